//! Collector Layer
//!
//! Runs configured queries against their databases and turns the results
//! into metric updates. Scheduled queries run in their own Tokio task;
//! on-demand queries run during a scrape.
//!
//! # Architecture
//!
//! - [`Schedule`]: Execution schedule (interval, cron or on demand)
//! - [`Pipeline`]: One run of a query against one database
//! - [`DoomPolicy`]: Stops pairs whose results can never be mapped
//! - [`QueryScheduler`]: Loop lifecycle and graceful shutdown

mod doom;
pub mod mapper;
mod pipeline;
mod schedule;
mod scheduler;

use thiserror::Error;

use crate::config::ConfigError;
use crate::metrics::MetricsError;

pub use doom::{DoomPolicy, ExecutionState, FailureClass, classify};
pub use mapper::MetricUpdate;
pub use pipeline::{Pipeline, RunMode, RunOutcome};
pub use schedule::{CronSchedule, MIN_INTERVAL, Schedule};
pub use scheduler::{DEFAULT_SHUTDOWN_TIMEOUT, QueryScheduler, SWEEP_INTERVAL};

/// Errors setting up collection.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Metric registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
}
