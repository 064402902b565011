//! Query Exporter - SQL query results as Prometheus metrics
//!
//! Runs configured SQL queries against one or more databases, maps the
//! result rows to metric series and serves them over HTTP in the Prometheus
//! text exposition format. It can be used as a library or run as the
//! standalone `query-exporter` binary.
//!
//! # Architecture
//!
//! - **Config**: YAML configuration of databases, metrics and queries
//! - **Database**: Session lifecycle and transactional query execution
//! - **Metrics**: In-process registry with expiration and text rendering
//! - **Collector**: Result mapping, doom policy and query scheduling
//! - **Server**: `/metrics` scrape endpoint and liveness check
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use query_exporter::{AppConfig, MetricsRegistry, Pipeline, QueryScheduler, SystemClock};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load("config.yaml")?;
//! let registry = Arc::new(MetricsRegistry::new(Arc::new(SystemClock)));
//! let pipeline = Arc::new(Pipeline::new(&config, Arc::clone(&registry))?);
//! let scheduler = QueryScheduler::new(pipeline)?;
//! scheduler.start();
//! scheduler.run_on_demand().await;
//! println!("{}", registry.render()?);
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod collector;
pub mod config;
pub mod database;
pub mod metrics;
pub mod server;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::{CollectorError, Pipeline, QueryScheduler, RunMode, RunOutcome, Schedule};
pub use config::{AppConfig, ConfigError};
pub use database::{Database, QueryError};
pub use metrics::{MetricsError, MetricsRegistry};
