//! Metrics Layer
//!
//! In-process registry of metric definitions and per-label-set series, with
//! type-specific update rules, per-series expiration and Prometheus text
//! rendering.
//!
//! # Components
//!
//! - [`MetricsRegistry`]: Definitions, series state, sweep and rendering
//! - [`SeriesValue`]: Tagged per-type series state
//! - [`builtin`]: Reserved metrics describing query execution

pub mod builtin;
mod registry;
mod series;

use thiserror::Error;

pub use registry::{MetricDefinition, MetricsRegistry, register_configured};
pub use series::{Series, SeriesValue};

/// A value applied to a series.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Counter, gauge, histogram and summary values.
    Number(f64),
    /// Active state of an enum metric.
    State(String),
}

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("unknown metric '{0}'")]
    Unknown(String),

    #[error("metric '{0}' is already registered")]
    Duplicate(String),

    #[error("labels for metric '{metric}' don't match: expected ({}), got ({})", .expected.join(", "), .got.join(", "))]
    LabelMismatch {
        metric: String,
        expected: Vec<String>,
        got: Vec<String>,
    },

    #[error("invalid state '{state}' for enum metric '{metric}'")]
    InvalidState { metric: String, state: String },

    #[error("metric '{metric}' expects a {expected} value")]
    InvalidValue { metric: String, expected: &'static str },

    #[error("failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),
}
