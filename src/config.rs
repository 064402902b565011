//! Configuration module for the exporter.
//!
//! Provides YAML-based configuration loading (with `!env`, `!file` and
//! `!include` tags, merged across files) and validation for:
//! - Server settings (port, bind address)
//! - Databases (DSN, static labels, connection behavior)
//! - Metrics (type, labels, type-specific settings)
//! - Queries (SQL, parameters, schedule, timeout)

mod app;
mod database;
mod metric;
mod query;
mod validation;
mod yaml;

pub use app::{AppConfig, BuiltinMetricsConfig, DEFAULT_PORT, QueryLatencyConfig, ServerConfig};
pub use database::{DatabaseConfig, Dsn, DsnDetails};
pub use metric::{MetricConfig, MetricType};
pub use query::{MATRIX_SEPARATOR, ParameterSet, ParameterSpec, QueryConfig};
pub use validation::{ConfigError, expand_env_vars, parse_duration, validate_identifier};
pub use yaml::{load_yaml, parse_yaml};
