//! Builtin metrics reporting on query execution.
//!
//! These names are reserved: user metrics can't use them.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use strum_macros::{AsRefStr, Display};

use crate::config::{DatabaseConfig, MetricType};

use super::registry::{MetricDefinition, MetricsRegistry};
use super::{MetricValue, MetricsError};

/// Label carrying the database name on every series.
pub const DATABASE_LABEL: &str = "database";
pub const QUERY_LABEL: &str = "query";
pub const STATUS_LABEL: &str = "status";

pub const QUERIES: &str = "queries";
pub const QUERY_LATENCY: &str = "query_latency";
pub const QUERY_TIMESTAMP: &str = "query_timestamp";
pub const DATABASE_ERRORS: &str = "database_errors";
pub const QUERY_INTERVAL: &str = "query_interval";

pub const BUILTIN_METRIC_NAMES: [&str; 5] = [
    QUERIES,
    QUERY_LATENCY,
    QUERY_TIMESTAMP,
    DATABASE_ERRORS,
    QUERY_INTERVAL,
];

/// Outcome of one query execution, as counted by `queries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum QueryStatus {
    Success,
    Error,
    Timeout,
}

/// Definitions of all builtin metrics. `extra_labels` are the `database`
/// label plus the database static labels.
pub fn definitions(extra_labels: &[String], latency_buckets: Option<&[f64]>) -> Vec<MetricDefinition> {
    fn labels_with(own: &[&str], extra: &[String]) -> Vec<String> {
        own.iter()
            .map(|l| l.to_string())
            .chain(extra.iter().cloned())
            .collect()
    }
    let with_extra = |own: &[&str]| labels_with(own, extra_labels);

    let mut latency = MetricDefinition::new(QUERY_LATENCY, MetricType::Histogram)
        .with_description("Query execution latency")
        .with_labels(with_extra(&[QUERY_LABEL]));
    if let Some(buckets) = latency_buckets {
        latency = latency.with_buckets(buckets.to_vec());
    }

    vec![
        MetricDefinition::new(DATABASE_ERRORS, MetricType::Counter)
            .with_description("Number of database errors")
            .with_labels(extra_labels.to_vec())
            .with_increment(true),
        MetricDefinition::new(QUERIES, MetricType::Counter)
            .with_description("Number of database queries")
            .with_labels(with_extra(&[QUERY_LABEL, STATUS_LABEL]))
            .with_increment(true),
        latency,
        MetricDefinition::new(QUERY_TIMESTAMP, MetricType::Gauge)
            .with_description("Query last execution timestamp")
            .with_labels(with_extra(&[QUERY_LABEL])),
        MetricDefinition::new(QUERY_INTERVAL, MetricType::Gauge)
            .with_description("Query execution interval")
            .with_labels(with_extra(&[QUERY_LABEL])),
    ]
}

/// Register all builtin metrics.
pub fn register(
    registry: &MetricsRegistry,
    extra_labels: &[String],
    latency_buckets: Option<&[f64]>,
) -> Result<(), MetricsError> {
    for def in definitions(extra_labels, latency_buckets) {
        registry.register(def)?;
    }
    Ok(())
}

/// Labels every series from `database` carries.
pub fn database_labels(database: &DatabaseConfig) -> BTreeMap<String, String> {
    let mut labels = database.labels.clone();
    labels.insert(DATABASE_LABEL.to_string(), database.name.clone());
    labels
}

fn with_query(base: &BTreeMap<String, String>, query: &str) -> BTreeMap<String, String> {
    let mut labels = base.clone();
    labels.insert(QUERY_LABEL.to_string(), query.to_string());
    labels
}

/// Count one execution of `query` with the given outcome.
pub fn record_query(
    registry: &MetricsRegistry,
    base: &BTreeMap<String, String>,
    query: &str,
    status: QueryStatus,
) -> Result<(), MetricsError> {
    let mut labels = with_query(base, query);
    labels.insert(STATUS_LABEL.to_string(), status.to_string());
    registry.update(QUERIES, &labels, MetricValue::Number(1.0))
}

pub fn record_latency(
    registry: &MetricsRegistry,
    base: &BTreeMap<String, String>,
    query: &str,
    latency: Duration,
) -> Result<(), MetricsError> {
    registry.update(
        QUERY_LATENCY,
        &with_query(base, query),
        MetricValue::Number(latency.as_secs_f64()),
    )
}

pub fn record_timestamp(
    registry: &MetricsRegistry,
    base: &BTreeMap<String, String>,
    query: &str,
    timestamp: DateTime<Utc>,
) -> Result<(), MetricsError> {
    let seconds = timestamp.timestamp_micros() as f64 / 1_000_000.0;
    registry.update(QUERY_TIMESTAMP, &with_query(base, query), MetricValue::Number(seconds))
}

pub fn record_database_error(
    registry: &MetricsRegistry,
    base: &BTreeMap<String, String>,
) -> Result<(), MetricsError> {
    registry.update(DATABASE_ERRORS, base, MetricValue::Number(1.0))
}

pub fn record_interval(
    registry: &MetricsRegistry,
    base: &BTreeMap<String, String>,
    query: &str,
    interval: Duration,
) -> Result<(), MetricsError> {
    registry.update(
        QUERY_INTERVAL,
        &with_query(base, query),
        MetricValue::Number(interval.as_secs_f64()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::SeriesValue;
    use std::sync::Arc;

    fn setup() -> (MetricsRegistry, BTreeMap<String, String>) {
        let registry = MetricsRegistry::new(Arc::new(ManualClock::default()));
        let extra = vec![DATABASE_LABEL.to_string(), "region".to_string()];
        register(&registry, &extra, Some(&[0.5, 1.0][..])).unwrap();

        let mut db = DatabaseConfig::new("db1", "sqlite::memory:");
        db.labels.insert("region".to_string(), "eu".to_string());
        (registry, database_labels(&db))
    }

    #[test]
    fn test_definitions_carry_extra_labels() {
        let defs = definitions(&[DATABASE_LABEL.to_string()], None);
        assert_eq!(defs.len(), BUILTIN_METRIC_NAMES.len());
        let queries = defs.iter().find(|d| d.name == QUERIES).unwrap();
        assert_eq!(queries.labels, vec!["database", "query", "status"]);
        let errors = defs.iter().find(|d| d.name == DATABASE_ERRORS).unwrap();
        assert_eq!(errors.labels, vec!["database"]);
    }

    #[test]
    fn test_record_query_counts() {
        let (registry, base) = setup();
        record_query(&registry, &base, "q1", QueryStatus::Success).unwrap();
        record_query(&registry, &base, "q1", QueryStatus::Success).unwrap();
        record_query(&registry, &base, "q1", QueryStatus::Timeout).unwrap();

        let mut labels = base.clone();
        labels.insert("query".into(), "q1".into());
        labels.insert("status".into(), "success".into());
        assert_eq!(registry.get(QUERIES, &labels), Some(SeriesValue::Counter(2.0)));
        labels.insert("status".into(), "timeout".into());
        assert_eq!(registry.get(QUERIES, &labels), Some(SeriesValue::Counter(1.0)));
    }

    #[test]
    fn test_record_latency_uses_configured_buckets() {
        let (registry, base) = setup();
        record_latency(&registry, &base, "q1", Duration::from_millis(700)).unwrap();

        let mut labels = base.clone();
        labels.insert("query".into(), "q1".into());
        assert_eq!(
            registry.get(QUERY_LATENCY, &labels),
            Some(SeriesValue::Histogram {
                buckets: vec![0, 1],
                sum: 0.7,
                count: 1
            })
        );
    }

    #[test]
    fn test_record_database_error() {
        let (registry, base) = setup();
        record_database_error(&registry, &base).unwrap();
        record_database_error(&registry, &base).unwrap();
        assert_eq!(registry.get(DATABASE_ERRORS, &base), Some(SeriesValue::Counter(2.0)));
    }

    #[test]
    fn test_query_status_display() {
        assert_eq!(QueryStatus::Success.to_string(), "success");
        assert_eq!(QueryStatus::Timeout.as_ref(), "timeout");
    }
}
