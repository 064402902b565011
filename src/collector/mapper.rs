//! Turns result rows into metric updates.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{MetricConfig, MetricType, QueryConfig};
use crate::database::{MappingError, QueryResults, SqlValue};
use crate::metrics::MetricValue;

/// One update for one series, with labels taken from the row.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricUpdate {
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub value: MetricValue,
}

/// Map `results` of `query` to metric updates, one per row and metric.
///
/// # Errors
/// - `MappingError::InvalidResultCount` if the column count doesn't match
///   the query's metrics and labels
/// - `MappingError::InvalidResultColumnNames` if the column names don't
/// - `MappingError::InvalidValue` if a value can't be used for its metric
pub fn map(
    query: &QueryConfig,
    metrics: &BTreeMap<String, MetricConfig>,
    results: &QueryResults,
) -> Result<Vec<MetricUpdate>, MappingError> {
    if results.is_empty() {
        return Ok(Vec::new());
    }

    let query_metrics: Vec<&MetricConfig> = query
        .metrics
        .iter()
        .filter_map(|name| metrics.get(name))
        .collect();

    let expected: BTreeSet<&str> = query_metrics
        .iter()
        .flat_map(|m| std::iter::once(m.name.as_str()).chain(m.labels.iter().map(String::as_str)))
        .collect();
    let mut got: Vec<&str> = results.columns.iter().map(String::as_str).collect();
    got.sort_unstable();

    if expected.len() != got.len() {
        return Err(MappingError::InvalidResultCount {
            expected: expected.len(),
            got: got.len(),
        });
    }

    let positional = match query_metrics.as_slice() {
        [only] => only.labels.is_empty() && !results.columns.iter().any(|c| c == &only.name),
        _ => false,
    };
    if !positional && !expected.iter().copied().eq(got.iter().copied()) {
        return Err(MappingError::InvalidResultColumnNames {
            expected: expected.iter().map(|s| s.to_string()).collect(),
            got: got.iter().map(|s| s.to_string()).collect(),
        });
    }

    let mut updates = Vec::with_capacity(results.rows.len() * query_metrics.len());
    for row in &results.rows {
        for metric in &query_metrics {
            let raw = if positional {
                row.first().unwrap_or(&NULL)
            } else {
                column(&results.columns, row, &metric.name)
            };
            let labels = metric
                .labels
                .iter()
                .map(|label| (label.clone(), column(&results.columns, row, label).as_label()))
                .collect();
            updates.push(MetricUpdate {
                metric: metric.name.clone(),
                labels,
                value: convert(metric, raw)?,
            });
        }
    }
    Ok(updates)
}

static NULL: SqlValue = SqlValue::Null;

fn column<'r>(columns: &[String], row: &'r [SqlValue], name: &str) -> &'r SqlValue {
    columns
        .iter()
        .position(|c| c == name)
        .and_then(|i| row.get(i))
        .unwrap_or(&NULL)
}

fn convert(metric: &MetricConfig, raw: &SqlValue) -> Result<MetricValue, MappingError> {
    if metric.metric_type == MetricType::Enum {
        return Ok(MetricValue::State(raw.as_label()));
    }
    raw.as_f64()
        .map(MetricValue::Number)
        .ok_or_else(|| MappingError::InvalidValue {
            metric: metric.name.clone(),
            reason: format!("'{raw}' is not a number"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn metrics() -> BTreeMap<String, MetricConfig> {
        [
            MetricConfig::new("metric1", MetricType::Gauge).with_labels(["label1", "label2"]),
            MetricConfig::new("metric2", MetricType::Counter).with_labels(["label2"]),
            MetricConfig::new("plain", MetricType::Gauge),
            MetricConfig::new("status", MetricType::Enum).with_states(["up", "down"]),
        ]
        .into_iter()
        .map(|m| (m.name.clone(), m))
        .collect()
    }

    fn results(columns: &[&str], rows: Vec<Vec<SqlValue>>) -> QueryResults {
        QueryResults {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            timestamp: Utc::now(),
            latency: Duration::from_millis(1),
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_map_rows_to_updates() {
        let query = QueryConfig::new("q", "SELECT ...").with_metrics(["metric1", "metric2"]);
        let res = results(
            &["metric2", "metric1", "label2", "label1"],
            vec![
                vec![SqlValue::Int(11), SqlValue::Int(22), "foo".into(), "bar".into()],
                vec![SqlValue::Int(33), SqlValue::Int(44), "baz".into(), "bza".into()],
            ],
        );

        let updates = map(&query, &metrics(), &res).unwrap();
        assert_eq!(
            updates,
            vec![
                MetricUpdate {
                    metric: "metric1".into(),
                    labels: labels(&[("label1", "bar"), ("label2", "foo")]),
                    value: MetricValue::Number(22.0),
                },
                MetricUpdate {
                    metric: "metric2".into(),
                    labels: labels(&[("label2", "foo")]),
                    value: MetricValue::Number(11.0),
                },
                MetricUpdate {
                    metric: "metric1".into(),
                    labels: labels(&[("label1", "bza"), ("label2", "baz")]),
                    value: MetricValue::Number(44.0),
                },
                MetricUpdate {
                    metric: "metric2".into(),
                    labels: labels(&[("label2", "baz")]),
                    value: MetricValue::Number(33.0),
                },
            ]
        );
    }

    #[test]
    fn test_empty_results() {
        let query = QueryConfig::new("q", "SELECT ...").with_metrics(["metric1"]);
        let res = results(&["whatever"], Vec::new());
        assert!(map(&query, &metrics(), &res).unwrap().is_empty());
    }

    #[test]
    fn test_positional_fallback() {
        let query = QueryConfig::new("q", "SELECT ...").with_metrics(["plain"]);
        let res = results(&["count(*)"], vec![vec![SqlValue::Int(7)]]);
        let updates = map(&query, &metrics(), &res).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].metric, "plain");
        assert_eq!(updates[0].value, MetricValue::Number(7.0));
        assert!(updates[0].labels.is_empty());
    }

    #[test]
    fn test_wrong_result_count() {
        let query = QueryConfig::new("q", "SELECT ...").with_metrics(["plain"]);
        let res = results(&["one", "two"], vec![vec![SqlValue::Int(1), SqlValue::Int(2)]]);
        assert!(matches!(
            map(&query, &metrics(), &res),
            Err(MappingError::InvalidResultCount { expected: 1, got: 2 })
        ));

        let query = QueryConfig::new("q", "SELECT ...").with_metrics(["metric2"]);
        let res = results(&["one"], vec![vec![SqlValue::Int(1)]]);
        assert!(matches!(
            map(&query, &metrics(), &res),
            Err(MappingError::InvalidResultCount { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_wrong_column_names() {
        let query = QueryConfig::new("q", "SELECT ...").with_metrics(["metric2"]);
        let res = results(&["one", "two"], vec![vec![SqlValue::Int(1), SqlValue::Int(2)]]);
        let err = map(&query, &metrics(), &res).unwrap_err();
        assert_eq!(
            err.to_string(),
            "wrong column names from query: expected (label2, metric2), got (one, two)"
        );
    }

    #[test]
    fn test_null_is_zero() {
        let query = QueryConfig::new("q", "SELECT ...").with_metrics(["plain"]);
        let res = results(&["plain"], vec![vec![SqlValue::Null]]);
        let updates = map(&query, &metrics(), &res).unwrap();
        assert_eq!(updates[0].value, MetricValue::Number(0.0));
    }

    #[test]
    fn test_invalid_value() {
        let query = QueryConfig::new("q", "SELECT ...").with_metrics(["plain"]);
        let res = results(&["plain"], vec![vec!["abc".into()]]);
        assert!(matches!(
            map(&query, &metrics(), &res),
            Err(MappingError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_enum_state_from_text() {
        let query = QueryConfig::new("q", "SELECT ...").with_metrics(["status"]);
        let res = results(&["status"], vec![vec!["down".into()]]);
        let updates = map(&query, &metrics(), &res).unwrap();
        assert_eq!(updates[0].value, MetricValue::State("down".into()));
    }
}
