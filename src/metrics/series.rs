//! Per-series state for each metric type.

use chrono::{DateTime, Utc};

use crate::config::MetricType;

use super::registry::MetricDefinition;
use super::{MetricValue, MetricsError};

/// Current value(s) of one series.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesValue {
    Counter(f64),
    Gauge(f64),
    /// `buckets` holds cumulative counts aligned with the metric's bucket bounds.
    Histogram { buckets: Vec<u64>, sum: f64, count: u64 },
    Summary { sum: f64, count: u64 },
    /// Index of the active state.
    Enum(usize),
}

impl SeriesValue {
    /// Empty state for a new series of the given metric.
    pub fn new(def: &MetricDefinition) -> Self {
        match def.metric_type {
            MetricType::Counter => Self::Counter(0.0),
            MetricType::Gauge => Self::Gauge(0.0),
            MetricType::Histogram => Self::Histogram {
                buckets: vec![0; def.buckets.len()],
                sum: 0.0,
                count: 0,
            },
            MetricType::Summary => Self::Summary { sum: 0.0, count: 0 },
            MetricType::Enum => Self::Enum(0),
        }
    }

    /// Apply one update according to the metric type.
    pub fn update(&mut self, def: &MetricDefinition, value: &MetricValue) -> Result<(), MetricsError> {
        match (self, value) {
            (Self::Counter(current), MetricValue::Number(v)) => {
                if def.increment {
                    *current += v;
                } else {
                    *current = *v;
                }
            }
            (Self::Gauge(current), MetricValue::Number(v)) => *current = *v,
            (Self::Histogram { buckets, sum, count }, MetricValue::Number(v)) => {
                for (bucket, bound) in buckets.iter_mut().zip(&def.buckets) {
                    if v <= bound {
                        *bucket += 1;
                    }
                }
                *sum += v;
                *count += 1;
            }
            (Self::Summary { sum, count }, MetricValue::Number(v)) => {
                *sum += v;
                *count += 1;
            }
            (Self::Enum(active), MetricValue::State(state)) => {
                *active = def.states.iter().position(|s| s == state).ok_or_else(|| {
                    MetricsError::InvalidState {
                        metric: def.name.clone(),
                        state: state.clone(),
                    }
                })?;
            }
            (Self::Enum(_), MetricValue::Number(_)) => {
                return Err(MetricsError::InvalidValue {
                    metric: def.name.clone(),
                    expected: "state",
                });
            }
            (_, MetricValue::State(_)) => {
                return Err(MetricsError::InvalidValue {
                    metric: def.name.clone(),
                    expected: "numeric",
                });
            }
        }
        Ok(())
    }
}

/// A series and when it was last updated.
#[derive(Debug, Clone)]
pub struct Series {
    pub value: SeriesValue,
    pub last_update: DateTime<Utc>,
}

impl Series {
    pub fn new(def: &MetricDefinition, now: DateTime<Utc>) -> Self {
        Self {
            value: SeriesValue::new(def),
            last_update: now,
        }
    }

    /// Whether the series is past its expiration at `now`.
    pub fn is_expired(&self, def: &MetricDefinition, now: DateTime<Utc>) -> bool {
        let Some(expiration) = def.expiration else {
            return false;
        };
        chrono::Duration::from_std(expiration)
            .is_ok_and(|expiration| now > self.last_update + expiration)
    }
}
