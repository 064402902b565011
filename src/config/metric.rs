//! Metric definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use super::validation::{ConfigError, deserialize_opt_duration, validate_identifier};

/// Supported metric types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Enum,
}

/// A metric declared in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    /// Metric name, filled in from the configuration key.
    #[serde(skip)]
    pub name: String,

    /// Metric type.
    #[serde(rename = "type")]
    pub metric_type: MetricType,

    /// Help text.
    #[serde(default)]
    pub description: String,

    /// Label names filled from query result columns.
    #[serde(default)]
    pub labels: Vec<String>,

    /// Histogram bucket upper bounds.
    #[serde(default)]
    pub buckets: Option<Vec<f64>>,

    /// Enum state names.
    #[serde(default)]
    pub states: Option<Vec<String>>,

    /// Drop series not updated for this long.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub expiration: Option<Duration>,

    /// Counters add each value instead of replacing the current one.
    #[serde(default)]
    pub increment: bool,
}

impl MetricConfig {
    /// Create a metric of the given type with no labels.
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            metric_type,
            description: String::new(),
            labels: Vec::new(),
            buckets: None,
            states: None,
            expiration: None,
            increment: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = Some(buckets);
        self
    }

    pub fn with_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states = Some(states.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_increment(mut self, increment: bool) -> Self {
        self.increment = increment;
        self
    }

    /// Validate type-specific settings and names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| ConfigError::invalid(format!("metric '{}': {}", self.name, msg));

        validate_identifier(&self.name).map_err(|e| fail(e.to_string()))?;

        let mut seen = std::collections::HashSet::new();
        for label in &self.labels {
            validate_identifier(label).map_err(|e| fail(e.to_string()))?;
            if !seen.insert(label) {
                return Err(fail(format!("duplicate label '{label}'")));
            }
        }

        if let Some(buckets) = &self.buckets {
            if self.metric_type != MetricType::Histogram {
                return Err(fail("buckets can only be set for histogram metrics".into()));
            }
            if buckets.is_empty() {
                return Err(fail("buckets must not be empty".into()));
            }
            if buckets.windows(2).any(|w| w[0] >= w[1]) {
                return Err(fail("buckets must be sorted and unique".into()));
            }
        }

        match (&self.states, self.metric_type) {
            (Some(states), MetricType::Enum) => {
                let unique: std::collections::HashSet<_> = states.iter().collect();
                if states.is_empty() || unique.len() != states.len() {
                    return Err(fail("states must be a non-empty list of unique names".into()));
                }
                if self.labels.contains(&self.name) {
                    return Err(fail("enum metrics can't have a label named after the metric".into()));
                }
            }
            (None, MetricType::Enum) => {
                return Err(fail("enum metrics require states".into()));
            }
            (Some(_), _) => {
                return Err(fail("states can only be set for enum metrics".into()));
            }
            (None, _) => {}
        }

        if self.increment && self.metric_type != MetricType::Counter {
            return Err(fail("increment can only be set for counter metrics".into()));
        }

        if self.expiration.is_some_and(|d| d.is_zero()) {
            return Err(fail("expiration must be positive".into()));
        }

        Ok(())
    }
}
