//! Query definitions and parameter expansion.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collector::Schedule;
use crate::database::placeholders;

use super::validation::{ConfigError, deserialize_opt_duration};

/// One resolved set of named parameter values.
pub type ParameterSet = BTreeMap<String, serde_json::Value>;

/// Separator between matrix keys and sub-keys in expanded parameter names.
pub const MATRIX_SEPARATOR: &str = "__";

/// Parameters for a query.
///
/// A list yields one execution per entry. A matrix maps top-level keys to
/// lists of named values and yields the cartesian product across keys, with
/// parameter names formed as `key__subkey`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterSpec {
    List(Vec<ParameterSet>),
    Matrix(BTreeMap<String, Vec<ParameterSet>>),
}

impl ParameterSpec {
    /// Expand into the parameter sets to execute, in order.
    pub fn expand(&self) -> Vec<ParameterSet> {
        match self {
            Self::List(sets) => sets.clone(),
            Self::Matrix(matrix) => {
                let mut combinations = vec![ParameterSet::new()];
                for (key, sets) in matrix {
                    let mut next = Vec::with_capacity(combinations.len() * sets.len());
                    for combination in &combinations {
                        for set in sets {
                            let mut merged = combination.clone();
                            merged.extend(set.iter().map(|(sub, value)| {
                                (format!("{key}{MATRIX_SEPARATOR}{sub}"), value.clone())
                            }));
                            next.push(merged);
                        }
                    }
                    combinations = next;
                }
                combinations
            }
        }
    }

    /// Parameter names every expanded set carries.
    pub fn names(&self) -> BTreeSet<String> {
        match self {
            Self::List(sets) => sets
                .first()
                .map(|set| set.keys().cloned().collect())
                .unwrap_or_default(),
            Self::Matrix(matrix) => matrix
                .iter()
                .flat_map(|(key, sets)| {
                    sets.first()
                        .into_iter()
                        .flat_map(|set| set.keys())
                        .map(move |sub| format!("{key}{MATRIX_SEPARATOR}{sub}"))
                })
                .collect(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        fn uniform(sets: &[ParameterSet]) -> bool {
            sets.windows(2).all(|w| w[0].keys().eq(w[1].keys()))
        }

        match self {
            Self::List(sets) => {
                if sets.is_empty() {
                    return Err("parameters list must not be empty".to_string());
                }
                if !uniform(sets) {
                    return Err("parameters dictionaries must all have the same keys".to_string());
                }
            }
            Self::Matrix(matrix) => {
                if matrix.is_empty() {
                    return Err("parameters matrix must not be empty".to_string());
                }
                for (key, sets) in matrix {
                    if key.contains(MATRIX_SEPARATOR) {
                        return Err(format!("matrix key '{key}' must not contain '{MATRIX_SEPARATOR}'"));
                    }
                    if sets.is_empty() {
                        return Err(format!("parameters for '{key}' must not be empty"));
                    }
                    if !uniform(sets) {
                        return Err(format!(
                            "parameters dictionaries for '{key}' must all have the same keys"
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A query declared in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    /// Query name, filled in from the configuration key.
    #[serde(skip)]
    pub name: String,

    /// Databases the query runs against.
    pub databases: Vec<String>,

    /// Metrics the query produces.
    pub metrics: Vec<String>,

    /// SQL text with optional `:name` placeholders.
    pub sql: String,

    #[serde(default)]
    pub parameters: Option<ParameterSpec>,

    /// Run every `interval`.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub interval: Option<Duration>,

    /// Run on a cron schedule.
    #[serde(default)]
    pub schedule: Option<String>,

    /// Bound on each execution.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub timeout: Option<Duration>,
}

impl QueryConfig {
    /// Create an on-demand query.
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            databases: Vec::new(),
            metrics: Vec::new(),
            sql: sql.into(),
            parameters: None,
            interval: None,
            schedule: None,
            timeout: None,
        }
    }

    pub fn with_databases<I, S>(mut self, databases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.databases = databases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metrics = metrics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: ParameterSpec) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_schedule(mut self, expr: impl Into<String>) -> Self {
        self.schedule = Some(expr.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve the schedule mode.
    pub fn schedule_mode(&self) -> Result<Schedule, ConfigError> {
        match (self.interval, &self.schedule) {
            (Some(_), Some(_)) => Err(self.invalid("both interval and schedule specified")),
            (Some(interval), None) => Ok(Schedule::interval(interval)),
            (None, Some(expr)) => Schedule::cron(expr)
                .map_err(|e| self.invalid(format!("invalid schedule format: {e}"))),
            (None, None) => Ok(Schedule::OnDemand),
        }
    }

    /// Parameter sets for one tick. A query without parameters runs once
    /// with an empty set.
    pub fn parameter_sets(&self) -> Vec<ParameterSet> {
        match &self.parameters {
            Some(spec) => spec.expand(),
            None => vec![ParameterSet::new()],
        }
    }

    /// Declared parameter names.
    pub fn parameter_names(&self) -> BTreeSet<String> {
        self.parameters
            .as_ref()
            .map(ParameterSpec::names)
            .unwrap_or_default()
    }

    /// Validate the query on its own. References to databases and metrics
    /// are checked by [`AppConfig`](super::AppConfig).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.databases.is_empty() {
            return Err(self.invalid("at least one database is required"));
        }
        if self.metrics.is_empty() {
            return Err(self.invalid("at least one metric is required"));
        }
        if self.sql.trim().is_empty() {
            return Err(self.invalid("sql must not be empty"));
        }
        if self.interval.is_some_and(|d| d.is_zero()) {
            return Err(self.invalid("interval must be positive"));
        }
        if self.timeout.is_some_and(|d| d.is_zero()) {
            return Err(self.invalid("timeout must be positive"));
        }
        self.schedule_mode()?;

        if let Some(spec) = &self.parameters {
            spec.validate().map_err(|e| self.invalid(e))?;
        }
        if self.parameter_names() != placeholders(&self.sql) {
            return Err(self.invalid("parameters don't match those from SQL"));
        }
        Ok(())
    }

    fn invalid(&self, message: impl std::fmt::Display) -> ConfigError {
        ConfigError::invalid(format!("query '{}': {}", self.name, message))
    }
}
