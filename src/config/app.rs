//! Application configuration structures.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::metrics::builtin::{BUILTIN_METRIC_NAMES, DATABASE_LABEL};

use super::database::DatabaseConfig;
use super::metric::MetricConfig;
use super::query::QueryConfig;
use super::validation::ConfigError;
use super::yaml::{load_yaml, parse_yaml};

// =============================================================================
// Constants
// =============================================================================

/// Default server port.
pub const DEFAULT_PORT: u16 = 9560;

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Server port (default: 9560).
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: DEFAULT_PORT,
        }
    }
}

// =============================================================================
// Builtin Metrics Configuration
// =============================================================================

/// Settings for the builtin latency histogram.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryLatencyConfig {
    /// Histogram buckets, Prometheus defaults when unset.
    #[serde(default)]
    pub buckets: Option<Vec<f64>>,
}

/// Settings for builtin metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuiltinMetricsConfig {
    #[serde(default)]
    pub query_latency: QueryLatencyConfig,
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AppConfig {
    /// Web server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Builtin metrics settings.
    #[serde(default)]
    pub builtin_metrics: BuiltinMetricsConfig,

    /// Databases keyed by name.
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,

    /// Metrics keyed by name.
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricConfig>,

    /// Queries keyed by name.
    #[serde(default)]
    pub queries: BTreeMap<String, QueryConfig>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_files(&[path])
    }

    /// Load configuration from several YAML files merged into one.
    ///
    /// Each section's entries are combined across files. An entry defined in
    /// more than one file is an error.
    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let mut merged = Mapping::new();
        for path in paths {
            let path = path.as_ref();
            match load_yaml(path)? {
                Value::Mapping(document) => merge_document(&mut merged, document)?,
                Value::Null => {}
                _ => {
                    return Err(ConfigError::invalid(format!(
                        "file content is not a mapping: {}",
                        path.display()
                    )));
                }
            }
        }
        Self::from_value(Value::Mapping(merged))
    }

    /// Parse and validate configuration from YAML text. Tag paths are
    /// relative to the working directory.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Self::from_value(parse_yaml(content, Path::new("."))?)
    }

    fn from_value(value: Value) -> Result<Self, ConfigError> {
        let value = if value.is_null() {
            Value::Mapping(Mapping::new())
        } else {
            value
        };
        let mut config: Self = serde_yaml::from_value(value)?;
        config.assign_names();
        config.validate()?;
        config.warn_unused();
        Ok(config)
    }

    /// Copy map keys into the `name` field of each entry.
    pub fn assign_names(&mut self) {
        for (name, db) in &mut self.databases {
            db.name.clone_from(name);
        }
        for (name, metric) in &mut self.metrics {
            metric.name.clone_from(name);
        }
        for (name, query) in &mut self.queries {
            query.name.clone_from(name);
            query.sql = query.sql.trim().to_string();
        }
    }

    /// Static label names shared by all databases, sorted.
    pub fn database_label_names(&self) -> Vec<String> {
        self.databases
            .values()
            .next()
            .map(|db| db.labels.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::invalid(format!("invalid server bind address: '{}'", self.server.bind))
        })?;
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server port must be non-zero"));
        }

        if let Some(buckets) = &self.builtin_metrics.query_latency.buckets {
            MetricConfig::new("query_latency", super::MetricType::Histogram)
                .with_buckets(buckets.clone())
                .validate()?;
        }

        // Databases
        let mut label_sets = BTreeSet::new();
        for db in self.databases.values() {
            db.validate()?;
            label_sets.insert(db.labels.keys().cloned().collect::<Vec<_>>());
        }
        if label_sets.len() > 1 {
            return Err(ConfigError::invalid("not all databases define the same labels"));
        }

        let mut reserved_labels: BTreeSet<String> = self.database_label_names().into_iter().collect();
        reserved_labels.insert(DATABASE_LABEL.to_string());

        // Metrics
        for metric in self.metrics.values() {
            if BUILTIN_METRIC_NAMES.contains(&metric.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "metric name '{}' is reserved for builtin metric",
                    metric.name
                )));
            }
            metric.validate()?;
            if metric.metric_type == super::MetricType::Enum && reserved_labels.contains(&metric.name) {
                return Err(ConfigError::invalid(format!(
                    "enum metric '{}' is named after a reserved/database label",
                    metric.name
                )));
            }
            let overlap: Vec<_> = metric
                .labels
                .iter()
                .filter(|label| reserved_labels.contains(*label))
                .map(String::as_str)
                .collect();
            if !overlap.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "labels for metric '{}' overlap with reserved/database ones: {}",
                    metric.name,
                    overlap.join(", ")
                )));
            }
        }

        // Queries
        for query in self.queries.values() {
            query.validate()?;
            let unknown: Vec<_> = query
                .databases
                .iter()
                .filter(|name| !self.databases.contains_key(*name))
                .map(String::as_str)
                .collect();
            if !unknown.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "unknown databases for query '{}': {}",
                    query.name,
                    unknown.join(", ")
                )));
            }
            let unknown: Vec<_> = query
                .metrics
                .iter()
                .filter(|name| !self.metrics.contains_key(*name))
                .map(String::as_str)
                .collect();
            if !unknown.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "unknown metrics for query '{}': {}",
                    query.name,
                    unknown.join(", ")
                )));
            }
        }

        Ok(())
    }

    /// Names of databases and metrics no query refers to.
    pub fn unused(&self) -> (Vec<&str>, Vec<&str>) {
        let used_dbs: BTreeSet<&str> = self
            .queries
            .values()
            .flat_map(|q| q.databases.iter().map(String::as_str))
            .collect();
        let used_metrics: BTreeSet<&str> = self
            .queries
            .values()
            .flat_map(|q| q.metrics.iter().map(String::as_str))
            .collect();

        let dbs = self
            .databases
            .keys()
            .map(String::as_str)
            .filter(|name| !used_dbs.contains(name))
            .collect();
        let metrics = self
            .metrics
            .keys()
            .map(String::as_str)
            .filter(|name| !used_metrics.contains(name))
            .collect();
        (dbs, metrics)
    }

    fn warn_unused(&self) {
        let (dbs, metrics) = self.unused();
        if !dbs.is_empty() {
            tracing::warn!(databases = %dbs.join(", "), "Unused entries in databases section");
        }
        if !metrics.is_empty() {
            tracing::warn!(metrics = %metrics.join(", "), "Unused entries in metrics section");
        }
    }
}

/// Merge the top-level sections of `document` into `merged`.
fn merge_document(merged: &mut Mapping, document: Mapping) -> Result<(), ConfigError> {
    for (section, value) in document {
        let Some(existing) = merged.get_mut(&section) else {
            merged.insert(section, value);
            continue;
        };
        let name = section.as_str().unwrap_or_default();
        match (existing, value) {
            (Value::Mapping(existing), Value::Mapping(entries)) => {
                for (key, entry) in entries {
                    if existing.contains_key(&key) {
                        return Err(ConfigError::invalid(format!(
                            "duplicate entry in '{}' section: {}",
                            name,
                            key.as_str().unwrap_or_default()
                        )));
                    }
                    existing.insert(key, entry);
                }
            }
            (_, Value::Null) => {}
            (existing, value) if existing.is_null() => *existing = value,
            _ => {
                return Err(ConfigError::invalid(format!(
                    "section '{name}' can't be merged across files"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const VALID_CONFIG: &str = r#"
server:
  bind: 127.0.0.1
  port: 9999
builtin-metrics:
  query_latency:
    buckets: [0.1, 0.5, 1, 5]
databases:
  db1:
    dsn: "sqlite::memory:"
    labels: {region: eu}
  db2:
    dsn: "sqlite::memory:"
    keep-connected: false
    labels: {region: us}
metrics:
  m1:
    type: gauge
    labels: [l1]
    expiration: 10m
  m2:
    type: counter
queries:
  q1:
    databases: [db1, db2]
    metrics: [m1]
    sql: "  SELECT 1 AS m1, 'x' AS l1  "
    interval: 30s
  q2:
    databases: [db1]
    metrics: [m2]
    sql: SELECT 3 AS m2
"#;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_load_valid_config() {
        let config = AppConfig::from_yaml_str(VALID_CONFIG).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.databases["db2"].name, "db2");
        assert!(!config.databases["db2"].keep_connected);
        assert_eq!(config.metrics["m1"].expiration, Some(Duration::from_secs(600)));
        assert_eq!(config.queries["q1"].sql, "SELECT 1 AS m1, 'x' AS l1");
        assert_eq!(config.database_label_names(), vec!["region"]);
        assert_eq!(
            config.builtin_metrics.query_latency.buckets,
            Some(vec![0.1, 0.5, 1.0, 5.0])
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID_CONFIG.as_bytes()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.queries.len(), 2);
    }

    #[test]
    fn test_load_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        let databases = dir.path().join("databases.yaml");
        std::fs::write(&databases, "databases:\n  db1: {dsn: \"sqlite::memory:\"}\n").unwrap();
        let queries = dir.path().join("queries.yaml");
        std::fs::write(
            &queries,
            r#"
metrics:
  m1: {type: gauge}
queries:
  q1: {databases: [db1], metrics: [m1], sql: SELECT 1 AS m1}
"#,
        )
        .unwrap();

        let config = AppConfig::load_files(&[&databases, &queries]).unwrap();
        assert_eq!(config.databases["db1"].name, "db1");
        assert_eq!(config.queries["q1"].databases, vec!["db1"]);
    }

    #[test]
    fn test_load_files_duplicate_entry() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.yaml");
        let second = dir.path().join("b.yaml");
        std::fs::write(&first, "databases:\n  db1: {dsn: \"sqlite::memory:\"}\n").unwrap();
        std::fs::write(&second, "databases:\n  db1: {dsn: \"sqlite::memory:\"}\n").unwrap();

        let err = AppConfig::load_files(&[&first, &second]).unwrap_err();
        assert!(err.to_string().contains("duplicate entry in 'databases' section: db1"));
    }

    #[test]
    fn test_load_resolves_tags() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dsn.txt"), "sqlite::memory:\n").unwrap();
        std::fs::write(
            dir.path().join("metrics.yaml"),
            "m1: {type: gauge, description: included}\n",
        )
        .unwrap();
        let main = dir.path().join("config.yaml");
        std::fs::write(
            &main,
            r#"
databases:
  db1: {dsn: !file dsn.txt}
metrics: !include metrics.yaml
queries:
  q1: {databases: [db1], metrics: [m1], sql: SELECT 1 AS m1}
"#,
        )
        .unwrap();

        let config = AppConfig::load(&main).unwrap();
        assert_eq!(config.databases["db1"].connection_url().unwrap(), "sqlite::memory:");
        assert_eq!(config.metrics["m1"].description, "included");
    }

    #[test]
    fn test_load_missing_file() {
        let result = AppConfig::load("/nonexistent/config.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = AppConfig::from_yaml_str("databases: [unclosed");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_config_validation_invalid_port() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_bind_address() {
        let mut config = AppConfig::default();
        config.server.bind = "not-an-ip".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invalid server bind address"));
    }

    #[test]
    fn test_databases_must_share_labels() {
        let yaml = r#"
databases:
  db1: {dsn: "sqlite::memory:", labels: {region: eu}}
  db2: {dsn: "sqlite::memory:", labels: {zone: a}}
"#;
        let err = AppConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("same labels"));
    }

    #[test]
    fn test_builtin_metric_name_reserved() {
        let yaml = r#"
metrics:
  queries: {type: counter}
"#;
        let err = AppConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("reserved for builtin"));
    }

    #[test]
    fn test_metric_labels_overlap_database_labels() {
        let yaml = r#"
databases:
  db1: {dsn: "sqlite::memory:", labels: {region: eu}}
metrics:
  m1: {type: gauge, labels: [region]}
  m2: {type: gauge, labels: [database]}
"#;
        let err = AppConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_enum_metric_named_after_database_label() {
        let yaml = r#"
databases:
  db1: {dsn: "sqlite::memory:", labels: {region: eu}}
metrics:
  region: {type: enum, states: [eu, us]}
"#;
        let err = AppConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("named after a reserved/database label"));
    }

    #[test]
    fn test_query_unknown_references() {
        let yaml = r#"
databases:
  db1: {dsn: "sqlite::memory:"}
metrics:
  m1: {type: gauge}
queries:
  q1: {databases: [db1, nope], metrics: [m1], sql: SELECT 1 AS m1}
"#;
        let err = AppConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown databases for query 'q1': nope"));

        let yaml = r#"
databases:
  db1: {dsn: "sqlite::memory:"}
queries:
  q1: {databases: [db1], metrics: [missing], sql: SELECT 1 AS m1}
"#;
        let err = AppConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown metrics"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
databases:
  db1: {dsn: "sqlite::memory:", autoconnect: true}
"#;
        assert!(matches!(
            AppConfig::from_yaml_str(yaml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_unused_entries() {
        let yaml = r#"
databases:
  db1: {dsn: "sqlite::memory:"}
  db2: {dsn: "sqlite::memory:"}
metrics:
  m1: {type: gauge}
  m2: {type: gauge}
queries:
  q1: {databases: [db1], metrics: [m1], sql: SELECT 1 AS m1}
"#;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        let (dbs, metrics) = config.unused();
        assert_eq!(dbs, vec!["db2"]);
        assert_eq!(metrics, vec!["m2"]);
    }
}
