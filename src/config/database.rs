//! Database connection configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::database::Backend;

use super::validation::{ConfigError, expand_env_vars, validate_identifier};

fn default_keep_connected() -> bool {
    true
}

/// DSN given piece by piece instead of as a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DsnDetails {
    /// URL scheme, e.g. `postgres`, `mysql`, `sqlite`.
    pub dialect: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    /// Extra query-string options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl DsnDetails {
    /// Render the details as a connection URL.
    pub fn to_url(&self) -> Result<String, ConfigError> {
        let mut url = url::Url::parse(&format!("{}://", self.dialect))
            .map_err(|e| ConfigError::invalid(format!("invalid dialect '{}': {}", self.dialect, e)))?;

        let invalid = |what: &str| ConfigError::invalid(format!("cannot set {what} for dialect '{}'", self.dialect));

        if let Some(host) = &self.host {
            url.set_host(Some(host)).map_err(|e| {
                ConfigError::invalid(format!("invalid host '{host}': {e}"))
            })?;
        }
        if let Some(user) = &self.user {
            url.set_username(user).map_err(|()| invalid("user"))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password)).map_err(|()| invalid("password"))?;
        }
        if let Some(port) = self.port {
            url.set_port(Some(port)).map_err(|()| invalid("port"))?;
        }
        if let Some(database) = &self.database {
            let path = if database.starts_with('/') {
                database.clone()
            } else {
                format!("/{database}")
            };
            url.set_path(&path);
        }
        if !self.options.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.options);
        }

        Ok(url.to_string())
    }
}

/// Connection descriptor: a URL string or its parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dsn {
    /// URL, with `${VAR}` / `${VAR:-default}` environment expansion.
    Url(String),
    /// Individual connection parameters.
    Details(DsnDetails),
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database name, filled in from the configuration key.
    #[serde(skip)]
    pub name: String,

    /// Connection descriptor.
    pub dsn: Dsn,

    /// Keep the session open between queries (default: true).
    #[serde(default = "default_keep_connected")]
    pub keep_connected: bool,

    /// Statements run in one transaction right after connecting.
    #[serde(default)]
    pub connect_sql: Vec<String>,

    /// Static labels attached to every series produced from this database.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl DatabaseConfig {
    /// Create a database configuration from a connection URL.
    pub fn new(name: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dsn: Dsn::Url(dsn.into()),
            keep_connected: true,
            connect_sql: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Set the keep-connected flag.
    pub fn with_keep_connected(mut self, keep_connected: bool) -> Self {
        self.keep_connected = keep_connected;
        self
    }

    /// Set the setup statements.
    pub fn with_connect_sql(mut self, statements: Vec<String>) -> Self {
        self.connect_sql = statements;
        self
    }

    /// Set static labels.
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Resolve the connection URL.
    ///
    /// `env:NAME` reads the URL from an environment variable and `file:PATH`
    /// from a file. Other strings get `${VAR}` expansion.
    pub fn connection_url(&self) -> Result<String, ConfigError> {
        let url = match &self.dsn {
            Dsn::Details(details) => return details.to_url(),
            Dsn::Url(url) => url,
        };

        if let Some(var) = url.strip_prefix("env:") {
            validate_identifier(var).map_err(|_| {
                ConfigError::invalid(format!("database '{}': invalid variable name: '{var}'", self.name))
            })?;
            return std::env::var(var).map_err(|_| {
                ConfigError::invalid(format!("database '{}': undefined variable: '{var}'", self.name))
            });
        }
        if let Some(path) = url.strip_prefix("file:") {
            return std::fs::read_to_string(path)
                .map(|content| content.trim().to_string())
                .map_err(|e| {
                    ConfigError::invalid(format!(
                        "database '{}': unable to read dsn file '{path}': {e}",
                        self.name
                    ))
                });
        }
        Ok(expand_env_vars(url))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.connection_url()?;
        url::Url::parse(&url).map_err(|e| {
            ConfigError::invalid(format!("database '{}': invalid DSN: {}", self.name, e))
        })?;
        if Backend::from_url(&url).is_none() {
            return Err(ConfigError::invalid(format!(
                "database '{}': unsupported database dialect",
                self.name
            )));
        }
        for label in self.labels.keys() {
            validate_identifier(label)
                .map_err(|e| ConfigError::invalid(format!("database '{}': {}", self.name, e)))?;
        }
        Ok(())
    }
}
