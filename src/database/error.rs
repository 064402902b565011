//! Query execution error types.
//!
//! Every failed run of a query against a database surfaces as a
//! [`QueryError`]. The collector classifies it to decide whether the
//! (query, database) pair can ever succeed again.

use std::time::Duration;

use thiserror::Error;

use crate::metrics::MetricsError;

/// Errors turning result rows into metric updates.
#[derive(Debug, Error)]
pub enum MappingError {
    /// Number of result columns doesn't match metrics plus labels.
    #[error("wrong result count from query: expected {expected}, got {got}")]
    InvalidResultCount { expected: usize, got: usize },

    /// Result column names don't match metrics plus labels.
    #[error("wrong column names from query: expected ({}), got ({})", .expected.join(", "), .got.join(", "))]
    InvalidResultColumnNames { expected: Vec<String>, got: Vec<String> },

    /// A column value can't be used for its metric.
    #[error("invalid value for metric '{metric}': {reason}")]
    InvalidValue { metric: String, reason: String },
}

/// Errors running a query against a database.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Opening the session or running its setup statements failed.
    #[error("connection to database '{database}' failed: {source}")]
    Connection {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// The query did not complete in time.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// Statement or transaction failure.
    #[error("query execution failed: {0}")]
    Execution(#[from] sqlx::Error),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Parameter names don't match the SQL placeholders.
    #[error("parameters for query '{query}' don't match those from SQL: expected ({}), got ({})", .expected.join(", "), .got.join(", "))]
    ParameterMismatch {
        query: String,
        expected: Vec<String>,
        got: Vec<String>,
    },

    #[error("metrics update failed: {0}")]
    Metrics(#[from] MetricsError),
}

impl QueryError {
    /// Whether the session can no longer be trusted after this error.
    pub fn breaks_session(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Execution(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}
