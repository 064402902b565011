//! Runs one SQL statement with one parameter set.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::ParameterSet;

use super::params::{check_parameters, rewrite};
use super::session::SessionGuard;
use super::value::SqlValue;
use super::QueryError;

/// Rows returned by one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResults {
    /// Column names in result order.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    /// When the execution completed.
    pub timestamp: DateTime<Utc>,
    /// Time spent running the statement and fetching rows.
    pub latency: Duration,
}

impl QueryResults {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Execute `sql` inside a transaction on the session.
///
/// The timeout bounds the whole begin to commit span. On timeout the
/// caller must discard the session since the transaction state is unknown.
///
/// # Errors
/// - `QueryError::ParameterMismatch` if `params` doesn't match the SQL placeholders
/// - `QueryError::Timeout` if the timeout elapses
/// - `QueryError::Execution` for any database failure, after rollback
pub async fn execute(
    session: &mut SessionGuard<'_>,
    query: &str,
    sql: &str,
    params: &ParameterSet,
    timeout: Option<Duration>,
    clock: &dyn Clock,
) -> Result<QueryResults, QueryError> {
    check_parameters(query, sql, params)?;

    let conn = session
        .connection()
        .ok_or_else(|| QueryError::Execution(sqlx::Error::Protocol("session is closed".into())))?;
    let prepared = rewrite(sql, conn.backend().placeholder_style());

    let run = conn.fetch(&prepared, params);
    let (columns, rows, latency) = match timeout {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .map_err(|_| QueryError::Timeout(limit))??,
        None => run.await?,
    };

    Ok(QueryResults {
        columns,
        rows,
        timestamp: clock.now(),
        latency,
    })
}
