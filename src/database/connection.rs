//! Backend connections.
//!
//! Each supported backend keeps its native sqlx connection type so rows are
//! decoded with the backend's own column types (NUMERIC, DECIMAL, catalog
//! names, timestamps) instead of the narrow common subset.

use std::time::Duration;

use sqlx::mysql::MySqlConnection;
use sqlx::postgres::PgConnection;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Column, Connection, Row, Transaction};
use tokio::time::Instant;

use crate::config::ParameterSet;

use super::params::{PlaceholderStyle, PreparedSql, bind};
use super::value::{SqlValue, decode_mysql, decode_postgres, decode_sqlite};

/// A supported database backend, chosen by the DSN scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Backend {
    #[strum(serialize = "PostgreSQL")]
    Postgres,
    #[strum(serialize = "MySQL")]
    MySql,
    #[strum(serialize = "SQLite")]
    Sqlite,
}

impl Backend {
    /// Backend for a connection URL, `None` if the scheme is not supported.
    pub fn from_url(url: &str) -> Option<Self> {
        let (scheme, _) = url.split_once(':')?;
        match scheme.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySql),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Positional placeholder syntax of the backend.
    pub fn placeholder_style(self) -> PlaceholderStyle {
        match self {
            Self::Postgres => PlaceholderStyle::Numbered,
            Self::MySql | Self::Sqlite => PlaceholderStyle::Question,
        }
    }
}

/// Column names, decoded rows and fetch latency.
pub(crate) type Fetched = (Vec<String>, Vec<Vec<SqlValue>>, Duration);

/// An open connection to one of the supported backends.
#[derive(Debug)]
pub enum DbConnection {
    Postgres(PgConnection),
    MySql(MySqlConnection),
    Sqlite(SqliteConnection),
}

macro_rules! fetch_in_transaction {
    ($conn:expr, $db:ty, $prepared:expr, $params:expr, $decode:path) => {{
        let mut tx = $conn.begin().await?;
        let started = Instant::now();
        let fetched = bind::<$db>($prepared, $params)
            .fetch_all(&mut *tx)
            .await
            .and_then(|rows| {
                let latency = started.elapsed();
                Ok((column_names(&rows), decode_rows(&rows, $decode)?, latency))
            });
        finish(tx, fetched).await
    }};
}

macro_rules! run_statements {
    ($conn:expr, $statements:expr) => {{
        let mut tx = $conn.begin().await?;
        for statement in $statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await
    }};
}

impl DbConnection {
    /// Open a connection to `url`.
    pub async fn connect(backend: Backend, url: &str) -> Result<Self, sqlx::Error> {
        match backend {
            Backend::Postgres => PgConnection::connect(url).await.map(Self::Postgres),
            Backend::MySql => MySqlConnection::connect(url).await.map(Self::MySql),
            Backend::Sqlite => SqliteConnection::connect(url).await.map(Self::Sqlite),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Self::Postgres(_) => Backend::Postgres,
            Self::MySql(_) => Backend::MySql,
            Self::Sqlite(_) => Backend::Sqlite,
        }
    }

    /// Run `statements` in one transaction.
    pub async fn run_setup(&mut self, statements: &[String]) -> Result<(), sqlx::Error> {
        match self {
            Self::Postgres(conn) => run_statements!(conn, statements),
            Self::MySql(conn) => run_statements!(conn, statements),
            Self::Sqlite(conn) => run_statements!(conn, statements),
        }
    }

    /// Fetch all rows of `prepared` inside a transaction, rolling back on
    /// failure.
    pub(crate) async fn fetch(
        &mut self,
        prepared: &PreparedSql,
        params: &ParameterSet,
    ) -> Result<Fetched, sqlx::Error> {
        match self {
            Self::Postgres(conn) => {
                fetch_in_transaction!(conn, sqlx::Postgres, prepared, params, decode_postgres)
            }
            Self::MySql(conn) => {
                fetch_in_transaction!(conn, sqlx::MySql, prepared, params, decode_mysql)
            }
            Self::Sqlite(conn) => {
                fetch_in_transaction!(conn, sqlx::Sqlite, prepared, params, decode_sqlite)
            }
        }
    }

    /// Close the connection gracefully.
    pub async fn close(self) -> Result<(), sqlx::Error> {
        match self {
            Self::Postgres(conn) => conn.close().await,
            Self::MySql(conn) => conn.close().await,
            Self::Sqlite(conn) => conn.close().await,
        }
    }
}

async fn finish<DB: sqlx::Database, T>(
    tx: Transaction<'_, DB>,
    result: Result<T, sqlx::Error>,
) -> Result<T, sqlx::Error> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::debug!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

fn column_names<R: Row>(rows: &[R]) -> Vec<String> {
    rows.first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default()
}

fn decode_rows<R: Row>(
    rows: &[R],
    decode: fn(&R, usize) -> Result<SqlValue, sqlx::Error>,
) -> Result<Vec<Vec<SqlValue>>, sqlx::Error> {
    rows.iter()
        .map(|row| (0..row.len()).map(|i| decode(row, i)).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_url() {
        assert_eq!(Backend::from_url("postgres://u@h/db"), Some(Backend::Postgres));
        assert_eq!(Backend::from_url("postgresql://u@h/db"), Some(Backend::Postgres));
        assert_eq!(Backend::from_url("MySQL://u@h/db"), Some(Backend::MySql));
        assert_eq!(Backend::from_url("mariadb://u@h/db"), Some(Backend::MySql));
        assert_eq!(Backend::from_url("sqlite::memory:"), Some(Backend::Sqlite));
        assert_eq!(Backend::from_url("oracle://u@h/db"), None);
        assert_eq!(Backend::from_url("no-scheme"), None);
    }

    #[test]
    fn test_placeholder_style() {
        assert_eq!(Backend::Postgres.placeholder_style(), PlaceholderStyle::Numbered);
        assert_eq!(Backend::MySql.placeholder_style(), PlaceholderStyle::Question);
        assert_eq!(Backend::Sqlite.placeholder_style(), PlaceholderStyle::Question);
        assert_eq!(Backend::Postgres.to_string(), "PostgreSQL");
    }

    #[tokio::test]
    async fn test_fetch_and_setup_on_sqlite() {
        let mut conn = DbConnection::connect(Backend::Sqlite, "sqlite::memory:").await.unwrap();
        assert_eq!(conn.backend(), Backend::Sqlite);
        conn.run_setup(&[
            "CREATE TABLE t (v INTEGER)".to_string(),
            "INSERT INTO t VALUES (1), (2)".to_string(),
        ])
        .await
        .unwrap();

        let prepared = PreparedSql {
            sql: "SELECT SUM(v) AS total FROM t".to_string(),
            binds: Vec::new(),
        };
        let (columns, rows, _) = conn.fetch(&prepared, &ParameterSet::new()).await.unwrap();
        assert_eq!(columns, vec!["total"]);
        assert_eq!(rows, vec![vec![SqlValue::Int(3)]]);
        conn.close().await.unwrap();
    }
}
