//! Connection lifecycle for a configured database.
//!
//! Each [`Database`] owns at most one live session. Access goes through
//! [`Database::acquire`], which locks the session for the caller so that
//! opening, closing and statements never interleave on one database.

use tokio::sync::{Mutex, MutexGuard};

use crate::config::{ConfigError, DatabaseConfig};

use super::QueryError;
use super::connection::{Backend, DbConnection};

/// A configured database and its session.
pub struct Database {
    config: DatabaseConfig,
    url: String,
    backend: Backend,
    session: Mutex<Option<DbConnection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.config.name)
            .field("backend", &self.backend)
            .field("keep_connected", &self.config.keep_connected)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Create a database handle. No connection is made until the first
    /// [`acquire`](Self::acquire).
    pub fn new(config: DatabaseConfig) -> Result<Self, ConfigError> {
        let url = config.connection_url()?;
        let backend = Backend::from_url(&url).ok_or_else(|| {
            ConfigError::invalid(format!("database '{}': unsupported database dialect", config.name))
        })?;
        Ok(Self {
            config,
            url,
            backend,
            session: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Whether a session is currently open.
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Lock the session, opening it first if needed.
    ///
    /// # Errors
    /// Returns `QueryError::Connection` if connecting or running the setup
    /// statements fails. The session is left closed in that case.
    pub async fn acquire(&self) -> Result<SessionGuard<'_>, QueryError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
            tracing::debug!(database = %self.config.name, backend = %self.backend, "Connected");
        }
        Ok(SessionGuard { db: self, guard })
    }

    /// Close the session if open. Waits for a caller holding the session to
    /// give it back first.
    pub async fn close(&self) {
        let mut guard = self.session.lock().await;
        if let Some(conn) = guard.take() {
            self.close_connection(conn).await;
        }
    }

    async fn connect(&self) -> Result<DbConnection, QueryError> {
        let connection_error = |source: sqlx::Error| QueryError::Connection {
            database: self.config.name.clone(),
            source,
        };

        let mut conn = DbConnection::connect(self.backend, &self.url)
            .await
            .map_err(connection_error)?;

        if self.config.connect_sql.is_empty() {
            return Ok(conn);
        }

        match conn.run_setup(&self.config.connect_sql).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                tracing::warn!(database = %self.config.name, error = %e, "Setup statements failed");
                self.close_connection(conn).await;
                Err(connection_error(e))
            }
        }
    }

    async fn close_connection(&self, conn: DbConnection) {
        if let Err(e) = conn.close().await {
            tracing::warn!(database = %self.config.name, error = %e, "Error closing connection");
        }
        tracing::debug!(database = %self.config.name, "Disconnected");
    }
}

/// Exclusive access to an open session.
///
/// Dropping the guard without [`release`](Self::release) still honors
/// `keep-connected: false` by dropping the connection.
#[derive(Debug)]
pub struct SessionGuard<'a> {
    db: &'a Database,
    guard: MutexGuard<'a, Option<DbConnection>>,
}

impl SessionGuard<'_> {
    /// The open connection.
    pub fn connection(&mut self) -> Option<&mut DbConnection> {
        self.guard.as_mut()
    }

    /// Give the session back, closing it unless the database keeps it open.
    pub async fn release(mut self) {
        if !self.db.config.keep_connected
            && let Some(conn) = self.guard.take()
        {
            self.db.close_connection(conn).await;
        }
    }

    /// Drop the session regardless of `keep-connected`, without waiting for
    /// the backend. A statement abandoned by a timeout may still be running
    /// on it.
    pub fn discard(mut self) {
        if self.guard.take().is_some() {
            tracing::debug!(database = %self.db.config.name, "Session discarded");
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if !self.db.config.keep_connected {
            self.guard.take();
        }
    }
}
