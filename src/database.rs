//! Database Layer
//!
//! One logical session per configured database, opened lazily with the
//! native sqlx driver for its PostgreSQL, MySQL or SQLite DSN.
//!
//! # Components
//!
//! - [`Database`] / [`SessionGuard`]: Connection lifecycle and exclusive access
//! - [`DbConnection`] / [`Backend`]: Per-backend connections and row decoding
//! - [`execute`]: Runs one statement in a transaction under a timeout
//! - [`SqlValue`]: Decoded column values
//! - [`QueryError`] / [`MappingError`]: Failure taxonomy

mod connection;
mod error;
mod executor;
pub mod params;
mod session;
mod value;

pub use connection::{Backend, DbConnection};
pub use error::{MappingError, QueryError};
pub use executor::{QueryResults, execute};
pub use params::placeholders;
pub use session::{Database, SessionGuard};
pub use value::SqlValue;
