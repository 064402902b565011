//! Tracks (query, database) pairs that can never succeed.
//!
//! A structural failure means the query and its metric declarations
//! disagree about the result shape. Rerunning won't help, so the pair is
//! doomed and skipped from then on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::database::{MappingError, QueryError};

/// How a failure affects future runs of the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Counted and retried on the next tick.
    Transient,
    /// Dooms the pair.
    Structural,
}

pub fn classify(err: &QueryError) -> FailureClass {
    match err {
        QueryError::Mapping(
            MappingError::InvalidResultCount { .. } | MappingError::InvalidResultColumnNames { .. },
        )
        | QueryError::ParameterMismatch { .. } => FailureClass::Structural,
        _ => FailureClass::Transient,
    }
}

/// Per-pair execution state.
#[derive(Debug, Default)]
pub struct ExecutionState {
    doomed: AtomicBool,
    /// Held for the whole of one run of the pair.
    pub(crate) lock: tokio::sync::Mutex<()>,
}

impl ExecutionState {
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }

    /// Mark as doomed. Returns `true` only for the call that made the change.
    fn doom(&self) -> bool {
        !self.doomed.swap(true, Ordering::AcqRel)
    }
}

/// Doom bookkeeping for all pairs.
#[derive(Debug, Default)]
pub struct DoomPolicy {
    states: Mutex<HashMap<(String, String), Arc<ExecutionState>>>,
}

impl DoomPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of a pair, created on first use.
    pub fn state(&self, query: &str, database: &str) -> Arc<ExecutionState> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .entry((query.to_string(), database.to_string()))
            .or_default()
            .clone()
    }

    pub fn is_doomed(&self, query: &str, database: &str) -> bool {
        self.state(query, database).is_doomed()
    }

    /// Record the outcome of one run. Returns `true` if this outcome doomed
    /// the pair; the transition is logged here and only once.
    pub fn record_and_check(
        &self,
        query: &str,
        database: &str,
        outcome: &Result<(), QueryError>,
    ) -> bool {
        let Err(err) = outcome else {
            return false;
        };
        if classify(err) != FailureClass::Structural {
            return false;
        }
        let doomed = self.state(query, database).doom();
        if doomed {
            tracing::error!(
                query = %query,
                database = %database,
                error = %err,
                "Query failed structurally, it won't be run again on this database"
            );
        }
        doomed
    }

    /// Whether every one of `databases` is doomed for `query`.
    pub fn all_doomed<S: AsRef<str>>(&self, query: &str, databases: &[S]) -> bool {
        databases
            .iter()
            .all(|database| self.is_doomed(query, database.as_ref()))
    }
}
