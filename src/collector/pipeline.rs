//! One run of a query against one database: execute, map, record.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, MetricConfig, ParameterSet, QueryConfig};
use crate::database::{Database, QueryError, execute};
use crate::metrics::builtin::{self, DATABASE_LABEL, QueryStatus};
use crate::metrics::{MetricsError, MetricsRegistry, register_configured};

use super::CollectorError;
use super::doom::{DoomPolicy, FailureClass, classify};
use super::mapper;

/// Who asked for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Timer or cron tick. Skipped if the pair is already running.
    Scheduled,
    /// Scrape. Waits for an in-flight run of the pair instead of starting one.
    OnDemand,
}

/// Result of [`Pipeline::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The pair is doomed and was not run.
    Doomed,
    /// A scheduled tick found the pair still running and was skipped.
    Busy,
    /// An on-demand run waited for an in-flight run and didn't start another.
    Coalesced,
    Success,
    Failed(FailureClass),
}

/// Executes queries and records their results in the registry.
pub struct Pipeline {
    databases: BTreeMap<String, Arc<Database>>,
    metrics: BTreeMap<String, MetricConfig>,
    queries: BTreeMap<String, QueryConfig>,
    registry: Arc<MetricsRegistry>,
    doom: DoomPolicy,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("databases", &self.databases.keys().collect::<Vec<_>>())
            .field("queries", &self.queries.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build database handles and register builtin and configured metrics.
    pub fn new(config: &AppConfig, registry: Arc<MetricsRegistry>) -> Result<Self, CollectorError> {
        let mut extra_labels = vec![DATABASE_LABEL.to_string()];
        extra_labels.extend(config.database_label_names());

        builtin::register(
            &registry,
            &extra_labels,
            config.builtin_metrics.query_latency.buckets.as_deref(),
        )?;
        register_configured(&registry, &config.metrics, &extra_labels)?;

        let databases: BTreeMap<_, _> = config
            .databases
            .values()
            .map(|db| -> Result<_, CollectorError> {
                Ok((db.name.clone(), Arc::new(Database::new(db.clone())?)))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            databases,
            metrics: config.metrics.clone(),
            queries: config.queries.clone(),
            registry,
            doom: DoomPolicy::new(),
        })
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn queries(&self) -> impl Iterator<Item = &QueryConfig> {
        self.queries.values()
    }

    pub fn database(&self, name: &str) -> Option<&Arc<Database>> {
        self.databases.get(name)
    }

    pub fn doom(&self) -> &DoomPolicy {
        &self.doom
    }

    /// Run `query` against `database` once, for every parameter set.
    pub async fn run(&self, query: &str, database: &str, mode: RunMode) -> RunOutcome {
        let (Some(query), Some(db)) = (self.queries.get(query), self.databases.get(database))
        else {
            tracing::warn!(query = %query, database = %database, "Unknown query or database");
            return RunOutcome::Failed(FailureClass::Transient);
        };

        let state = self.doom.state(&query.name, db.name());
        if state.is_doomed() {
            return RunOutcome::Doomed;
        }

        let _running = match state.lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => match mode {
                RunMode::Scheduled => {
                    tracing::debug!(query = %query.name, database = %db.name(), "Previous run still in progress, skipping");
                    return RunOutcome::Busy;
                }
                RunMode::OnDemand => {
                    let _ = state.lock.lock().await;
                    return RunOutcome::Coalesced;
                }
            },
        };
        if state.is_doomed() {
            return RunOutcome::Doomed;
        }

        let base = builtin::database_labels(db.config());
        let mut outcome = RunOutcome::Success;
        for params in query.parameter_sets() {
            let result = self.run_unit(query, db, &base, &params).await;
            let Err(err) = result else {
                self.record_builtin(builtin::record_query(
                    &self.registry,
                    &base,
                    &query.name,
                    QueryStatus::Success,
                ));
                continue;
            };

            let class = classify(&err);
            outcome = RunOutcome::Failed(class);
            if matches!(err, QueryError::Connection { .. }) {
                tracing::warn!(query = %query.name, database = %db.name(), error = %err, "Database connection failed");
                self.record_builtin(builtin::record_database_error(&self.registry, &base));
                break;
            }
            if class == FailureClass::Structural {
                if self.doom.record_and_check(&query.name, db.name(), &Err(err)) {
                    self.record_builtin(builtin::record_query(
                        &self.registry,
                        &base,
                        &query.name,
                        QueryStatus::Error,
                    ));
                }
                break;
            }

            let status = if matches!(err, QueryError::Timeout(_)) {
                tracing::warn!(query = %query.name, database = %db.name(), error = %err, "Query timed out");
                QueryStatus::Timeout
            } else {
                tracing::warn!(query = %query.name, database = %db.name(), error = %err, "Query failed");
                QueryStatus::Error
            };
            self.record_builtin(builtin::record_query(&self.registry, &base, &query.name, status));
        }
        outcome
    }

    /// Execute with one parameter set and apply the resulting updates.
    async fn run_unit(
        &self,
        query: &QueryConfig,
        db: &Database,
        base: &BTreeMap<String, String>,
        params: &ParameterSet,
    ) -> Result<(), QueryError> {
        let mut session = db.acquire().await?;
        let result = execute(
            &mut session,
            &query.name,
            &query.sql,
            params,
            query.timeout,
            self.registry.clock().as_ref(),
        )
        .await;
        match &result {
            Err(e) if e.breaks_session() => session.discard(),
            _ => session.release().await,
        }
        let results = result?;

        tracing::debug!(
            query = %query.name,
            database = %db.name(),
            rows = results.rows.len(),
            duration_ms = results.latency.as_millis() as u64,
            "Query executed"
        );

        let updates = mapper::map(query, &self.metrics, &results)?;
        for update in updates {
            let mut labels = base.clone();
            labels.extend(update.labels);
            self.registry.update(&update.metric, &labels, update.value)?;
        }
        builtin::record_latency(&self.registry, base, &query.name, results.latency)?;
        builtin::record_timestamp(&self.registry, base, &query.name, results.timestamp)?;
        Ok(())
    }

    /// Set `query_interval` for every database of a scheduled query.
    pub fn record_interval(&self, query: &QueryConfig, period: Duration) {
        for name in &query.databases {
            if let Some(db) = self.databases.get(name) {
                let base = builtin::database_labels(db.config());
                self.record_builtin(builtin::record_interval(
                    &self.registry,
                    &base,
                    &query.name,
                    period,
                ));
            }
        }
    }

    fn record_builtin(&self, result: Result<(), MetricsError>) {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to record builtin metric");
        }
    }

    /// Close every database session, waiting for sessions in use.
    pub async fn close(&self) {
        for db in self.databases.values() {
            db.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::SeriesValue;
    use crate::metrics::builtin::{DATABASE_ERRORS, QUERIES, QUERY_LATENCY};

    fn pipeline(yaml: &str) -> Pipeline {
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        let registry = Arc::new(MetricsRegistry::new(Arc::new(ManualClock::default())));
        Pipeline::new(&config, registry).unwrap()
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn queries_count(pipeline: &Pipeline, query: &str, status: &str) -> Option<SeriesValue> {
        pipeline.registry().get(
            QUERIES,
            &labels(&[("database", "db1"), ("query", query), ("status", status)]),
        )
    }

    #[tokio::test]
    async fn test_run_records_metrics() {
        let p = pipeline(
            r#"
databases:
  db1:
    dsn: "sqlite::memory:"
    labels: { region: eu }
metrics:
  m: { type: gauge, labels: [kind] }
queries:
  q1:
    databases: [db1]
    metrics: [m]
    sql: SELECT 42 AS m, 'a' AS kind
"#,
        );

        assert_eq!(p.run("q1", "db1", RunMode::OnDemand).await, RunOutcome::Success);
        assert_eq!(
            p.registry()
                .get("m", &labels(&[("database", "db1"), ("region", "eu"), ("kind", "a")])),
            Some(SeriesValue::Gauge(42.0))
        );
        let base = labels(&[("database", "db1"), ("region", "eu"), ("query", "q1")]);
        let mut with_status = base.clone();
        with_status.insert("status".into(), "success".into());
        assert_eq!(p.registry().get(QUERIES, &with_status), Some(SeriesValue::Counter(1.0)));
        assert!(matches!(
            p.registry().get(QUERY_LATENCY, &base),
            Some(SeriesValue::Histogram { count: 1, .. })
        ));
        p.close().await;
    }

    #[tokio::test]
    async fn test_structural_failure_dooms_pair() {
        let p = pipeline(
            r#"
databases:
  db1: { dsn: "sqlite::memory:" }
metrics:
  m: { type: gauge }
queries:
  q1:
    databases: [db1]
    metrics: [m]
    sql: SELECT 1 AS m, 2 AS other
"#,
        );

        assert_eq!(
            p.run("q1", "db1", RunMode::OnDemand).await,
            RunOutcome::Failed(FailureClass::Structural)
        );
        assert_eq!(p.run("q1", "db1", RunMode::OnDemand).await, RunOutcome::Doomed);
        assert_eq!(p.run("q1", "db1", RunMode::Scheduled).await, RunOutcome::Doomed);
        assert_eq!(queries_count(&p, "q1", "error"), Some(SeriesValue::Counter(1.0)));
        assert!(p.doom().all_doomed("q1", &["db1"]));
    }

    #[tokio::test]
    async fn test_transient_failure_counts_each_run() {
        let p = pipeline(
            r#"
databases:
  db1: { dsn: "sqlite::memory:" }
metrics:
  m: { type: gauge }
queries:
  q1:
    databases: [db1]
    metrics: [m]
    sql: SELECT m FROM missing_table
"#,
        );

        for _ in 0..2 {
            assert_eq!(
                p.run("q1", "db1", RunMode::Scheduled).await,
                RunOutcome::Failed(FailureClass::Transient)
            );
        }
        assert_eq!(queries_count(&p, "q1", "error"), Some(SeriesValue::Counter(2.0)));
        assert!(!p.doom().is_doomed("q1", "db1"));
    }

    #[tokio::test]
    async fn test_matrix_runs_every_combination() {
        let p = pipeline(
            r#"
databases:
  db1: { dsn: "sqlite::memory:" }
metrics:
  m: { type: counter, increment: true }
queries:
  q1:
    databases: [db1]
    metrics: [m]
    sql: SELECT :a__x * :b__y AS m
    parameters:
      a: [{x: 1}, {x: 2}, {x: 3}]
      b: [{y: 10}, {y: 20}, {y: 30}]
"#,
        );

        assert_eq!(p.run("q1", "db1", RunMode::OnDemand).await, RunOutcome::Success);
        assert_eq!(queries_count(&p, "q1", "success"), Some(SeriesValue::Counter(9.0)));
        // (1 + 2 + 3) * (10 + 20 + 30)
        assert_eq!(
            p.registry().get("m", &labels(&[("database", "db1")])),
            Some(SeriesValue::Counter(360.0))
        );
    }

    #[tokio::test]
    async fn test_connection_error_counts_database_error() {
        let p = pipeline(
            r#"
databases:
  db1: { dsn: "sqlite:///nonexistent-dir/missing.db" }
metrics:
  m: { type: gauge }
queries:
  q1:
    databases: [db1]
    metrics: [m]
    sql: SELECT 1 AS m
"#,
        );

        assert_eq!(
            p.run("q1", "db1", RunMode::OnDemand).await,
            RunOutcome::Failed(FailureClass::Transient)
        );
        assert_eq!(
            p.registry().get(DATABASE_ERRORS, &labels(&[("database", "db1")])),
            Some(SeriesValue::Counter(1.0))
        );
        assert_eq!(queries_count(&p, "q1", "error"), None);
    }

    #[tokio::test]
    async fn test_runs_on_shared_database_never_overlap() {
        let p = Arc::new(pipeline(
            r#"
databases:
  db1: { dsn: "sqlite::memory:" }
metrics:
  m: { type: gauge }
queries:
  q1:
    databases: [db1]
    metrics: [m]
    sql: SELECT 1 AS m
"#,
        ));

        let db = Arc::clone(p.database("db1").unwrap());
        let session = db.acquire().await.unwrap();

        let task = tokio::spawn({
            let p = Arc::clone(&p);
            async move { p.run("q1", "db1", RunMode::Scheduled).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        session.release().await;
        assert_eq!(task.await.unwrap(), RunOutcome::Success);
    }

    #[tokio::test]
    async fn test_busy_pair_is_skipped_or_coalesced() {
        let p = pipeline(
            r#"
databases:
  db1: { dsn: "sqlite::memory:" }
metrics:
  m: { type: gauge }
queries:
  q1:
    databases: [db1]
    metrics: [m]
    sql: SELECT 1 AS m
"#,
        );

        let state = p.doom().state("q1", "db1");
        let running = state.lock.lock().await;
        assert_eq!(p.run("q1", "db1", RunMode::Scheduled).await, RunOutcome::Busy);

        let (outcome, ()) = tokio::join!(p.run("q1", "db1", RunMode::OnDemand), async {
            tokio::task::yield_now().await;
            drop(running);
        });
        assert_eq!(outcome, RunOutcome::Coalesced);
        assert_eq!(queries_count(&p, "q1", "success"), None);
    }

    #[tokio::test]
    async fn test_timed_out_run_frees_database() {
        let p = pipeline(
            r#"
databases:
  db1: { dsn: "sqlite::memory:" }
metrics:
  m: { type: gauge }
queries:
  slow:
    databases: [db1]
    metrics: [m]
    timeout: 0.1
    sql: |
      WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 1000000000)
      SELECT COUNT(*) AS m FROM c
  fast:
    databases: [db1]
    metrics: [m]
    sql: SELECT 1 AS m
"#,
        );

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            p.run("slow", "db1", RunMode::OnDemand),
        )
        .await
        .expect("timed-out run kept holding the database");
        assert_eq!(outcome, RunOutcome::Failed(FailureClass::Transient));
        assert_eq!(queries_count(&p, "slow", "timeout"), Some(SeriesValue::Counter(1.0)));

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            p.run("fast", "db1", RunMode::OnDemand),
        )
        .await
        .expect("database still blocked after timeout");
        assert_eq!(outcome, RunOutcome::Success);
    }
}
