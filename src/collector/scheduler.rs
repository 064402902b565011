//! Query scheduler managing loop lifecycle and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::pipeline::{Pipeline, RunMode};
use super::schedule::{CronSchedule, Schedule};
use super::CollectorError;

/// Default timeout for graceful shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How often expired series are swept outside of scrapes.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A query with its resolved schedule.
#[derive(Debug, Clone)]
struct ScheduledQuery {
    name: String,
    databases: Vec<String>,
    schedule: Schedule,
}

/// Runs scheduled queries on their timers and on-demand queries on scrape.
pub struct QueryScheduler {
    pipeline: Arc<Pipeline>,
    queries: Vec<ScheduledQuery>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for QueryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryScheduler")
            .field("query_count", &self.queries.len())
            .field("in_flight", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl QueryScheduler {
    /// Resolve the schedule of every query.
    pub fn new(pipeline: Arc<Pipeline>) -> Result<Self, CollectorError> {
        let queries = pipeline
            .queries()
            .map(|query| -> Result<_, CollectorError> {
                Ok(ScheduledQuery {
                    name: query.name.clone(),
                    databases: query.databases.clone(),
                    schedule: query.schedule_mode()?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            pipeline,
            queries,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Spawn one loop per scheduled query plus the periodic sweep.
    pub fn start(&self) {
        let now = self.pipeline.registry().clock().now().with_timezone(&Local);
        for query in self.queries.iter().filter(|q| q.schedule.is_scheduled()) {
            if let Some(period) = query.schedule.period(&now)
                && let Some(config) = self.pipeline.queries().find(|c| c.name == query.name)
            {
                self.pipeline.record_interval(config, period);
            }

            let task = QueryLoop {
                pipeline: Arc::clone(&self.pipeline),
                query: query.clone(),
                cancel: self.cancel.clone(),
                tracker: self.tracker.clone(),
            };
            match query.schedule.clone() {
                Schedule::Interval(period) => {
                    self.tracker.spawn(task.run_interval(period));
                }
                Schedule::Cron(cron) => {
                    self.tracker.spawn(task.run_cron(cron));
                }
                Schedule::OnDemand => {}
            }
            tracing::info!(query = %query.name, schedule = %query.schedule, "Query scheduled");
        }

        self.tracker.spawn(sweep_loop(Arc::clone(&self.pipeline), self.cancel.clone()));
        tracing::info!("Query scheduler started");
    }

    /// Run every on-demand query against each of its databases and wait
    /// for all of them.
    pub async fn run_on_demand(&self) {
        let mut runs = JoinSet::new();
        for query in self.queries.iter().filter(|q| !q.schedule.is_scheduled()) {
            for database in &query.databases {
                let pipeline = Arc::clone(&self.pipeline);
                let (query, database) = (query.name.clone(), database.clone());
                runs.spawn(async move { pipeline.run(&query, &database, RunMode::OnDemand).await });
            }
        }
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "On-demand query task failed");
            }
        }
    }

    /// Gracefully shutdown with default timeout.
    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await;
    }

    /// Cancel all loops, wait for in-flight runs, then close every database
    /// session. The whole shutdown takes at most `timeout`. Sessions still in
    /// use when it runs out are left open.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout_at(deadline, self.tracker.wait()).await.is_err() {
            tracing::warn!(in_flight = self.tracker.len(), "Query scheduler shutdown timed out");
        } else {
            tracing::info!("Query scheduler shutdown complete");
        }
        if tokio::time::timeout_at(deadline, self.pipeline.close()).await.is_err() {
            tracing::warn!("Database sessions still in use, leaving them open");
        }
    }
}

struct QueryLoop {
    pipeline: Arc<Pipeline>,
    query: ScheduledQuery,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl QueryLoop {
    async fn run_interval(self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.tick() {
                break;
            }
        }
        tracing::debug!(query = %self.query.name, "Query loop stopped");
    }

    async fn run_cron(self, cron: CronSchedule) {
        let mut previous = None;
        loop {
            let now = self.pipeline.registry().clock().now().with_timezone(&Local);
            let Some(next) = next_fire(&cron, previous, now) else {
                tracing::warn!(query = %self.query.name, schedule = %cron.expr(), "No upcoming fire time");
                break;
            };
            previous = Some(next);
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            if !self.tick() {
                break;
            }
        }
        tracing::debug!(query = %self.query.name, "Query loop stopped");
    }

    /// Spawn one run per live database. Returns `false` once every database
    /// is doomed.
    fn tick(&self) -> bool {
        let doom = self.pipeline.doom();
        if doom.all_doomed(&self.query.name, &self.query.databases) {
            tracing::info!(query = %self.query.name, "All databases doomed, stopping query loop");
            return false;
        }
        for database in &self.query.databases {
            if doom.is_doomed(&self.query.name, database) {
                continue;
            }
            let pipeline = Arc::clone(&self.pipeline);
            let (query, database) = (self.query.name.clone(), database.clone());
            self.tracker
                .spawn(async move { pipeline.run(&query, &database, RunMode::Scheduled).await });
        }
        true
    }
}

/// Next fire time after the previous one, or after `now` if the previous
/// one is older or this is the first. A wall clock running behind the timer
/// never yields the same fire time twice.
fn next_fire(
    cron: &CronSchedule,
    previous: Option<DateTime<Local>>,
    now: DateTime<Local>,
) -> Option<DateTime<Local>> {
    let after = previous.map_or(now, |previous| previous.max(now));
    cron.next_after(&after)
}

async fn sweep_loop(pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                pipeline.registry().sweep_expired();
            }
        }
    }
}
