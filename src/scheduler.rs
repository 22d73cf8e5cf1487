//! Startup initialization and the refresh loop.
//!
//! # Architecture
//! - [`Scheduler::plan`] reads the catalog snapshot once and ranks it into a
//!   [`Schedule`]. No DDL happens here.
//! - [`Scheduler::start`] prepares the gate: output tables in schedule
//!   order, then change tracking once per distinct table.
//! - [`Scheduler::run`] waits on a [`PassTrigger`] and runs one pass per
//!   firing until cancelled.
//!
//! # Error Handling & Resilience
//! - **Startup**: any catalog, schedule or DDL error aborts; there is no
//!   safe partial schedule to run.
//! - **Per-entry isolation**: a failed refresh is logged and recorded, and
//!   the pass moves on to the next entry. The failed view is retried on a
//!   later pass, after optional backoff from [`RetryPolicy`].
//! - **Cancellation**: checked before every entry. A refresh that has
//!   started is always awaited to completion; atomicity of that refresh is
//!   the gate's business.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::{self, CatalogSource, View};
use crate::config::SchedulerConfig;
use crate::dag::{Schedule, ViewDag};
use crate::error::{RetryPolicy, RetryState, ViewMatError};
use crate::monitor::{self, PassReport, RefreshStats};
use crate::policy::{Clock, PassTrigger, SystemClock};
use crate::refresh::MaterializationGate;

/// Per-entry state owned by the driver.
#[derive(Debug, Clone, Default)]
struct EntryState {
    retry: RetryState,
    stats: RefreshStats,
}

/// How a call to [`Scheduler::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Passes started during this run (including an interrupted one).
    pub passes: u64,
    /// Whether the last pass was cut short by cancellation.
    pub interrupted: bool,
}

/// Dependency-ordered refresh driver.
pub struct Scheduler {
    config: SchedulerConfig,
    schedule: Schedule,
    gate: Arc<dyn MaterializationGate>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    /// Aligned with `schedule.entries()`.
    states: Vec<EntryState>,
    passes: u64,
}

impl Scheduler {
    /// Read the catalog and rank it. Pure with respect to the database.
    pub async fn plan(
        catalog: &dyn CatalogSource,
        config: &SchedulerConfig,
    ) -> Result<Schedule, ViewMatError> {
        let snapshot = catalog::load_snapshot(catalog, &config.view_schema).await?;
        let dag = ViewDag::build(snapshot, &config.materialized_schema)?;
        let schedule = dag.schedule()?;

        info!(
            views = schedule.len(),
            edges = dag.edge_count(),
            max_rank = schedule.max_rank(),
            view_schema = %config.view_schema,
            "pg_viewmat: schedule built"
        );
        for entry in &schedule {
            debug!(view = %entry.view, rank = entry.rank, tables = entry.tables.len(), "pg_viewmat: scheduled");
        }
        Ok(schedule)
    }

    /// Prepare output tables and change tracking for `schedule`.
    pub async fn start(
        schedule: Schedule,
        gate: Arc<dyn MaterializationGate>,
        config: SchedulerConfig,
    ) -> Result<Self, ViewMatError> {
        // Schedule order: an output table is created before any view that
        // reads it.
        for entry in &schedule {
            gate.ensure_output_table(&entry.view, &config.materialized_schema)
                .await?;
        }

        let tables = schedule.distinct_tables();
        for table in &tables {
            gate.enable_change_tracking(table, &config.work_schema)
                .await?;
        }
        info!(
            views = schedule.len(),
            tracked_tables = tables.len(),
            "pg_viewmat: output tables and change tracking ready"
        );

        let retry_policy = config.retry.policy();
        let states = vec![EntryState::default(); schedule.len()];
        Ok(Scheduler {
            config,
            schedule,
            gate,
            clock: Arc::new(SystemClock),
            retry_policy,
            states,
            passes: 0,
        })
    }

    /// [`plan`](Self::plan) followed by [`start`](Self::start).
    pub async fn initialize(
        catalog: &dyn CatalogSource,
        gate: Arc<dyn MaterializationGate>,
        config: SchedulerConfig,
    ) -> Result<Self, ViewMatError> {
        let schedule = Self::plan(catalog, &config).await?;
        Self::start(schedule, gate, config).await
    }

    /// Replace the wall clock used for retry backoff and statistics.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Passes started since startup.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Statistics for `view`, if it is scheduled.
    pub fn stats_for(&self, view: &View) -> Option<&RefreshStats> {
        self.schedule
            .iter()
            .position(|e| &e.view == view)
            .map(|i| &self.states[i].stats)
    }

    /// Statistics for every view, in schedule order.
    pub fn stats(&self) -> impl Iterator<Item = (&View, &RefreshStats)> {
        self.schedule
            .iter()
            .zip(&self.states)
            .map(|(e, s)| (&e.view, &s.stats))
    }

    /// Run passes until `cancel` fires or `trigger` gives up.
    pub async fn run(
        &mut self,
        trigger: &mut dyn PassTrigger,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let mut summary = RunSummary {
            passes: 0,
            interrupted: false,
        };

        while trigger.wait(cancel).await {
            let report = self.run_pass(cancel).await;
            summary.passes += 1;
            summary.interrupted = report.interrupted;
            if report.interrupted {
                break;
            }
        }

        info!(
            passes = summary.passes,
            interrupted = summary.interrupted,
            "pg_viewmat: refresh loop stopped"
        );
        summary
    }

    /// Visit every entry once, in rank order.
    pub async fn run_pass(&mut self, cancel: &CancellationToken) -> PassReport {
        self.passes += 1;
        let mut report = PassReport::new(self.passes);
        let pass_start = Instant::now();

        for (entry, state) in self.schedule.iter().zip(self.states.iter_mut()) {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }

            if state.retry.is_in_backoff(self.clock.now_ms()) {
                state.stats.record_deferred();
                report.deferred += 1;
                debug!(view = %entry.view, attempts = state.retry.attempts, "pg_viewmat: in backoff, deferred");
                continue;
            }

            let started = Instant::now();
            let result = self
                .gate
                .refresh(
                    &entry.view,
                    &entry.tables,
                    &self.config.materialized_schema,
                    &self.config.work_schema,
                    cancel,
                )
                .await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            match result {
                Ok(outcome) => {
                    let recovered_after = state.retry.attempts;
                    state.retry.reset();
                    state.stats.record_success(outcome, self.clock.now());
                    if outcome.did_work() {
                        report.refreshed += 1;
                    } else {
                        report.skipped += 1;
                    }
                    if recovered_after > 0 {
                        monitor::log_refresh_recovered(&entry.view, recovered_after);
                    }
                    monitor::log_refresh_completed(&entry.view, entry.rank, outcome, elapsed_ms);
                }
                Err(err) => {
                    state.retry.record_failure(&self.retry_policy, self.clock.now_ms());
                    state.stats.record_failure(&err, self.clock.now());
                    monitor::log_refresh_failed(
                        &entry.view,
                        &err,
                        state.stats.consecutive_errors,
                        &self.retry_policy,
                    );
                    report.failed.push(entry.view.clone());
                }
            }
        }

        monitor::log_pass_completed(&report, pass_start.elapsed().as_secs_f64() * 1000.0);
        report
    }
}
