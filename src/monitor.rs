//! Monitoring and observability for the refresh loop.
//!
//! # Statistics
//!
//! Per-view statistics ([`RefreshStats`]) are kept in memory by the refresh
//! driver and reset on restart. Every pass produces a [`PassReport`].
//!
//! # Events
//!
//! Operational events are emitted as `tracing` events with structured
//! fields (`event`, `view`, ...), so any subscriber, text or JSON, can
//! route them:
//! - `refresh_completed`: a view was recomputed (debug)
//! - `refresh_failed`: a refresh failed (warn, error once repeated)
//! - `refresh_recovered`: a view refreshed after failing (info)
//! - `pass_completed`: one full pass finished (debug, info when it failed)

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::View;
use crate::error::{RetryPolicy, ViewMatError};
use crate::refresh::RefreshOutcome;

/// Event names emitted in the `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    RefreshCompleted,
    RefreshFailed,
    RefreshRecovered,
    PassCompleted,
}

impl AlertEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertEvent::RefreshCompleted => "refresh_completed",
            AlertEvent::RefreshFailed => "refresh_failed",
            AlertEvent::RefreshRecovered => "refresh_recovered",
            AlertEvent::PassCompleted => "pass_completed",
        }
    }
}

/// Running counters for one view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshStats {
    /// Refreshes that recomputed the output table.
    pub refreshed: u64,
    /// Refreshes the gate skipped because nothing changed.
    pub skipped: u64,
    pub failed: u64,
    /// Passes in which the view was held back by retry backoff.
    pub deferred: u64,
    pub consecutive_errors: u32,
    pub rows_last_refresh: Option<u64>,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl RefreshStats {
    pub fn record_success(&mut self, outcome: RefreshOutcome, at: DateTime<Utc>) {
        match outcome {
            RefreshOutcome::Refreshed { rows } => {
                self.refreshed += 1;
                self.rows_last_refresh = Some(rows);
            }
            RefreshOutcome::Skipped => self.skipped += 1,
        }
        self.consecutive_errors = 0;
        self.last_refresh_at = Some(at);
    }

    pub fn record_failure(&mut self, error: &ViewMatError, at: DateTime<Utc>) {
        self.failed += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(at);
    }

    pub fn record_deferred(&mut self) {
        self.deferred += 1;
    }

    /// Total successful refresh calls, whether or not they did work.
    pub fn successes(&self) -> u64 {
        self.refreshed + self.skipped
    }
}

/// Summary of one pass over the schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// 1-based pass number.
    pub pass: u64,
    pub refreshed: usize,
    pub skipped: usize,
    pub deferred: usize,
    /// Views whose refresh failed, in schedule order.
    pub failed: Vec<View>,
    /// Cancellation stopped the pass before every entry was visited.
    pub interrupted: bool,
}

impl PassReport {
    pub fn new(pass: u64) -> Self {
        PassReport {
            pass,
            ..PassReport::default()
        }
    }

    /// Entries the gate was called for.
    pub fn visited(&self) -> usize {
        self.refreshed + self.skipped + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }
}

// ── Event emitters ─────────────────────────────────────────────────────────

pub fn log_refresh_completed(view: &View, rank: u32, outcome: RefreshOutcome, elapsed_ms: f64) {
    if let RefreshOutcome::Refreshed { rows } = outcome {
        debug!(
            event = AlertEvent::RefreshCompleted.as_str(),
            view = %view,
            rank,
            rows,
            elapsed_ms,
            "pg_viewmat: refreshed {view}"
        );
    }
}

pub fn log_refresh_recovered(view: &View, after_failures: u32) {
    info!(
        event = AlertEvent::RefreshRecovered.as_str(),
        view = %view,
        after_failures,
        "pg_viewmat: {view} refreshed again after {after_failures} failure(s)"
    );
}

/// Report a failed refresh; escalates to `error` once the view has failed
/// `policy.alert_threshold` times in a row.
pub fn log_refresh_failed(view: &View, err: &ViewMatError, consecutive: u32, policy: &RetryPolicy) {
    if policy.should_alert(consecutive) {
        error!(
            event = AlertEvent::RefreshFailed.as_str(),
            view = %view,
            consecutive_errors = consecutive,
            error = %err,
            "pg_viewmat: refresh of {view} keeps failing"
        );
    } else {
        warn!(
            event = AlertEvent::RefreshFailed.as_str(),
            view = %view,
            consecutive_errors = consecutive,
            error = %err,
            "pg_viewmat: refresh of {view} failed, will retry"
        );
    }
}

pub fn log_pass_completed(report: &PassReport, elapsed_ms: f64) {
    if report.failed.is_empty() {
        debug!(
            event = AlertEvent::PassCompleted.as_str(),
            pass = report.pass,
            refreshed = report.refreshed,
            skipped = report.skipped,
            deferred = report.deferred,
            interrupted = report.interrupted,
            elapsed_ms,
            "pg_viewmat: pass complete"
        );
    } else {
        let failed: Vec<String> = report.failed.iter().map(ToString::to_string).collect();
        info!(
            event = AlertEvent::PassCompleted.as_str(),
            pass = report.pass,
            refreshed = report.refreshed,
            skipped = report.skipped,
            deferred = report.deferred,
            failed = %failed.join(", "),
            interrupted = report.interrupted,
            elapsed_ms,
            "pg_viewmat: pass complete with failures"
        );
    }
}
