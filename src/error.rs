//! Error types for pg_viewmat.
//!
//! All errors that can occur within the scheduler are represented by [`ViewMatError`].
//! Errors are propagated via `Result<T, ViewMatError>` throughout the codebase and
//! surfaced either as a failed startup (the binary exits non-zero) or as a
//! logged, per-view refresh failure inside the refresh loop.
//!
//! # Error Classification
//!
//! Errors are classified into kinds that determine how the scheduler reacts:
//! - **Catalog**: the catalog snapshot could not be read. Fatal at startup.
//! - **Schedule**: dangling references, self references, cycles, duplicate
//!   views. Fatal at startup; there is no safe partial schedule.
//! - **Ddl**: output table or change tracking setup failed. Fatal at startup.
//! - **Refresh**: a single refresh failed during the loop. Logged, retried
//!   on a later pass.
//! - **Config** / **Internal**: fatal.
//!
//! # Retry Policy
//!
//! The [`RetryPolicy`] struct encapsulates optional exponential backoff for
//! views whose refresh keeps failing. With the default policy a failing view
//! is simply retried on the next pass.

use std::fmt;

/// Primary error type for the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum ViewMatError {
    // ── Catalog errors ───────────────────────────────────────────────────
    /// The catalog could not be read.
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// The view schema contains no views to materialize.
    #[error("no views found in schema \"{0}\"")]
    EmptyCatalog(String),

    /// A database connection could not be established.
    #[error("connection error: {0}")]
    Connection(String),

    // ── Schedule construction errors ─────────────────────────────────────
    /// A view reads a table in the materialized schema that no known view
    /// produces.
    #[error("view {view} reads {table}, which is not the output of any known view")]
    UnknownDependency { view: String, table: String },

    /// A view reads its own materialized output table.
    #[error("view {0} reads its own materialized output table")]
    SelfDependency(String),

    /// The inter-view dependency graph contains a cycle.
    #[error("cycle detected in dependency graph: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// Two catalog entries share a view identity or an output table.
    #[error("duplicate view: {0}")]
    DuplicateView(String),

    // ── Setup errors ─────────────────────────────────────────────────────
    /// Output table creation or change tracking setup failed.
    #[error("DDL failed for {object}: {message}")]
    Ddl { object: String, message: String },

    // ── Loop errors, retried on a later pass ────────────────────────────
    /// A single refresh failed.
    #[error("refresh of {view} failed: {message}")]
    Refresh { view: String, message: String },

    // ── Configuration and internal errors ────────────────────────────────
    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Classification of error kind for logging and exit handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMatErrorKind {
    Catalog,
    Schedule,
    Ddl,
    Refresh,
    Config,
    Internal,
}

impl fmt::Display for ViewMatErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewMatErrorKind::Catalog => write!(f, "CATALOG"),
            ViewMatErrorKind::Schedule => write!(f, "SCHEDULE"),
            ViewMatErrorKind::Ddl => write!(f, "DDL"),
            ViewMatErrorKind::Refresh => write!(f, "REFRESH"),
            ViewMatErrorKind::Config => write!(f, "CONFIG"),
            ViewMatErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl ViewMatError {
    /// Classify the error.
    pub fn kind(&self) -> ViewMatErrorKind {
        match self {
            ViewMatError::CatalogUnavailable(_)
            | ViewMatError::EmptyCatalog(_)
            | ViewMatError::Connection(_) => ViewMatErrorKind::Catalog,

            ViewMatError::UnknownDependency { .. }
            | ViewMatError::SelfDependency(_)
            | ViewMatError::CycleDetected(_)
            | ViewMatError::DuplicateView(_) => ViewMatErrorKind::Schedule,

            ViewMatError::Ddl { .. } => ViewMatErrorKind::Ddl,
            ViewMatError::Refresh { .. } => ViewMatErrorKind::Refresh,
            ViewMatError::InvalidConfig(_) => ViewMatErrorKind::Config,
            ViewMatError::Internal(_) => ViewMatErrorKind::Internal,
        }
    }

    /// Whether this error must stop the process.
    ///
    /// Only loop-time refresh failures are survivable; everything else means
    /// there is no valid schedule to run.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ViewMatErrorKind::Refresh
    }

    pub(crate) fn ddl(object: impl fmt::Display, message: impl fmt::Display) -> Self {
        ViewMatError::Ddl {
            object: object.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn refresh(view: impl fmt::Display, message: impl fmt::Display) -> Self {
        ViewMatError::Refresh {
            view: view.to_string(),
            message: message.to_string(),
        }
    }
}

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Backoff policy for views whose refresh keeps failing.
///
/// A `base_delay_ms` of zero disables backoff: a failing view is retried on
/// every pass. A view is never given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Consecutive failures after which a failing view is reported at
    /// `error` level instead of `warn`.
    pub alert_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 60_000,
            alert_threshold: 3,
        }
    }
}

impl RetryPolicy {
    /// Calculate the backoff delay in milliseconds for the given attempt number (0-based).
    ///
    /// Uses exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
    /// Adds simple jitter by varying ±25%.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);

        // Deterministic jitter keyed on attempt parity
        if attempt.is_multiple_of(2) {
            capped.saturating_mul(3) / 4
        } else {
            capped.saturating_mul(5) / 4
        }
    }

    /// Whether `consecutive_failures` has reached the alert threshold.
    pub fn should_alert(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.alert_threshold
    }
}

// ── Per-view Retry State ───────────────────────────────────────────────────

/// Tracks retry state for a single schedule entry.
///
/// Held in memory by the refresh driver; reset when a refresh succeeds or
/// the process restarts.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Number of consecutive failures.
    pub attempts: u32,
    /// Timestamp (epoch millis) before which the entry is not retried.
    pub next_retry_at_ms: u64,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and compute the next retry time.
    pub fn record_failure(&mut self, policy: &RetryPolicy, now_ms: u64) {
        self.attempts = self.attempts.saturating_add(1);
        self.next_retry_at_ms = now_ms.saturating_add(policy.backoff_ms(self.attempts - 1));
    }

    /// Reset retry state after a successful refresh.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_retry_at_ms = 0;
    }

    /// Whether the entry is currently in a retry-backoff period.
    pub fn is_in_backoff(&self, now_ms: u64) -> bool {
        self.attempts > 0 && now_ms < self.next_retry_at_ms
    }
}
