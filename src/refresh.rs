//! The materialization gate: the collaborator that owns output tables,
//! change tracking, and the actual refresh work.
//!
//! The scheduler decides *when* and *in which order* views are refreshed.
//! Whether a refresh has anything to do is the gate's call: it consults its
//! change-tracking state and returns [`RefreshOutcome::Skipped`] when nothing
//! a view reads has changed since its last successful refresh.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Table, View};
use crate::error::ViewMatError;

/// What a refresh call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The output table was recomputed.
    Refreshed { rows: u64 },
    /// No upstream change since the last successful refresh.
    Skipped,
}

impl RefreshOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Refreshed { .. } => "REFRESHED",
            RefreshOutcome::Skipped => "SKIPPED",
        }
    }

    /// Whether the gate did any work.
    pub fn did_work(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed { .. })
    }
}

/// Performs (or skips) materialization work on behalf of the scheduler.
///
/// Each method is a suspension point and may be slow. A single `refresh`
/// call must be atomic from the scheduler's point of view: the scheduler
/// never abandons a call it has started.
#[async_trait]
pub trait MaterializationGate: Send + Sync {
    /// Make sure the output table of `view` exists in `materialized_schema`.
    ///
    /// Called once per view at startup, dependencies first.
    async fn ensure_output_table(
        &self,
        view: &View,
        materialized_schema: &str,
    ) -> Result<(), ViewMatError>;

    /// Start tracking changes on `table`, keeping bookkeeping in
    /// `work_schema`.
    ///
    /// Called once per distinct table at startup.
    async fn enable_change_tracking(
        &self,
        table: &Table,
        work_schema: &str,
    ) -> Result<(), ViewMatError>;

    /// Bring the output table of `view` up to date.
    ///
    /// Must be idempotent and cheap when none of `tables` changed since the
    /// last successful refresh.
    async fn refresh(
        &self,
        view: &View,
        tables: &[Table],
        materialized_schema: &str,
        work_schema: &str,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome, ViewMatError>;
}
