//! Scheduler behaviour against an in-memory catalog and gate.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CountingGate, FakeCatalog, GateCall, ManualClock, table, test_config, view};
use tokio_util::sync::CancellationToken;

use pg_viewmat::policy::{ContinuousTrigger, IntervalTrigger, NotifyTrigger};
use pg_viewmat::{Scheduler, SchedulerConfig, ViewMatError};

/// `c` reads `b` reads `a` reads a raw table, discovered in reverse order.
fn chain() -> FakeCatalog {
    FakeCatalog::new()
        .view("c", &["mat.b"])
        .view("b", &["mat.a", "public.customers"])
        .view("a", &["public.orders"])
}

async fn started(catalog: &FakeCatalog, config: SchedulerConfig) -> (Scheduler, Arc<CountingGate>) {
    let gate = CountingGate::new();
    let scheduler = Scheduler::initialize(catalog, gate.clone(), config)
        .await
        .expect("scheduler should start");
    gate.clear_calls();
    (scheduler, gate)
}

async fn start_error(catalog: &FakeCatalog, gate: Arc<CountingGate>) -> ViewMatError {
    match Scheduler::initialize(catalog, gate, test_config()).await {
        Ok(_) => panic!("startup should fail"),
        Err(e) => e,
    }
}

// ── Ordering ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chain_refreshes_in_dependency_order_every_pass() {
    let (mut scheduler, gate) = started(&chain(), test_config()).await;

    let (notifier, mut trigger) = NotifyTrigger::channel(4);
    notifier.notify();
    notifier.notify();
    drop(notifier);

    let summary = scheduler.run(&mut trigger, &CancellationToken::new()).await;

    assert_eq!(summary.passes, 2);
    assert!(!summary.interrupted);
    assert_eq!(gate.refreshed(), vec!["a", "b", "c", "a", "b", "c"]);
}

#[tokio::test]
async fn test_schedule_ranks_follow_dependencies() {
    let schedule = Scheduler::plan(&chain(), &test_config()).await.unwrap();

    let ranks: Vec<(String, u32)> = schedule
        .iter()
        .map(|e| (e.view.name().to_string(), e.rank))
        .collect();
    assert_eq!(
        ranks,
        vec![("a".into(), 0), ("b".into(), 1), ("c".into(), 2)]
    );

    let json = serde_json::to_value(&schedule).unwrap();
    assert_eq!(json["entries"][2]["rank"], 2);
}

#[tokio::test]
async fn test_startup_creates_outputs_in_rank_order_and_tracks_each_table_once() {
    let catalog = chain().view("d", &["public.orders", "mat.a"]);
    let gate = CountingGate::new();
    Scheduler::initialize(&catalog, gate.clone(), test_config())
        .await
        .unwrap();

    assert_eq!(
        gate.calls(),
        vec![
            GateCall::EnsureOutput(view("a")),
            GateCall::EnsureOutput(view("b")),
            GateCall::EnsureOutput(view("d")),
            GateCall::EnsureOutput(view("c")),
            GateCall::Track(table("public.orders")),
            GateCall::Track(table("mat.a")),
            GateCall::Track(table("public.customers")),
            GateCall::Track(table("mat.b")),
        ]
    );
}

// ── Change detection ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_unchanged_views_are_skipped_and_changes_cascade() {
    let (mut scheduler, gate) = started(&chain(), test_config()).await;
    let cancel = CancellationToken::new();

    let first = scheduler.run_pass(&cancel).await;
    assert_eq!(first.refreshed, 3);

    let second = scheduler.run_pass(&cancel).await;
    assert_eq!(second.refreshed, 0);
    assert_eq!(second.skipped, 3);

    gate.touch("public.customers");
    let third = scheduler.run_pass(&cancel).await;
    assert_eq!(third.skipped, 1, "a does not read customers");
    assert_eq!(third.refreshed, 2, "b and then c pick up the change");

    let stats = scheduler.stats_for(&view("c")).unwrap();
    assert_eq!(stats.refreshed, 2);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.rows_last_refresh, Some(1));
}

// ── Failures ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_refresh_does_not_stop_the_pass_and_is_retried() {
    let (mut scheduler, gate) = started(&chain(), test_config()).await;
    let cancel = CancellationToken::new();
    gate.fail("b");

    let first = scheduler.run_pass(&cancel).await;
    assert_eq!(first.failed, vec![view("b")]);
    assert_eq!(first.visited(), 3);
    assert_eq!(gate.refreshed(), vec!["a", "b", "c"]);

    let second = scheduler.run_pass(&cancel).await;
    assert_eq!(second.failed, vec![view("b")]);
    let b = scheduler.stats_for(&view("b")).unwrap();
    assert_eq!(b.consecutive_errors, 2);
    assert!(b.last_error.as_deref().unwrap().contains("relation does not exist"));

    gate.heal("b");
    let third = scheduler.run_pass(&cancel).await;
    assert!(third.is_clean());
    assert_eq!(third.refreshed, 2, "b recovers and c picks up its output");
    assert_eq!(scheduler.stats_for(&view("b")).unwrap().consecutive_errors, 0);
}

#[tokio::test]
async fn test_backoff_defers_failing_view_until_delay_elapses() {
    let mut config = test_config();
    config.retry.base_delay_ms = 1_000;
    config.retry.max_delay_ms = 10_000;

    let (scheduler, gate) = started(&chain(), config).await;
    let clock = ManualClock::new();
    let mut scheduler = scheduler.with_clock(clock.clone());
    let cancel = CancellationToken::new();
    gate.fail("b");

    scheduler.run_pass(&cancel).await;
    gate.clear_calls();

    clock.advance(Duration::from_millis(100));
    let deferred = scheduler.run_pass(&cancel).await;
    assert_eq!(deferred.deferred, 1);
    assert!(deferred.failed.is_empty());
    assert_eq!(gate.refreshed(), vec!["a", "c"]);

    gate.clear_calls();
    clock.advance(Duration::from_secs(1));
    let retried = scheduler.run_pass(&cancel).await;
    assert_eq!(retried.failed, vec![view("b")]);
    assert_eq!(gate.refreshed(), vec!["a", "b", "c"]);
    assert_eq!(scheduler.stats_for(&view("b")).unwrap().deferred, 1);
}

// ── Cancellation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_during_refresh_finishes_it_and_stops_before_next() {
    let (mut scheduler, gate) = started(&chain(), test_config()).await;
    let cancel = CancellationToken::new();
    gate.cancel_during("b", cancel.clone());

    let report = scheduler.run_pass(&cancel).await;

    assert!(report.interrupted);
    assert_eq!(report.refreshed, 2);
    assert_eq!(gate.refreshed(), vec!["a", "b"]);
    assert_eq!(scheduler.stats_for(&view("b")).unwrap().refreshed, 1);
    assert_eq!(scheduler.stats_for(&view("c")).unwrap().successes(), 0);
}

#[tokio::test]
async fn test_run_stops_after_interrupted_pass() {
    let (mut scheduler, gate) = started(&chain(), test_config()).await;
    let cancel = CancellationToken::new();
    gate.cancel_during("a", cancel.clone());

    let summary = scheduler.run(&mut ContinuousTrigger, &cancel).await;

    assert_eq!(summary.passes, 1);
    assert!(summary.interrupted);
    assert_eq!(gate.refreshed(), vec!["a"]);
}

#[tokio::test]
async fn test_cancelled_before_start_runs_no_pass() {
    let (mut scheduler, gate) = started(&chain(), test_config()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = scheduler.run(&mut ContinuousTrigger, &cancel).await;

    assert_eq!(summary.passes, 0);
    assert!(gate.refreshed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_interval_trigger_runs_one_pass_per_period() {
    let (mut scheduler, _gate) = started(&chain(), test_config()).await;
    let cancel = CancellationToken::new();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(35)).await;
        stopper.cancel();
    });

    let mut trigger = IntervalTrigger::new(Duration::from_secs(10));
    let summary = scheduler.run(&mut trigger, &cancel).await;

    assert_eq!(summary.passes, 4, "passes at 0s, 10s, 20s and 30s");
    assert!(!summary.interrupted);
    assert_eq!(scheduler.passes(), 4);
}

// ── Startup errors ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_materialized_table_aborts_startup() {
    let catalog = chain().view("e", &["mat.ghost"]);
    let gate = CountingGate::new();

    let err = start_error(&catalog, gate.clone()).await;

    match err {
        ViewMatError::UnknownDependency { view, table } => {
            assert_eq!(view, "views.e");
            assert_eq!(table, "mat.ghost");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(gate.calls().is_empty(), "no DDL before the schedule is valid");
}

#[tokio::test]
async fn test_cycle_aborts_startup_naming_its_members() {
    let catalog = FakeCatalog::new()
        .view("x", &["mat.y"])
        .view("y", &["mat.x"])
        .view("z", &["mat.x"]);
    let gate = CountingGate::new();

    let err = start_error(&catalog, gate.clone()).await;

    assert!(
        matches!(&err, ViewMatError::CycleDetected(names) if names == &["views.x", "views.y"]),
        "unexpected error: {err}"
    );
    assert!(gate.calls().is_empty());
}

#[tokio::test]
async fn test_unreachable_catalog_aborts_startup() {
    let err = start_error(&chain().unavailable(), CountingGate::new()).await;
    assert!(matches!(err, ViewMatError::CatalogUnavailable(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_empty_view_schema_aborts_startup() {
    let err = start_error(&FakeCatalog::new(), CountingGate::new()).await;
    assert!(matches!(err, ViewMatError::EmptyCatalog(ref schema) if schema == "views"));
}

#[tokio::test]
async fn test_ddl_failure_aborts_before_tracking() {
    let gate = CountingGate::new();
    gate.fail_ddl("b");

    let err = start_error(&chain(), gate.clone()).await;

    assert!(matches!(err, ViewMatError::Ddl { .. }));
    assert_eq!(
        gate.calls(),
        vec![
            GateCall::EnsureOutput(view("a")),
            GateCall::EnsureOutput(view("b")),
        ]
    );
}
