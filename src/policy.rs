//! Pass cadence: when the refresh driver starts its next pass.
//!
//! A [`SchedulePolicy`] is parsed from configuration and turned into a
//! [`PassTrigger`], which the driver awaits before every pass. Triggers
//! observe the cancellation token so a stopped process never sits in a
//! sleep.
//!
//! **Schedule strings** accept:
//! - `continuous`: start the next pass as soon as the previous one ends.
//! - Prometheus/GNU-style durations: `30s`, `5m`, `1h`, `1h30m`, `1d`, `2w`.
//!   A bare integer is treated as seconds.
//! - Cron expressions (5- or 6-field, or `@hourly`-style aliases), detected
//!   by a leading `@` or embedded spaces.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::ViewMatError;

// ── Clock ──────────────────────────────────────────────────────────────────

/// Wall-clock source, injectable so retry backoff and cron cadence can be
/// tested without real time passing.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_ms(&self) -> u64 {
        self.now().timestamp_millis().max(0) as u64
    }
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ── Schedule policy ────────────────────────────────────────────────────────

/// How often passes run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Back-to-back passes.
    Continuous,
    /// One pass per period; late ticks are delayed, not bunched up.
    Interval(Duration),
    /// One pass per cron occurrence.
    Cron(String),
}

impl SchedulePolicy {
    /// Parse a schedule string.
    pub fn parse(s: &str) -> Result<Self, ViewMatError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ViewMatError::InvalidConfig(
                "schedule cannot be empty".into(),
            ));
        }

        if s.eq_ignore_ascii_case("continuous") {
            return Ok(SchedulePolicy::Continuous);
        }

        // Duration strings never contain spaces.
        if s.starts_with('@') || s.contains(' ') {
            validate_cron(s)?;
            Ok(SchedulePolicy::Cron(s.to_string()))
        } else {
            let secs = parse_duration(s)?;
            if secs == 0 {
                return Ok(SchedulePolicy::Continuous);
            }
            Ok(SchedulePolicy::Interval(Duration::from_secs(secs)))
        }
    }

    /// Build the trigger for this policy.
    pub fn into_trigger(self, clock: Arc<dyn Clock>) -> Result<Box<dyn PassTrigger>, ViewMatError> {
        Ok(match self {
            SchedulePolicy::Continuous => Box::new(ContinuousTrigger),
            SchedulePolicy::Interval(period) => Box::new(IntervalTrigger::new(period)),
            SchedulePolicy::Cron(expr) => Box::new(CronTrigger::new(&expr, clock)?),
        })
    }
}

impl fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulePolicy::Continuous => write!(f, "continuous"),
            SchedulePolicy::Interval(d) => write!(f, "every {}s", d.as_secs()),
            SchedulePolicy::Cron(expr) => write!(f, "cron '{expr}'"),
        }
    }
}

/// Parse a Prometheus/GNU-style duration string into seconds.
///
/// Supported units: `s`, `m`, `h`, `d`, `w`. Compound durations like `1h30m`
/// are supported. A bare integer is treated as seconds.
pub fn parse_duration(s: &str) -> Result<u64, ViewMatError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ViewMatError::InvalidConfig("duration cannot be empty".into()));
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs);
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
            continue;
        }

        let multiplier = match ch {
            's' => 1u64,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            'w' => 604800,
            _ => {
                return Err(ViewMatError::InvalidConfig(format!(
                    "invalid duration unit '{ch}' in '{s}'. \
                     Use s, m, h, d or w. Example: '5m', '1h30m'"
                )));
            }
        };

        if num_buf.is_empty() {
            return Err(ViewMatError::InvalidConfig(format!(
                "expected a number before '{ch}' in duration '{s}'"
            )));
        }

        let n: u64 = num_buf.parse().map_err(|_| {
            ViewMatError::InvalidConfig(format!("invalid number '{num_buf}' in duration '{s}'"))
        })?;

        total_secs = n
            .checked_mul(multiplier)
            .and_then(|v| total_secs.checked_add(v))
            .ok_or_else(|| ViewMatError::InvalidConfig(format!("duration '{s}' is too large")))?;
        num_buf.clear();
    }

    if !num_buf.is_empty() {
        return Err(ViewMatError::InvalidConfig(format!(
            "trailing digits '{num_buf}' without a unit in duration '{s}'"
        )));
    }

    Ok(total_secs)
}

/// Validate a cron expression by parsing it with croner.
fn validate_cron(expr: &str) -> Result<croner::Cron, ViewMatError> {
    croner::Cron::from_str(expr).map_err(|e| {
        ViewMatError::InvalidConfig(format!("invalid cron expression '{expr}': {e}"))
    })
}

// ── Triggers ───────────────────────────────────────────────────────────────

/// Gate in front of every pass.
#[async_trait]
pub trait PassTrigger: Send {
    /// Wait until the next pass is due.
    ///
    /// Returns `false` when the driver should stop: `cancel` fired, or the
    /// trigger can never fire again.
    async fn wait(&mut self, cancel: &CancellationToken) -> bool;
}

/// Fires immediately, yielding to the runtime first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinuousTrigger;

#[async_trait]
impl PassTrigger for ContinuousTrigger {
    async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        tokio::task::yield_now().await;
        !cancel.is_cancelled()
    }
}

/// Fires once per period; the first pass starts immediately.
#[derive(Debug)]
pub struct IntervalTrigger {
    interval: Interval,
}

impl IntervalTrigger {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        IntervalTrigger { interval }
    }
}

#[async_trait]
impl PassTrigger for IntervalTrigger {
    async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.interval.tick() => true,
        }
    }
}

/// Fires at every occurrence of a cron expression.
pub struct CronTrigger {
    cron: croner::Cron,
    expr: String,
    clock: Arc<dyn Clock>,
}

impl CronTrigger {
    pub fn new(expr: &str, clock: Arc<dyn Clock>) -> Result<Self, ViewMatError> {
        Ok(CronTrigger {
            cron: validate_cron(expr)?,
            expr: expr.to_string(),
            clock,
        })
    }

    /// Time until the next occurrence strictly after now.
    pub fn delay_until_next(&self) -> Option<Duration> {
        let now = self.clock.now();
        let next = self.cron.find_next_occurrence(&now, false).ok()?;
        Some((next - now).to_std().unwrap_or_default())
    }
}

#[async_trait]
impl PassTrigger for CronTrigger {
    async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let Some(delay) = self.delay_until_next() else {
            error!(cron = %self.expr, "pg_viewmat: cron expression has no future occurrence");
            return false;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Event-driven trigger: fires once per notification.
///
/// Stops when every [`PassNotifier`] has been dropped.
#[derive(Debug)]
pub struct NotifyTrigger {
    rx: mpsc::Receiver<()>,
}

/// Sending half of a [`NotifyTrigger`].
#[derive(Debug, Clone)]
pub struct PassNotifier {
    tx: mpsc::Sender<()>,
}

impl PassNotifier {
    /// Request a pass. Requests beyond the channel capacity coalesce.
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

impl NotifyTrigger {
    pub fn channel(capacity: usize) -> (PassNotifier, NotifyTrigger) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (PassNotifier { tx }, NotifyTrigger { rx })
    }
}

#[async_trait]
impl PassTrigger for NotifyTrigger {
    async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            msg = self.rx.recv() => msg.is_some(),
        }
    }
}
