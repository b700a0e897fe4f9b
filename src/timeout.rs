//! Timeout supervision: three independent clocks checked on a fixed poll
//! interval, racing against line delivery and process exit.
//!
//! The supervisor runs alongside the channel readers, periodically examining
//! the shared activity tracker. Whichever clock's condition is satisfied
//! first wins; exactly one timeout event is emitted per run.

use crate::state::{ActivityTracker, StopFlag};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Which clock fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Total run duration exceeded, regardless of activity.
    Overall,
    /// No output on any channel within the idle window.
    Idle,
    /// No output at all within the first-output window. Permanently
    /// disabled once any line is observed.
    FirstOutput,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Overall => write!(f, "overall"),
            TimeoutKind::Idle => write!(f, "idle"),
            TimeoutKind::FirstOutput => write!(f, "first-output"),
        }
    }
}

/// Three independent optional deadlines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutPolicy {
    /// Measured from process start.
    pub overall: Option<Duration>,
    /// Reset by every line on any channel.
    pub idle: Option<Duration>,
    /// Satisfied the instant any channel emits its first line.
    pub first_output: Option<Duration>,
}

impl TimeoutPolicy {
    /// Whether any clock is configured at all.
    pub fn is_empty(&self) -> bool {
        self.overall.is_none() && self.idle.is_none() && self.first_output.is_none()
    }

    /// Evaluate all clocks at `now`. If several are satisfied within the
    /// same poll, overall wins over first-output wins over idle.
    pub fn check(&self, now: Instant, tracker: &ActivityTracker) -> Option<TimeoutKind> {
        if let Some(limit) = self.overall {
            if now.duration_since(tracker.start()) >= limit {
                return Some(TimeoutKind::Overall);
            }
        }
        if let Some(limit) = self.first_output {
            if !tracker.first_output_seen() && now.duration_since(tracker.start()) >= limit {
                return Some(TimeoutKind::FirstOutput);
            }
        }
        if let Some(limit) = self.idle {
            if tracker.idle_for() >= limit {
                return Some(TimeoutKind::Idle);
            }
        }
        None
    }
}

/// Periodic supervision task. Sends at most one `TimeoutKind` and returns.
///
/// `poll_interval` bounds detection latency: a timeout is reported within
/// one interval of its deadline.
pub async fn supervise(
    policy: TimeoutPolicy,
    tracker: Arc<ActivityTracker>,
    stop: StopFlag,
    poll_interval: Duration,
    tx: mpsc::Sender<TimeoutKind>,
) {
    if policy.is_empty() {
        return;
    }
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if stop.is_set() {
            return;
        }
        if let Some(kind) = policy.check(Instant::now(), &tracker) {
            tracing::info!(kind = %kind, elapsed_secs = tracker.elapsed().as_secs_f64(), "timeout fired");
            // Coordinator may already be gone; nothing to do then.
            let _ = tx.send(kind).await;
            return;
        }
    }
}
