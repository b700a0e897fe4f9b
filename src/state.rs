//! Shared run state: the activity tracker read by the timeout supervisor and
//! the stop flag checked by channel readers.
//!
//! These are the only cross-task mutable resources. Channel readers write the
//! activity tracker; the supervisor only reads it. The stop flag is set once,
//! by the coordinator, after the exit decision is finalized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Tracks process start and most-recent-output times across all channels.
///
/// `last_activity` starts at process start, so the idle clock measures from
/// launch until the first line, then from the most recent line on any channel.
pub struct ActivityTracker {
    start: Instant,
    last_activity: Mutex<Instant>,
    saw_output: AtomicBool,
}

impl ActivityTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_activity: Mutex::new(now),
            saw_output: AtomicBool::new(false),
        }
    }

    /// Record output on any channel. Called by channel readers.
    pub fn record_line(&self) {
        let mut last = self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
        self.saw_output.store(true, Ordering::Release);
    }

    /// Instant the monitored process was started.
    pub fn start(&self) -> Instant {
        self.start
    }

    /// Elapsed time since process start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Duration since the most recent line on any channel (or since start,
    /// if nothing has been emitted yet).
    pub fn idle_for(&self) -> Duration {
        let last = *self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
        last.elapsed()
    }

    /// Whether any channel has ever produced a line.
    pub fn first_output_seen(&self) -> bool {
        self.saw_output.load(Ordering::Acquire)
    }
}

/// Shared cancellation flag. Set exactly once when the exit decision is
/// finalized; readers cease forwarding and the supervisor stops polling.
#[derive(Clone)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
