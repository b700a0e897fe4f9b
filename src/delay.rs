//! Delay-exit: bounded continuation of monitoring after a qualifying match,
//! to capture trailing context (stack traces, cleanup logs) before the
//! termination sequence starts.

use std::time::{Duration, Instant};

/// Configured bounds for the post-match capture window.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayPolicy {
    /// Extra lines to forward after the match.
    pub extra_lines: Option<u64>,
    /// Extra wall-clock time to keep forwarding after the match.
    pub extra_time: Option<Duration>,
}

impl DelayPolicy {
    /// Open a capture window at the instant of the qualifying match.
    pub fn open(&self, now: Instant) -> DelayWindow {
        DelayWindow {
            lines_left: self.extra_lines,
            deadline: self.extra_time.map(|t| now + t),
        }
    }
}

/// A live capture window. Whichever boundary (line budget or deadline) is
/// reached first ends the window; natural process exit also ends it early.
#[derive(Debug, Clone, Copy)]
pub struct DelayWindow {
    lines_left: Option<u64>,
    deadline: Option<Instant>,
}

impl DelayWindow {
    /// True when no capture remains: no boundary was configured at all, or
    /// the line budget is already exhausted. Whichever boundary is reached
    /// first ends the window, so an exhausted budget closes it even with a
    /// deadline still pending.
    pub fn closed(&self) -> bool {
        match self.lines_left {
            Some(0) => true,
            Some(_) => false,
            None => self.deadline.is_none(),
        }
    }

    /// Account for one forwarded line. Returns true once the line budget
    /// is exhausted.
    pub fn note_line(&mut self) -> bool {
        if let Some(left) = self.lines_left.as_mut() {
            *left = left.saturating_sub(1);
            if *left == 0 {
                return true;
            }
        }
        false
    }

    /// Wall-clock boundary, if one was configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_bounds_closes_immediately() {
        let w = DelayPolicy::default().open(Instant::now());
        assert!(w.closed());
    }

    #[test]
    fn test_zero_line_budget_no_deadline_closes_immediately() {
        let policy = DelayPolicy {
            extra_lines: Some(0),
            extra_time: None,
        };
        assert!(policy.open(Instant::now()).closed());
    }

    #[test]
    fn test_zero_line_budget_closes_despite_deadline() {
        let policy = DelayPolicy {
            extra_lines: Some(0),
            extra_time: Some(Duration::from_secs(60)),
        };
        assert!(policy.open(Instant::now()).closed());
    }

    #[test]
    fn test_line_budget_reached_after_n_lines() {
        let policy = DelayPolicy {
            extra_lines: Some(3),
            extra_time: None,
        };
        let mut w = policy.open(Instant::now());
        assert!(!w.closed());
        assert!(!w.note_line());
        assert!(!w.note_line());
        // Third line exhausts the budget
        assert!(w.note_line());
    }

    #[test]
    fn test_single_extra_line() {
        let policy = DelayPolicy {
            extra_lines: Some(1),
            extra_time: None,
        };
        let mut w = policy.open(Instant::now());
        assert!(!w.closed());
        assert!(w.note_line());
    }

    #[test]
    fn test_time_budget_sets_deadline() {
        let now = Instant::now();
        let policy = DelayPolicy {
            extra_lines: None,
            extra_time: Some(Duration::from_secs(2)),
        };
        let w = policy.open(now);
        assert!(!w.closed());
        assert_eq!(w.deadline(), Some(now + Duration::from_secs(2)));
        // Lines never exhaust a time-only window
        let mut w = w;
        for _ in 0..1000 {
            assert!(!w.note_line());
        }
    }

    #[test]
    fn test_both_bounds_line_budget_can_win() {
        let policy = DelayPolicy {
            extra_lines: Some(2),
            extra_time: Some(Duration::from_secs(60)),
        };
        let mut w = policy.open(Instant::now());
        assert!(w.deadline().is_some());
        assert!(!w.note_line());
        assert!(w.note_line());
    }
}
