//! Wall-clock budget tracking for one build invocation.
//!
//! The host kills the invocation at a hard budget; the guard reserves a
//! trailing safety margin so the pipeline abandons generation/verification
//! early enough to persist whatever it has. Once the margin is crossed, no
//! new model call or verification round may start, and an in-flight model
//! stream is dropped rather than awaited.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct DeadlineGuard {
    started: Instant,
    budget: Duration,
    margin: Duration,
}

impl DeadlineGuard {
    pub fn new(budget: Duration, margin: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
            margin,
        }
    }

    /// Time left before the hard budget, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// True while there is still more than the safety margin left. The
    /// single predicate every stage checks before starting new work.
    pub fn should_continue(&self) -> bool {
        self.remaining() > self.margin
    }

    #[cfg(test)]
    fn backdated(budget: Duration, margin: Duration, elapsed: Duration) -> Self {
        Self {
            started: Instant::now() - elapsed,
            budget,
            margin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_guard_continues() {
        let guard = DeadlineGuard::new(Duration::from_secs(300), Duration::from_secs(30));
        assert!(guard.should_continue());
        assert!(guard.remaining() > Duration::from_secs(250));
    }

    #[test]
    fn test_guard_stops_inside_margin() {
        let guard = DeadlineGuard::backdated(
            Duration::from_secs(300),
            Duration::from_secs(30),
            Duration::from_secs(280),
        );
        assert!(!guard.should_continue());
        assert!(guard.remaining() <= Duration::from_secs(30));
    }

    #[test]
    fn test_guard_stops_past_budget() {
        let guard = DeadlineGuard::backdated(
            Duration::from_secs(300),
            Duration::from_secs(30),
            Duration::from_secs(400),
        );
        assert!(!guard.should_continue());
        assert_eq!(guard.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_guard_continues_just_outside_margin() {
        let guard = DeadlineGuard::backdated(
            Duration::from_secs(300),
            Duration::from_secs(30),
            Duration::from_secs(200),
        );
        assert!(guard.should_continue());
    }
}
