//! Bounded fast-retry bookkeeping for pipeline failures.

use std::time::Duration;

pub const RECOVERY_INTERVAL_MS: u64 = 5000;
pub const MAX_RECOVERY_ATTEMPTS: u32 = 60;

/// When the next recovery attempt should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDelay {
    /// Within the bounded window, at the fast interval.
    Fast { attempt: u32, delay: Duration },
    /// Window exhausted; retry at the normal rotation cadence.
    Normal { attempt: u32, delay: Duration },
}

impl RecoveryDelay {
    pub fn delay(&self) -> Duration {
        match self {
            RecoveryDelay::Fast { delay, .. } | RecoveryDelay::Normal { delay, .. } => *delay,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            RecoveryDelay::Fast { attempt, .. } | RecoveryDelay::Normal { attempt, .. } => *attempt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryTracker {
    attempts: u32,
    max_attempts: u32,
    fast_interval: Duration,
    normal_interval: Duration,
}

impl RecoveryTracker {
    pub fn new(fast_interval: Duration, max_attempts: u32, normal_interval: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            fast_interval,
            normal_interval,
        }
    }

    /// Count a failure and return when to retry.
    pub fn next_delay(&mut self) -> RecoveryDelay {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts <= self.max_attempts {
            RecoveryDelay::Fast {
                attempt: self.attempts,
                delay: self.fast_interval,
            }
        } else {
            RecoveryDelay::Normal {
                attempt: self.attempts,
                delay: self.normal_interval,
            }
        }
    }

    /// A recovery worked; returns how many attempts it took.
    pub fn succeeded(&mut self) -> u32 {
        std::mem::take(&mut self.attempts)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_recovering(&self) -> bool {
        self.attempts > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_then_normal() {
        let fast = Duration::from_millis(100);
        let normal = Duration::from_secs(60);
        let mut tracker = RecoveryTracker::new(fast, 2, normal);

        assert_eq!(tracker.next_delay(), RecoveryDelay::Fast { attempt: 1, delay: fast });
        assert_eq!(tracker.next_delay().delay(), fast);
        let third = tracker.next_delay();
        assert_eq!(third, RecoveryDelay::Normal { attempt: 3, delay: normal });
        assert_eq!(tracker.next_delay().delay(), normal);
        assert!(tracker.is_recovering());
    }

    #[test]
    fn test_success_resets_window() {
        let mut tracker = RecoveryTracker::new(Duration::from_millis(1), 1, Duration::from_secs(1));
        tracker.next_delay();
        tracker.next_delay();
        assert_eq!(tracker.succeeded(), 2);
        assert_eq!(tracker.attempts(), 0);
        assert!(matches!(tracker.next_delay(), RecoveryDelay::Fast { attempt: 1, .. }));
    }
}
