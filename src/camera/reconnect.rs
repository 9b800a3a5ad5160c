//! Bounded fixed-delay reconnect bookkeeping for one camera session.

/// Default delay between reconnect attempts in milliseconds.
pub const RECONNECT_DELAY_MS: u64 = 2000;

/// Default cap on reconnect attempts for one disconnect.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 90;

/// What to do after a connection loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Schedule attempt number `attempt` (1-based).
    Schedule { attempt: u32 },
    /// An attempt is already scheduled.
    AlreadyInFlight,
    /// Reconnect was disabled by close or a permanent error.
    Disabled,
    /// The cap was reached; reconnect is now disabled.
    Exhausted,
}

/// Attempt counter, enabled flag and in-flight flag.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    attempts: u32,
    max_attempts: u32,
    enabled: bool,
    in_flight: bool,
}

impl ReconnectState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            enabled: true,
            in_flight: false,
        }
    }

    /// Clear the counter (successful open, explicit close).
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.in_flight = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.in_flight = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide whether to schedule another attempt and claim it.
    pub fn next_attempt(&mut self) -> ReconnectDecision {
        if !self.enabled {
            return ReconnectDecision::Disabled;
        }
        if self.in_flight {
            return ReconnectDecision::AlreadyInFlight;
        }
        if self.attempts >= self.max_attempts {
            self.enabled = false;
            return ReconnectDecision::Exhausted;
        }
        self.attempts += 1;
        self.in_flight = true;
        ReconnectDecision::Schedule {
            attempt: self.attempts,
        }
    }

    /// The scheduled attempt is now running.
    pub fn attempt_started(&mut self) {
        self.in_flight = false;
    }
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_are_capped() {
        let mut state = ReconnectState::new(3);
        for expected in 1..=3 {
            assert_eq!(
                state.next_attempt(),
                ReconnectDecision::Schedule { attempt: expected }
            );
            state.attempt_started();
        }
        assert_eq!(state.next_attempt(), ReconnectDecision::Exhausted);
        assert!(!state.is_enabled());
        assert_eq!(state.next_attempt(), ReconnectDecision::Disabled);
    }

    #[test]
    fn test_in_flight_blocks_duplicate_schedule() {
        let mut state = ReconnectState::new(5);
        assert!(matches!(
            state.next_attempt(),
            ReconnectDecision::Schedule { attempt: 1 }
        ));
        assert_eq!(state.next_attempt(), ReconnectDecision::AlreadyInFlight);
        state.attempt_started();
        assert!(matches!(
            state.next_attempt(),
            ReconnectDecision::Schedule { attempt: 2 }
        ));
    }

    #[test]
    fn test_reset_and_reenable() {
        let mut state = ReconnectState::new(1);
        state.next_attempt();
        state.attempt_started();
        assert_eq!(state.next_attempt(), ReconnectDecision::Exhausted);

        state.reset();
        state.enable();
        assert_eq!(state.attempts(), 0);
        assert_eq!(
            state.next_attempt(),
            ReconnectDecision::Schedule { attempt: 1 }
        );
    }

    #[test]
    fn test_disable_clears_in_flight() {
        let mut state = ReconnectState::default();
        state.next_attempt();
        state.disable();
        assert!(!state.is_in_flight());
        assert_eq!(state.next_attempt(), ReconnectDecision::Disabled);
        assert_eq!(state.max_attempts(), MAX_RECONNECT_ATTEMPTS);
    }
}
