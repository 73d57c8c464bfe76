//! Bounded, fixed-backoff reconnection policy

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Stable,
    Retrying,
    /// Gave up; only a user connect starts over
    Exhausted,
}

/// What to do about a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { retries: u32 },
}

#[derive(Debug, Clone)]
pub struct ReconnectController {
    max_retries: u32,
    backoff: Duration,
    retries: u32,
    state: ReconnectState,
}

impl ReconnectController {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            retries: 0,
            state: ReconnectState::Stable,
        }
    }

    /// Record a failure. The counter never passes `max_retries`.
    pub fn on_failure(&mut self) -> RetryDecision {
        if self.retries < self.max_retries {
            self.retries += 1;
            self.state = ReconnectState::Retrying;
            RetryDecision::Retry {
                attempt: self.retries,
                delay: self.backoff,
            }
        } else {
            self.state = ReconnectState::Exhausted;
            RetryDecision::GiveUp {
                retries: self.retries,
            }
        }
    }

    /// A connection opened. The counter is kept until the next user connect.
    pub fn mark_stable(&mut self) {
        self.state = ReconnectState::Stable;
    }

    /// Start a new connect cycle
    pub fn reset(&mut self) {
        self.retries = 0;
        self.state = ReconnectState::Stable;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_retries_then_give_up() {
        let backoff = Duration::from_millis(1000);
        let mut controller = ReconnectController::new(3, backoff);

        for attempt in 1..=3 {
            assert_eq!(
                controller.on_failure(),
                RetryDecision::Retry { attempt, delay: backoff }
            );
            assert_eq!(controller.state(), ReconnectState::Retrying);
        }

        assert_eq!(controller.on_failure(), RetryDecision::GiveUp { retries: 3 });
        assert_eq!(controller.state(), ReconnectState::Exhausted);
        assert_eq!(controller.retries(), 3);
    }

    #[test]
    fn test_stable_keeps_counter() {
        let mut controller = ReconnectController::new(3, Duration::ZERO);
        controller.on_failure();
        controller.mark_stable();
        assert_eq!(controller.state(), ReconnectState::Stable);
        assert_eq!(controller.retries(), 1);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut controller = ReconnectController::new(1, Duration::ZERO);
        controller.on_failure();
        assert!(matches!(controller.on_failure(), RetryDecision::GiveUp { .. }));

        controller.reset();
        assert_eq!(controller.retries(), 0);
        assert!(matches!(controller.on_failure(), RetryDecision::Retry { attempt: 1, .. }));
    }

    #[test]
    fn test_zero_retries_gives_up_immediately() {
        let mut controller = ReconnectController::new(0, Duration::ZERO);
        assert_eq!(controller.on_failure(), RetryDecision::GiveUp { retries: 0 });
    }
}
