use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Delay before each reconnect attempt. The last value repeats.
pub const DELAY_SCHEDULE: [Duration; 5] = [
    Duration::ZERO,
    Duration::from_secs(3),
    Duration::from_secs(6),
    Duration::from_secs(12),
    Duration::from_secs(20),
];

/// Backoff delay for the attempt with the given zero-based index.
pub fn retry_delay(attempt: u32) -> Duration {
    let index = (attempt as usize).min(DELAY_SCHEDULE.len() - 1);
    DELAY_SCHEDULE[index]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Schedule attempt number `attempt` (1-based) after `delay`.
    Reconnect { delay: Duration, attempt: u32 },
    /// The attempt budget is spent.
    GiveUp { attempts: u32 },
    /// User intent or policy forbids reconnecting.
    None,
}

/// Pure reconnect bookkeeping.
///
/// No I/O, no timers: the manager loop feeds lifecycle facts in and turns the
/// returned `ReconnectAction` into a scheduled deadline.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt_count: u32,
    max_attempts: u32,
    user_intent_disconnect: bool,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            max_attempts,
            user_intent_disconnect: false,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn user_intent_disconnect(&self) -> bool {
        self.user_intent_disconnect
    }

    pub fn on_user_connect(&mut self) {
        self.attempt_count = 0;
        self.user_intent_disconnect = false;
    }

    pub fn on_user_disconnect(&mut self) {
        self.user_intent_disconnect = true;
    }

    pub fn on_connected(&mut self) {
        self.attempt_count = 0;
        self.user_intent_disconnect = false;
    }

    /// Called once a user-requested stop has fully completed.
    pub fn on_finalized(&mut self) {
        self.attempt_count = 0;
        self.user_intent_disconnect = false;
    }

    pub fn on_unexpected_exit(&mut self, auto_reconnect: bool) -> ReconnectAction {
        if self.user_intent_disconnect || !auto_reconnect {
            return ReconnectAction::None;
        }

        if self.attempt_count >= self.max_attempts {
            let attempts = self.attempt_count;
            self.attempt_count = 0;
            return ReconnectAction::GiveUp { attempts };
        }

        let delay = retry_delay(self.attempt_count);
        self.attempt_count += 1;
        ReconnectAction::Reconnect {
            delay,
            attempt: self.attempt_count,
        }
    }
}
