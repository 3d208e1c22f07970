//! Backoff for the accept loop.
//!
//! Each consecutive accept failure doubles the pause before the next
//! attempt, up to a ceiling. A success resets the count. With a failure
//! limit set, the loop gives up once that many failures happen in a row.

use std::time::Duration;

/// What the accept loop should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    After(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct AcceptBackoff {
    initial: Duration,
    max: Duration,
    /// 0 = retry forever.
    max_failures: u32,
    failures: u32,
}

impl AcceptBackoff {
    pub fn new(initial: Duration, max: Duration, max_failures: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_failures,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn on_success(&mut self) {
        self.failures = 0;
    }

    pub fn on_failure(&mut self) -> Retry {
        self.failures = self.failures.saturating_add(1);
        if self.max_failures > 0 && self.failures >= self.max_failures {
            return Retry::GiveUp;
        }
        let shift = (self.failures - 1).min(16);
        let delay = self.initial.saturating_mul(1u32 << shift);
        Retry::After(delay.min(self.max))
    }
}
