//! Adaptive per-feed polling intervals.
//!
//! Every URL feed carries a [`BackoffState`]: `wait_period` is the learned
//! interval in scheduler ticks, `remaining_wait` counts down to the next
//! eligible fetch. After each fetch the [`BackoffPolicy`] moves the interval:
//!
//! | Outcome              | `wait_period`            | `remaining_wait` |
//! |----------------------|--------------------------|------------------|
//! | success, changed     | halved, floor `min_wait` | `wait_period`    |
//! | success, unchanged   | doubled, cap `max_wait`  | `wait_period`    |
//! | failure              | unchanged                | `retry_delay`    |

/// Scheduling state persisted on each feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    pub wait_period: u32,
    pub remaining_wait: u32,
}

impl BackoffState {
    /// A feed is due once its countdown has run out.
    pub fn is_due(&self) -> bool {
        self.remaining_wait == 0
    }

    /// One scheduler tick. Never goes below zero.
    pub fn tick(self) -> Self {
        Self {
            remaining_wait: self.remaining_wait.saturating_sub(1),
            ..self
        }
    }
}

/// Bounds and retry delay used to update [`BackoffState`] after a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    min_wait: u32,
    max_wait: u32,
    retry_delay: u32,
}

impl BackoffPolicy {
    /// Builds a policy, normalising the bounds so that
    /// `1 <= min_wait <= max_wait` and `retry_delay <= min_wait` always hold.
    pub fn new(min_wait: u32, max_wait: u32, retry_delay: u32) -> Self {
        let min_wait = min_wait.max(1);
        Self {
            min_wait,
            max_wait: max_wait.max(min_wait),
            retry_delay: retry_delay.min(min_wait),
        }
    }

    pub fn min_wait(&self) -> u32 {
        self.min_wait
    }

    pub fn max_wait(&self) -> u32 {
        self.max_wait
    }

    pub fn retry_delay(&self) -> u32 {
        self.retry_delay
    }

    /// State for a newly created feed: minimum interval, due immediately.
    pub fn initial(&self) -> BackoffState {
        BackoffState {
            wait_period: self.min_wait,
            remaining_wait: 0,
        }
    }

    /// Clamps a state loaded from storage into this policy's bounds.
    ///
    /// Needed when the configured bounds change between runs.
    pub fn clamp(&self, state: BackoffState) -> BackoffState {
        BackoffState {
            wait_period: state.wait_period.clamp(self.min_wait, self.max_wait),
            remaining_wait: state.remaining_wait.min(self.max_wait),
        }
    }

    /// Update after a successful fetch.
    ///
    /// Frequent change tightens polling, inactivity relaxes it.
    pub fn after_success(&self, state: BackoffState, changed: bool) -> BackoffState {
        let current = self.clamp(state).wait_period;
        let wait_period = if changed {
            (current / 2).max(self.min_wait)
        } else {
            current.saturating_mul(2).min(self.max_wait)
        };
        BackoffState {
            wait_period,
            remaining_wait: wait_period,
        }
    }

    /// Update after a failed fetch. The learned interval is kept so that a
    /// transient error does not stretch it.
    pub fn after_failure(&self, state: BackoffState) -> BackoffState {
        BackoffState {
            wait_period: self.clamp(state).wait_period,
            remaining_wait: self.retry_delay,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(1, 64, 1)
    }
}
