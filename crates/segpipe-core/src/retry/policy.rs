/// Decision taken after a failed transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Restart the transfer from the bytes already received.
    Restart,
    /// Give up and deliver the task as failed.
    Finalize,
}

/// Bounded restart budget for one task.
///
/// `retry_times` is the number of restarts allowed after the first attempt,
/// so a task is started at most `retry_times + 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub retry_times: u32,
}

impl RetryBudget {
    pub fn new(retry_times: u32) -> Self {
        Self { retry_times }
    }

    /// `attempts` is the number of times the transfer has been started so far (1-based).
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if attempts.saturating_sub(1) < self.retry_times {
            RetryDecision::Restart
        } else {
            RetryDecision::Finalize
        }
    }
}
