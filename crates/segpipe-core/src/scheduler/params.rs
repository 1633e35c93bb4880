use std::time::Duration;

/// Used when `max_parallel_transfers` is configured as 0.
pub const DEFAULT_MAX_PARALLEL_TRANSFERS: usize = 4;

/// Shared transfer parameters, applied to every handle the scheduler starts.
#[derive(Debug, Clone)]
pub struct TransferParams {
    pub max_parallel_transfers: usize,
    /// Restarts allowed after a failed attempt before the task is finalized.
    pub retry_times: u32,
    pub connect_timeout: Duration,
    pub timeout: Option<Duration>,
    pub low_speed_limit: u32,
    pub low_speed_time: Duration,
    pub follow_redirects: bool,
    pub max_redirections: u32,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl Default for TransferParams {
    fn default() -> Self {
        Self::from(&crate::config::TransferConfig::default())
    }
}

impl TransferParams {
    pub fn effective_max_parallel(&self) -> usize {
        if self.max_parallel_transfers > 0 {
            self.max_parallel_transfers
        } else {
            DEFAULT_MAX_PARALLEL_TRANSFERS
        }
    }

    /// Pool size: two handles per parallel slot.
    pub fn pool_capacity(&self) -> usize {
        self.effective_max_parallel() << 1
    }
}
