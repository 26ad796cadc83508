use serde::{Deserialize, Serialize};

/// Point-in-time queue sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub retry: usize,
    pub dead: usize,
}

impl QueueCounts {
    /// Tasks not yet finished (pending, in flight or waiting for retry).
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_flight + self.retry
    }
}
