//! Queue module: tri-queue manager, retry policy, dead-letter records, checkpointing.

mod checkpoint;
mod manager;
mod record;
mod retry;
mod state;

pub use checkpoint::{CheckpointError, read_checkpoint, write_checkpoint};
pub use manager::QueueManager;
pub use record::DeadTask;
pub use retry::{JitteredBackoff, MAX_ATTEMPTS, RetryDecision, RetryPolicy, random_between};
pub use state::QueueState;
