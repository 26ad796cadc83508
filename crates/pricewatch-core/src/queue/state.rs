//! Checkpoint document for the tri-queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DeadTask;
use crate::domain::Task;

/// On-disk form: `{ queue, retry, dead, savedAt }`.
///
/// `queue` also carries tasks that were in flight when the snapshot was taken,
/// so a crash mid-task never loses work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    #[serde(default)]
    pub queue: Vec<Task>,
    #[serde(default)]
    pub retry: Vec<Task>,
    #[serde(default)]
    pub dead: Vec<DeadTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl QueueState {
    /// Tasks that still need work (pending + retry).
    pub fn outstanding(&self) -> usize {
        self.queue.len() + self.retry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerates_missing_sections_and_unknown_fields() {
        let state: QueueState =
            serde_json::from_str(r#"{"queue":[{"brandName":"CLAAS","partNumber":"1"}],"extra":true}"#)
                .unwrap();
        assert_eq!(state.queue.len(), 1);
        assert!(state.retry.is_empty());
        assert!(state.dead.is_empty());
        assert_eq!(state.outstanding(), 1);
    }
}
