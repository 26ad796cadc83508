//! Dead-letter record: a task set aside for operator inspection.

use serde::{Deserialize, Serialize};

use crate::domain::Task;

/// Terminal failure with the last error message preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadTask {
    #[serde(flatten)]
    pub task: Task,
    pub error: String,
}

impl DeadTask {
    pub fn new(task: Task, error: impl Into<String>) -> Self {
        Self {
            task,
            error: error.into(),
        }
    }
}
