//! Queue manager: pending / retry / dead behind one lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use chrono::Utc;
use tokio::sync::Mutex;

use super::checkpoint::{CheckpointError, read_checkpoint, write_checkpoint};
use super::{DeadTask, QueueState, RetryDecision, RetryPolicy};
use crate::domain::{Task, TaskKey};
use crate::observability::QueueCounts;

/// Inner state. Never handed out; all access goes through [`QueueManager`].
#[derive(Default)]
struct State {
    pending: VecDeque<Task>,
    retry: VecDeque<Task>,
    dead: Vec<DeadTask>,
    /// Popped tasks, tagged with their pop sequence number.
    in_flight: HashMap<TaskKey, (u64, Task)>,
    next_seq: u64,

    /// Every key currently held in pending, retry, dead or in flight.
    known: HashSet<TaskKey>,
}

impl State {
    fn admit(&mut self, task: &Task) -> bool {
        self.known.insert(task.key())
    }

    fn release(&mut self, key: &TaskKey) -> Option<Task> {
        let (_, task) = self.in_flight.remove(key)?;
        self.known.remove(key);
        Some(task)
    }

    fn to_document(&self) -> QueueState {
        // in-flight first, in pop order: those were popped earliest
        let mut popped: Vec<&(u64, Task)> = self.in_flight.values().collect();
        popped.sort_by_key(|(seq, _)| *seq);
        let queue = popped
            .into_iter()
            .map(|(_, task)| task.clone())
            .chain(self.pending.iter().cloned())
            .collect();
        QueueState {
            queue,
            retry: self.retry.iter().cloned().collect(),
            dead: self.dead.clone(),
            saved_at: Some(Utc::now()),
        }
    }
}

/// Shared work queue.
///
/// Design:
/// - A (part, brand) key lives in at most one of pending / retry / dead / in-flight.
/// - `pop` moves a task to in-flight under the lock, so two workers never get the same task.
/// - The worker reports the result with `complete`, `requeue` or `dead_letter`.
pub struct QueueManager {
    state: Mutex<State>,
    policy: RetryPolicy,
    /// Serializes checkpoint writes so snapshots land in order.
    persist_lock: Mutex<()>,
}

impl QueueManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            policy,
            persist_lock: Mutex::new(()),
        }
    }

    /// Append tasks to pending, skipping keys the queue already holds.
    pub async fn seed(&self, tasks: impl IntoIterator<Item = Task>) -> usize {
        let mut state = self.state.lock().await;
        let mut added = 0;
        for task in tasks {
            if state.admit(&task) {
                state.pending.push_back(task);
                added += 1;
            }
        }
        added
    }

    /// Load a checkpoint document into the queue. Returns the number of tasks
    /// that still need work.
    pub async fn restore(&self, doc: QueueState) -> usize {
        let mut state = self.state.lock().await;
        let mut outstanding = 0;
        for task in doc.queue {
            if state.admit(&task) {
                state.pending.push_back(task);
                outstanding += 1;
            }
        }
        for task in doc.retry {
            if state.admit(&task) {
                state.retry.push_back(task);
                outstanding += 1;
            }
        }
        for dead in doc.dead {
            if state.admit(&dead.task) {
                state.dead.push(dead);
            }
        }
        outstanding
    }

    /// Next task: pending first, then retry. `None` means the queue is drained.
    pub async fn pop(&self) -> Option<Task> {
        let mut state = self.state.lock().await;
        let task = match state.pending.pop_front() {
            Some(task) => task,
            None => state.retry.pop_front()?,
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.in_flight.insert(task.key(), (seq, task.clone()));
        Some(task)
    }

    /// Success or skip: the task leaves the queue.
    pub async fn complete(&self, task: &Task) {
        let mut state = self.state.lock().await;
        state.release(&task.key());
    }

    /// Retryable failure: one more attempt is counted and the task goes to the
    /// retry list, or to dead when the cap is reached.
    pub async fn requeue(&self, task: &Task, reason: &str) -> RetryDecision {
        let mut state = self.state.lock().await;
        let key = task.key();
        let mut task = state.release(&key).unwrap_or_else(|| task.clone());
        task.attempts += 1;

        let decision = self.policy.decide(task.attempts);
        state.known.insert(key);
        match decision {
            RetryDecision::Requeue => state.retry.push_back(task),
            RetryDecision::DeadLetter => state.dead.push(DeadTask::new(task, reason)),
        }
        decision
    }

    /// Terminal failure, regardless of attempts left.
    pub async fn dead_letter(&self, task: &Task, reason: &str) {
        let mut state = self.state.lock().await;
        let key = task.key();
        let mut task = state.release(&key).unwrap_or_else(|| task.clone());
        task.attempts += 1;
        state.known.insert(key);
        state.dead.push(DeadTask::new(task, reason));
    }

    pub async fn snapshot(&self) -> QueueState {
        self.state.lock().await.to_document()
    }

    /// Write the full tri-queue state to `path`.
    pub async fn persist(&self, path: &Path) -> Result<(), CheckpointError> {
        let _guard = self.persist_lock.lock().await;
        let doc = self.snapshot().await;
        write_checkpoint(path, &doc).await
    }

    /// Restore from `path` if a checkpoint exists. Returns the outstanding count.
    pub async fn load(&self, path: &Path) -> Result<Option<usize>, CheckpointError> {
        match read_checkpoint(path).await? {
            Some(doc) => Ok(Some(self.restore(doc).await)),
            None => Ok(None),
        }
    }

    pub async fn counts(&self) -> QueueCounts {
        let state = self.state.lock().await;
        QueueCounts {
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            retry: state.retry.len(),
            dead: state.dead.len(),
        }
    }

    pub async fn dead_tasks(&self) -> Vec<DeadTask> {
        self.state.lock().await.dead.clone()
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn tasks(n: usize) -> Vec<Task> {
        (0..n).map(|i| Task::new("CLAAS", format!("P{i}"))).collect()
    }

    #[tokio::test]
    async fn pop_prefers_pending_over_retry() {
        let queue = QueueManager::default();
        queue.seed(tasks(2)).await;

        let first = queue.pop().await.unwrap();
        queue.requeue(&first, "timeout").await;

        let second = queue.pop().await.unwrap();
        assert_eq!(second.part_number, "P1");

        let third = queue.pop().await.unwrap();
        assert_eq!(third.part_number, "P0");
        assert_eq!(third.attempts, 1);

        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn seed_skips_keys_already_held() {
        let queue = QueueManager::default();
        assert_eq!(queue.seed(tasks(3)).await, 3);

        let popped = queue.pop().await.unwrap();
        assert_eq!(queue.seed(tasks(3)).await, 0);

        queue.dead_letter(&popped, "unsupported brand").await;
        assert_eq!(queue.seed(vec![popped.clone()]).await, 0);
    }

    #[tokio::test]
    async fn requeue_increments_attempts_by_exactly_one() {
        let queue = QueueManager::default();
        let mut task = Task::new("CLAAS", "X");
        task.attempts = 3;
        queue.seed(vec![task]).await;

        let task = queue.pop().await.unwrap();
        let decision = queue.requeue(&task, "net::ERR_CONNECTION_RESET").await;
        assert_eq!(decision, RetryDecision::Requeue);

        let snap = queue.snapshot().await;
        assert_eq!(snap.retry.len(), 1);
        assert_eq!(snap.retry[0].attempts, 4);
        assert!(snap.queue.is_empty());
    }

    #[tokio::test]
    async fn five_consecutive_failures_end_in_dead_letter() {
        let queue = QueueManager::default();
        queue.seed(vec![Task::new("MANITOU", "M-1")]).await;

        let mut executions = 0;
        while let Some(task) = queue.pop().await {
            executions += 1;
            queue
                .requeue(&task, &format!("connection reset (run {executions})"))
                .await;
        }

        assert_eq!(executions, 5);
        let snap = queue.snapshot().await;
        assert!(snap.queue.is_empty());
        assert!(snap.retry.is_empty());
        assert_eq!(snap.dead.len(), 1);
        assert_eq!(snap.dead[0].task.attempts, 5);
        assert_eq!(snap.dead[0].error, "connection reset (run 5)");
    }

    #[tokio::test]
    async fn in_flight_tasks_are_checkpointed_as_pending() {
        let queue = QueueManager::default();
        queue.seed(tasks(2)).await;
        let _running = queue.pop().await.unwrap();

        let snap = queue.snapshot().await;
        let parts: Vec<_> = snap.queue.iter().map(|t| t.part_number.as_str()).collect();
        assert_eq!(parts, vec!["P0", "P1"]);
        assert!(snap.saved_at.is_some());
    }

    #[tokio::test]
    async fn in_flight_tasks_keep_pop_order_in_checkpoint() {
        let queue = QueueManager::default();
        queue.seed(tasks(12)).await;
        let mut running = Vec::new();
        for _ in 0..10 {
            running.push(queue.pop().await.unwrap());
        }
        // finishing some out of order must not reshuffle the rest
        queue.complete(&running[3]).await;
        queue.complete(&running[0]).await;

        let snap = queue.snapshot().await;
        let parts: Vec<_> = snap.queue.iter().map(|t| t.part_number.as_str()).collect();
        assert_eq!(
            parts,
            vec!["P1", "P2", "P4", "P5", "P6", "P7", "P8", "P9", "P10", "P11"]
        );
    }

    #[tokio::test]
    async fn persist_then_load_resumes_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let queue = QueueManager::default();
        queue.seed(tasks(3)).await;
        let done = queue.pop().await.unwrap();
        queue.complete(&done).await;
        let failed = queue.pop().await.unwrap();
        queue.requeue(&failed, "no data").await;
        queue.persist(&path).await.unwrap();

        let resumed = QueueManager::default();
        assert_eq!(resumed.load(&path).await.unwrap(), Some(2));
        let counts = resumed.counts().await;
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.retry, 1);
        assert_eq!(counts.dead, 0);
    }

    #[tokio::test]
    async fn load_without_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let queue = QueueManager::default();
        assert_eq!(queue.load(&dir.path().join("missing.json")).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pops_never_return_the_same_task() {
        let queue = Arc::new(QueueManager::default());
        queue.seed(tasks(500)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(task) = q.pop().await {
                    got.push(task.part_number.clone());
                    q.complete(&task).await;
                    tokio::task::yield_now().await;
                }
                got
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for part in h.await.unwrap() {
                total += 1;
                assert!(seen.insert(part), "task handed out twice");
            }
        }
        assert_eq!(total, 500);
    }
}
