//! Run progress: processed / total, elapsed and ETA.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// `(percent, message)`; percent is `None` while the total is not known yet.
pub type ProgressFn = Arc<dyn Fn(Option<f64>, &str) + Send + Sync>;

/// Progress callback that ignores every update.
pub fn silent_progress() -> ProgressFn {
    Arc::new(|_: Option<f64>, _: &str| {})
}

/// One progress tick. Recomputed each time, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub processed: usize,
    pub total: usize,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

impl RunProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.processed as f64 / self.total as f64 * 100.0).min(100.0)
    }

    pub fn message(&self) -> String {
        let eta = self
            .eta
            .map(format_duration)
            .unwrap_or_else(|| "--".to_string());
        format!(
            "Processed {}/{} ({:.1}%) · elapsed {} · ETA {}",
            self.processed,
            self.total,
            self.percent(),
            format_duration(self.elapsed),
            eta
        )
    }
}

/// Shared between workers; each executed task calls [`ProgressTracker::tick`].
///
/// A requeued task runs again, so it adds one to the total via
/// [`ProgressTracker::requeued`].
#[derive(Debug)]
pub struct ProgressTracker {
    total: AtomicUsize,
    processed: AtomicUsize,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total: AtomicUsize::new(total),
            processed: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    /// Counts one finished task and returns the new snapshot.
    pub fn tick(&self) -> RunProgress {
        let processed = self.processed.fetch_add(1, Ordering::AcqRel) + 1;
        self.snapshot_at(processed)
    }

    /// One more execution is pending for a task that will be retried.
    pub fn requeued(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> RunProgress {
        self.snapshot_at(self.processed.load(Ordering::Acquire))
    }

    fn snapshot_at(&self, processed: usize) -> RunProgress {
        let elapsed = self.started.elapsed();
        let total = self.total.load(Ordering::Acquire);
        // ETA = mean time per task × remaining
        let eta = (processed > 0).then(|| {
            let remaining = total.saturating_sub(processed) as u32;
            (elapsed / processed as u32) * remaining
        });
        RunProgress {
            processed,
            total,
            elapsed,
            eta,
        }
    }
}

/// `1h02m03s` / `2m05s` / `7s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m{s:02}s"),
        _ => format!("{h}h{m:02}m{s:02}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::seconds(Duration::from_secs(7), "7s")]
    #[case::minutes(Duration::from_secs(125), "2m05s")]
    #[case::hours(Duration::from_secs(3723), "1h02m03s")]
    fn formats_durations(#[case] d: Duration, #[case] expected: &str) {
        assert_eq!(format_duration(d), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn eta_is_mean_time_times_remaining() {
        let tracker = ProgressTracker::new(4);
        tokio::time::advance(Duration::from_secs(10)).await;
        tracker.tick();
        let p = tracker.tick();

        assert_eq!(p.processed, 2);
        assert_eq!(p.elapsed, Duration::from_secs(10));
        assert_eq!(p.eta, Some(Duration::from_secs(10)));
        assert_eq!(p.percent(), 50.0);
        assert_eq!(p.message(), "Processed 2/4 (50.0%) · elapsed 10s · ETA 10s");
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_extends_the_total() {
        let tracker = ProgressTracker::new(2);
        tokio::time::advance(Duration::from_secs(6)).await;
        tracker.requeued();
        tracker.tick();
        let p = tracker.tick();

        assert_eq!((p.processed, p.total), (2, 3));
        assert!(p.percent() < 100.0);
        assert_eq!(p.eta, Some(Duration::from_secs(3)));
    }

    #[test]
    fn no_eta_before_first_task() {
        let tracker = ProgressTracker::new(3);
        let p = tracker.snapshot();
        assert_eq!(p.eta, None);
        assert!(p.message().ends_with("ETA --"));
    }
}
