//! RunController - 1 回の実行のオーケストレーション
//!
//! # フロー
//! 1. 入力の正規化（空行・未対応ブランド・重複キーを除外）
//! 2. 保存済み行の除外（exists の失敗は fail-open）
//! 3. チェックポイントの復元 → 新規タスクの投入
//! 4. aggregator 起動 → ブラウザ起動 → ワーカーごとにページを開く
//! 5. ワーカーグループを完了（またはキャンセル）まで実行
//! 6. aggregator の drain → ページ・ブラウザを閉じる → 最終チェックポイント → data changed 通知
//!
//! 同じ controller で 2 つの実行が重なることはない（[`RunError::AlreadyRunning`]）。

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};
use ulid::Ulid;

use super::aggregator::{Aggregator, AggregatorHandle, AggregatorReport};
use super::worker_loop::{WorkerContext, WorkerGroup, WorkerSettings};
use crate::config::ScraperConfig;
use crate::domain::{
    InputRow, ProgressFn, ProgressTracker, RunError, Task, TaskKey, resolve_brand_code,
};
use crate::ports::{BrowserLauncher, BrowserSession, ImageFetcher, PricePage, PriceStore};
use crate::queue::{DeadTask, QueueManager};

/// Called once per run after storage may have changed.
pub type DataChangedFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Ulid,
    pub total_input: usize,
    pub unsupported: usize,
    pub already_stored: usize,
    /// Outstanding tasks restored from the checkpoint.
    pub resumed: usize,
    pub queued: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub dead_lettered: usize,
    pub requeued: usize,
    pub rows_written: usize,
    pub rows_dropped: usize,
    pub elapsed_ms: u64,
    pub cancelled: bool,
    pub dead: Vec<DeadTask>,
}

impl RunSummary {
    fn new(run_id: Ulid) -> Self {
        Self {
            run_id,
            total_input: 0,
            unsupported: 0,
            already_stored: 0,
            resumed: 0,
            queued: 0,
            succeeded: 0,
            skipped: 0,
            dead_lettered: 0,
            requeued: 0,
            rows_written: 0,
            rows_dropped: 0,
            elapsed_ms: 0,
            cancelled: false,
            dead: Vec::new(),
        }
    }
}

pub struct RunController {
    config: ScraperConfig,
    settings: WorkerSettings,
    store: Arc<dyn PriceStore>,
    launcher: Arc<dyn BrowserLauncher>,
    images: Option<Arc<dyn ImageFetcher>>,
    running: AtomicBool,
}

/// Clears the running flag on every exit path.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RunController {
    pub fn new(
        config: ScraperConfig,
        store: Arc<dyn PriceStore>,
        launcher: Arc<dyn BrowserLauncher>,
        images: Option<Arc<dyn ImageFetcher>>,
    ) -> Result<Self, RunError> {
        config
            .validate()
            .map_err(|e| RunError::Config(e.to_string()))?;
        let settings =
            WorkerSettings::from_config(&config).map_err(|e| RunError::Config(e.to_string()))?;
        Ok(Self {
            config,
            settings,
            store,
            launcher,
            images,
            running: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn run(
        &self,
        rows: Vec<InputRow>,
        progress: ProgressFn,
        on_data_changed: DataChangedFn,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunSummary, RunError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RunError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let run_id = Ulid::new();
        self.run_inner(run_id, rows, progress, on_data_changed, cancel)
            .instrument(info_span!("run", %run_id))
            .await
    }

    async fn run_inner(
        &self,
        run_id: Ulid,
        rows: Vec<InputRow>,
        progress: ProgressFn,
        on_data_changed: DataChangedFn,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let mut summary = RunSummary::new(run_id);
        summary.total_input = rows.len();

        let (tasks, unsupported) = normalize_input(rows);
        summary.unsupported = unsupported;
        progress(None, &format!("Loaded {} rows ({} unsupported)", summary.total_input, unsupported));

        let candidates = tasks.len();
        let mut tasks = self.drop_stored(tasks).await;
        summary.already_stored = candidates - tasks.len();
        let message = format!("Existing rows skipped: {} / {}", summary.already_stored, candidates);
        info!(already_stored = summary.already_stored, candidates, "{message}");
        progress(None, &message);

        if self.config.max_parts > 0 && tasks.len() > self.config.max_parts {
            info!(max_parts = self.config.max_parts, dropped = tasks.len() - self.config.max_parts, "capping tasks");
            tasks.truncate(self.config.max_parts);
        }

        let queue = Arc::new(QueueManager::new(self.config.retry_policy()));
        let checkpoint = &self.settings.checkpoint_path;
        if let Some(outstanding) = queue.load(checkpoint).await? {
            info!(outstanding, path = %checkpoint.display(), "resumed from checkpoint");
            summary.resumed = outstanding;
        }
        let seeded = queue.seed(tasks).await;
        summary.queued = queue.counts().await.outstanding();
        info!(seeded, queued = summary.queued, "queue ready");

        if summary.queued == 0 {
            info!("nothing to do");
            progress(Some(100.0), "Nothing to process");
            summary.dead = queue.dead_tasks().await;
            summary.elapsed_ms = started.elapsed().as_millis() as u64;
            on_data_changed();
            return Ok(summary);
        }

        let (aggregator, results) = Aggregator::spawn(
            Arc::clone(&self.store),
            &self.config.aggregator,
            self.config.our_site_code.clone(),
        );

        let session = match self.launcher.launch().await {
            Ok(session) => session,
            Err(e) => {
                drop(results);
                self.abort_startup(aggregator, &queue).await;
                return Err(RunError::Infrastructure(e));
            }
        };

        let pages = match open_pages(session.as_ref(), self.config.workers.min(summary.queued)).await {
            Ok(pages) => pages,
            Err(e) => {
                session.shutdown().await;
                drop(results);
                self.abort_startup(aggregator, &queue).await;
                return Err(RunError::Infrastructure(e));
            }
        };
        info!(workers = pages.len(), "workers starting");

        let mut ctx = WorkerContext::new(
            Arc::clone(&queue),
            Arc::clone(&self.store),
            results,
            Arc::new(ProgressTracker::new(summary.queued)),
            progress,
            self.settings.clone(),
        );
        if let Some(images) = &self.images {
            ctx = ctx.with_images(Arc::clone(images));
        }

        let outcome = WorkerGroup::spawn(pages, ctx).join_until(cancel).await;
        // teardown runs even when the aggregator failed
        let aggregated = aggregator.finish().await;

        for page in outcome.pages {
            page.close().await;
        }
        session.shutdown().await;

        if let Err(e) = queue.persist(checkpoint).await {
            warn!(error = %e, "final checkpoint write failed");
        }
        on_data_changed();
        let report = aggregated?;

        let stats = outcome.stats;
        summary.succeeded = stats.succeeded;
        summary.skipped = stats.skipped;
        summary.requeued = stats.requeued;
        summary.dead_lettered = stats.dead_lettered;
        summary.rows_written = report.rows_written;
        summary.rows_dropped = report.rows_dropped;
        summary.cancelled = outcome.cancelled;
        summary.dead = queue.dead_tasks().await;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            dead_lettered = summary.dead_lettered,
            rows_written = summary.rows_written,
            rows_dropped = summary.rows_dropped,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed_ms,
            "run finished"
        );
        Ok(summary)
    }

    /// Tasks not yet in storage. A failing lookup keeps the task.
    async fn drop_stored(&self, tasks: Vec<Task>) -> Vec<Task> {
        let mut remaining = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.store.exists(&task.part_number, &task.brand_name).await {
                Ok(true) => debug!(part = %task.part_number, brand = %task.brand_name, "already stored"),
                Ok(false) => remaining.push(task),
                Err(e) => {
                    warn!(part = %task.part_number, error = %e, "exists check failed; keeping task");
                    remaining.push(task);
                }
            }
        }
        remaining
    }

    async fn abort_startup(&self, aggregator: AggregatorHandle, queue: &QueueManager) {
        match aggregator.finish().await {
            Ok(AggregatorReport { rows_written, .. }) => debug!(rows_written, "aggregator stopped"),
            Err(e) => warn!(error = %e, "aggregator stop failed"),
        }
        if let Err(e) = queue.persist(&self.settings.checkpoint_path).await {
            warn!(error = %e, "checkpoint write failed");
        }
    }
}

/// Trim, drop blank and unsupported rows, keep the first of each key.
fn normalize_input(rows: Vec<InputRow>) -> (Vec<Task>, usize) {
    let mut seen = HashSet::new();
    let mut tasks = Vec::new();
    let mut unsupported = 0;
    for row in rows {
        let Some(row) = row.normalized() else {
            continue;
        };
        if resolve_brand_code(&row.brand_name).is_none() {
            info!(part = %row.part_number, brand = %row.brand_name, "unsupported brand; row skipped");
            unsupported += 1;
            continue;
        }
        let key = TaskKey {
            part_number: row.part_number.clone(),
            brand_name: row.brand_name.clone(),
        };
        if seen.insert(key) {
            tasks.push(Task::new(row.brand_name, row.part_number));
        }
    }
    (tasks, unsupported)
}

/// Up to `n` pages. Only a failure on the first page is fatal.
async fn open_pages(
    session: &dyn BrowserSession,
    n: usize,
) -> Result<Vec<Box<dyn PricePage>>, crate::domain::ScrapeError> {
    let mut pages = Vec::with_capacity(n);
    for worker_id in 0..n {
        match session.open_page().await {
            Ok(page) => pages.push(page),
            Err(e) if pages.is_empty() => return Err(e),
            Err(e) => {
                warn!(worker_id, error = %e, "page open failed; continuing with fewer workers");
                break;
            }
        }
    }
    Ok(pages)
}
