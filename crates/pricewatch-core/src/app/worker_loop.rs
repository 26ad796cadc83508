//! WorkerLoop - タスク実行ループ
//!
//! # フロー（1 タスク）
//! 1. 重複チェック: 保存済みならスキップ（exists の失敗は fail-open）
//! 2. NAVIGATE: 購読を開始してから商品ページへ遷移
//! 3. AWAIT_RESPONSE: 価格 API の応答を待つ
//! 4. RETRY_AWAIT: 短い休止のあと半分の時間だけもう一度待つ。それでも無ければ NoData
//! 5. EXTRACT: 見積もりの抽出と画像の保存（画像は best-effort）
//! 6. ENQUEUE_RESULT: aggregator へ送る
//!
//! 失敗は [`ErrorKind`] で分類し、requeue か dead-letter に変換する。
//! タスク単位のエラーがこのループの外に出ることはない。

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{ConfigError, ScraperConfig};
use crate::domain::{
    CompetitorQuote, ErrorKind, ListingFilter, ProgressFn, ProgressTracker, ScrapeError, Task,
    extract_quotes, find_image_url, image_destination, product_url, resolve_brand_code,
};
use crate::ports::{ImageFetcher, PricePage, PricePayload, PriceStore};
use crate::queue::{QueueManager, RetryDecision, random_between};

/// Quotes of one task, on their way to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteBatch {
    pub quotes: Vec<CompetitorQuote>,
    pub part_number: String,
    pub brand_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    /// Already in storage; nothing fetched.
    Skipped,
    Requeued,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub succeeded: usize,
    pub skipped: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

impl WorkerStats {
    pub fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded => self.succeeded += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Requeued => self.requeued += 1,
            TaskOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }

    pub fn merge(&mut self, other: &WorkerStats) {
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.skipped + self.requeued + self.dead_lettered
    }
}

/// Per-run knobs the workers read, resolved once from [`ScraperConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub base_url: Url,
    pub checkpoint_path: PathBuf,
    pub throttle: (Duration, Duration),
    pub api_wait: Duration,
    pub retry_pause: (Duration, Duration),
    pub listing: ListingFilter,
    pub images_dir: PathBuf,
    pub capture_log_every: u64,
}

impl WorkerSettings {
    pub fn from_config(config: &ScraperConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: config.base_url()?,
            checkpoint_path: config.checkpoint_path.clone(),
            throttle: config.throttle_window(),
            api_wait: config.capture.api_wait(),
            retry_pause: config.capture.retry_pause(),
            listing: config.listing_filter(),
            images_dir: config.images.dir.clone(),
            capture_log_every: config.capture.log_every,
        })
    }
}

/// State shared by all workers of one run.
pub struct WorkerContext {
    queue: Arc<QueueManager>,
    store: Arc<dyn PriceStore>,
    images: Option<Arc<dyn ImageFetcher>>,
    results: mpsc::Sender<QuoteBatch>,
    progress: Arc<ProgressTracker>,
    on_progress: ProgressFn,
    settings: WorkerSettings,
    captures: AtomicU64,
}

impl WorkerContext {
    pub fn new(
        queue: Arc<QueueManager>,
        store: Arc<dyn PriceStore>,
        results: mpsc::Sender<QuoteBatch>,
        progress: Arc<ProgressTracker>,
        on_progress: ProgressFn,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            store,
            images: None,
            results,
            progress,
            on_progress,
            settings,
            captures: AtomicU64::new(0),
        }
    }

    /// Download product images with `fetcher`.
    pub fn with_images(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.images = Some(fetcher);
        self
    }
}

/// What the group hands back once every worker has stopped.
pub struct GroupResult {
    pub pages: Vec<Box<dyn PricePage>>,
    pub stats: WorkerStats,
    pub cancelled: bool,
}

/// Worker group handle.
/// - one worker per page; the page goes back to the caller when the worker stops
/// - `request_shutdown` stops workers from pulling new tasks (in-flight tasks finish)
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<(Box<dyn PricePage>, WorkerStats)>>,
}

impl WorkerGroup {
    pub fn spawn(pages: Vec<Box<dyn PricePage>>, ctx: WorkerContext) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(ctx);

        let joins = pages
            .into_iter()
            .enumerate()
            .map(|(worker_id, page)| {
                let ctx = Arc::clone(&ctx);
                let rx = shutdown_rx.clone();
                tokio::spawn(worker_loop(worker_id, page, ctx, rx))
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait until the queue is drained, or until `cancel` turns true and the
    /// in-flight tasks have finished.
    pub async fn join_until(self, mut cancel: watch::Receiver<bool>) -> GroupResult {
        let Self { shutdown_tx, joins } = self;
        let all = futures::future::join_all(joins);
        tokio::pin!(all);

        let mut cancelled = false;
        let results = tokio::select! {
            results = &mut all => results,
            Ok(()) = async { cancel.wait_for(|c| *c).await.map(|_| ()) } => {
                info!("cancellation requested; waiting for in-flight tasks");
                cancelled = true;
                let _ = shutdown_tx.send(true);
                all.await
            }
        };

        let mut pages = Vec::with_capacity(results.len());
        let mut stats = WorkerStats::default();
        for result in results {
            match result {
                Ok((page, worker_stats)) => {
                    stats.merge(&worker_stats);
                    pages.push(page);
                }
                Err(e) => error!(error = %e, "worker task failed"),
            }
        }
        GroupResult {
            pages,
            stats,
            cancelled,
        }
    }

    pub async fn shutdown_and_join(self) -> GroupResult {
        self.request_shutdown();
        let (_tx, rx) = watch::channel(false);
        self.join_until(rx).await
    }
}

async fn worker_loop(
    worker_id: usize,
    page: Box<dyn PricePage>,
    ctx: Arc<WorkerContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> (Box<dyn PricePage>, WorkerStats) {
    let mut stats = WorkerStats::default();
    loop {
        if *shutdown_rx.borrow() {
            info!(worker_id, "shutdown requested; worker stopping");
            break;
        }
        let Some(task) = ctx.queue.pop().await else {
            debug!(worker_id, "queue drained");
            break;
        };

        let outcome = process_task(worker_id, page.as_ref(), &ctx, &task).await;
        stats.record(outcome);
        if matches!(outcome, TaskOutcome::Requeued) {
            ctx.progress.requeued();
        }

        if let Err(e) = ctx.queue.persist(&ctx.settings.checkpoint_path).await {
            warn!(worker_id, error = %e, "checkpoint write failed");
        }
        let progress = ctx.progress.tick();
        (ctx.on_progress)(Some(progress.percent()), &progress.message());

        throttle(ctx.settings.throttle, &mut shutdown_rx).await;
    }
    (page, stats)
}

/// Random pause between tasks, cut short by shutdown.
async fn throttle(window: (Duration, Duration), shutdown_rx: &mut watch::Receiver<bool>) {
    let pause = random_between(window.0, window.1);
    tokio::select! {
        _ = tokio::time::sleep(pause) => {}
        _ = shutdown_rx.changed() => {}
    }
}

async fn process_task(
    worker_id: usize,
    page: &dyn PricePage,
    ctx: &WorkerContext,
    task: &Task,
) -> TaskOutcome {
    match ctx.store.exists(&task.part_number, &task.brand_name).await {
        Ok(true) => {
            debug!(worker_id, part = %task.part_number, brand = %task.brand_name, "already stored; skipping");
            ctx.queue.complete(task).await;
            return TaskOutcome::Skipped;
        }
        Ok(false) => {}
        Err(e) => {
            warn!(worker_id, part = %task.part_number, error = %e, "exists check failed; processing anyway");
        }
    }

    match scrape(worker_id, page, ctx, task).await {
        Ok(()) => {
            ctx.queue.complete(task).await;
            TaskOutcome::Succeeded
        }
        Err(e) => handle_failure(worker_id, ctx, task, e).await,
    }
}

async fn scrape(
    worker_id: usize,
    page: &dyn PricePage,
    ctx: &WorkerContext,
    task: &Task,
) -> Result<(), ScrapeError> {
    let settings = &ctx.settings;
    let brand_code = resolve_brand_code(&task.brand_name)
        .ok_or_else(|| ScrapeError::UnsupportedBrand(task.brand_name.clone()))?;
    let url = product_url(&settings.base_url, brand_code, &task.part_number)
        .ok_or_else(|| ScrapeError::BadProductUrl(task.part_number.clone()))?;

    // NAVIGATE
    let mut subscription = page.subscribe().await?;
    page.navigate(&url).await?;

    // AWAIT_RESPONSE / RETRY_AWAIT
    let payload = match subscription.next_payload(settings.api_wait).await? {
        Some(payload) => payload,
        None => {
            let pause = random_between(settings.retry_pause.0, settings.retry_pause.1);
            info!(
                worker_id,
                part = %task.part_number,
                waited_ms = settings.api_wait.as_millis() as u64,
                "no price response yet; waiting once more"
            );
            tokio::time::sleep(pause).await;
            subscription
                .next_payload(settings.api_wait / 2)
                .await?
                .ok_or(ScrapeError::NoData)?
        }
    };
    drop(subscription);

    // EXTRACT
    let quotes = extract_quotes(&payload.items, &settings.listing);
    log_capture(worker_id, ctx, task, &payload, quotes.len());

    if let Some(fetcher) = &ctx.images {
        match find_image_url(&payload.items, &settings.base_url) {
            Some(image_url) => save_image(worker_id, ctx, fetcher.as_ref(), task, &image_url, &url).await,
            None => debug!(worker_id, part = %task.part_number, "no image url"),
        }
    }

    // ENQUEUE_RESULT
    ctx.results
        .send(QuoteBatch {
            quotes,
            part_number: task.part_number.clone(),
            brand_name: task.brand_name.clone(),
        })
        .await
        .map_err(|_| ScrapeError::ChannelClosed)
}

/// Every `capture_log_every`-th capture at info, the rest at debug.
fn log_capture(
    worker_id: usize,
    ctx: &WorkerContext,
    task: &Task,
    payload: &PricePayload,
    quotes: usize,
) {
    let n = ctx.captures.fetch_add(1, Ordering::Relaxed) + 1;
    let every = ctx.settings.capture_log_every;
    if every > 0 && n % every == 0 {
        info!(
            worker_id,
            part = %task.part_number,
            brand = %task.brand_name,
            items = payload.items.len(),
            quotes,
            bytes_in = payload.bytes_in,
            captures = n,
            "captured price response"
        );
    } else {
        debug!(
            worker_id,
            part = %task.part_number,
            brand = %task.brand_name,
            items = payload.items.len(),
            quotes,
            bytes_in = payload.bytes_in,
            "captured price response"
        );
    }
}

async fn save_image(
    worker_id: usize,
    ctx: &WorkerContext,
    fetcher: &dyn ImageFetcher,
    task: &Task,
    image_url: &Url,
    referer: &Url,
) {
    let dest = image_destination(
        &ctx.settings.images_dir,
        &task.brand_name,
        &task.part_number,
        image_url,
    );
    match fetcher.fetch(image_url, referer, &dest).await {
        Ok(bytes) => debug!(worker_id, part = %task.part_number, bytes, dest = %dest.display(), "image saved"),
        Err(e) => warn!(worker_id, part = %task.part_number, url = %image_url, error = %e, "image download failed"),
    }
}

async fn handle_failure(
    worker_id: usize,
    ctx: &WorkerContext,
    task: &Task,
    err: ScrapeError,
) -> TaskOutcome {
    let reason = err.to_string();
    let attempt = task.attempts + 1;
    match err.kind() {
        ErrorKind::Transient => match ctx.queue.requeue(task, &reason).await {
            RetryDecision::Requeue => {
                warn!(worker_id, part = %task.part_number, brand = %task.brand_name, attempt, error = %reason, "task failed; requeued");
                TaskOutcome::Requeued
            }
            RetryDecision::DeadLetter => {
                error!(worker_id, part = %task.part_number, brand = %task.brand_name, attempt, error = %reason, "retries exhausted; dead-lettered");
                TaskOutcome::DeadLettered
            }
        },
        ErrorKind::Permanent => {
            ctx.queue.dead_letter(task, &reason).await;
            warn!(worker_id, part = %task.part_number, brand = %task.brand_name, error = %reason, "task failed permanently; dead-lettered");
            TaskOutcome::DeadLettered
        }
        ErrorKind::Infrastructure => {
            ctx.queue.dead_letter(task, &reason).await;
            error!(worker_id, part = %task.part_number, brand = %task.brand_name, error = %reason, "infrastructure failure; dead-lettered");
            TaskOutcome::DeadLettered
        }
    }
}
