//! Aggregator - ランキングとバッチ書き込み
//!
//! ワーカーから [`QuoteBatch`] を受け取り、順位付けした行をまとめて upsert する。
//! 書き込みをページ操作から切り離すので、遅いストレージがナビゲーションを止めない。
//!
//! # フラッシュ条件
//! - バッチが `batch_size` に達した
//! - チャネルが `idle_flush` の間静かだった（バッチが空でなければ）
//! - 全送信側が drop された（最終フラッシュして終了）
//!
//! 書き込み失敗はログに残してそのバッチを捨てる。再試行はしない。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::worker_loop::QuoteBatch;
use crate::config::AggregatorSettings;
use crate::domain::{RankedRow, RunError, rank};
use crate::ports::PriceStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorReport {
    pub rows_ranked: usize,
    pub rows_written: usize,
    pub batches_written: usize,
    pub batches_failed: usize,
    pub rows_dropped: usize,
}

pub struct Aggregator {
    store: Arc<dyn PriceStore>,
    our_id: String,
    batch_size: usize,
    idle_flush: Duration,
    batch: Vec<RankedRow>,
    report: AggregatorReport,
}

pub struct AggregatorHandle {
    join: JoinHandle<AggregatorReport>,
}

impl Aggregator {
    /// Start the consumer task. Dropping every clone of the returned sender
    /// ends the run: the aggregator drains, flushes once more, and exits.
    pub fn spawn(
        store: Arc<dyn PriceStore>,
        settings: &AggregatorSettings,
        our_id: impl Into<String>,
    ) -> (AggregatorHandle, mpsc::Sender<QuoteBatch>) {
        let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
        let batch_size = settings.batch_size.max(1);
        let aggregator = Aggregator {
            store,
            our_id: our_id.into(),
            batch_size,
            idle_flush: settings.idle_flush(),
            batch: Vec::with_capacity(batch_size),
            report: AggregatorReport::default(),
        };
        let join = tokio::spawn(aggregator.run(rx));
        (AggregatorHandle { join }, tx)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<QuoteBatch>) -> AggregatorReport {
        loop {
            match tokio::time::timeout(self.idle_flush, rx.recv()).await {
                Ok(Some(batch)) => {
                    let row = rank(&batch.quotes, &self.our_id, &batch.part_number, &batch.brand_name);
                    debug!(
                        part = %row.part_number,
                        brand = %row.brand_name,
                        rank = ?row.rank_pos,
                        "ranked"
                    );
                    self.batch.push(row);
                    self.report.rows_ranked += 1;
                    if self.batch.len() >= self.batch_size {
                        self.flush().await;
                    }
                }
                Ok(None) => break,
                Err(_idle) => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        if !self.batch.is_empty() {
            self.flush().await;
        }
        info!(
            rows_written = self.report.rows_written,
            rows_dropped = self.report.rows_dropped,
            batches = self.report.batches_written,
            "aggregator drained"
        );
        self.report
    }

    async fn flush(&mut self) {
        let rows = std::mem::take(&mut self.batch);
        match self.store.upsert_batch(&rows).await {
            Ok(written) => {
                self.report.rows_written += written;
                self.report.batches_written += 1;
                debug!(rows = written, "batch written");
            }
            Err(e) => {
                self.report.rows_dropped += rows.len();
                self.report.batches_failed += 1;
                error!(rows = rows.len(), error = %e, "batch write failed; rows dropped");
            }
        }
    }
}

impl AggregatorHandle {
    /// Wait for the drain and final flush. Every sender must be dropped first.
    pub async fn finish(self) -> Result<AggregatorReport, RunError> {
        self.join
            .await
            .map_err(|e| RunError::Aggregator(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CompetitorQuote, Field, NO_LISTING};
    use crate::impls::InMemoryPriceStore;

    fn settings(batch_size: usize) -> AggregatorSettings {
        AggregatorSettings {
            batch_size,
            ..AggregatorSettings::default()
        }
    }

    fn batch(part: &str, quotes: Vec<CompetitorQuote>) -> QuoteBatch {
        QuoteBatch {
            quotes,
            part_number: part.to_string(),
            brand_name: "CLAAS".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_full_batches_and_the_remainder() {
        let store = Arc::new(InMemoryPriceStore::new());
        let (handle, tx) = Aggregator::spawn(store.clone(), &settings(10), "1269");

        for i in 0..25 {
            tx.send(batch(&format!("P{i}"), vec![CompetitorQuote::new("1269", 10.0)]))
                .await
                .unwrap();
        }
        drop(tx);
        let report = handle.finish().await.unwrap();

        assert_eq!(report.rows_ranked, 25);
        assert_eq!(report.rows_written, 25);
        assert_eq!(report.batches_written, 3);
        assert_eq!(store.batch_sizes().await, vec![10, 10, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_channel_flushes_a_partial_batch() {
        let store = Arc::new(InMemoryPriceStore::new());
        let (handle, tx) = Aggregator::spawn(store.clone(), &settings(10), "1269");

        tx.send(batch("P1", vec![])).await.unwrap();
        tx.send(batch("P2", vec![])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.batch_sizes().await, vec![2]);

        tx.send(batch("P3", vec![])).await.unwrap();
        drop(tx);
        let report = handle.finish().await.unwrap();
        assert_eq!(store.batch_sizes().await, vec![2, 1]);
        assert_eq!(report.batches_written, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_drops_the_batch_and_keeps_going() {
        let store = Arc::new(InMemoryPriceStore::new());
        store.fail_writes(true);
        let (handle, tx) = Aggregator::spawn(store.clone(), &settings(2), "1269");

        tx.send(batch("P1", vec![])).await.unwrap();
        tx.send(batch("P2", vec![])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.fail_writes(false);
        tx.send(batch("P3", vec![])).await.unwrap();
        drop(tx);
        let report = handle.finish().await.unwrap();

        assert_eq!(report.rows_dropped, 2);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.rows_written, 1);
        let rows = store.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].part_number, "P3");
    }

    #[tokio::test(start_paused = true)]
    async fn rows_are_ranked_with_our_id() {
        let store = Arc::new(InMemoryPriceStore::new());
        let (handle, tx) = Aggregator::spawn(store.clone(), &settings(10), "1269");

        tx.send(batch(
            "P1",
            vec![CompetitorQuote::new("77", 90.0), CompetitorQuote::new("1269", 100.0)],
        ))
        .await
        .unwrap();
        tx.send(batch("P2", vec![CompetitorQuote::new("77", 90.0)])).await.unwrap();
        drop(tx);
        handle.finish().await.unwrap();

        let rows = store.rows().await;
        let p1 = rows.iter().find(|r| r.part_number == "P1").unwrap();
        assert_eq!(p1.rank_pos, Some(Field::Number(2.0)));
        assert_eq!(p1.leader_code.as_deref(), Some("77"));
        let p2 = rows.iter().find(|r| r.part_number == "P2").unwrap();
        assert_eq!(p2.rank_pos, Some(Field::text(NO_LISTING)));
    }
}
