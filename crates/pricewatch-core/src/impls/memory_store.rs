//! InMemoryPriceStore - 開発・テスト用の価格ストア
//!
//! # 実装詳細
//! - BTreeMap<(part, brand), RankedRow> で主キーを表現（upsert は insert で上書き）
//! - 書き込み失敗・exists 失敗を注入できる（aggregator / worker のテスト用）
//! - flush ごとのバッチサイズを記録する

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::RankedRow;
use crate::ports::{PriceStore, StoreError};

#[derive(Default)]
pub struct InMemoryPriceStore {
    rows: Mutex<BTreeMap<(String, String), RankedRow>>,
    batches: Mutex<Vec<usize>>,
    fail_writes: AtomicBool,
    fail_exists: AtomicBool,
}

impl InMemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated store.
    pub async fn with_rows(rows: impl IntoIterator<Item = RankedRow>) -> Self {
        let store = Self::new();
        {
            let mut map = store.rows.lock().await;
            for row in rows {
                map.insert((row.part_number.clone(), row.brand_name.clone()), row);
            }
        }
        store
    }

    /// Make every following `upsert_batch` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every following `exists` fail.
    pub fn fail_exists(&self, fail: bool) {
        self.fail_exists.store(fail, Ordering::SeqCst);
    }

    pub async fn rows(&self) -> Vec<RankedRow> {
        self.rows.lock().await.values().cloned().collect()
    }

    /// Sizes of the batches written so far, in order.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl PriceStore for InMemoryPriceStore {
    async fn exists(&self, part_number: &str, brand_name: &str) -> Result<bool, StoreError> {
        if self.fail_exists.load(Ordering::SeqCst) {
            return Err(StoreError::Database("exists check failed (injected)".into()));
        }
        let rows = self.rows.lock().await;
        Ok(rows.contains_key(&(part_number.to_string(), brand_name.to_string())))
    }

    async fn upsert_batch(&self, rows: &[RankedRow]) -> Result<usize, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("write failed (injected)".into()));
        }
        let mut map = self.rows.lock().await;
        for row in rows {
            map.insert((row.part_number.clone(), row.brand_name.clone()), row.clone());
        }
        self.batches.lock().await.push(rows.len());
        Ok(rows.len())
    }

    async fn find_by_part(&self, part_number: &str) -> Result<Vec<RankedRow>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|r| r.part_number == part_number)
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.lock().await.len() as u64)
    }
}
