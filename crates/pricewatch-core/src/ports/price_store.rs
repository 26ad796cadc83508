//! PriceStore port - 価格テーブルの読み書き
//!
//! 主キーは (part_number, brand_name)。書き込みは upsert（後勝ち）なので
//! 同じタスクが二度実行されても行は一つのまま。

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::RankedRow;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// PriceStore は永続化の契約だけを定める
///
/// # 設計原則
/// - `exists` は worker の dedupe 判定に使う（ネットワークコストを避ける主防御）
/// - `upsert_batch` は 1 トランザクションでバッチ全体を書く
/// - `find_by_part` / `count` は閲覧・エクスポート用の汎用読み出し
#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn exists(&self, part_number: &str, brand_name: &str) -> Result<bool, StoreError>;

    /// Upsert all rows; returns the number written.
    async fn upsert_batch(&self, rows: &[RankedRow]) -> Result<usize, StoreError>;

    async fn find_by_part(&self, part_number: &str) -> Result<Vec<RankedRow>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}
