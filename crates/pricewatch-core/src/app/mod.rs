//! App - アプリケーション層
//!
//! ports を組み合わせて 1 回の実行を組み立てる。
//!
//! # 主要コンポーネント
//! - **WorkerLoop / WorkerGroup**: タスク実行ループ（dedupe→navigate→capture→enqueue→throttle）
//! - **Aggregator**: ランキングとバッチ upsert
//! - **RunController**: 入力の準備からシャットダウンまで

pub mod aggregator;
pub mod run;
pub mod worker_loop;

#[cfg(test)]
pub(crate) mod testing;

// 主要な型を再エクスポート
pub use self::aggregator::{Aggregator, AggregatorHandle, AggregatorReport};
pub use self::run::{DataChangedFn, RunController, RunSummary};
pub use self::worker_loop::{
    GroupResult, QuoteBatch, TaskOutcome, WorkerContext, WorkerGroup, WorkerSettings, WorkerStats,
};
