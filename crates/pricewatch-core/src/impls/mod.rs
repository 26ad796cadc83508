//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **SqlitePriceStore**: 本番用の価格テーブル（sqlx / SQLite）
//! - **InMemoryPriceStore**: テスト・開発用
//! - **ChromiumLauncher**: chromiumoxide によるブラウザセッション
//! - **HttpImageFetcher**: reqwest による画像ダウンロード

pub mod browser;
pub mod image_download;
pub mod memory_store;
pub mod sqlite_store;

// 主要な型を再エクスポート
pub use self::browser::ChromiumLauncher;
pub use self::image_download::HttpImageFetcher;
pub use self::memory_store::InMemoryPriceStore;
pub use self::sqlite_store::SqlitePriceStore;
