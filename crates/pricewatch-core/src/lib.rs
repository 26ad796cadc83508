//! pricewatch-core
//!
//! Core building blocks for the partsbooking price-rank scraper.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（task, brand, quote, ranked row, ranking, errors, progress）
//! - **queue**: tri-queue（pending / retry / dead）、リトライ方針、チェックポイント
//! - **ports**: 抽象化レイヤー（PriceStore, BrowserLauncher, PricePage, ImageFetcher）
//! - **impls**: 実装（SQLite, in-memory, chromiumoxide, reqwest）
//! - **app**: アプリケーションロジック（worker_loop, aggregator, run）
//! - **config**: ScraperConfig
//! - **observability**: キューの状態ビュー

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

pub use self::app::{RunController, RunSummary};
pub use self::config::ScraperConfig;
