//! Browser ports - ブラウザセッションとページ
//!
//! # 構成
//! - [`BrowserLauncher`]: 共有ブラウザプロセスを 1 つ起動する
//! - [`BrowserSession`]: ワーカーごとに 1 ページを払い出す
//! - [`PricePage`]: 1 ワーカーが専有するページ（ナビゲーション + 応答の購読）
//! - [`PriceSubscription`]: 1 タスク分の応答購読。drop すると購読解除される
//!
//! 購読はタスク開始時に作り、どの経路で抜けても drop されるので、
//! 長寿命のページにリスナーが溜まることはない。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::domain::ScrapeError;

/// One qualifying price API response.
#[derive(Debug, Clone, Default)]
pub struct PricePayload {
    /// `price_items` entries, unfiltered.
    pub items: Vec<Value>,
    /// Encoded bytes received for the API response.
    pub bytes_in: u64,
    pub url: String,
}

#[async_trait]
pub trait PriceSubscription: Send {
    /// Wait up to `wait` for the next qualifying response.
    ///
    /// `Ok(None)` on timeout. Non-qualifying traffic on the API path is skipped.
    async fn next_payload(&mut self, wait: Duration) -> Result<Option<PricePayload>, ScrapeError>;
}

#[async_trait]
pub trait PricePage: Send + Sync {
    /// Start listening for price API responses. Subscribe before navigating.
    async fn subscribe(&self) -> Result<Box<dyn PriceSubscription>, ScrapeError>;

    /// Navigate with bounded retries; fails unless the final response is
    /// usable and same-origin.
    async fn navigate(&self, url: &Url) -> Result<(), ScrapeError>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// A new prepared page (headers, filter, viewport) for one worker.
    async fn open_page(&self) -> Result<Box<dyn PricePage>, ScrapeError>;

    async fn shutdown(self: Box<Self>);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launch the shared browser. Failure is fatal to the run.
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, ScrapeError>;
}
