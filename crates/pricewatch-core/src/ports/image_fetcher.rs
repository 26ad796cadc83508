//! ImageFetcher port - 商品画像のダウンロード

use std::path::Path;

use async_trait::async_trait;
use url::Url;

use crate::domain::ScrapeError;

/// 画像取得はタスクの付随処理。失敗してもタスク自体は失敗にしない（呼び出し側で log のみ）。
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Download `url` to `dest`; returns the bytes written.
    ///
    /// `dest` is either fully written or absent afterwards.
    async fn fetch(&self, url: &Url, referer: &Url, dest: &Path) -> Result<u64, ScrapeError>;
}
