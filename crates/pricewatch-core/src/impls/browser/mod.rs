//! Browser impls - chromiumoxide (CDP) による browser ports の実装
//!
//! # 構成
//! - `session`: ブラウザ起動とページ準備
//! - `intercept`: リソース種別によるリクエスト遮断
//! - `navigation`: リトライ付き goto と応答の検証
//! - `capture`: 価格 API 応答の購読
//!
//! 判定ロジック（遮断・検証・応答の選別）は純粋関数にしてあり、ブラウザなしでテストできる。

mod capture;
mod intercept;
mod navigation;
mod session;

use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::error::CdpError;

use crate::domain::ScrapeError;

pub use self::capture::{is_price_response, parse_price_items};
pub use self::intercept::{InterceptAction, classify_request};
pub use self::navigation::{retry_with_backoff, validate_navigation};
pub use self::session::ChromiumLauncher;

pub(crate) fn cdp_err(e: CdpError) -> ScrapeError {
    ScrapeError::Cdp(e.to_string())
}

/// (Re)send `Accept-Language` as an extra header on every request of `page`.
pub(crate) async fn set_accept_language(page: &Page, accept_language: &str) -> Result<(), ScrapeError> {
    let headers = Headers::new(serde_json::json!({ "Accept-Language": accept_language }));
    page.execute(SetExtraHttpHeadersParams::new(headers))
        .await
        .map_err(cdp_err)?;
    Ok(())
}
