//! Errors - エラー型と分類
//!
//! タスク単位のエラー（[`ScrapeError`]）は worker loop の外に出ない。
//! [`ErrorKind`] に分類され、retry / dead-letter の判断材料になる。
//! run 単位のエラー（[`RunError`]）だけが呼び出し側に返る。

use std::time::Duration;

use thiserror::Error;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（ブラウザ起動・プロキシ認証の障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failure of a single task.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("unsupported brand {0:?}")]
    UnsupportedBrand(String),

    #[error("cannot build product url for {0:?}")]
    BadProductUrl(String),

    #[error("navigation returned no response for {url}")]
    NoNavigationResponse { url: String },

    #[error("bad status {status} for {url}")]
    BadStatus { status: i64, url: String },

    #[error("cross-origin redirect: requested {requested}, landed on {landed}")]
    CrossOriginRedirect { requested: String, landed: String },

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("network error: {0}")]
    Network(String),

    #[error("no data: price api response not captured")]
    NoData,

    #[error("malformed price payload: {0}")]
    MalformedPayload(String),

    #[error("browser unavailable: {0}")]
    Browser(String),

    #[error("devtools protocol error: {0}")]
    Cdp(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("image download failed: {0}")]
    Image(String),

    #[error("result channel closed")]
    ChannelClosed,
}

/// Substrings of protocol/network error messages that indicate a retryable condition.
const TRANSIENT_PATTERNS: [&str; 9] = [
    "timeout",
    "timed out",
    "net::err",
    "econnreset",
    "connection reset",
    "connection closed",
    "connection refused",
    "socket hang up",
    "navigation failed",
];

impl ScrapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScrapeError::BadStatus { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::Transient
            }
            ScrapeError::NoNavigationResponse { .. }
            | ScrapeError::Timeout { .. }
            | ScrapeError::Network(_)
            | ScrapeError::NoData
            | ScrapeError::Storage(_) => ErrorKind::Transient,
            ScrapeError::Cdp(message) => {
                let lower = message.to_lowercase();
                if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            ScrapeError::Browser(_) | ScrapeError::ChannelClosed => ErrorKind::Infrastructure,
            ScrapeError::UnsupportedBrand(_)
            | ScrapeError::BadProductUrl(_)
            | ScrapeError::BadStatus { .. }
            | ScrapeError::CrossOriginRedirect { .. }
            | ScrapeError::MalformedPayload(_)
            | ScrapeError::Image(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Failure of a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("a run is already in progress")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("checkpoint: {0}")]
    Checkpoint(#[from] crate::queue::CheckpointError),

    #[error("infrastructure failure: {0}")]
    Infrastructure(ScrapeError),

    #[error("aggregator task failed: {0}")]
    Aggregator(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::too_many_requests(ScrapeError::BadStatus { status: 429, url: "u".into() }, ErrorKind::Transient)]
    #[case::server_error(ScrapeError::BadStatus { status: 502, url: "u".into() }, ErrorKind::Transient)]
    #[case::not_found(ScrapeError::BadStatus { status: 404, url: "u".into() }, ErrorKind::Permanent)]
    #[case::no_data(ScrapeError::NoData, ErrorKind::Transient)]
    #[case::timeout(ScrapeError::Timeout { op: "navigation", after: Duration::from_secs(60) }, ErrorKind::Transient)]
    #[case::reset(ScrapeError::Cdp("net::ERR_CONNECTION_RESET".into()), ErrorKind::Transient)]
    #[case::ws_closed(ScrapeError::Cdp("Connection closed".into()), ErrorKind::Transient)]
    #[case::protocol(ScrapeError::Cdp("Cannot find context with specified id".into()), ErrorKind::Permanent)]
    #[case::brand(ScrapeError::UnsupportedBrand("KUBOTA".into()), ErrorKind::Permanent)]
    #[case::payload(ScrapeError::MalformedPayload("price_items is not an array".into()), ErrorKind::Permanent)]
    #[case::redirect(ScrapeError::CrossOriginRedirect { requested: "a".into(), landed: "b".into() }, ErrorKind::Permanent)]
    #[case::browser(ScrapeError::Browser("launch failed".into()), ErrorKind::Infrastructure)]
    fn classifies_errors(#[case] err: ScrapeError, #[case] kind: ErrorKind) {
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn messages_are_operator_readable() {
        let err = ScrapeError::BadStatus {
            status: 503,
            url: "https://partsbooking.ru/products/CLAAS/1.html".into(),
        };
        assert_eq!(
            err.to_string(),
            "bad status 503 for https://partsbooking.ru/products/CLAAS/1.html"
        );
    }
}
