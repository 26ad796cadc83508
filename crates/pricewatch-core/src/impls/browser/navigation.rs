//! Navigation controller - リトライ付き goto
//!
//! 1 回の試行 = 応答イベントの購読 → goto（タイムアウト付き）→ Document 応答の
//! ステータスと最終 URL の検証。試行の間はジッター付きバックオフで待ち、
//! Accept-Language ヘッダーを送り直す。

use std::future::Future;
use std::time::Duration;

use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::network::{EventResponseReceived, ResourceType};
use chromiumoxide::listeners::EventStream;
use futures::{FutureExt, StreamExt};
use tracing::{debug, warn};
use url::Url;

use super::{cdp_err, set_accept_language};
use crate::config::NavigationSettings;
use crate::domain::ScrapeError;
use crate::queue::JitteredBackoff;

/// Run `op` up to `attempts` times, sleeping `backoff.delay(i)` after failed attempt `i`.
///
/// `op` receives the 1-indexed attempt number. The last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    backoff: &JitteredBackoff,
    mut op: F,
) -> Result<T, ScrapeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ScrapeError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                let delay = backoff.delay(attempt);
                warn!(
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "navigation attempt failed"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Accept a navigation only with a usable status and a same-origin final URL.
///
/// An unknown final URL is treated as the requested one.
pub fn validate_navigation(
    requested: &Url,
    final_url: Option<&str>,
    status: Option<i64>,
) -> Result<(), ScrapeError> {
    let Some(status) = status else {
        return Err(ScrapeError::NoNavigationResponse {
            url: requested.to_string(),
        });
    };
    if status == 429 || status >= 500 {
        return Err(ScrapeError::BadStatus {
            status,
            url: requested.to_string(),
        });
    }
    if let Some(landed) = final_url {
        let same_origin = Url::parse(landed)
            .map(|u| u.origin() == requested.origin())
            .unwrap_or(false);
        if !same_origin {
            return Err(ScrapeError::CrossOriginRedirect {
                requested: requested.to_string(),
                landed: landed.to_string(),
            });
        }
    }
    Ok(())
}

pub(crate) async fn navigate_with_retries(
    page: &Page,
    url: &Url,
    settings: &NavigationSettings,
    accept_language: &str,
) -> Result<(), ScrapeError> {
    let timeout = settings.timeout();
    retry_with_backoff(settings.attempts, &settings.backoff(), |attempt| async move {
        if attempt > 1 {
            set_accept_language(page, accept_language).await?;
        }
        debug!(url = %url, attempt, "navigating");
        navigate_once(page, url, timeout).await
    })
    .await
}

async fn navigate_once(page: &Page, url: &Url, timeout: Duration) -> Result<(), ScrapeError> {
    let mut responses = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(cdp_err)?;

    tokio::time::timeout(timeout, page.goto(url.as_str()))
        .await
        .map_err(|_| ScrapeError::Timeout {
            op: "navigation",
            after: timeout,
        })?
        .map_err(cdp_err)?;

    let status = document_status(&mut responses);
    let final_url = page.url().await.map_err(cdp_err)?;
    validate_navigation(url, final_url.as_deref(), status)
}

/// Status of the first `Document` response already delivered to `responses`.
fn document_status(responses: &mut EventStream<EventResponseReceived>) -> Option<i64> {
    // goto has resolved, so the document response is buffered; never block here
    while let Some(Some(event)) = responses.next().now_or_never() {
        if event.r#type == ResourceType::Document {
            return Some(event.response.status);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use rstest::rstest;
    use tokio::time::Instant;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[rstest]
    #[case::ok(Some(200), Ok(()))]
    #[case::not_found_is_not_rejected_here(Some(404), Ok(()))]
    #[case::rate_limited(Some(429), Err(429))]
    #[case::server_error(Some(503), Err(503))]
    fn validates_status(#[case] status: Option<i64>, #[case] expected: Result<(), i64>) {
        let requested = url("https://partsbooking.ru/products/CLAAS/P1.html");
        let result = validate_navigation(&requested, Some(requested.as_str()), status);
        match expected {
            Ok(()) => assert!(result.is_ok()),
            Err(code) => assert!(matches!(result, Err(ScrapeError::BadStatus { status, .. }) if status == code)),
        }
    }

    #[test]
    fn missing_response_is_rejected() {
        let requested = url("https://partsbooking.ru/products/CLAAS/P1.html");
        let err = validate_navigation(&requested, None, None).unwrap_err();
        assert!(matches!(err, ScrapeError::NoNavigationResponse { .. }));
        assert!(err.is_retryable());
    }

    #[rstest]
    #[case::same_origin("https://partsbooking.ru/search?q=P1", true)]
    #[case::other_host("https://login.example.com/", false)]
    #[case::scheme_downgrade("http://partsbooking.ru/products/CLAAS/P1.html", false)]
    #[case::garbage("not a url", false)]
    fn checks_final_origin(#[case] landed: &str, #[case] accepted: bool) {
        let requested = url("https://partsbooking.ru/products/CLAAS/P1.html");
        let result = validate_navigation(&requested, Some(landed), Some(200));
        assert_eq!(result.is_ok(), accepted);
        if !accepted {
            assert!(matches!(result, Err(ScrapeError::CrossOriginRedirect { .. })));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_growing_backoff_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = retry_with_backoff(3, &JitteredBackoff::default(), |attempt| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(ScrapeError::Cdp("net::ERR_CONNECTION_RESET".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 800..=1200 after the first failure, 1600..=2400 after the second
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(2400), "{waited:?}");
        assert!(waited <= Duration::from_millis(3600), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_returns_the_last_error() {
        let result: Result<(), _> = retry_with_backoff(3, &JitteredBackoff::default(), |attempt| async move {
            Err(ScrapeError::BadStatus {
                status: 500 + i64::from(attempt),
                url: "u".into(),
            })
        })
        .await;

        assert!(matches!(result, Err(ScrapeError::BadStatus { status: 503, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_does_not_sleep() {
        let started = Instant::now();
        let result: Result<(), _> =
            retry_with_backoff(1, &JitteredBackoff::default(), |_| async { Err(ScrapeError::NoData) }).await;
        assert!(result.is_err());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
