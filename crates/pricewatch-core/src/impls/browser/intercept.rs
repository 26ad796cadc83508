//! Request filter.
//!
//! With interception on, every paused request must be answered (continue, fail or
//! fulfil), otherwise the page stalls.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EventRequestPaused, FailRequestParams, FulfillRequestParams,
    HeaderEntry,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::{Binary, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::cdp_err;
use crate::domain::ScrapeError;

/// Script URLs containing any of these (case-insensitive) are aborted.
const TRACKER_PATTERNS: [&str; 7] = [
    "analytics",
    "gtag",
    "google-analytics",
    "yandex",
    "metrika",
    "hotjar",
    "tracker",
];

const STUB_STYLESHEET: &str = "/* stripped */";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptAction {
    /// Answer locally with an empty stylesheet.
    StubStylesheet,
    Abort,
    Continue,
}

pub fn classify_request(resource: &ResourceType, url: &str) -> InterceptAction {
    match resource {
        ResourceType::Stylesheet => InterceptAction::StubStylesheet,
        ResourceType::Font | ResourceType::Image | ResourceType::Media => InterceptAction::Abort,
        ResourceType::Script if is_tracker(url) => InterceptAction::Abort,
        _ => InterceptAction::Continue,
    }
}

fn is_tracker(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    TRACKER_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Start answering paused requests of `page`. The task ends with the page's event stream.
pub(crate) async fn spawn_request_filter(page: &Page) -> Result<JoinHandle<()>, ScrapeError> {
    let mut paused = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(cdp_err)?;
    let page = page.clone();

    Ok(tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let action = classify_request(&event.resource_type, &event.request.url);
            trace!(url = %event.request.url, ?action, "request paused");
            if let Err(e) = answer(&page, &event, action).await {
                debug!(url = %event.request.url, error = %e, "failed to answer paused request");
            }
        }
    }))
}

async fn answer(
    page: &Page,
    event: &EventRequestPaused,
    action: InterceptAction,
) -> Result<(), ScrapeError> {
    let id = event.request_id.clone();
    match action {
        InterceptAction::Continue => {
            page.execute(ContinueRequestParams::new(id))
                .await
                .map_err(cdp_err)?;
        }
        InterceptAction::Abort => {
            page.execute(FailRequestParams::new(id, ErrorReason::BlockedByClient))
                .await
                .map_err(cdp_err)?;
        }
        InterceptAction::StubStylesheet => {
            let mut params = FulfillRequestParams::new(id, 200i64);
            params.response_headers = Some(vec![HeaderEntry::new("Content-Type", "text/css")]);
            params.body = Some(Binary::from(STANDARD.encode(STUB_STYLESHEET)));
            page.execute(params).await.map_err(cdp_err)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::stylesheet(ResourceType::Stylesheet, "https://partsbooking.ru/app.css", InterceptAction::StubStylesheet)]
    #[case::font(ResourceType::Font, "https://partsbooking.ru/a.woff2", InterceptAction::Abort)]
    #[case::image(ResourceType::Image, "https://cdn.partsbooking.ru/p.jpg", InterceptAction::Abort)]
    #[case::media(ResourceType::Media, "https://partsbooking.ru/v.mp4", InterceptAction::Abort)]
    #[case::metrika(ResourceType::Script, "https://mc.yandex.ru/metrika/tag.js", InterceptAction::Abort)]
    #[case::gtag(ResourceType::Script, "https://www.googletagmanager.com/GTAG/js?id=1", InterceptAction::Abort)]
    #[case::app_script(ResourceType::Script, "https://partsbooking.ru/static/app.js", InterceptAction::Continue)]
    #[case::document(ResourceType::Document, "https://partsbooking.ru/products/CLAAS/1.html", InterceptAction::Continue)]
    #[case::api(ResourceType::Xhr, "https://partsbooking.ru/price_search/search?x=1", InterceptAction::Continue)]
    fn classifies_paused_requests(
        #[case] resource: ResourceType,
        #[case] url: &str,
        #[case] expected: InterceptAction,
    ) {
        assert_eq!(classify_request(&resource, url), expected);
    }

    #[test]
    fn tracker_patterns_only_apply_to_scripts() {
        // an xhr to an analytics host is left alone
        assert_eq!(
            classify_request(&ResourceType::Xhr, "https://www.google-analytics.com/collect"),
            InterceptAction::Continue
        );
    }
}
