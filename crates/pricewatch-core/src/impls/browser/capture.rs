//! Response capture - 価格 API 応答の購読
//!
//! 購読（[`ChromiumSubscription`]）はタスクごとに作り、CDP のイベントストリームを
//! 自分で所有する。drop でストリームが閉じるので、どの経路で抜けても購読解除される。
//!
//! 流れ: requestWillBeSent でメソッドを記録 → responseReceived で選別 →
//! loadingFinished を待ってから本文を取得（それより前だと本文がまだ無い）。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived, GetResponseBodyParams,
    RequestId,
};
use chromiumoxide::listeners::EventStream;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use super::cdp_err;
use crate::domain::ScrapeError;
use crate::ports::{PricePayload, PriceSubscription};

/// Whether a response on the page is the price API answer we wait for.
///
/// Pre-flights, error statuses and non-JSON bodies on the API path are ignored.
pub fn is_price_response(
    url: &str,
    api_path: &str,
    method: Option<&str>,
    status: i64,
    mime_type: &str,
) -> bool {
    let on_api_path = Url::parse(url)
        .map(|u| u.path().starts_with(api_path))
        .unwrap_or(false);
    let preflight = method.is_some_and(|m| m.eq_ignore_ascii_case("OPTIONS"));

    on_api_path
        && !preflight
        && (200..300).contains(&status)
        && mime_type.to_ascii_lowercase().contains("json")
}

/// `price_items` of an API body.
///
/// - not JSON, no `price_items` key, or `price_items: null`: `Ok(None)`, the caller keeps waiting
/// - `price_items` present but not an array: `MalformedPayload`
pub fn parse_price_items(body: &str) -> Result<Option<Vec<Value>>, ScrapeError> {
    let Ok(mut doc) = serde_json::from_str::<Value>(body) else {
        return Ok(None);
    };
    match doc.get_mut("price_items").map(Value::take) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(other) => Err(ScrapeError::MalformedPayload(format!(
            "price_items is not an array (got {})",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) struct ChromiumSubscription {
    page: Page,
    api_path: String,
    requests: EventStream<EventRequestWillBeSent>,
    responses: EventStream<EventResponseReceived>,
    finished: EventStream<EventLoadingFinished>,
    /// Method per request id, for requests on the API path.
    methods: HashMap<RequestId, String>,
    /// Qualifying responses whose body has not finished loading yet.
    ready: HashMap<RequestId, String>,
}

impl ChromiumSubscription {
    pub(crate) async fn open(page: &Page, api_path: &str) -> Result<Self, ScrapeError> {
        Ok(Self {
            page: page.clone(),
            api_path: api_path.to_string(),
            requests: page
                .event_listener::<EventRequestWillBeSent>()
                .await
                .map_err(cdp_err)?,
            responses: page
                .event_listener::<EventResponseReceived>()
                .await
                .map_err(cdp_err)?,
            finished: page
                .event_listener::<EventLoadingFinished>()
                .await
                .map_err(cdp_err)?,
            methods: HashMap::new(),
            ready: HashMap::new(),
        })
    }

    fn on_request(&mut self, event: &EventRequestWillBeSent) {
        if event.request.url.contains(&self.api_path) {
            self.methods
                .insert(event.request_id.clone(), event.request.method.clone());
        }
    }

    fn on_response(&mut self, event: &EventResponseReceived) {
        let response = &event.response;
        if !response.url.contains(&self.api_path) {
            return;
        }
        let method = self.methods.get(&event.request_id).map(String::as_str);
        if is_price_response(
            &response.url,
            &self.api_path,
            method,
            response.status,
            &response.mime_type,
        ) {
            self.ready
                .insert(event.request_id.clone(), response.url.clone());
        } else {
            debug!(
                url = %response.url,
                status = response.status,
                method = method.unwrap_or("?"),
                mime = %response.mime_type,
                "ignoring api response"
            );
        }
    }

    async fn read_payload(
        &self,
        request_id: &RequestId,
        url: String,
        encoded_length: f64,
    ) -> Result<Option<PricePayload>, ScrapeError> {
        let body = match self
            .page
            .execute(GetResponseBodyParams::new(request_id.clone()))
            .await
        {
            Ok(response) => response.result,
            Err(e) => {
                debug!(url = %url, error = %e, "api response body unavailable");
                return Ok(None);
            }
        };

        let text = if body.base64_encoded {
            match STANDARD
                .decode(body.body.as_bytes())
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            {
                Ok(text) => text,
                Err(e) => {
                    debug!(url = %url, error = %e, "api response body is not valid base64");
                    return Ok(None);
                }
            }
        } else {
            body.body
        };

        match parse_price_items(&text)? {
            Some(items) => Ok(Some(PricePayload {
                items,
                bytes_in: encoded_length.max(0.0) as u64,
                url,
            })),
            None => {
                debug!(url = %url, "api response without price_items");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl PriceSubscription for ChromiumSubscription {
    async fn next_payload(&mut self, wait: Duration) -> Result<Option<PricePayload>, ScrapeError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            tokio::select! {
                Some(event) = self.requests.next() => self.on_request(&event),
                Some(event) = self.responses.next() => self.on_response(&event),
                Some(event) = self.finished.next() => {
                    let Some(url) = self.ready.remove(&event.request_id) else {
                        continue;
                    };
                    trace!(url = %url, "api response finished loading");
                    if let Some(payload) = self
                        .read_payload(&event.request_id, url, event.encoded_data_length)
                        .await?
                    {
                        return Ok(Some(payload));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const API: &str = "/price_search/search";

    #[rstest]
    #[case::json_ok("https://partsbooking.ru/price_search/search?q=1", Some("GET"), 200, "application/json", true)]
    #[case::post_ok("https://partsbooking.ru/price_search/search", Some("POST"), 201, "application/json; charset=utf-8", true)]
    #[case::method_unknown("https://partsbooking.ru/price_search/search", None, 200, "application/json", true)]
    #[case::preflight("https://partsbooking.ru/price_search/search", Some("OPTIONS"), 204, "application/json", false)]
    #[case::server_error("https://partsbooking.ru/price_search/search", Some("GET"), 502, "application/json", false)]
    #[case::redirect("https://partsbooking.ru/price_search/search", Some("GET"), 302, "application/json", false)]
    #[case::html("https://partsbooking.ru/price_search/search", Some("GET"), 200, "text/html", false)]
    #[case::other_path("https://partsbooking.ru/api/cart", Some("GET"), 200, "application/json", false)]
    fn qualifies_api_responses(
        #[case] url: &str,
        #[case] method: Option<&str>,
        #[case] status: i64,
        #[case] mime: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(is_price_response(url, API, method, status, mime), expected);
    }

    #[test]
    fn extracts_price_items() {
        let items = parse_price_items(r#"{"price_items":[{"price_id":1,"cost":10}],"total":1}"#)
            .unwrap()
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["cost"], 10);
    }

    #[rstest]
    #[case::not_json("<html>captcha</html>")]
    #[case::no_key(r#"{"error":"busy"}"#)]
    #[case::not_an_object("[1,2,3]")]
    #[case::null_items(r#"{"price_items":null,"total":0}"#)]
    fn unusable_bodies_are_skipped(#[case] body: &str) {
        assert!(parse_price_items(body).unwrap().is_none());
    }

    #[test]
    fn non_array_price_items_is_malformed() {
        let err = parse_price_items(r#"{"price_items":{"0":{}}}"#).unwrap_err();
        assert!(matches!(err, ScrapeError::MalformedPayload(ref m) if m.contains("object")));
        assert!(!err.is_retryable());
    }
}
