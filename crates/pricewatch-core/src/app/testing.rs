//! Scripted browser and image doubles for app-level tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::domain::ScrapeError;
use crate::ports::{
    BrowserLauncher, BrowserSession, ImageFetcher, PricePage, PricePayload, PriceSubscription,
};

pub(crate) fn payload(items: Value) -> PricePayload {
    let bytes_in = items.to_string().len() as u64;
    PricePayload {
        items: match items {
            Value::Array(items) => items,
            other => vec![other],
        },
        bytes_in,
        url: "https://partsbooking.ru/price_search/search".into(),
    }
}

/// What one visit of a product page does.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// The API answers during the first wait.
    Payload(PricePayload),
    /// The API answers only during the second, shorter wait.
    Late(PricePayload),
    /// The API never answers.
    Silent,
    NavigateFails(&'static str),
    /// `price_items` is not an array.
    Malformed,
}

/// Steps per part number, shared by every scripted page.
#[derive(Default)]
pub(crate) struct Script {
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    fallback: Mutex<Option<Step>>,
    visited: Mutex<Vec<String>>,
}

impl Script {
    pub(crate) fn push(&self, part: &str, step: Step) {
        self.steps
            .lock()
            .unwrap()
            .entry(part.to_string())
            .or_default()
            .push_back(step);
    }

    /// Step used once a part has no scripted steps left.
    pub(crate) fn fallback(&self, step: Step) {
        *self.fallback.lock().unwrap() = Some(step);
    }

    pub(crate) fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap().clone()
    }

    fn next(&self, url: &Url) -> Step {
        self.visited.lock().unwrap().push(url.to_string());
        let part = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .map(|last| last.trim_end_matches(".html").to_string())
            .unwrap_or_default();
        let scripted = self
            .steps
            .lock()
            .unwrap()
            .get_mut(&part)
            .and_then(VecDeque::pop_front);
        scripted
            .or_else(|| self.fallback.lock().unwrap().clone())
            .unwrap_or(Step::Silent)
    }
}

pub(crate) struct ScriptedPage {
    script: Arc<Script>,
    current: Arc<Mutex<Option<Step>>>,
}

impl ScriptedPage {
    pub(crate) fn new(script: Arc<Script>) -> Self {
        Self {
            script,
            current: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl PricePage for ScriptedPage {
    async fn subscribe(&self) -> Result<Box<dyn PriceSubscription>, ScrapeError> {
        *self.current.lock().unwrap() = None;
        Ok(Box::new(ScriptedSubscription {
            current: Arc::clone(&self.current),
        }))
    }

    async fn navigate(&self, url: &Url) -> Result<(), ScrapeError> {
        match self.script.next(url) {
            Step::NavigateFails(message) => Err(ScrapeError::Cdp(message.to_string())),
            step => {
                *self.current.lock().unwrap() = Some(step);
                Ok(())
            }
        }
    }

    async fn close(self: Box<Self>) {}
}

struct ScriptedSubscription {
    current: Arc<Mutex<Option<Step>>>,
}

#[async_trait]
impl PriceSubscription for ScriptedSubscription {
    async fn next_payload(&mut self, wait: Duration) -> Result<Option<PricePayload>, ScrapeError> {
        let step = self.current.lock().unwrap().take();
        match step {
            Some(Step::Payload(payload)) => Ok(Some(payload)),
            Some(Step::Late(payload)) => {
                *self.current.lock().unwrap() = Some(Step::Payload(payload));
                tokio::time::sleep(wait).await;
                Ok(None)
            }
            Some(Step::Malformed) => Err(ScrapeError::MalformedPayload(
                "price_items is not an array (got object)".into(),
            )),
            Some(Step::Silent) | Some(Step::NavigateFails(_)) | None => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }
}

/// Launcher over [`ScriptedPage`]s. Page opens past `page_limit` fail.
pub(crate) struct ScriptedLauncher {
    pub(crate) script: Arc<Script>,
    pub(crate) fail_launch: bool,
    pub(crate) page_limit: usize,
    pub(crate) opened: Arc<AtomicUsize>,
    pub(crate) shut_down: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    pub(crate) fn new(script: Arc<Script>) -> Self {
        Self {
            script,
            fail_launch: false,
            page_limit: usize::MAX,
            opened: Arc::new(AtomicUsize::new(0)),
            shut_down: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, ScrapeError> {
        if self.fail_launch {
            return Err(ScrapeError::Browser("launch failed: no chrome".into()));
        }
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            page_limit: self.page_limit,
            opened: Arc::clone(&self.opened),
            shut_down: Arc::clone(&self.shut_down),
        }))
    }
}

struct ScriptedSession {
    script: Arc<Script>,
    page_limit: usize,
    opened: Arc<AtomicUsize>,
    shut_down: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn open_page(&self) -> Result<Box<dyn PricePage>, ScrapeError> {
        if self.opened.load(Ordering::SeqCst) >= self.page_limit {
            return Err(ScrapeError::Browser("cannot open page: target closed".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedPage::new(Arc::clone(&self.script))))
    }

    async fn shutdown(self: Box<Self>) {
        self.shut_down.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every request; writes nothing.
#[derive(Default)]
pub(crate) struct RecordingImageFetcher {
    fetched: Mutex<Vec<(Url, PathBuf)>>,
}

impl RecordingImageFetcher {
    pub(crate) fn fetched(&self) -> Vec<(Url, PathBuf)> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageFetcher for RecordingImageFetcher {
    async fn fetch(&self, url: &Url, _referer: &Url, dest: &Path) -> Result<u64, ScrapeError> {
        self.fetched
            .lock()
            .unwrap()
            .push((url.clone(), dest.to_path_buf()));
        Ok(0)
    }
}
