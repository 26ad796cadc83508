//! Browser session factory.
//!
//! One browser process per run, one prepared page per worker. The CDP handler
//! must be polled for anything to happen, so it runs on its own task for the
//! lifetime of the session.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::auth::Credentials;
use chromiumoxide::cdp::browser_protocol::network::{SetCacheDisabledParams, SetUserAgentOverrideParams};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::capture::ChromiumSubscription;
use super::intercept::spawn_request_filter;
use super::navigation::navigate_with_retries;
use super::{cdp_err, set_accept_language};
use crate::config::{BrowserSettings, NavigationSettings, ProxySettings, ScraperConfig};
use crate::domain::ScrapeError;
use crate::ports::{BrowserLauncher, BrowserSession, PricePage, PriceSubscription};

const LAUNCH_ARGS: [&str; 5] = [
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-accelerated-2d-canvas",
    "--no-first-run",
    "--disable-extensions",
];

/// Unregisters service workers and empties CacheStorage before any page script runs.
const PURGE_WORKERS_SCRIPT: &str = r#"(() => {
  try {
    if ('serviceWorker' in navigator) {
      navigator.serviceWorker.getRegistrations()
        .then(rs => rs.forEach(r => r.unregister())).catch(() => {});
    }
    if (typeof caches !== 'undefined' && caches.keys) {
      caches.keys().then(keys => keys.forEach(k => caches.delete(k))).catch(() => {});
    }
  } catch (_) {}
})();"#;

/// Headless builds announce themselves in the user agent; present a regular one.
fn normalize_user_agent(user_agent: &str) -> String {
    user_agent.replace("HeadlessChrome", "Chrome")
}

pub struct ChromiumLauncher {
    browser: BrowserSettings,
    navigation: NavigationSettings,
    api_path: String,
    proxy: Option<ProxySettings>,
}

impl ChromiumLauncher {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            browser: config.browser.clone(),
            navigation: config.navigation.clone(),
            api_path: config.capture.api_path.clone(),
            proxy: config.proxy.clone(),
        }
    }

    fn browser_config(&self) -> Result<BrowserConfig, ScrapeError> {
        let settings = &self.browser;
        let mut builder = BrowserConfig::builder()
            .enable_request_intercept()
            .disable_cache()
            .viewport(Viewport {
                width: settings.viewport_width,
                height: settings.viewport_height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: false,
                has_touch: false,
            })
            .window_size(settings.viewport_width, settings.viewport_height)
            .launch_timeout(Duration::from_millis(settings.launch_timeout_ms))
            .args(LAUNCH_ARGS);

        if !settings.headless {
            builder = builder.with_head();
        }
        if settings.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(proxy) = &self.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy.url()));
        }
        if let Some(executable) = &settings.executable {
            builder = builder.chrome_executable(executable);
        }
        if let Some(dir) = &settings.user_data_dir {
            builder = builder.user_data_dir(dir);
        }

        builder
            .build()
            .map_err(|e| ScrapeError::Browser(format!("invalid browser config: {e}")))
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, ScrapeError> {
        let config = self.browser_config()?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScrapeError::Browser(format!("launch failed: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    trace!(error = %e, "cdp handler error");
                }
            }
            debug!("cdp handler finished");
        });

        let user_agent = match &self.browser.user_agent {
            Some(ua) => ua.clone(),
            None => match browser.user_agent().await {
                Ok(ua) => normalize_user_agent(&ua),
                Err(e) => {
                    handler.abort();
                    return Err(ScrapeError::Browser(format!("cannot read user agent: {e}")));
                }
            },
        };

        info!(
            headless = self.browser.headless,
            proxy = self.proxy.is_some(),
            user_agent = %user_agent,
            "browser launched"
        );

        Ok(Box::new(ChromiumSession {
            browser: Mutex::new(browser),
            handler,
            setup: PageSetup {
                user_agent,
                accept_language: self.browser.accept_language.clone(),
                credentials: self
                    .proxy
                    .as_ref()
                    .and_then(ProxySettings::credentials)
                    .map(|(user, pass)| (user.to_string(), pass.to_string())),
                navigation: self.navigation.clone(),
                api_path: self.api_path.clone(),
            },
        }))
    }
}

/// Per-page preparation shared by every worker page.
struct PageSetup {
    user_agent: String,
    accept_language: String,
    credentials: Option<(String, String)>,
    navigation: NavigationSettings,
    api_path: String,
}

impl PageSetup {
    async fn prepare(&self, page: &Page) -> Result<JoinHandle<()>, ScrapeError> {
        if let Some((username, password)) = &self.credentials {
            page.authenticate(Credentials {
                username: username.clone(),
                password: password.clone(),
            })
            .await
            .map_err(|e| ScrapeError::Browser(format!("proxy authentication: {e}")))?;
        }

        let filter = spawn_request_filter(page).await?;
        let prepared = self.apply_headers(page).await;
        if prepared.is_err() {
            filter.abort();
        }
        prepared.map(|()| filter)
    }

    async fn apply_headers(&self, page: &Page) -> Result<(), ScrapeError> {
        page.execute(SetCacheDisabledParams::new(true))
            .await
            .map_err(cdp_err)?;
        page.evaluate_on_new_document(PURGE_WORKERS_SCRIPT)
            .await
            .map_err(cdp_err)?;

        let mut user_agent = SetUserAgentOverrideParams::new(self.user_agent.clone());
        user_agent.accept_language = Some(self.accept_language.clone());
        page.execute(user_agent).await.map_err(cdp_err)?;

        set_accept_language(page, &self.accept_language).await
    }
}

pub(crate) struct ChromiumSession {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
    setup: PageSetup,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn open_page(&self) -> Result<Box<dyn PricePage>, ScrapeError> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| ScrapeError::Browser(format!("cannot open page: {e}")))?;

        match self.setup.prepare(&page).await {
            Ok(filter) => Ok(Box::new(ChromiumPage {
                page,
                filter,
                navigation: self.setup.navigation.clone(),
                api_path: self.setup.api_path.clone(),
                accept_language: self.setup.accept_language.clone(),
            })),
            Err(e) => {
                if let Err(close) = page.close().await {
                    debug!(error = %close, "closing unprepared page failed");
                }
                Err(ScrapeError::Browser(format!("page setup failed: {e}")))
            }
        }
    }

    async fn shutdown(self: Box<Self>) {
        let ChromiumSession {
            browser, handler, ..
        } = *self;
        let mut browser = browser.into_inner();
        if let Err(e) = browser.close().await {
            warn!(error = %e, "browser close failed");
        }
        if let Err(e) = browser.wait().await {
            debug!(error = %e, "waiting for browser exit failed");
        }
        handler.abort();
        info!("browser closed");
    }
}

pub(crate) struct ChromiumPage {
    page: Page,
    filter: JoinHandle<()>,
    navigation: NavigationSettings,
    api_path: String,
    accept_language: String,
}

#[async_trait]
impl PricePage for ChromiumPage {
    async fn subscribe(&self) -> Result<Box<dyn PriceSubscription>, ScrapeError> {
        let subscription = ChromiumSubscription::open(&self.page, &self.api_path).await?;
        Ok(Box::new(subscription))
    }

    async fn navigate(&self, url: &Url) -> Result<(), ScrapeError> {
        navigate_with_retries(&self.page, url, &self.navigation, &self.accept_language).await
    }

    async fn close(self: Box<Self>) {
        let ChromiumPage { page, filter, .. } = *self;
        if let Err(e) = page.close().await {
            debug!(error = %e, "page close failed");
        }
        filter.abort();
    }
}
