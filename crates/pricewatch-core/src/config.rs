//! Scraper configuration.
//!
//! JSON ファイル（任意）→ 環境変数の順に上書きする。すべての項目にデフォルトがあるので
//! 部分的な JSON でもよい。認証情報は環境変数からのみ渡す想定。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::domain::ListingFilter;
use crate::queue::{JitteredBackoff, RetryPolicy};

pub mod defaults {
    pub const BASE_URL: &str = "https://partsbooking.ru";
    pub const OUR_SITE_CODE: &str = "1269";
    pub const WORKERS: usize = 1;
    pub const THROTTLE_MIN_MS: u64 = 1500;
    pub const THROTTLE_MAX_MS: u64 = 3000;
    pub const NAVIGATION_TIMEOUT_MS: u64 = 60_000;
    pub const NAVIGATION_ATTEMPTS: u32 = 3;
    pub const BACKOFF_MIN_STEP_MS: u64 = 800;
    pub const BACKOFF_MAX_STEP_MS: u64 = 1200;
    pub const API_PATH: &str = "/price_search/search";
    pub const API_WAIT_MS: u64 = 60_000;
    pub const RETRY_PAUSE_MIN_MS: u64 = 400;
    pub const RETRY_PAUSE_MAX_MS: u64 = 900;
    pub const CAPTURE_LOG_EVERY: u64 = 10;
    pub const LISTING_TYPE: i64 = 1;
    pub const EXCLUDED_REGION: &str = "альметьевск";
    pub const IMAGE_TIMEOUT_MS: u64 = 10_000;
    pub const IMAGE_MAX_REDIRECTS: usize = 5;
    pub const IMAGES_DIR: &str = "images";
    pub const BATCH_SIZE: usize = 10;
    pub const IDLE_FLUSH_MS: u64 = 2_000;
    pub const CHANNEL_CAPACITY: usize = 256;
    pub const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9,ru;q=0.8";
    pub const VIEWPORT_WIDTH: u32 = 1280;
    pub const VIEWPORT_HEIGHT: u32 = 800;
    pub const LAUNCH_TIMEOUT_MS: u64 = 30_000;
    pub const CHECKPOINT_PATH: &str = "checkpoint.json";
    pub const DATABASE_PATH: &str = "data/partsbooking.db";
}

pub const ENV_DB_PATH: &str = "PARTSBOOKING_DB_PATH";
pub const ENV_PROXY_SERVER: &str = "PRICEWATCH_PROXY_SERVER";
pub const ENV_PROXY_USER: &str = "PRICEWATCH_PROXY_USER";
pub const ENV_PROXY_PASS: &str = "PRICEWATCH_PROXY_PASS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    /// Target site origin.
    pub base_url: String,
    /// Our own competitor id on the site.
    pub our_site_code: String,
    /// Concurrent workers, one page each.
    pub workers: usize,
    /// Cap on tasks seeded per run; 0 = no cap.
    pub max_parts: usize,
    pub throttle_min_ms: u64,
    pub throttle_max_ms: u64,
    pub max_attempts: u32,
    pub checkpoint_path: PathBuf,
    pub database_path: PathBuf,

    pub navigation: NavigationSettings,
    pub capture: CaptureSettings,
    pub images: ImageSettings,
    pub aggregator: AggregatorSettings,
    pub browser: BrowserSettings,
    pub proxy: Option<ProxySettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationSettings {
    pub timeout_ms: u64,
    pub attempts: u32,
    pub backoff_min_step_ms: u64,
    pub backoff_max_step_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Path of the client-side price API.
    pub api_path: String,
    /// First wait; the fallback wait is half of it.
    pub api_wait_ms: u64,
    pub retry_pause_min_ms: u64,
    pub retry_pause_max_ms: u64,
    /// Every n-th capture is logged at info, the rest at debug.
    pub log_every: u64,
    pub listing_type: i64,
    pub excluded_region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub timeout_ms: u64,
    pub max_redirects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    pub batch_size: usize,
    pub idle_flush_ms: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    /// Pass `--no-sandbox`; needed when running as root in a container.
    pub no_sandbox: bool,
    pub executable: Option<PathBuf>,
    pub user_data_dir: Option<PathBuf>,
    /// Overrides the browser's own user agent when set.
    pub user_agent: Option<String>,
    pub accept_language: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub launch_timeout_ms: u64,
}

/// Outbound proxy shared by the browser and the image fetcher.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// `host:port` or `scheme://host:port`.
    pub server: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl std::fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySettings")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ProxySettings {
    /// Proxy URL with a scheme, as reqwest expects it.
    pub fn url(&self) -> String {
        if self.server.contains("://") {
            self.server.clone()
        } else {
            format!("http://{}", self.server)
        }
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::BASE_URL.to_string(),
            our_site_code: defaults::OUR_SITE_CODE.to_string(),
            workers: defaults::WORKERS,
            max_parts: 0,
            throttle_min_ms: defaults::THROTTLE_MIN_MS,
            throttle_max_ms: defaults::THROTTLE_MAX_MS,
            max_attempts: crate::queue::MAX_ATTEMPTS,
            checkpoint_path: PathBuf::from(defaults::CHECKPOINT_PATH),
            database_path: PathBuf::from(defaults::DATABASE_PATH),
            navigation: NavigationSettings::default(),
            capture: CaptureSettings::default(),
            images: ImageSettings::default(),
            aggregator: AggregatorSettings::default(),
            browser: BrowserSettings::default(),
            proxy: None,
        }
    }
}

impl Default for NavigationSettings {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::NAVIGATION_TIMEOUT_MS,
            attempts: defaults::NAVIGATION_ATTEMPTS,
            backoff_min_step_ms: defaults::BACKOFF_MIN_STEP_MS,
            backoff_max_step_ms: defaults::BACKOFF_MAX_STEP_MS,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            api_path: defaults::API_PATH.to_string(),
            api_wait_ms: defaults::API_WAIT_MS,
            retry_pause_min_ms: defaults::RETRY_PAUSE_MIN_MS,
            retry_pause_max_ms: defaults::RETRY_PAUSE_MAX_MS,
            log_every: defaults::CAPTURE_LOG_EVERY,
            listing_type: defaults::LISTING_TYPE,
            excluded_region: defaults::EXCLUDED_REGION.to_string(),
        }
    }
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(defaults::IMAGES_DIR),
            timeout_ms: defaults::IMAGE_TIMEOUT_MS,
            max_redirects: defaults::IMAGE_MAX_REDIRECTS,
        }
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            idle_flush_ms: defaults::IDLE_FLUSH_MS,
            channel_capacity: defaults::CHANNEL_CAPACITY,
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            no_sandbox: false,
            executable: None,
            user_data_dir: None,
            user_agent: None,
            accept_language: defaults::ACCEPT_LANGUAGE.to_string(),
            viewport_width: defaults::VIEWPORT_WIDTH,
            viewport_height: defaults::VIEWPORT_HEIGHT,
            launch_timeout_ms: defaults::LAUNCH_TIMEOUT_MS,
        }
    }
}

impl ScraperConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`; blank values are ignored.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get(ENV_DB_PATH) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(server) = get(ENV_PROXY_SERVER) {
            self.proxy.get_or_insert_with(ProxySettings::default).server = server;
        }
        if let Some(proxy) = self.proxy.as_mut() {
            if let Some(user) = get(ENV_PROXY_USER) {
                proxy.username = Some(user);
            }
            if let Some(pass) = get(ENV_PROXY_PASS) {
                proxy.password = Some(pass);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        self.base_url()?;
        if self.our_site_code.trim().is_empty() {
            return invalid("our_site_code must not be empty");
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.throttle_min_ms > self.throttle_max_ms {
            return invalid("throttle_min_ms must not exceed throttle_max_ms");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.navigation.attempts == 0 {
            return invalid("navigation.attempts must be at least 1");
        }
        if self.navigation.backoff_min_step_ms > self.navigation.backoff_max_step_ms {
            return invalid("navigation backoff min step must not exceed max step");
        }
        if self.capture.retry_pause_min_ms > self.capture.retry_pause_max_ms {
            return invalid("capture retry pause min must not exceed max");
        }
        if !self.capture.api_path.starts_with('/') {
            return invalid("capture.api_path must start with '/'");
        }
        if self.aggregator.batch_size == 0 {
            return invalid("aggregator.batch_size must be at least 1");
        }
        if self.aggregator.channel_capacity == 0 {
            return invalid("aggregator.channel_capacity must be at least 1");
        }
        if let Some(proxy) = &self.proxy
            && proxy.server.trim().is_empty()
        {
            return invalid("proxy.server must not be empty");
        }
        Ok(())
    }

    /// Parsed [`ScraperConfig::base_url`]; only http(s) origins are accepted.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::Invalid(format!("base_url {:?}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid("base_url must be http or https".into()));
        }
        Ok(url)
    }

    pub fn throttle_window(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.throttle_min_ms),
            Duration::from_millis(self.throttle_max_ms),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
        }
    }

    pub fn listing_filter(&self) -> ListingFilter {
        ListingFilter {
            listing_type: self.capture.listing_type,
            excluded_region: self.capture.excluded_region.clone(),
        }
    }

    /// sqlx connection url for [`ScraperConfig::database_path`].
    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.database_path.display())
    }
}

impl NavigationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> JitteredBackoff {
        JitteredBackoff {
            min_step: Duration::from_millis(self.backoff_min_step_ms),
            max_step: Duration::from_millis(self.backoff_max_step_ms),
        }
    }
}

impl CaptureSettings {
    pub fn api_wait(&self) -> Duration {
        Duration::from_millis(self.api_wait_ms)
    }

    pub fn retry_pause(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.retry_pause_min_ms),
            Duration::from_millis(self.retry_pause_max_ms),
        )
    }
}

impl AggregatorSettings {
    pub fn idle_flush(&self) -> Duration {
        Duration::from_millis(self.idle_flush_ms)
    }
}
