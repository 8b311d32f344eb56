use std::time::Duration;

use secrecy::SecretString;

use crate::protocol::DEFAULT_API_URL;
use crate::{Error, Result};

pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const MIN_POLL_INTERVAL_SECS: u64 = 180;
/// Daily request allowance the service publishes.
pub const DEFAULT_RATE_BUDGET: u32 = 1700;
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_RATE_LIMIT_BACKOFF_SECS: u64 = 61 * 60;
pub const DEFAULT_OFFLINE_AFTER_FAILURES: u32 = 3;
pub const DEFAULT_DEDUP_RETENTION_SECS: u64 = 10 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub access_token: SecretString,
    /// Must end with `/`; resource paths are appended to it.
    pub api_url: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub rate_budget: u32,
    pub rate_window: Duration,
    /// Used when a 429 carries no retry-after hint.
    pub rate_limit_backoff: Duration,
    /// Consecutive transport-class poll failures before a controller is reported offline.
    pub offline_after_failures: u32,
    pub dedup_retention: Duration,
    /// Shared secret expected on inbound webhook calls. `None` accepts any caller.
    pub webhook_secret: Option<SecretString>,
}

impl Config {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(MIN_POLL_INTERVAL_SECS),
            rate_budget: DEFAULT_RATE_BUDGET,
            rate_window: Duration::from_secs(DEFAULT_RATE_WINDOW_SECS),
            rate_limit_backoff: Duration::from_secs(DEFAULT_RATE_LIMIT_BACKOFF_SECS),
            offline_after_failures: DEFAULT_OFFLINE_AFTER_FAILURES,
            dedup_retention: Duration::from_secs(DEFAULT_DEDUP_RETENTION_SECS),
            webhook_secret: None,
        }
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        let mut url = url.into();
        if !url.ends_with('/') {
            url.push('/');
        }
        self.api_url = url;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn rate_budget(mut self, requests: u32, window: Duration) -> Self {
        self.rate_budget = requests;
        self.rate_window = window;
        self
    }

    pub fn rate_limit_backoff(mut self, backoff: Duration) -> Self {
        self.rate_limit_backoff = backoff;
        self
    }

    pub fn offline_after_failures(mut self, failures: u32) -> Self {
        self.offline_after_failures = failures.max(1);
        self
    }

    pub fn dedup_retention(mut self, retention: Duration) -> Self {
        self.dedup_retention = retention;
        self
    }

    pub fn webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(SecretString::from(secret.into()));
        self
    }

    /// Reads `RACHIO_ACCESS_TOKEN` (required), `RACHIO_API_URL`,
    /// `RACHIO_POLL_INTERVAL_SECS`, `RACHIO_API_TIMEOUT_SECS` and
    /// `RACHIO_WEBHOOK_SECRET`. Poll intervals below three minutes are raised.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let token = var("RACHIO_ACCESS_TOKEN")
            .ok_or_else(|| Error::Config("RACHIO_ACCESS_TOKEN is not set".to_string()))?;
        let mut config = Config::new(token);

        if let Some(url) = var("RACHIO_API_URL") {
            config = config.api_url(url);
        }

        if let Some(raw) = var("RACHIO_POLL_INTERVAL_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                Error::Config(format!("RACHIO_POLL_INTERVAL_SECS must be a number, got {raw:?}"))
            })?;
            config.poll_interval = Duration::from_secs(secs.max(MIN_POLL_INTERVAL_SECS));
        }

        if let Some(raw) = var("RACHIO_API_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                Error::Config(format!("RACHIO_API_TIMEOUT_SECS must be a number, got {raw:?}"))
            })?;
            if secs == 0 {
                return Err(Error::Config("RACHIO_API_TIMEOUT_SECS must be positive".to_string()));
            }
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(secret) = var("RACHIO_WEBHOOK_SECRET") {
            config = config.webhook_secret(secret);
        }

        Ok(config)
    }
}
