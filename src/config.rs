use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::http::{
    DEFAULT_AUTO_RETRY_SLEEP_SECS, DEFAULT_NUM_AUTO_RETRIES, DEFAULT_RATE_LIMIT_SLEEP_SECS,
    RateLimitPolicy, RefreshPolicy, RequestDispatcher, RetryPolicy, TransportOptions, WireFormat,
};

/// Dispatcher settings, usually read from `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub base_url: String,
    pub num_auto_retries: u32,
    pub auto_retry_sleep_secs: u64,
    pub rate_limit_statuses: Vec<u16>,
    pub rate_limit_sleep_secs: u64,
    pub refresh_statuses: Vec<u16>,
    pub non_retryable_statuses: Vec<u16>,
    pub wire_format: WireFormat,
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub user_agent: String,
    /// `Name: value` lines sent with every request
    pub global_headers: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.twitch.tv".to_string(),
            num_auto_retries: DEFAULT_NUM_AUTO_RETRIES,
            auto_retry_sleep_secs: DEFAULT_AUTO_RETRY_SLEEP_SECS,
            rate_limit_statuses: vec![429],
            rate_limit_sleep_secs: DEFAULT_RATE_LIMIT_SLEEP_SECS,
            refresh_statuses: vec![401],
            non_retryable_statuses: Vec::new(),
            wire_format: WireFormat::Json,
            timeout_seconds: 60,
            connect_timeout_seconds: 60,
            user_agent: String::new(),
            global_headers: Vec::new(),
        }
    }
}

impl DispatcherConfig {
    /// Default location: `<config dir>/request-dispatcher/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("request-dispatcher").join("config.json"))
    }

    /// Reads a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading dispatcher config from {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Loads `path` if given, else the default path if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            num_auto_retries: self.num_auto_retries,
            auto_retry_sleep: Duration::from_secs(self.auto_retry_sleep_secs),
            non_retryable_statuses: self.non_retryable_statuses.clone(),
        }
    }

    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            statuses: self.rate_limit_statuses.clone(),
            sleep: Duration::from_secs(self.rate_limit_sleep_secs),
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            timeout: Duration::from_secs(self.timeout_seconds),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            user_agent: self.user_agent.clone(),
            header_parser: None,
        }
    }
}

impl RequestDispatcher {
    /// Builds a reqwest-backed dispatcher from `config`. No refresher is set.
    pub fn from_config(config: &DispatcherConfig) -> Result<Self> {
        let mut dispatcher = RequestDispatcher::new(&config.base_url)?;
        dispatcher.set_transport_options(config.transport_options())?;
        dispatcher.set_retry_policy(config.retry_policy());
        dispatcher.set_rate_limit_policy(config.rate_limit_policy());
        dispatcher.set_refresh_policy(RefreshPolicy::new(config.refresh_statuses.clone()));
        dispatcher.set_wire_format(config.wire_format);

        let headers: Vec<&str> = config.global_headers.iter().map(String::as_str).collect();
        dispatcher.set_global_headers(&headers)?;

        Ok(dispatcher)
    }
}
