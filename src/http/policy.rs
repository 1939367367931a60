//! Retry, rate-limit and credential refresh policies.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::retry::CallError;

/// Default number of retries after the first attempt.
pub const DEFAULT_NUM_AUTO_RETRIES: u32 = 3;

/// Default delay between retry attempts in seconds.
pub const DEFAULT_AUTO_RETRY_SLEEP_SECS: u64 = 1;

/// Default back-off after a rate-limit response in seconds.
pub const DEFAULT_RATE_LIMIT_SLEEP_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a call makes at most `num_auto_retries + 1` attempts.
    pub num_auto_retries: u32,
    pub auto_retry_sleep: Duration,
    /// Statuses the caller does not want retried.
    pub non_retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            num_auto_retries: DEFAULT_NUM_AUTO_RETRIES,
            auto_retry_sleep: Duration::from_secs(DEFAULT_AUTO_RETRY_SLEEP_SECS),
            non_retryable_statuses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    pub statuses: Vec<u16>,
    pub sleep: Duration,
}

impl RateLimitPolicy {
    pub fn matches(&self, status: u16) -> bool {
        self.statuses.contains(&status)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            statuses: vec![429],
            sleep: Duration::from_secs(DEFAULT_RATE_LIMIT_SLEEP_SECS),
        }
    }
}

/// An opaque access token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(****)")
    }
}

/// Obtains a fresh credential when the current one has expired.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Returns a new credential, or `None` if nothing changed.
    async fn refresh(&self) -> Result<Option<Credential>>;

    /// Header line carrying the credential on later requests.
    fn build_header(&self, credential: &Credential) -> String {
        format!("Authorization: Bearer {}", credential.secret())
    }
}

/// When to refresh, and who does it. Without a refresher, refresh is disabled.
#[derive(Clone, Default)]
pub struct RefreshPolicy {
    pub statuses: Vec<u16>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl RefreshPolicy {
    /// Refreshes on `statuses` once a refresher is attached.
    pub fn new(statuses: Vec<u16>) -> Self {
        Self {
            statuses,
            refresher: None,
        }
    }

    /// Attaches the strategy that obtains new credentials.
    pub fn with_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn refresher(&self) -> Option<&Arc<dyn CredentialRefresher>> {
        self.refresher.as_ref()
    }

    pub fn matches(&self, status: u16) -> bool {
        self.statuses.contains(&status)
    }

    /// Whether `error` calls for a refresh under this policy.
    pub fn should_refresh(&self, error: &CallError) -> bool {
        self.refresher.is_some()
            && (error.auth_expired() || error.status().is_some_and(|s| self.matches(s)))
    }
}

impl fmt::Debug for RefreshPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshPolicy")
            .field("statuses", &self.statuses)
            .field("refresher", &self.refresher.is_some())
            .finish()
    }
}
