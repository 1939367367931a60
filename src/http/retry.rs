//! Failure taxonomy for dispatched calls and classification of responses.

use super::policy::{RateLimitPolicy, RefreshPolicy, RetryPolicy};
use super::transport::{RawResponse, TransportError};

/// What went wrong on an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection, DNS, TLS or timeout failure before a status was received
    Transport,
    /// Non-2xx status not covered by a more specific policy
    Http,
    /// Status listed in the rate-limit policy
    RateLimited,
    /// Status listed in the refresh policy, or an explicit invalid-token signal
    AuthExpired,
    /// The request could not be built (bad URL, header or body)
    InvalidRequest,
}

/// A failed call, carrying everything the caller needs to decide what to do next.
#[derive(Debug, Clone)]
pub struct CallError {
    kind: FailureKind,
    status: Option<u16>,
    body: Option<String>,
    message: String,
    retryable: bool,
    auth_expired: bool,
    attempts: u32,
}

impl CallError {
    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::InvalidRequest,
            status: None,
            body: None,
            message: message.into(),
            retryable: false,
            auth_expired: false,
            attempts: 0,
        }
    }

    pub(crate) fn transport(error: TransportError) -> Self {
        Self {
            kind: FailureKind::Transport,
            status: None,
            body: None,
            message: error.to_string(),
            retryable: true,
            auth_expired: false,
            attempts: 0,
        }
    }

    fn http(kind: FailureKind, response: &RawResponse, retryable: bool) -> Self {
        Self {
            kind,
            status: Some(response.status),
            body: Some(response.body.clone()),
            message: String::new(),
            retryable,
            auth_expired: false,
            attempts: 0,
        }
    }

    /// Category of the failure.
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// HTTP status of the failed attempt, if a response was received.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Raw response body of the failed attempt, if a response was received.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Whether another attempt could succeed.
    pub fn retryable(&self) -> bool {
        self.retryable
    }

    /// True when the server explicitly reported the credential as invalid.
    pub fn auth_expired(&self) -> bool {
        self.auth_expired
    }

    /// Number of attempts made before this error was returned.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A retryable failure that was returned anyway: the retry budget ran out.
    pub fn is_exhausted(&self) -> bool {
        self.retryable && self.attempts > 0
    }

    pub(crate) fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status.map(|s| s.to_string()).unwrap_or_default();
        match self.kind {
            FailureKind::Transport => write!(f, "Transport error: {}", self.message)?,
            FailureKind::Http => write!(f, "HTTP {} error", status)?,
            FailureKind::RateLimited => write!(f, "Rate limit exceeded (HTTP {})", status)?,
            FailureKind::AuthExpired => {
                write!(f, "Authentication expired (HTTP {})", status)?
            }
            FailureKind::InvalidRequest => write!(f, "Invalid request: {}", self.message)?,
        }
        if self.is_exhausted() {
            write!(f, " after {} attempts", self.attempts)?;
        }
        Ok(())
    }
}

impl std::error::Error for CallError {}

impl From<TransportError> for CallError {
    fn from(error: TransportError) -> Self {
        CallError::transport(error)
    }
}

/// Returns true if a `WWW-Authenticate` header reports an invalid or expired token.
fn signals_invalid_token(response: &RawResponse) -> bool {
    response
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("www-authenticate"))
        .any(|(_, value)| value.to_ascii_lowercase().contains("invalid_token"))
}

/// Classifies a response. Returns `None` for 2xx, otherwise the failure with its
/// retryable flag set according to the policies.
pub fn classify_response(
    response: &RawResponse,
    retry: &RetryPolicy,
    rate_limit: &RateLimitPolicy,
    refresh: &RefreshPolicy,
) -> Option<CallError> {
    if (200..300).contains(&response.status) {
        return None;
    }

    let auth_expired = signals_invalid_token(response);

    let mut error = if rate_limit.matches(response.status) {
        CallError::http(FailureKind::RateLimited, response, true)
    } else if auth_expired || refresh.matches(response.status) {
        CallError::http(FailureKind::AuthExpired, response, true)
    } else {
        let retryable = !retry.non_retryable_statuses.contains(&response.status);
        CallError::http(FailureKind::Http, response, retryable)
    };
    error.auth_expired = auth_expired;

    Some(error)
}
