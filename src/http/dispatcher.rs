//! Request dispatcher: verb methods funnelled into one retry/refresh loop.

use anyhow::Result;
use log::{debug, warn};
use std::collections::BTreeMap;

use super::call::{
    CallResult, EndpointCall, Method, RequestBody, WireFormat, merge_headers, parse_header_line,
};
use super::policy::{RateLimitPolicy, RefreshPolicy, RetryPolicy};
use super::retry::{CallError, classify_response};
use super::sleep::{Sleeper, TokioSleeper};
use super::transport::{ReqwestTransport, Transport, TransportOptions};

/// Values that apply to the next call only and are cleared when it ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOverrides {
    pub base_url: Option<String>,
    pub oauth_header: Option<String>,
}

/// Executes HTTP calls against a base URL, retrying transient failures,
/// backing off on rate limits and refreshing credentials on auth expiry.
///
/// Calls take `&mut self`: one call occupies the dispatcher until it finishes,
/// and the last call's diagnostics stay readable afterwards.
pub struct RequestDispatcher {
    base_url: String,
    transport: Box<dyn Transport>,
    sleeper: Box<dyn Sleeper>,
    transport_options: TransportOptions,
    wire_format: WireFormat,
    retry: RetryPolicy,
    rate_limit: RateLimitPolicy,
    refresh: RefreshPolicy,
    global_query: Vec<(String, String)>,
    global_headers: Vec<(String, String)>,
    oauth_header: Option<String>,
    overrides: CallOverrides,
    last: CallResult,
    last_error: Option<CallError>,
}

impl RequestDispatcher {
    /// Creates a dispatcher with a reqwest transport and default options.
    pub fn new(base_url: &str) -> Result<Self> {
        let options = TransportOptions::default();
        let transport = ReqwestTransport::new(&options)?;
        let mut dispatcher =
            Self::with_transport(base_url, Box::new(transport), Box::new(TokioSleeper));
        dispatcher.transport_options = options;
        Ok(dispatcher)
    }

    /// Creates a dispatcher over an injected transport and sleeper.
    pub fn with_transport(
        base_url: &str,
        transport: Box<dyn Transport>,
        sleeper: Box<dyn Sleeper>,
    ) -> Self {
        Self {
            base_url: base_url.trim().to_string(),
            transport,
            sleeper,
            transport_options: TransportOptions::default(),
            wire_format: WireFormat::default(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
            refresh: RefreshPolicy::new(vec![401]),
            global_query: Vec::new(),
            global_headers: Vec::new(),
            oauth_header: None,
            overrides: CallOverrides::default(),
            last: CallResult::default(),
            last_error: None,
        }
    }

    /// Returns the current base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Changes the base URL used by later calls. Surrounding whitespace is trimmed.
    pub fn set_base_url(&mut self, base_url: &str) {
        self.base_url = base_url.trim().to_string();
    }

    /// Returns the options the transport was last configured with.
    pub fn transport_options(&self) -> &TransportOptions {
        &self.transport_options
    }

    /// Replaces the transport options and re-initializes the transport handle.
    pub fn set_transport_options(&mut self, options: TransportOptions) -> Result<()> {
        self.transport.reconfigure(&options)?;
        self.transport_options = options;
        Ok(())
    }

    /// Releases and re-acquires the transport handle with the current options.
    pub fn reinit_transport(&mut self) -> Result<()> {
        self.transport.reconfigure(&self.transport_options)
    }

    /// Sets how structured bodies are serialized.
    pub fn set_wire_format(&mut self, format: WireFormat) {
        self.wire_format = format;
    }

    /// Sets the retry count, retry back-off and non-retryable statuses.
    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry = policy;
    }

    /// Sets which statuses mean "over rate limit" and how long to back off.
    pub fn set_rate_limit_policy(&mut self, policy: RateLimitPolicy) {
        self.rate_limit = policy;
    }

    /// Sets which statuses trigger a credential refresh, and the refresher.
    pub fn set_refresh_policy(&mut self, policy: RefreshPolicy) {
        self.refresh = policy;
    }

    /// Query parameters sent with every call, before the call's own.
    pub fn set_global_query(&mut self, query: &[(&str, &str)]) {
        self.global_query = owned_pairs(query);
    }

    /// Header lines sent with every call. Lines without a `Name:` part are rejected.
    pub fn set_global_headers(&mut self, headers: &[&str]) -> Result<()> {
        self.global_headers = parse_header_lines(headers)
            .map_err(|line| anyhow::anyhow!("Invalid header line: {}", line))?;
        Ok(())
    }

    /// Header line carrying the current credential, e.g. `Authorization: Bearer ...`.
    pub fn set_oauth_header(&mut self, header: Option<String>) {
        self.oauth_header = header;
    }

    /// Returns the OAuth header line sent with calls, if any.
    pub fn oauth_header(&self) -> Option<&str> {
        self.oauth_header.as_deref()
    }

    /// Applies `overrides` to the next call only.
    pub fn override_next_call(&mut self, overrides: CallOverrides) {
        self.overrides = overrides;
    }

    /// Returns the HTTP status of the last attempt, if a response was received.
    pub fn last_http_code(&self) -> Option<u16> {
        self.last.status
    }

    /// Returns the unparsed response body of the last attempt.
    pub fn last_raw_response(&self) -> Option<&str> {
        self.last.raw_response.as_deref()
    }

    /// Returns the request of the last attempt as text.
    pub fn last_raw_request(&self) -> Option<&str> {
        self.last.raw_request.as_deref()
    }

    /// Returns the HTTP method of the last call.
    pub fn last_request_type(&self) -> Option<Method> {
        self.last.method
    }

    /// Response headers of the last attempt. Keys are lowercase.
    pub fn response_headers(&self) -> &BTreeMap<String, String> {
        &self.last.response_headers
    }

    /// Case-insensitive lookup of one response header of the last attempt.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.last.header(name)
    }

    /// Returns the headers sent on the last attempt.
    pub fn request_headers(&self) -> &[(String, String)] {
        &self.last.request_headers
    }

    /// Returns all diagnostics of the last attempt.
    pub fn last_call(&self) -> &CallResult {
        &self.last
    }

    /// Error of the last call, if it failed.
    pub fn last_error(&self) -> Option<&CallError> {
        self.last_error.as_ref()
    }

    /// Performs a GET call, retrying and refreshing as configured.
    #[tracing::instrument(skip(self, query, headers))]
    pub async fn get(
        &mut self,
        endpoint: &str,
        query: &[(&str, &str)],
        headers: &[&str],
    ) -> Result<CallResult, CallError> {
        self.dispatch(Method::Get, endpoint, query, &RequestBody::Empty, headers).await
    }

    /// Performs a POST call, retrying and refreshing as configured.
    #[tracing::instrument(skip(self, query, body, headers))]
    pub async fn post(
        &mut self,
        endpoint: &str,
        query: &[(&str, &str)],
        body: impl Into<RequestBody>,
        headers: &[&str],
    ) -> Result<CallResult, CallError> {
        let body = body.into();
        self.dispatch(Method::Post, endpoint, query, &body, headers).await
    }

    /// Performs a PUT call, retrying and refreshing as configured.
    #[tracing::instrument(skip(self, query, body, headers))]
    pub async fn put(
        &mut self,
        endpoint: &str,
        query: &[(&str, &str)],
        body: impl Into<RequestBody>,
        headers: &[&str],
    ) -> Result<CallResult, CallError> {
        let body = body.into();
        self.dispatch(Method::Put, endpoint, query, &body, headers).await
    }

    /// Performs a PATCH call, retrying and refreshing as configured.
    #[tracing::instrument(skip(self, query, body, headers))]
    pub async fn patch(
        &mut self,
        endpoint: &str,
        query: &[(&str, &str)],
        body: impl Into<RequestBody>,
        headers: &[&str],
    ) -> Result<CallResult, CallError> {
        let body = body.into();
        self.dispatch(Method::Patch, endpoint, query, &body, headers).await
    }

    /// Performs a DELETE call, retrying and refreshing as configured.
    #[tracing::instrument(skip(self, query, body, headers))]
    pub async fn delete(
        &mut self,
        endpoint: &str,
        query: &[(&str, &str)],
        body: impl Into<RequestBody>,
        headers: &[&str],
    ) -> Result<CallResult, CallError> {
        let body = body.into();
        self.dispatch(Method::Delete, endpoint, query, &body, headers).await
    }

    /// Same as the verb methods, with the method chosen at runtime.
    pub async fn request(
        &mut self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: impl Into<RequestBody>,
        headers: &[&str],
    ) -> Result<CallResult, CallError> {
        let body = match method {
            Method::Get => RequestBody::Empty,
            _ => body.into(),
        };
        self.dispatch(method, endpoint, query, &body, headers).await
    }

    async fn dispatch(
        &mut self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: &RequestBody,
        headers: &[&str],
    ) -> Result<CallResult, CallError> {
        let mut remaining = i64::from(self.retry.num_auto_retries);
        let mut attempts: u32 = 0;
        self.last_error = None;

        loop {
            self.last = CallResult::started(method);
            remaining -= 1;
            attempts += 1;

            let error = match self.attempt(method, endpoint, query, body, headers).await {
                Ok(result) => {
                    self.overrides = CallOverrides::default();
                    return Ok(result);
                }
                Err(e) => e.with_attempts(attempts),
            };

            // Always back off on a rate limit, even if no retry follows
            if error.status().is_some_and(|s| self.rate_limit.matches(s)) {
                warn!(
                    "Over rate limit. Sleeping {} seconds",
                    self.rate_limit.sleep.as_secs()
                );
                self.sleeper.sleep(self.rate_limit.sleep).await;
            }

            if self.refresh.should_refresh(&error) {
                self.refresh_credential().await;
            }

            if remaining < 0 || !error.retryable() {
                debug!(
                    "{} {}: giving up after {} attempt(s): {}",
                    method, endpoint, attempts, error
                );
                self.overrides = CallOverrides::default();
                self.last_error = Some(error.clone());
                return Err(error);
            }

            warn!(
                "{} {}: attempt {}/{} failed ({}), retrying in {}s...",
                method,
                endpoint,
                attempts,
                self.retry.num_auto_retries + 1,
                error,
                self.retry.auto_retry_sleep.as_secs()
            );
            self.sleeper.sleep(self.retry.auto_retry_sleep).await;
        }
    }

    /// One attempt. Records diagnostics on `self.last` as they become known.
    async fn attempt(
        &mut self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: &RequestBody,
        headers: &[&str],
    ) -> Result<CallResult, CallError> {
        let call = self.prepare(method, endpoint, query, body, headers)?;
        self.last.raw_request = Some(call.raw_request());
        self.last.request_headers = call.headers.clone();

        let response = self.transport.execute(&call).await?;

        self.last.status = Some(response.status);
        self.last.raw_response = Some(response.body.clone());
        self.last.response_headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();

        match classify_response(&response, &self.retry, &self.rate_limit, &self.refresh) {
            Some(error) => Err(error),
            None => Ok(self.last.clone()),
        }
    }

    fn prepare(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: &RequestBody,
        headers: &[&str],
    ) -> Result<EndpointCall, CallError> {
        let base_url = self.overrides.base_url.as_deref().unwrap_or(&self.base_url);

        let mut all_query = self.global_query.clone();
        all_query.extend(owned_pairs(query));
        let url = EndpointCall::build_url(base_url, endpoint, &all_query)?;

        let call_headers = parse_header_lines(headers).map_err(|line| {
            CallError::invalid_request(format!("invalid header line: {}", line))
        })?;

        let oauth = self
            .overrides
            .oauth_header
            .as_deref()
            .or(self.oauth_header.as_deref())
            .map(|line| {
                parse_header_line(line).ok_or_else(|| {
                    CallError::invalid_request(format!("invalid OAuth header: {}", line))
                })
            })
            .transpose()?;

        let merged = merge_headers(
            self.global_headers
                .iter()
                .chain(call_headers.iter())
                .chain(oauth.iter()),
        );

        EndpointCall::new(method, url, merged, body, self.wire_format)
    }

    /// Asks the refresher for a new credential and, if one is returned, stores
    /// the header it builds for later attempts.
    async fn refresh_credential(&mut self) {
        let Some(refresher) = self.refresh.refresher().cloned() else {
            return;
        };

        match refresher.refresh().await {
            Ok(Some(credential)) => {
                debug!("Credential refreshed, updating OAuth header");
                self.oauth_header = Some(refresher.build_header(&credential));
                // Takes precedence over a call-scoped header for the remaining attempts
                self.overrides.oauth_header = None;
            }
            Ok(None) => debug!("Credential refresh returned no new credential"),
            Err(e) => warn!("Credential refresh failed: {:#}", e),
        }
    }
}

fn owned_pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Parses header lines, returning the first invalid line on failure.
fn parse_header_lines(lines: &[&str]) -> std::result::Result<Vec<(String, String)>, String> {
    lines
        .iter()
        .map(|line| parse_header_line(line).ok_or_else(|| line.to_string()))
        .collect()
}
