//! Network transfer behind a trait, with a reqwest-backed implementation.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::call::EndpointCall;

/// Maps a received `(name, value)` header pair to the stored pair, or drops it.
pub type HeaderParser = Arc<dyn Fn(&str, &str) -> Option<(String, String)> + Send + Sync>;

/// Response as received, before any classification.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Failures that happen before a status code is received.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    Timeout(String),
    Connect(String),
    Request(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout(msg) => write!(f, "timed out: {}", msg),
            TransportError::Connect(msg) => write!(f, "connection failed: {}", msg),
            TransportError::Request(msg) => write!(f, "request failed: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        let msg = error.to_string();
        if error.is_timeout() {
            TransportError::Timeout(msg)
        } else if error.is_connect() {
            TransportError::Connect(msg)
        } else {
            TransportError::Request(msg)
        }
    }
}

/// Options applied when the transport handle is (re)built.
#[derive(Clone)]
pub struct TransportOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub header_parser: Option<HeaderParser>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(60),
            user_agent: String::new(),
            header_parser: None,
        }
    }
}

impl TransportOptions {
    /// Sets an option by name: `timeout_seconds`, `connect_timeout_seconds` or `user_agent`.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "timeout_seconds" => {
                self.timeout = Duration::from_secs(parse_seconds(name, value)?);
            }
            "connect_timeout_seconds" => {
                self.connect_timeout = Duration::from_secs(parse_seconds(name, value)?);
            }
            "user_agent" => self.user_agent = value.to_string(),
            "header_parser" => bail!("header_parser must be set with set_header_parser"),
            _ => bail!("Unknown transport option: {}", name),
        }
        Ok(())
    }

    /// Installs a callback applied to every response header.
    pub fn set_header_parser(&mut self, parser: HeaderParser) {
        self.header_parser = Some(parser);
    }

    /// Applies the header parser (if any) and lower-cases the resulting name.
    pub fn parse_header(&self, name: &str, value: &str) -> Option<(String, String)> {
        let (name, value) = match &self.header_parser {
            Some(parser) => parser(name, value)?,
            None => (name.to_string(), value.to_string()),
        };
        Some((name.to_ascii_lowercase(), value))
    }
}

fn parse_seconds(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", name, value))
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("user_agent", &self.user_agent)
            .field("header_parser", &self.header_parser.is_some())
            .finish()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one transfer. Any received status, including non-2xx, is `Ok`.
    async fn execute(&self, call: &EndpointCall) -> Result<RawResponse, TransportError>;

    /// Releases the current handle and acquires a new one with `options`.
    fn reconfigure(&mut self, options: &TransportOptions) -> Result<()>;
}

/// Transport backed by a `reqwest::Client`.
pub struct ReqwestTransport {
    client: Client,
    options: TransportOptions,
}

impl ReqwestTransport {
    pub fn new(options: &TransportOptions) -> Result<Self> {
        Ok(Self {
            client: build_client(options)?,
            options: options.clone(),
        })
    }
}

fn build_client(options: &TransportOptions) -> Result<Client> {
    Client::builder()
        .timeout(options.timeout)
        .connect_timeout(options.connect_timeout)
        .user_agent(options.user_agent.clone())
        .build()
        .context("Failed to build HTTP client")
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[tracing::instrument(skip(self, call), fields(method = %call.method, url = %call.url))]
    async fn execute(&self, call: &EndpointCall) -> Result<RawResponse, TransportError> {
        let mut request = self.client.request(call.method.into(), &call.url);
        for (name, value) in &call.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &call.body {
            request = request.body(body.clone());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let value = String::from_utf8_lossy(value.as_bytes());
                self.options.parse_header(name.as_str(), &value)
            })
            .collect();

        let body = response.text().await?;
        debug!("{} {} -> {} ({} bytes)", call.method, call.url, status, body.len());

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    fn reconfigure(&mut self, options: &TransportOptions) -> Result<()> {
        self.client = build_client(options)?;
        self.options = options.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::call::Method;

    fn call(method: Method, url: String) -> EndpointCall {
        EndpointCall {
            method,
            url,
            headers: vec![],
            body: None,
        }
    }

    #[test]
    fn test_options_set_known_names() {
        let mut options = TransportOptions::default();
        options.set("timeout_seconds", "5").unwrap();
        options.set("connect_timeout_seconds", " 7 ").unwrap();
        options.set("user_agent", "translate-bot/1.0").unwrap();

        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.connect_timeout, Duration::from_secs(7));
        assert_eq!(options.user_agent, "translate-bot/1.0");
    }

    #[test]
    fn test_options_set_rejects_bad_input() {
        let mut options = TransportOptions::default();
        assert!(options.set("timeout_seconds", "soon").is_err());
        assert!(options.set("follow_redirects", "1").is_err());
        assert!(options.set("header_parser", "x").is_err());
    }

    #[test]
    fn test_parse_header_lowercases() {
        let options = TransportOptions::default();
        assert_eq!(
            options.parse_header("Content-Type", "text/plain"),
            Some(("content-type".to_string(), "text/plain".to_string()))
        );
    }

    #[test]
    fn test_custom_header_parser() {
        let mut options = TransportOptions::default();
        options.set_header_parser(Arc::new(|name: &str, value: &str| {
            if name.eq_ignore_ascii_case("set-cookie") {
                None
            } else {
                Some((name.to_string(), value.to_uppercase()))
            }
        }));

        assert_eq!(options.parse_header("Set-Cookie", "a=b"), None);
        assert_eq!(
            options.parse_header("Ratelimit-Remaining", "ok"),
            Some(("ratelimit-remaining".to_string(), "OK".to_string()))
        );
    }

    #[tokio::test]
    async fn test_execute_captures_status_headers_and_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/items")
            .match_header("client-id", "abc")
            .match_body("payload")
            .with_status(201)
            .with_header("X-Request-Id", "r-1")
            .with_body("created")
            .create_async()
            .await;

        let transport = ReqwestTransport::new(&TransportOptions::default()).unwrap();
        let mut request = call(Method::Post, format!("{}/items", server.url()));
        request.headers.push(("Client-Id".to_string(), "abc".to_string()));
        request.body = Some("payload".to_string());

        let response = transport.execute(&request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 201);
        assert_eq!(response.body, "created");
        assert!(
            response
                .headers
                .contains(&("x-request-id".to_string(), "r-1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_execute_returns_error_statuses_as_responses() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/")
            .with_status(503)
            .with_body("down")
            .create_async()
            .await;

        let transport = ReqwestTransport::new(&TransportOptions::default()).unwrap();
        let response = transport
            .execute(&call(Method::Get, server.url()))
            .await
            .unwrap();

        assert_eq!(response.status, 503);
        assert_eq!(response.body, "down");
    }

    #[tokio::test]
    async fn test_execute_connection_failure() {
        let transport = ReqwestTransport::new(&TransportOptions::default()).unwrap();
        // Port 9 (discard) on localhost is not expected to accept HTTP connections
        let result = transport
            .execute(&call(Method::Get, "http://127.0.0.1:9/".to_string()))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reconfigure_applies_user_agent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("user-agent", "translate-bot")
            .with_status(200)
            .create_async()
            .await;

        let mut transport = ReqwestTransport::new(&TransportOptions::default()).unwrap();
        let mut options = TransportOptions::default();
        options.set("user_agent", "translate-bot").unwrap();
        transport.reconfigure(&options).unwrap();

        let response = transport
            .execute(&call(Method::Get, server.url()))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 200);
    }
}
