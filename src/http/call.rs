//! Request and response values for a single dispatch attempt.

use reqwest::header::HeaderName;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

use super::retry::CallError;

/// HTTP verb of a dispatched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Encoding used for structured request bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Form,
}

impl WireFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::Form => "application/x-www-form-urlencoded",
        }
    }
}

/// Body of a non-GET call.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Sent verbatim.
    Text(String),
    /// Serialized with the dispatcher's [`WireFormat`].
    Structured(serde_json::Value),
}

impl RequestBody {
    /// Encodes the body, returning the payload and the content type it implies.
    pub fn encode(
        &self,
        format: WireFormat,
    ) -> Result<Option<(String, Option<&'static str>)>, CallError> {
        match self {
            RequestBody::Empty => Ok(None),
            RequestBody::Text(text) => Ok(Some((text.clone(), None))),
            RequestBody::Structured(value) => {
                let payload = match format {
                    WireFormat::Json => serde_json::to_string(value).map_err(|e| {
                        CallError::invalid_request(format!("failed to serialize JSON body: {}", e))
                    })?,
                    WireFormat::Form => encode_form(value)?,
                };
                Ok(Some((payload, Some(format.content_type()))))
            }
        }
    }
}

impl From<serde_json::Value> for RequestBody {
    fn from(value: serde_json::Value) -> Self {
        RequestBody::Structured(value)
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::Text(text)
    }
}

impl From<&str> for RequestBody {
    fn from(text: &str) -> Self {
        RequestBody::Text(text.to_string())
    }
}

fn encode_form(value: &serde_json::Value) -> Result<String, CallError> {
    let serde_json::Value::Object(fields) = value else {
        return Err(CallError::invalid_request(
            "form bodies must be a JSON object of fields",
        ));
    };

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in fields {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        serializer.append_pair(key, &value);
    }
    Ok(serializer.finish())
}

/// Splits a `Name: value` header line. Returns `None` for lines without a name.
pub fn parse_header_line(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// Merges header layers in order. A later header replaces an earlier one with
/// the same (case-insensitive) name, keeping the earlier position.
pub fn merge_headers<'a, I>(layers: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = &'a (String, String)>,
{
    let mut merged: Vec<(String, String)> = Vec::new();
    for (name, value) in layers {
        match merged.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(existing) => *existing = (name.clone(), value.clone()),
            None => merged.push((name.clone(), value.clone())),
        }
    }
    merged
}

/// One fully-built attempt: what goes on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointCall {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl EndpointCall {
    /// Joins `base_url` and `endpoint`, then appends `query` as a query string.
    pub fn build_url(
        base_url: &str,
        endpoint: &str,
        query: &[(String, String)],
    ) -> Result<String, CallError> {
        let joined = format!("{}{}", base_url.trim(), endpoint);
        let mut url = Url::parse(&joined)
            .map_err(|e| CallError::invalid_request(format!("invalid URL {}: {}", joined, e)))?;

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        Ok(url.into())
    }

    /// Builds an attempt. `headers` must already be merged; a content type is
    /// added for structured bodies unless one is present.
    pub fn new(
        method: Method,
        url: String,
        mut headers: Vec<(String, String)>,
        body: &RequestBody,
        format: WireFormat,
    ) -> Result<Self, CallError> {
        for (name, _) in &headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                CallError::invalid_request(format!("invalid header name: {}", name))
            })?;
        }

        let body = match body.encode(format)? {
            Some((payload, content_type)) => {
                let has_content_type = headers
                    .iter()
                    .any(|(n, _)| n.eq_ignore_ascii_case("content-type"));
                if let (Some(content_type), false) = (content_type, has_content_type) {
                    headers.push(("Content-Type".to_string(), content_type.to_string()));
                }
                Some(payload)
            }
            None => None,
        };

        Ok(Self {
            method,
            url,
            headers,
            body,
        })
    }

    /// Text form of the request as sent: request line, headers, blank line, body.
    pub fn raw_request(&self) -> String {
        let mut raw = format!("{} {}\r\n", self.method, self.url);
        for (name, value) in &self.headers {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
        raw.push_str("\r\n");
        if let Some(body) = &self.body {
            raw.push_str(body);
        }
        raw
    }
}

/// Outcome of the most recent attempt.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallResult {
    pub method: Option<Method>,
    pub status: Option<u16>,
    pub raw_request: Option<String>,
    pub request_headers: Vec<(String, String)>,
    pub raw_response: Option<String>,
    /// Keys are always lowercase.
    pub response_headers: BTreeMap<String, String>,
}

impl CallResult {
    pub(crate) fn started(method: Method) -> Self {
        Self {
            method: Some(method),
            ..Default::default()
        }
    }

    /// Case-insensitive response header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        if name.is_empty() {
            return None;
        }
        self.response_headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parses the raw response body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let body = self.raw_response.as_deref().unwrap_or_default();
        serde_json::from_str(body).map_err(|e| {
            anyhow::anyhow!(
                "Failed to parse JSON response (HTTP {}): {}",
                self.status.map(|s| s.to_string()).unwrap_or_default(),
                e
            )
        })
    }
}
