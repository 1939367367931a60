//! HTTP request layer with retry, rate-limit back-off and credential refresh.

mod call;
mod dispatcher;
mod policy;
mod retry;
mod sleep;
mod transport;

pub use call::{
    CallResult, EndpointCall, Method, RequestBody, WireFormat, merge_headers, parse_header_line,
};
pub use dispatcher::{CallOverrides, RequestDispatcher};
pub use policy::{
    Credential, CredentialRefresher, DEFAULT_AUTO_RETRY_SLEEP_SECS, DEFAULT_NUM_AUTO_RETRIES,
    DEFAULT_RATE_LIMIT_SLEEP_SECS, RateLimitPolicy, RefreshPolicy, RetryPolicy,
};
pub use retry::{CallError, FailureKind, classify_response};
pub use sleep::{Sleeper, TokioSleeper};
pub use transport::{
    HeaderParser, RawResponse, ReqwestTransport, Transport, TransportError, TransportOptions,
};
