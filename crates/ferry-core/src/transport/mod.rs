//! Resilient request transport for the source and target platform APIs.
//!
//! # Architecture
//!
//! ```text
//! TransportClient::send(method, endpoint, body, side)
//!     |
//!     +-- prepare: base URL, api-version (target), side auth, redaction
//!     |
//!     +-- attempt loop (RetryPolicy, synchronous backoff)
//!     |       |
//!     |       +-- primary Transport (HttpTransport, reqwest)
//!     |       |
//!     |       +-- fallback Transport (CurlTransport), TLS failures
//!     |           against an internally hosted target only
//!     |
//!     +-- Response | NormalizedError (+ optional diagnostic record)
//! ```
//!
//! A [`Transport`] performs exactly one attempt and reports either the raw
//! answer or a connection-level [`TransportFailure`]. Retry, classification
//! and normalization live in [`TransportClient`] so that both transports
//! share identical semantics.

mod client;
mod curl;
mod diagnostics;
mod error;
mod http;
mod retry;


use std::fmt;

use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use client::{API_VERSION_CANDIDATES, TransportClient};
pub use curl::{CurlTransport, STATUS_MARKER, parse_raw_response};
pub use diagnostics::{DiagnosticRecord, DiagnosticsWriter};
pub use error::{FailureKind, NormalizedError, extract_message};
pub use http::HttpTransport;
pub use retry::{
    MAX_BACKOFF, MAX_JITTER_FRACTION, RETRYABLE_STATUSES, RetryPolicy, classify_message,
    is_retryable_status, is_tls_failure, is_transient_failure,
};

/// Percent-encodes a path segment or query value. Unreserved characters
/// (`A-Z a-z 0-9 - . _ ~`) are kept, everything else including `/` is
/// escaped.
#[must_use]
pub fn encode_component(value: &str) -> String {
    use fmt::Write;

    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}

/// Which platform a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The platform repositories are migrated from.
    Source,
    /// The platform repositories are migrated into.
    Target,
}

impl Side {
    /// Returns the lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Target => "target",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// `GET`
    Get,
    /// `HEAD`
    Head,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl Method {
    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a request authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthContext {
    /// Token header (`PRIVATE-TOKEN`), used for the source platform.
    TokenHeader,
    /// Basic-auth style `Authorization` header, used for the target platform.
    Basic,
    /// No credentials.
    Anonymous,
}

impl AuthContext {
    /// The default authentication for a side.
    #[must_use]
    pub const fn for_side(side: Side) -> Self {
        match side {
            Side::Source => Self::TokenHeader,
            Side::Target => Self::Basic,
        }
    }
}

/// One logical request, before URL resolution and authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the side's base URL, or an absolute URL.
    pub endpoint: String,
    /// JSON body.
    pub body: Option<Value>,
    /// Which platform the request is addressed to.
    pub side: Side,
    /// How the request authenticates.
    pub auth: AuthContext,
    /// Content type of the body.
    pub content_type: &'static str,
}

impl RequestDescriptor {
    /// Creates a descriptor with the side's default authentication.
    #[must_use]
    pub fn new(method: Method, endpoint: impl Into<String>, side: Side) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body: None,
            side,
            auth: AuthContext::for_side(side),
            content_type: "application/json",
        }
    }

    /// Sets the JSON body.
    #[must_use]
    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    /// Sets the content type, e.g. `application/json-patch+json`.
    #[must_use]
    pub const fn with_content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = content_type;
        self
    }
}

/// A fully resolved request handed to a [`Transport`].
///
/// `url` may carry credentials; only `redacted_url` is ever logged.
#[derive(Debug)]
pub struct PreparedRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL sent on the wire.
    pub url: String,
    /// Redacted copy of `url`.
    pub redacted_url: String,
    /// Non-secret headers.
    pub headers: Vec<(String, String)>,
    /// Authentication header, if any.
    pub auth_header: Option<(&'static str, SecretString)>,
    /// Serialized body.
    pub body: Option<String>,
    /// Content type of the body.
    pub content_type: &'static str,
}

/// The raw answer of a single attempt, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl RawResponse {
    /// Creates a raw response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// A connection-level failure of a single attempt (no HTTP status).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    /// Classification.
    pub kind: FailureKind,
    /// Error text, including the source chain.
    pub message: String,
}

impl TransportFailure {
    /// Creates a failure.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Performs one attempt of a prepared request.
///
/// Implementations must not retry; [`TransportClient`] owns retry.
pub trait Transport: Send + Sync {
    /// Returns the transport name for logging.
    fn name(&self) -> &'static str;

    /// Executes the request once.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportFailure`] when no HTTP answer was received. Any
    /// received answer, including non-2xx, is `Ok`.
    fn execute(&self, request: &PreparedRequest) -> Result<RawResponse, TransportFailure>;
}

/// A successful (2xx) answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status.
    pub status: u16,
    /// Response body.
    pub body: String,
    /// Side the answer came from.
    pub side: Side,
    /// Method of the request.
    pub method: Method,
    /// Redacted endpoint of the request.
    pub endpoint: String,
}

impl Response {
    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns a [`FailureKind::Decode`] error if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, NormalizedError> {
        serde_json::from_str(&self.body).map_err(|e| {
            NormalizedError::decode(
                self.side,
                self.method,
                self.endpoint.clone(),
                self.status,
                e.to_string(),
            )
        })
    }

    /// Decodes the body as a JSON value; an empty body is `null`.
    ///
    /// # Errors
    ///
    /// Returns a [`FailureKind::Decode`] error if the body is not JSON.
    pub fn json_value(&self) -> Result<Value, NormalizedError> {
        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        self.json()
    }
}
