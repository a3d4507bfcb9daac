//! The single error shape that leaves the transport layer.
//!
//! The two platforms disagree on how they describe failures: the source
//! answers with `{"message": ...}` (string, list or map) or an OAuth-style
//! `{"error", "error_description"}` pair, while the target answers with
//! `{"message", "typeKey"}`. Connection-level failures from either transport
//! have no body at all. All of them collapse into [`NormalizedError`] here;
//! nothing above this module inspects raw transport errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{Method, Side};

/// Longest raw-body excerpt used as a fallback message.
const MAX_FALLBACK_MESSAGE_LEN: usize = 200;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The server answered with a non-2xx status.
    Http,
    /// The attempt timed out.
    Timeout,
    /// TLS or certificate handshake failure.
    Tls,
    /// Any other connection-level failure (reset, refused, read error).
    Connection,
    /// A 2xx answer whose body could not be decoded.
    Decode,
}

impl FailureKind {
    /// Returns the snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Timeout => "timeout",
            Self::Tls => "tls",
            Self::Connection => "connection",
            Self::Decode => "decode",
        }
    }

    /// Whether this failure happened below HTTP (no status available).
    #[must_use]
    pub const fn is_connection_level(self) -> bool {
        matches!(self, Self::Timeout | Self::Tls | Self::Connection)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed request, normalized across sides and transports.
///
/// `status` is 0 for connection-level failures. `endpoint`, `message` and
/// `raw_body` are already redacted.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{side} {method} {endpoint} failed ({kind}, status {status}): {message}")]
pub struct NormalizedError {
    /// Which platform the request was sent to.
    pub side: Side,
    /// HTTP method.
    pub method: Method,
    /// Failure classification.
    pub kind: FailureKind,
    /// HTTP status, or 0 for connection-level failures.
    pub status: u16,
    /// Human-readable message extracted from the platform's error vocabulary.
    pub message: String,
    /// Redacted endpoint.
    pub endpoint: String,
    /// Redacted response body, when one was received.
    pub raw_body: Option<String>,
    /// Attempts spent before giving up.
    pub attempts: u32,
}

impl NormalizedError {
    /// Builds an error from a non-2xx answer.
    #[must_use]
    pub fn from_status(
        side: Side,
        method: Method,
        endpoint: impl Into<String>,
        status: u16,
        body: &str,
    ) -> Self {
        Self {
            side,
            method,
            kind: FailureKind::Http,
            status,
            message: extract_message(side, body).unwrap_or_else(|| fallback_message(status, body)),
            endpoint: endpoint.into(),
            raw_body: (!body.trim().is_empty()).then(|| body.to_string()),
            attempts: 1,
        }
    }

    /// Builds an error for a failure below HTTP.
    #[must_use]
    pub fn connection(
        side: Side,
        method: Method,
        endpoint: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            side,
            method,
            kind,
            status: 0,
            message: message.into(),
            endpoint: endpoint.into(),
            raw_body: None,
            attempts: 1,
        }
    }

    /// Builds an error for a 2xx body that did not decode.
    #[must_use]
    pub fn decode(
        side: Side,
        method: Method,
        endpoint: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Self {
            side,
            method,
            kind: FailureKind::Decode,
            status,
            message: message.into(),
            endpoint: endpoint.into(),
            raw_body: None,
            attempts: 1,
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// The resource does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, FailureKind::Http) && self.status == 404
    }

    /// The resource already exists or the write conflicted.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self.kind, FailureKind::Http) && self.status == 409
    }
}

/// Extracts a message from a platform error body.
///
/// Returns `None` when the body is not JSON or carries no recognizable
/// message field.
#[must_use]
pub fn extract_message(side: Side, body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let object = value.as_object()?;
    match side {
        Side::Source => {
            if let Some(message) = object.get("message").and_then(flatten_message) {
                return Some(message);
            }
            let error = object.get("error").and_then(Value::as_str)?;
            match object.get("error_description").and_then(Value::as_str) {
                Some(description) => Some(format!("{error}: {description}")),
                None => Some(error.to_string()),
            }
        },
        Side::Target => {
            let message = object
                .get("message")
                .or_else(|| object.get("Message"))
                .and_then(Value::as_str)?;
            match object.get("typeKey").and_then(Value::as_str) {
                Some(type_key) => Some(format!("{message} ({type_key})")),
                None => Some(message.to_string()),
            }
        },
    }
}

/// Flattens the source platform's message shapes: a string, a list of
/// strings, or a map of field name to list of complaints.
fn flatten_message(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(flatten_message).collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        },
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .filter_map(|(field, v)| flatten_message(v).map(|m| format!("{field}: {m}")))
                .collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        },
        _ => None,
    }
}

fn fallback_message(status: u16, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .map_or_else(|| format!("HTTP {status}"), str::to_string);
    }
    let mut excerpt: String = trimmed.chars().take(MAX_FALLBACK_MESSAGE_LEN).collect();
    if excerpt.len() < trimmed.len() {
        excerpt.push_str("...");
    }
    excerpt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_string_message() {
        let message = extract_message(Side::Source, r#"{"message":"404 Project Not Found"}"#);
        assert_eq!(message.as_deref(), Some("404 Project Not Found"));
    }

    #[test]
    fn source_map_message() {
        let body = r#"{"message":{"name":["has already been taken"],"path":["is reserved"]}}"#;
        let message = extract_message(Side::Source, body).unwrap();
        assert_eq!(message, "name: has already been taken; path: is reserved");
    }

    #[test]
    fn source_oauth_error() {
        let body = r#"{"error":"invalid_token","error_description":"Token was revoked"}"#;
        let message = extract_message(Side::Source, body);
        assert_eq!(message.as_deref(), Some("invalid_token: Token was revoked"));
    }

    #[test]
    fn target_message_with_type_key() {
        let body = r#"{"$id":"1","message":"TF401019: repository does not exist","typeKey":"GitRepositoryNotFoundException","errorCode":0}"#;
        let message = extract_message(Side::Target, body);
        assert_eq!(
            message.as_deref(),
            Some("TF401019: repository does not exist (GitRepositoryNotFoundException)")
        );
    }

    #[test]
    fn non_json_body_falls_back_to_excerpt() {
        let err = NormalizedError::from_status(
            Side::Target,
            Method::Get,
            "/x",
            502,
            "<html>Bad Gateway</html>",
        );
        assert_eq!(err.message, "<html>Bad Gateway</html>");
        assert_eq!(err.kind, FailureKind::Http);
        assert_eq!(err.raw_body.as_deref(), Some("<html>Bad Gateway</html>"));
    }

    #[test]
    fn empty_body_uses_reason_phrase() {
        let err = NormalizedError::from_status(Side::Source, Method::Get, "/x", 503, "");
        assert_eq!(err.message, "Service Unavailable");
        assert!(err.raw_body.is_none());
    }

    #[test]
    fn long_body_is_truncated() {
        let body = "x".repeat(500);
        let err = NormalizedError::from_status(Side::Source, Method::Get, "/x", 500, &body);
        assert_eq!(err.message.len(), MAX_FALLBACK_MESSAGE_LEN + 3);
    }

    #[test]
    fn connection_errors_have_status_zero() {
        let err = NormalizedError::connection(
            Side::Target,
            Method::Post,
            "/x",
            FailureKind::Tls,
            "invalid peer certificate: UnknownIssuer",
        );
        assert_eq!(err.status, 0);
        assert!(err.kind.is_connection_level());
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("target POST /x failed (tls, status 0)"));
    }

    #[test]
    fn not_found_and_conflict() {
        let nf = NormalizedError::from_status(Side::Target, Method::Get, "/x", 404, "");
        let cf = NormalizedError::from_status(Side::Target, Method::Put, "/x", 409, "");
        assert!(nf.is_not_found() && !nf.is_conflict());
        assert!(cf.is_conflict() && !cf.is_not_found());
    }
}
