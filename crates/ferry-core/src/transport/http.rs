//! Primary transport backed by `reqwest`'s blocking client.

use std::error::Error as StdError;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderValue};
use secrecy::ExposeSecret;

use super::retry::classify_message;
use super::{FailureKind, Method, PreparedRequest, RawResponse, Transport, TransportFailure};
use crate::config::ConfigError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = concat!("ferry/", env!("CARGO_PKG_VERSION"));

/// Transport using the platform trust store.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Builds the transport with a per-attempt timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ConfigError::Validation(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn execute(&self, request: &PreparedRequest) -> Result<RawResponse, TransportFailure> {
        let mut builder = self
            .client
            .request(reqwest_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((name, secret)) = &request.auth_header {
            let mut value = HeaderValue::from_str(secret.expose_secret()).map_err(|_| {
                TransportFailure::new(
                    FailureKind::Connection,
                    "authentication header contains invalid characters",
                )
            })?;
            value.set_sensitive(true);
            builder = builder.header(*name, value);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, request.content_type)
                .body(body.clone());
        }

        let response = builder.send().map_err(failure_from_reqwest)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(failure_from_reqwest)?;
        Ok(RawResponse { status, body })
    }
}

fn failure_from_reqwest(error: reqwest::Error) -> TransportFailure {
    let timeout = error.is_timeout();
    let message = error_chain(&error.without_url());
    let kind = if timeout {
        FailureKind::Timeout
    } else {
        classify_message(&message)
    };
    TransportFailure::new(kind, message)
}

/// Renders an error and all of its sources, outermost first.
fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
