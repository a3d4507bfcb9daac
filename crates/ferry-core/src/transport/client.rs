//! The transport client: authentication, retry, fallback and normalization.

use std::fmt;
use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use super::{
    AuthContext, CurlTransport, DiagnosticRecord, DiagnosticsWriter, FailureKind, HttpTransport,
    Method, NormalizedError, PreparedRequest, RawResponse, RequestDescriptor, Response,
    RetryPolicy, Side, Transport, TransportFailure, is_retryable_status, is_tls_failure,
    is_transient_failure,
};
use crate::config::{ConfigError, Credentials, FerryConfig};
use crate::log::SecretRedactor;

/// Target API versions probed, newest first.
pub const API_VERSION_CANDIDATES: [&str; 4] = ["7.1", "7.0", "6.0", "5.1"];

const SOURCE_TOKEN_HEADER: &str = "PRIVATE-TOKEN";
const AUTHORIZATION_HEADER: &str = "Authorization";

/// Issues requests against both platforms.
///
/// One client is created per session. It owns the side credentials, the
/// resolved target API version and the retry policy; callers only name a
/// method, an endpoint, a body and a side.
pub struct TransportClient {
    source_base: String,
    target_base: String,
    graph_base: String,
    source_token: SecretString,
    target_basic: SecretString,
    primary: Box<dyn Transport>,
    fallback: Option<Box<dyn Transport>>,
    policy: RetryPolicy,
    redactor: SecretRedactor,
    diagnostics: Option<DiagnosticsWriter>,
    api_version_override: Option<String>,
    api_version: OnceLock<String>,
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("source_base", &self.source_base)
            .field("target_base", &self.target_base)
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|t| t.name()))
            .field("policy", &self.policy)
            .field("api_version", &self.api_version.get())
            .finish_non_exhaustive()
    }
}

impl TransportClient {
    /// Builds the production client: reqwest as primary transport, curl as
    /// fallback when the target is internally hosted and the operator opted
    /// in.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(config: &FerryConfig, credentials: &Credentials) -> Result<Self, ConfigError> {
        let primary = HttpTransport::new(config.transport.timeout)?;
        let fallback = (config.target.allow_insecure_fallback && config.target.is_internal_host())
            .then(|| {
                Box::new(CurlTransport::new(true, config.transport.timeout)) as Box<dyn Transport>
            });
        Ok(Self::with_transports(
            config,
            credentials,
            Box::new(primary),
            fallback,
        ))
    }

    /// Builds a client around explicit transports.
    #[must_use]
    pub fn with_transports(
        config: &FerryConfig,
        credentials: &Credentials,
        primary: Box<dyn Transport>,
        fallback: Option<Box<dyn Transport>>,
    ) -> Self {
        let basic = STANDARD.encode(format!(
            "{}:{}",
            credentials.target_user,
            credentials.target_pat.expose_secret()
        ));
        let redactor = SecretRedactor::new()
            .with_literal(credentials.source_token.expose_secret())
            .with_literal(credentials.target_pat.expose_secret())
            .with_literal(&basic);

        Self {
            source_base: config.source.base_url.trim_end_matches('/').to_string(),
            target_base: config.target.base_url.trim_end_matches('/').to_string(),
            graph_base: graph_base_url(&config.target.base_url),
            source_token: copy_secret(&credentials.source_token),
            target_basic: SecretString::from(format!("Basic {basic}")),
            primary,
            fallback,
            policy: RetryPolicy::new(config.transport.max_attempts, config.transport.base_delay),
            redactor,
            diagnostics: config
                .transport
                .diagnostics_dir
                .as_ref()
                .map(DiagnosticsWriter::new),
            api_version_override: config.target.api_version.clone(),
            api_version: OnceLock::new(),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enables diagnostic records on final failure.
    #[must_use]
    pub fn with_diagnostics(mut self, writer: DiagnosticsWriter) -> Self {
        self.diagnostics = Some(writer);
        self
    }

    /// The retry policy in effect.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Source platform base URL, without a trailing slash.
    #[must_use]
    pub fn source_base_url(&self) -> &str {
        &self.source_base
    }

    /// Target platform base URL, without a trailing slash.
    #[must_use]
    pub fn target_base_url(&self) -> &str {
        &self.target_base
    }

    /// Absolute URL of a target identity (graph) endpoint.
    ///
    /// On the hosted platform identities live on a separate `vssps` host;
    /// on an internal host they share the collection URL.
    #[must_use]
    pub fn graph_url(&self, path: &str) -> String {
        join_url(&self.graph_base, path)
    }

    /// Redacts secrets known to this session plus the built-in patterns.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        self.redactor.redact(text).into_owned()
    }

    /// Sends one logical request.
    ///
    /// # Errors
    ///
    /// Returns a [`NormalizedError`] when the request finally fails.
    pub fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        side: Side,
    ) -> Result<Response, NormalizedError> {
        self.execute(&RequestDescriptor::new(method, endpoint, side).with_body(body))
    }

    /// Sends a prepared descriptor. Target requests carry the session's API
    /// version unless the endpoint already names one.
    ///
    /// # Errors
    ///
    /// Returns a [`NormalizedError`] when the request finally fails, or when
    /// the target API version cannot be resolved.
    pub fn execute(&self, descriptor: &RequestDescriptor) -> Result<Response, NormalizedError> {
        let version = match descriptor.side {
            Side::Target if !descriptor.endpoint.contains("api-version=") => {
                Some(self.api_version()?)
            },
            _ => None,
        };
        self.dispatch(descriptor, version.as_deref())
    }

    /// The target API version for this session.
    ///
    /// The configured override wins. Otherwise the candidates are probed
    /// newest first; the first answer that is not `400 Bad Request` decides
    /// and is cached for the lifetime of the client.
    ///
    /// # Errors
    ///
    /// Returns the probe failure if no candidate could be evaluated.
    pub fn api_version(&self) -> Result<String, NormalizedError> {
        if let Some(version) = &self.api_version_override {
            return Ok(version.clone());
        }
        if let Some(version) = self.api_version.get() {
            return Ok(version.clone());
        }

        let mut last_error = None;
        for candidate in API_VERSION_CANDIDATES {
            let probe = RequestDescriptor::new(
                Method::Get,
                format!("_apis/projects?$top=1&api-version={candidate}"),
                Side::Target,
            );
            match self.dispatch(&probe, None) {
                Ok(_) => {},
                Err(e) if e.status == 400 => {
                    tracing::debug!(candidate, "target rejected api version");
                    last_error = Some(e);
                    continue;
                },
                Err(e) if e.kind.is_connection_level() => return Err(e),
                Err(_) => {},
            }
            let version = self.api_version.get_or_init(|| candidate.to_string());
            tracing::info!(api_version = %version, "resolved target api version");
            return Ok(version.clone());
        }

        Err(last_error.unwrap_or_else(|| {
            NormalizedError::connection(
                Side::Target,
                Method::Get,
                "_apis/projects",
                FailureKind::Connection,
                "no api version candidate was accepted",
            )
        }))
    }

    fn prepare(&self, descriptor: &RequestDescriptor, version: Option<&str>) -> PreparedRequest {
        let base = match descriptor.side {
            Side::Source => &self.source_base,
            Side::Target => &self.target_base,
        };
        let mut url = join_url(base, &descriptor.endpoint);
        if let Some(version) = version {
            url = append_query(&url, "api-version", version);
        }
        let auth_header = match descriptor.auth {
            AuthContext::TokenHeader => {
                Some((SOURCE_TOKEN_HEADER, copy_secret(&self.source_token)))
            },
            AuthContext::Basic => Some((AUTHORIZATION_HEADER, copy_secret(&self.target_basic))),
            AuthContext::Anonymous => None,
        };

        PreparedRequest {
            method: descriptor.method,
            redacted_url: self.redact(&url),
            url,
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            auth_header,
            body: descriptor.body.as_ref().map(Value::to_string),
            content_type: descriptor.content_type,
        }
    }

    fn dispatch(
        &self,
        descriptor: &RequestDescriptor,
        version: Option<&str>,
    ) -> Result<Response, NormalizedError> {
        let request = self.prepare(descriptor, version);
        let side = descriptor.side;
        let method = descriptor.method;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let (transport, fallback, outcome) = self.attempt_once(&request, side);

            let (error, retryable) = match outcome {
                Ok(raw) if raw.is_success() => {
                    tracing::info!(
                        side = %side,
                        method = %method,
                        endpoint = %request.redacted_url,
                        attempt,
                        transport,
                        fallback,
                        status = raw.status,
                        "request attempt"
                    );
                    return Ok(Response {
                        status: raw.status,
                        body: raw.body,
                        side,
                        method,
                        endpoint: request.redacted_url.clone(),
                    });
                },
                Ok(raw) => {
                    tracing::info!(
                        side = %side,
                        method = %method,
                        endpoint = %request.redacted_url,
                        attempt,
                        transport,
                        fallback,
                        status = raw.status,
                        "request attempt"
                    );
                    let body = self.redact(&raw.body);
                    let error = NormalizedError::from_status(
                        side,
                        method,
                        request.redacted_url.clone(),
                        raw.status,
                        &body,
                    );
                    (error, is_retryable_status(raw.status))
                },
                Err(failure) => {
                    let message = self.redact(&failure.message);
                    tracing::info!(
                        side = %side,
                        method = %method,
                        endpoint = %request.redacted_url,
                        attempt,
                        transport,
                        fallback,
                        kind = %failure.kind,
                        error = %message,
                        "request attempt"
                    );
                    let retryable = is_transient_failure(&failure);
                    let error = NormalizedError::connection(
                        side,
                        method,
                        request.redacted_url.clone(),
                        failure.kind,
                        message,
                    );
                    (error, retryable)
                },
            };

            if retryable && self.policy.allows_retry_after(attempt) {
                let delay = self.policy.delay_for_attempt(attempt);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                continue;
            }

            let error = error.with_attempts(attempt);
            self.record_diagnostic(&error);
            return Err(error);
        }
    }

    /// Runs one attempt on the primary transport, falling back to the
    /// secondary transport for a TLS failure against the target. The flag
    /// reports whether the fallback served the attempt.
    fn attempt_once(
        &self,
        request: &PreparedRequest,
        side: Side,
    ) -> (&'static str, bool, Result<RawResponse, TransportFailure>) {
        let outcome = self.primary.execute(request);
        let failure = match outcome {
            Err(failure) if side == Side::Target && is_tls_failure(&failure) => failure,
            other => return (self.primary.name(), false, other),
        };
        let Some(fallback) = &self.fallback else {
            return (self.primary.name(), false, Err(failure));
        };

        tracing::debug!(
            endpoint = %request.redacted_url,
            error = %self.redact(&failure.message),
            "primary transport failed TLS validation"
        );
        (fallback.name(), true, fallback.execute(request))
    }

    fn record_diagnostic(&self, error: &NormalizedError) {
        let Some(writer) = &self.diagnostics else {
            return;
        };
        let record = DiagnosticRecord::from_error(error, Utc::now());
        match writer.write(&record) {
            Ok(path) => tracing::debug!(path = %path.display(), "wrote diagnostic record"),
            Err(e) => tracing::warn!(
                dir = %writer.dir().display(),
                error = %e,
                "failed to write diagnostic record"
            ),
        }
    }
}

fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

/// Joins a base URL and an endpoint. Absolute endpoints are kept as-is.
pub(crate) fn join_url(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

/// Appends a query parameter unless the URL already carries it.
pub(crate) fn append_query(url: &str, name: &str, value: &str) -> String {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let present = query
        .split('&')
        .any(|pair| pair.split('=').next() == Some(name));
    if present {
        url.to_string()
    } else if query.is_empty() {
        format!("{path}?{name}={value}")
    } else {
        format!("{url}&{name}={value}")
    }
}

/// Derives the identity host: `dev.azure.com/<org>` becomes
/// `vssps.dev.azure.com/<org>`, `<org>.visualstudio.com` becomes
/// `<org>.vssps.visualstudio.com`. Other hosts are returned unchanged.
fn graph_base_url(target_base: &str) -> String {
    let trimmed = target_base.trim_end_matches('/');
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let graph_host = if host == "dev.azure.com" {
        Some("vssps.dev.azure.com".to_string())
    } else {
        host.strip_suffix(".visualstudio.com")
            .filter(|org| !org.contains('.'))
            .map(|org| format!("{org}.vssps.visualstudio.com"))
    };
    match graph_host {
        Some(graph_host) if url.set_host(Some(&graph_host)).is_ok() => {
            url.as_str().trim_end_matches('/').to_string()
        },
        _ => trimmed.to_string(),
    }
}
