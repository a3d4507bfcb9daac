//! Secondary transport that shells out to `curl`.
//!
//! Used for a single attempt when the primary transport rejects the
//! certificate of an internally hosted target. The request is passed to curl
//! as a config file on stdin so that credentials never show up in the
//! process list. With `insecure` set, certificate validation is bypassed.
//!
//! curl is run with `--include` and a `--write-out` trailer, so stdout is:
//!
//! ```text
//! HTTP/1.1 201 Created\r\n
//! Content-Type: application/json\r\n
//! \r\n
//! {"id": "..."}\n
//! __FERRY_STATUS__:201
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use secrecy::ExposeSecret;

use super::retry::classify_message;
use super::{FailureKind, Method, PreparedRequest, RawResponse, Transport, TransportFailure};

/// Trailer written after the body by `--write-out`.
pub const STATUS_MARKER: &str = "__FERRY_STATUS__:";

/// Transport invoking the `curl` command-line tool.
#[derive(Debug, Clone)]
pub struct CurlTransport {
    program: PathBuf,
    insecure: bool,
    timeout: Duration,
}

impl CurlTransport {
    /// Creates a transport running `curl` from `PATH`.
    #[must_use]
    pub fn new(insecure: bool, timeout: Duration) -> Self {
        Self {
            program: PathBuf::from("curl"),
            insecure,
            timeout,
        }
    }

    /// Uses a specific curl binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Renders the curl config document for a request.
    fn render_config(&self, request: &PreparedRequest) -> String {
        let mut config = String::new();
        push_option(&mut config, "url", &request.url);
        if request.method == Method::Head {
            config.push_str("head\n");
        } else {
            push_option(&mut config, "request", request.method.as_str());
        }
        push_option(&mut config, "max-time", &self.timeout.as_secs().max(1).to_string());
        for (name, value) in &request.headers {
            push_option(&mut config, "header", &format!("{name}: {value}"));
        }
        if let Some((name, secret)) = &request.auth_header {
            push_option(
                &mut config,
                "header",
                &format!("{name}: {}", secret.expose_secret()),
            );
        }
        if let Some(body) = &request.body {
            push_option(
                &mut config,
                "header",
                &format!("Content-Type: {}", request.content_type),
            );
            push_option(&mut config, "data-binary", body);
        }
        if self.insecure {
            config.push_str("insecure\n");
        }
        push_option(&mut config, "write-out", &format!("\n{STATUS_MARKER}%{{http_code}}"));
        config
    }
}

/// Appends `name = "value"` with curl config escaping.
fn push_option(config: &mut String, name: &str, value: &str) {
    config.push_str(name);
    config.push_str(" = \"");
    for c in value.chars() {
        match c {
            '\\' => config.push_str("\\\\"),
            '"' => config.push_str("\\\""),
            '\n' => config.push_str("\\n"),
            '\r' => config.push_str("\\r"),
            '\t' => config.push_str("\\t"),
            _ => config.push(c),
        }
    }
    config.push_str("\"\n");
}

impl Transport for CurlTransport {
    fn name(&self) -> &'static str {
        "curl"
    }

    fn execute(&self, request: &PreparedRequest) -> Result<RawResponse, TransportFailure> {
        let config = self.render_config(request);
        let mut child = Command::new(&self.program)
            .args(["--silent", "--show-error", "--include", "--config", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                TransportFailure::new(
                    FailureKind::Connection,
                    format!("cannot spawn {}: {e}", self.program.display()),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(config.as_bytes()).map_err(|e| {
                TransportFailure::new(
                    FailureKind::Connection,
                    format!("cannot write curl config: {e}"),
                )
            })?;
        }

        let output = child.wait_with_output().map_err(|e| {
            TransportFailure::new(FailureKind::Connection, format!("curl did not finish: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = output.status.code().unwrap_or(-1);
            return Err(failure_from_exit(code, &stderr));
        }

        parse_raw_response(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Maps a curl exit code to a failure.
fn failure_from_exit(code: i32, stderr: &str) -> TransportFailure {
    let kind = match code {
        28 => FailureKind::Timeout,
        35 | 51 | 53 | 54 | 58 | 59 | 60 | 64 | 66 | 77 | 80 | 82 | 83 | 90 | 91 => {
            FailureKind::Tls
        },
        _ => classify_message(stderr),
    };
    let message = if stderr.is_empty() {
        format!("curl exited with code {code}")
    } else {
        format!("curl exited with code {code}: {stderr}")
    };
    TransportFailure::new(kind, message)
}

/// Parses curl's `--include` output followed by the status trailer.
///
/// Intermediate header blocks (`100 Continue`, proxy `CONNECT` answers) are
/// skipped. The trailer's status is authoritative.
///
/// # Errors
///
/// Returns a connection failure if the trailer is missing or reports no
/// response (`000`).
pub fn parse_raw_response(raw: &str) -> Result<RawResponse, TransportFailure> {
    let Some((content, code)) = raw.rsplit_once(STATUS_MARKER) else {
        return Err(TransportFailure::new(
            FailureKind::Connection,
            "secondary transport produced no status marker",
        ));
    };
    let status: u16 = code.trim().parse().map_err(|_| {
        TransportFailure::new(
            FailureKind::Connection,
            format!("secondary transport produced an invalid status {:?}", code.trim()),
        )
    })?;
    if status == 0 {
        return Err(TransportFailure::new(
            FailureKind::Connection,
            "secondary transport received no response",
        ));
    }

    let content = content.strip_suffix('\n').unwrap_or(content);
    let mut rest = content;
    while rest.starts_with("HTTP/") {
        match split_header_block(rest) {
            Some((_, after)) => rest = after,
            None => {
                rest = "";
                break;
            },
        }
    }

    Ok(RawResponse::new(status, rest))
}

/// Splits at the first blank line, accepting CRLF or LF line endings.
fn split_header_block(text: &str) -> Option<(&str, &str)> {
    let crlf = text.find("\r\n\r\n").map(|i| (i, 4));
    let lf = text.find("\n\n").map(|i| (i, 2));
    let (index, len) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        },
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&text[..index], &text[index + len..]))
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn request(method: Method, body: Option<&str>) -> PreparedRequest {
        PreparedRequest {
            method,
            url: "https://tfs.corp.local/tfs/Default/_apis/projects?api-version=6.0".to_string(),
            redacted_url: "https://tfs.corp.local/tfs/Default/_apis/projects?api-version=6.0"
                .to_string(),
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            auth_header: Some(("Authorization", SecretString::from("Basic Zm9vOmJhcg=="))),
            body: body.map(str::to_string),
            content_type: "application/json",
        }
    }

    #[test]
    fn parses_simple_response() {
        let raw = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"count\":1}\n__FERRY_STATUS__:200";
        let response = parse_raw_response(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "{\"count\":1}");
    }

    #[test]
    fn skips_continue_block() {
        let raw = "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nX-A: b\r\n\r\n{\"id\":\"r1\"}\n__FERRY_STATUS__:201";
        let response = parse_raw_response(raw).unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, "{\"id\":\"r1\"}");
    }

    #[test]
    fn accepts_lf_only_headers_and_empty_body() {
        let raw = "HTTP/2 204\nserver: x\n\n\n__FERRY_STATUS__:204";
        let response = parse_raw_response(raw).unwrap();
        assert_eq!(response.status, 204);
        assert_eq!(response.body, "");
    }

    #[test]
    fn keeps_error_status_and_body() {
        let raw = "HTTP/1.1 409 Conflict\r\n\r\n{\"message\":\"exists\"}\n__FERRY_STATUS__:409";
        let response = parse_raw_response(raw).unwrap();
        assert_eq!(response.status, 409);
        assert!(!response.is_success());
    }

    #[test]
    fn missing_marker_is_connection_failure() {
        let failure = parse_raw_response("HTTP/1.1 200 OK\r\n\r\n{}").unwrap_err();
        assert_eq!(failure.kind, FailureKind::Connection);
    }

    #[test]
    fn zero_status_is_connection_failure() {
        let failure = parse_raw_response("\n__FERRY_STATUS__:000").unwrap_err();
        assert_eq!(failure.kind, FailureKind::Connection);
    }

    #[test]
    fn config_escapes_body_and_sets_insecure() {
        let transport = CurlTransport::new(true, Duration::from_secs(30));
        let config = transport.render_config(&request(Method::Post, Some("{\"name\":\"a\\b\"}\n")));
        assert!(config.contains("request = \"POST\"\n"));
        assert!(config.contains("data-binary = \"{\\\"name\\\":\\\"a\\\\b\\\"}\\n\"\n"));
        assert!(config.contains("header = \"Authorization: Basic Zm9vOmJhcg==\"\n"));
        assert!(config.contains("insecure\n"));
        assert!(config.contains("max-time = \"30\"\n"));
        assert!(config.contains("write-out = \"\\n__FERRY_STATUS__:%{http_code}\"\n"));
    }

    #[test]
    fn config_without_opt_in_validates_certificates() {
        let transport = CurlTransport::new(false, Duration::from_secs(30));
        let config = transport.render_config(&request(Method::Head, None));
        assert!(config.contains("head\n"));
        assert!(!config.contains("insecure"));
        assert!(!config.contains("data-binary"));
    }

    #[test]
    fn exit_codes_map_to_kinds() {
        assert_eq!(failure_from_exit(60, "SSL certificate problem").kind, FailureKind::Tls);
        assert_eq!(failure_from_exit(28, "Operation timed out").kind, FailureKind::Timeout);
        assert_eq!(
            failure_from_exit(7, "Failed to connect").kind,
            FailureKind::Connection
        );
        assert!(failure_from_exit(56, "Recv failure: Connection reset by peer")
            .message
            .contains("code 56"));
    }
}
