//! Control protocol: actions, request-line parsing, and reply encoding.
//!
//! A control connection carries exactly one request line and one reply. Two
//! request forms are accepted:
//!
//! ```text
//! GET /stats?token=abc HTTP/1.0      (answered with an HTTP/1.0 response)
//! stats?token=abc                    (answered with the bare JSON line)
//! ```
//!
//! The reply body is always a single JSON line.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};

/// Maximum accepted request line length.
pub const MAX_REQUEST_LINE: usize = 8 * 1024;

/// An operation the control plane can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Stats,
    Gc,
    GcStats,
    Stop,
    Halt,
    Restart,
    PhasedRestart,
}

impl ControlAction {
    pub const ALL: [ControlAction; 7] = [
        ControlAction::Stats,
        ControlAction::Gc,
        ControlAction::GcStats,
        ControlAction::Stop,
        ControlAction::Halt,
        ControlAction::Restart,
        ControlAction::PhasedRestart,
    ];

    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Stats => "stats",
            ControlAction::Gc => "gc",
            ControlAction::GcStats => "gc-stats",
            ControlAction::Stop => "stop",
            ControlAction::Halt => "halt",
            ControlAction::Restart => "restart",
            ControlAction::PhasedRestart => "phased-restart",
        }
    }

    /// Whether the action only reads state.
    pub fn is_read_only(&self) -> bool {
        matches!(self, ControlAction::Stats | ControlAction::GcStats)
    }
}

impl FromStr for ControlAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unsupported action {s:?}"))
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed request line. The action is kept raw so the server can reject
/// unknown actions only after authentication has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub action: String,
    pub token: Option<String>,
    /// Whether the request used the HTTP request-line form.
    pub http: bool,
}

/// Parse one request line.
pub fn parse_request_line(line: &str) -> Result<ControlRequest, String> {
    let line = line.trim();
    if line.is_empty() {
        return Err("empty request".into());
    }
    if line.len() > MAX_REQUEST_LINE {
        return Err("request line too long".into());
    }

    let (target, http) = match line.split_once(' ') {
        Some((method, rest)) if method.eq_ignore_ascii_case("GET") => {
            let mut parts = rest.split_whitespace();
            let target = parts.next().ok_or("missing request target")?;
            match parts.next() {
                Some(version) if version.starts_with("HTTP/") => {}
                _ => return Err("missing HTTP version".into()),
            }
            (target, true)
        }
        Some((action, rest)) => {
            // Bare form with a space-separated `token=` parameter.
            let rest = rest.trim();
            if !rest.starts_with("token=") {
                return Err(format!("unexpected request parameters {rest:?}"));
            }
            return Ok(ControlRequest {
                action: action.trim_start_matches('/').to_string(),
                token: query_token(rest),
                http: false,
            });
        }
        None if line.eq_ignore_ascii_case("GET") => return Err("missing request target".into()),
        None => (line, false),
    };

    let target = target.trim_start_matches('/');
    let (action, query) = match target.split_once('?') {
        Some((action, query)) => (action, Some(query)),
        None => (target, None),
    };
    if action.is_empty() {
        return Err("missing action".into());
    }

    let token = query.and_then(query_token);

    Ok(ControlRequest {
        action: action.to_string(),
        token,
        http,
    })
}

/// Percent-decoded `token` value from a query string.
fn query_token(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
}

/// Percent-encode a token for the request query string.
pub fn encode_token(token: &str) -> String {
    url::form_urlencoded::byte_serialize(token.as_bytes()).collect()
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&x, &y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Check a presented token against the configured one.
///
/// A blank configured token accepts every request. That opt-out is meant for
/// trusted local sockets only.
pub fn authorize(configured: &str, presented: Option<&str>) -> bool {
    if configured.trim().is_empty() {
        return true;
    }
    match presented {
        Some(token) => constant_time_eq(token.as_bytes(), configured.as_bytes()),
        None => false,
    }
}

/// Reply status, mapped onto HTTP status codes for the HTTP request form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    Unavailable,
}

impl ReplyStatus {
    pub fn code(&self) -> u16 {
        match self {
            ReplyStatus::Ok => 200,
            ReplyStatus::BadRequest => 400,
            ReplyStatus::Forbidden => 403,
            ReplyStatus::NotFound => 404,
            ReplyStatus::Unavailable => 503,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ReplyStatus::Ok => "OK",
            ReplyStatus::BadRequest => "Bad Request",
            ReplyStatus::Forbidden => "Forbidden",
            ReplyStatus::NotFound => "Not Found",
            ReplyStatus::Unavailable => "Service Unavailable",
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            200..=299 => ReplyStatus::Ok,
            403 => ReplyStatus::Forbidden,
            404 => ReplyStatus::NotFound,
            503 => ReplyStatus::Unavailable,
            _ => ReplyStatus::BadRequest,
        }
    }
}

/// Response to a control request.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlReply {
    pub status: ReplyStatus,
    pub body: Value,
}

impl ControlReply {
    /// `{"status":"ok"}`
    pub fn ok() -> Self {
        Self::json(json!({ "status": "ok" }))
    }

    /// A successful reply carrying an arbitrary JSON body.
    pub fn json(body: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            body,
        }
    }

    /// An error reply: `{"error": message}`.
    pub fn error(status: ReplyStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Encode the reply for the wire. The JSON body is always the last line.
    pub fn encode(&self, http: bool) -> String {
        let mut body = serde_json::to_string(&self.body).unwrap_or_else(|_| "{}".into());
        body.push('\n');
        if !http {
            return body;
        }
        format!(
            "HTTP/1.0 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status.code(),
            self.status.reason(),
            body.len(),
            body
        )
    }
}
