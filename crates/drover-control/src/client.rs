//! Blocking client for the control endpoint.
//!
//! Sends one HTTP-style request line per connection and parses the final JSON
//! line of the reply.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use drover_types::BindUrl;

use crate::action::{encode_token, ControlReply, ReplyStatus};

/// Upper bound on reply size.
const MAX_REPLY_BYTES: u64 = 1_000_000;

/// Client for a running server's control endpoint.
pub struct ControlClient {
    url: BindUrl,
    token: Option<String>,
    timeout: Duration,
}

impl ControlClient {
    /// Create a client targeting the given endpoint.
    pub fn new(url: BindUrl, token: Option<String>) -> Self {
        Self {
            url,
            token,
            timeout: Duration::from_secs(60),
        }
    }

    /// Override the read/write timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &BindUrl {
        &self.url
    }

    /// The request line sent for `action`.
    pub fn request_line(&self, action: &str) -> String {
        match self.token.as_deref() {
            Some(token) if !token.is_empty() => {
                format!("GET /{action}?token={} HTTP/1.0\r\n\r\n", encode_token(token))
            }
            _ => format!("GET /{action} HTTP/1.0\r\n\r\n"),
        }
    }

    /// Send an action and wait for the reply.
    pub fn send(&self, action: &str) -> Result<ControlReply, String> {
        let request = self.request_line(action);
        let raw = match &self.url {
            BindUrl::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .map_err(|e| format!("failed to connect to control server at {addr}: {e}"))?;
                stream.set_read_timeout(Some(self.timeout)).ok();
                stream.set_write_timeout(Some(self.timeout)).ok();
                exchange(stream, &request)?
            }
            BindUrl::Unix(path) => {
                let stream = UnixStream::connect(path).map_err(|e| {
                    format!("failed to connect to control server at {}: {e}", path.display())
                })?;
                stream.set_read_timeout(Some(self.timeout)).ok();
                stream.set_write_timeout(Some(self.timeout)).ok();
                exchange(stream, &request)?
            }
        };
        parse_reply(&raw)
    }
}

fn exchange<S: Read + Write>(mut stream: S, request: &str) -> Result<String, String> {
    stream
        .write_all(request.as_bytes())
        .map_err(|e| format!("failed to send request: {e}"))?;
    stream.flush().map_err(|e| format!("failed to flush: {e}"))?;

    let mut raw = String::new();
    stream
        .take(MAX_REPLY_BYTES)
        .read_to_string(&mut raw)
        .map_err(|e| format!("failed to read reply: {e}"))?;
    Ok(raw)
}

/// Parse a raw reply (HTTP or bare) into a [`ControlReply`].
pub fn parse_reply(raw: &str) -> Result<ControlReply, String> {
    let status = if raw.starts_with("HTTP/") {
        let code = raw
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| "malformed status line in reply".to_string())?;
        ReplyStatus::from_code(code)
    } else {
        ReplyStatus::Ok
    };

    let line = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .ok_or_else(|| "empty reply from control server".to_string())?;
    let body: serde_json::Value =
        serde_json::from_str(line).map_err(|e| format!("failed to parse reply: {e}"))?;

    // Bare replies carry no status line; infer errors from the body.
    let status = if status == ReplyStatus::Ok && body.get("error").is_some() {
        ReplyStatus::BadRequest
    } else {
        status
    };
    Ok(ControlReply { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_includes_token_only_when_set() {
        let url: BindUrl = "tcp://127.0.0.1:1".parse().unwrap();
        let with = ControlClient::new(url.clone(), Some("tok".into()));
        assert_eq!(with.request_line("stop"), "GET /stop?token=tok HTTP/1.0\r\n\r\n");

        let blank = ControlClient::new(url.clone(), Some(String::new()));
        assert_eq!(blank.request_line("stats"), "GET /stats HTTP/1.0\r\n\r\n");

        let none = ControlClient::new(url, None);
        assert_eq!(none.request_line("gc"), "GET /gc HTTP/1.0\r\n\r\n");
    }

    #[test]
    fn request_line_encodes_reserved_token_characters() {
        let url: BindUrl = "tcp://127.0.0.1:1".parse().unwrap();
        let client = ControlClient::new(url, Some("a b&c%d".into()));
        let line = client.request_line("stats");
        assert_eq!(line, "GET /stats?token=a+b%26c%25d HTTP/1.0\r\n\r\n");

        let req = crate::action::parse_request_line(&line).unwrap();
        assert_eq!(req.token.as_deref(), Some("a b&c%d"));
    }

    #[test]
    fn parse_http_reply() {
        let raw = "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n{\"status\":\"ok\"}\n";
        let reply = parse_reply(raw).unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.body["status"], "ok");
    }

    #[test]
    fn parse_http_error_reply() {
        let raw = "HTTP/1.0 403 Forbidden\r\n\r\n{\"error\":\"Invalid auth token\"}\n";
        let reply = parse_reply(raw).unwrap();
        assert_eq!(reply.status, ReplyStatus::Forbidden);
    }

    #[test]
    fn parse_bare_error_reply() {
        let reply = parse_reply("{\"error\":\"unsupported action\"}\n").unwrap();
        assert!(!reply.is_ok());
    }

    #[test]
    fn parse_empty_reply_fails() {
        assert!(parse_reply("").is_err());
        assert!(parse_reply("HTTP/1.0 200 OK\r\n\r\n").is_err());
    }

    #[test]
    fn connect_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let url = BindUrl::Unix(tmp.path().join("missing.sock"));
        let err = ControlClient::new(url, None).send("stats").unwrap_err();
        assert!(err.contains("failed to connect"));
    }
}
