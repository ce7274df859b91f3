//! Application work executed for each accepted connection.
//!
//! The server core only needs `handle(connection)`; the built-in apps speak
//! just enough HTTP/1.0 to be driven by curl, load generators, and tests.

use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;

use drover_types::AppKind;

use crate::listener::Connection;

/// How long a client may take to send its request head.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the request head.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Longest sleep the `sleep` app honours.
const MAX_SLEEP_SECS: u64 = 300;

/// Executes one unit of application work on a connection.
pub trait App: Send + Sync {
    fn name(&self) -> &'static str;

    /// Serve one connection to completion.
    fn handle(&self, conn: Connection) -> Result<(), String>;
}

/// Instantiate a built-in application.
pub fn builtin(kind: AppKind) -> Arc<dyn App> {
    match kind {
        AppKind::Hello => Arc::new(HelloApp),
        AppKind::Sleep => Arc::new(SleepApp),
    }
}

/// Answers every request with `Hello World`.
#[derive(Debug, Default)]
pub struct HelloApp;

impl App for HelloApp {
    fn name(&self) -> &'static str {
        "hello"
    }

    fn handle(&self, mut conn: Connection) -> Result<(), String> {
        let Some(_) = read_request_path(&mut conn)? else {
            return Ok(());
        };
        respond(&mut conn, "200 OK", "Hello World\n")
    }
}

/// Sleeps N seconds for `/sleepN` paths before answering.
#[derive(Debug, Default)]
pub struct SleepApp;

impl App for SleepApp {
    fn name(&self) -> &'static str {
        "sleep"
    }

    fn handle(&self, mut conn: Connection) -> Result<(), String> {
        let Some(path) = read_request_path(&mut conn)? else {
            return Ok(());
        };
        let secs = sleep_secs(&path).unwrap_or(0);
        if secs > 0 {
            std::thread::sleep(Duration::from_secs(secs));
        }
        respond(&mut conn, "200 OK", &format!("Slept {secs}\n"))
    }
}

/// Seconds requested by a `/sleepN` path.
fn sleep_secs(path: &str) -> Option<u64> {
    let path = path.split('?').next().unwrap_or(path);
    let n: u64 = path.strip_prefix("/sleep")?.parse().ok()?;
    Some(n.min(MAX_SLEEP_SECS))
}

/// Read the request head and return the request target. `None` if the client
/// closed without sending anything.
fn read_request_path(conn: &mut Connection) -> Result<Option<String>, String> {
    conn.set_read_timeout(Some(READ_TIMEOUT))
        .map_err(|e| format!("set read timeout: {e}"))?;
    conn.set_write_timeout(Some(READ_TIMEOUT))
        .map_err(|e| format!("set write timeout: {e}"))?;

    let mut reader = BufReader::new(&mut *conn);
    let mut first = String::new();
    let n = reader
        .read_line(&mut first)
        .map_err(|e| format!("read request line: {e}"))?;
    if n == 0 {
        return Ok(None);
    }

    let mut total = n;
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| format!("read header: {e}"))?;
        total += n;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        if total > MAX_HEAD_BYTES {
            return Err("request head too large".into());
        }
    }

    let path = first.split_whitespace().nth(1).unwrap_or("/").to_string();
    Ok(Some(path))
}

fn respond(conn: &mut Connection, status: &str, body: &str) -> Result<(), String> {
    let response = format!(
        "HTTP/1.0 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    conn.write_all(response.as_bytes())
        .and_then(|()| conn.flush())
        .map_err(|e| format!("write response: {e}"))?;
    let _ = conn.shutdown_write();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    fn exchange(app: &dyn App, request: &str) -> String {
        let (mut client, server) = UnixStream::pair().unwrap();
        client.write_all(request.as_bytes()).unwrap();
        app.handle(Connection::Unix(server)).unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn hello_answers_200() {
        let out = exchange(&HelloApp, "GET / HTTP/1.0\r\nHost: x\r\n\r\n");
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(out.ends_with("Hello World\n"));
        assert!(out.contains("Content-Length: 12\r\n"));
    }

    #[test]
    fn sleep_path_parsing() {
        assert_eq!(sleep_secs("/sleep3"), Some(3));
        assert_eq!(sleep_secs("/sleep0?x=1"), Some(0));
        assert_eq!(sleep_secs("/sleep100000"), Some(MAX_SLEEP_SECS));
        assert_eq!(sleep_secs("/other"), None);
        assert_eq!(sleep_secs("/sleepx"), None);
    }

    #[test]
    fn sleep_app_reports_duration() {
        let out = exchange(&SleepApp, "GET /sleep0 HTTP/1.0\r\n\r\n");
        assert!(out.ends_with("Slept 0\n"));
    }

    #[test]
    fn closed_client_is_not_an_error() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(client);
        assert!(HelloApp.handle(Connection::Unix(server)).is_ok());
    }

    #[test]
    fn builtin_picks_by_kind() {
        assert_eq!(builtin(AppKind::Hello).name(), "hello");
        assert_eq!(builtin(AppKind::Sleep).name(), "sleep");
    }
}
