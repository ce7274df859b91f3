//! Shared helpers for integration tests.
//!
//! Each integration test file compiles common/ as its own module, so not
//! every helper is used in every file.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::TempDir;

use drover_control::{ControlClient, ControlReply};
use drover_types::BindUrl;

pub const TOKEN: &str = "integration-token";

/// Path of the `drover` binary under test.
pub fn drover_bin() -> &'static str {
    env!("CARGO_BIN_EXE_drover")
}

/// `drover` command for one-shot invocations.
pub fn drover_cmd() -> assert_cmd::Command {
    assert_cmd::Command::new(drover_bin())
}

/// Poll `check` until it returns `Some`, panicking after `timeout`.
pub fn wait_until<T>(timeout: Duration, what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// A `drover run` process bound to Unix sockets in its own temp dir.
pub struct ServerProcess {
    pub child: Child,
    pub dir: TempDir,
    pub token: String,
}

impl ServerProcess {
    /// Start with the integration token and `extra` flags.
    pub fn start(extra: &[&str]) -> Self {
        Self::start_with_token(TOKEN, extra)
    }

    pub fn start_with_token(token: &str, extra: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = std::fs::File::create(dir.path().join("server.log")).expect("log file");

        let child = Command::new(drover_bin())
            .arg("run")
            .arg("-b")
            .arg(format!("unix://{}", dir.path().join("app.sock").display()))
            .arg("--control-url")
            .arg(format!("unix://{}", dir.path().join("ctl.sock").display()))
            .arg("--control-token")
            .arg(token)
            .arg("-S")
            .arg(dir.path().join("drover.state"))
            .arg("--pidfile")
            .arg(dir.path().join("drover.pid"))
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn()
            .expect("spawn drover run");

        let server = Self {
            child,
            dir,
            token: token.to_string(),
        };
        wait_until(Duration::from_secs(20), "control endpoint", || {
            server.try_ctl("stats").filter(ControlReply::is_ok)
        });
        server
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn control_url(&self) -> String {
        format!("unix://{}", self.path("ctl.sock").display())
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    fn client(&self) -> ControlClient {
        ControlClient::new(BindUrl::Unix(self.path("ctl.sock")), Some(self.token.clone()))
            .with_timeout(Duration::from_secs(30))
    }

    pub fn try_ctl(&self, action: &str) -> Option<ControlReply> {
        self.client().send(action).ok()
    }

    /// Send an action and return the reply body; panics on transport errors.
    pub fn ctl(&self, action: &str) -> Value {
        self.client()
            .send(action)
            .unwrap_or_else(|e| panic!("{action} failed: {e}\n{}", self.log()))
            .body
    }

    /// Wait until all `workers` slots are booted in the current phase.
    pub fn wait_fleet_ready(&self, workers: usize) -> Value {
        wait_until(Duration::from_secs(30), "fleet ready", || {
            let stats = self.try_ctl("stats")?.body;
            let phase = stats["phase"].as_u64()?;
            let ready = stats["worker_status"]
                .as_array()?
                .iter()
                .filter(|w| w["booted"] == true && w["phase"].as_u64() == Some(phase))
                .count();
            (ready == workers && stats["worker_status"].as_array()?.len() == workers)
                .then_some(stats)
        })
    }

    /// Issue a plain HTTP request against the app socket.
    pub fn request(&self, path: &str) -> std::io::Result<String> {
        http_get(&self.path("app.sock"), path)
    }

    pub fn wait_exit(&mut self, timeout: Duration) -> ExitStatus {
        let child = &mut self.child;
        wait_until(timeout, "server exit", || child.try_wait().ok().flatten())
    }

    pub fn log(&self) -> String {
        std::fs::read_to_string(self.path("server.log")).unwrap_or_default()
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Pids listed in a cluster `stats` body.
pub fn worker_pids(stats: &Value) -> Vec<u32> {
    stats["worker_status"]
        .as_array()
        .map(|workers| {
            workers
                .iter()
                .filter_map(|w| w["pid"].as_u64())
                .map(|pid| pid as u32)
                .collect()
        })
        .unwrap_or_default()
}

pub fn http_get(socket: &Path, path: &str) -> std::io::Result<String> {
    let mut stream = UnixStream::connect(socket)?;
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    stream.write_all(format!("GET {path} HTTP/1.0\r\n\r\n").as_bytes())?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

/// A pid that is guaranteed to have exited.
pub fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait true");
    pid
}
