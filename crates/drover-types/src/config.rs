//! Server configuration, loaded once at boot from `drover.toml` and CLI flags.
//!
//! The resolved [`DroverConfig`] is immutable for the lifetime of the process.
//! Cluster workers receive it as JSON through their environment so they never
//! reinterpret raw flags.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bind::{BindUrl, AUTO_CONTROL_URL};
use crate::DroverError;

/// Default listener when none is configured.
pub const DEFAULT_BIND: &str = "tcp://0.0.0.0:9292";

/// Which log line formatter to install.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// `default` in single mode, `pid` in cluster mode.
    #[default]
    Auto,
    /// Standard timestamp/level/message lines.
    Default,
    /// Standard lines prefixed with `[pid]`.
    Pid,
}

impl LogFormat {
    /// Resolve `Auto` against the process mode.
    pub fn resolve(self, clustered: bool) -> Self {
        match self {
            LogFormat::Auto if clustered => LogFormat::Pid,
            LogFormat::Auto => LogFormat::Default,
            other => other,
        }
    }
}

/// Built-in application run for each accepted connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    /// Answer every request with a fixed 200 response.
    #[default]
    Hello,
    /// Sleep N seconds for `/sleepN` paths, then answer.
    Sleep,
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroverConfig {
    /// Worker processes to supervise. `0` runs a single process.
    #[serde(default)]
    pub workers: usize,
    /// Threads kept alive even when idle.
    #[serde(default)]
    pub min_threads: usize,
    /// Thread ceiling per process.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Seconds an extra thread may sit idle before it exits.
    #[serde(default = "default_thread_idle_timeout")]
    pub thread_idle_timeout: u64,
    /// Listener URLs (`tcp://host:port` or `unix://path`).
    #[serde(default = "default_binds")]
    pub binds: Vec<String>,
    /// Control endpoint URL, or `auto` for a generated local socket.
    #[serde(default)]
    pub control_url: Option<String>,
    /// Control token. `None` generates one at boot; an empty string disables
    /// the check, which is only appropriate on a trusted local socket.
    #[serde(default)]
    pub control_token: Option<String>,
    /// Where to write the discovery state file.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    /// Where to write the pid file.
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    /// Seconds a new worker may take to report booted.
    #[serde(default = "default_worker_boot_timeout")]
    pub worker_boot_timeout: u64,
    /// Seconds a stopping worker may take to drain before it is killed.
    #[serde(default = "default_worker_shutdown_timeout")]
    pub worker_shutdown_timeout: u64,
    /// Seconds between worker heartbeats.
    #[serde(default = "default_worker_check_interval")]
    pub worker_check_interval: u64,
    /// Seconds without a heartbeat before a booted worker is replaced.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout: u64,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub app: AppKind,
    /// Free-form tag echoed into logs and the state file.
    #[serde(default)]
    pub tag: Option<String>,
    /// Extra environment for worker processes. Kept last so it serializes as
    /// a trailing TOML table.
    #[serde(default)]
    pub worker_env: BTreeMap<String, String>,
}

fn default_max_threads() -> usize {
    16
}

fn default_thread_idle_timeout() -> u64 {
    60
}

fn default_binds() -> Vec<String> {
    vec![DEFAULT_BIND.to_string()]
}

fn default_worker_boot_timeout() -> u64 {
    60
}

fn default_worker_shutdown_timeout() -> u64 {
    30
}

fn default_worker_check_interval() -> u64 {
    5
}

fn default_worker_timeout() -> u64 {
    60
}

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            min_threads: 0,
            max_threads: default_max_threads(),
            thread_idle_timeout: default_thread_idle_timeout(),
            binds: default_binds(),
            control_url: None,
            control_token: None,
            state_path: None,
            pidfile: None,
            worker_boot_timeout: default_worker_boot_timeout(),
            worker_shutdown_timeout: default_worker_shutdown_timeout(),
            worker_check_interval: default_worker_check_interval(),
            worker_timeout: default_worker_timeout(),
            log_format: LogFormat::Auto,
            app: AppKind::Hello,
            tag: None,
            worker_env: BTreeMap::new(),
        }
    }
}

impl DroverConfig {
    /// Parse and validate a configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, DroverError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DroverError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, DroverError> {
        toml::to_string_pretty(self)
            .map_err(|e| DroverError::Config(format!("failed to serialize config: {e}")))
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), DroverError> {
        if self.max_threads == 0 {
            return Err(DroverError::Config("max_threads must be at least 1".into()));
        }
        if self.min_threads > self.max_threads {
            return Err(DroverError::Config(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        if self.binds.is_empty() {
            return Err(DroverError::Config("at least one bind is required".into()));
        }
        for bind in &self.binds {
            bind.parse::<BindUrl>()?;
        }
        if let Some(url) = &self.control_url {
            if url != AUTO_CONTROL_URL {
                url.parse::<BindUrl>()?;
            }
        }
        if self.worker_check_interval == 0 {
            return Err(DroverError::Config("worker_check_interval must be at least 1s".into()));
        }
        Ok(())
    }

    /// Whether worker processes are supervised by a master.
    pub fn is_clustered(&self) -> bool {
        self.workers > 0
    }

    /// Parsed listener URLs. Call after [`validate`](Self::validate).
    pub fn bind_urls(&self) -> Result<Vec<BindUrl>, DroverError> {
        self.binds.iter().map(|b| b.parse()).collect()
    }

    pub fn thread_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.thread_idle_timeout)
    }

    pub fn worker_boot_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_boot_timeout)
    }

    pub fn worker_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_shutdown_timeout)
    }

    pub fn worker_check_interval(&self) -> Duration {
        Duration::from_secs(self.worker_check_interval)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout)
    }
}

/// Parse a `-t` style thread spec: `max` or `min:max`.
pub fn parse_threads(spec: &str) -> Result<(usize, usize), DroverError> {
    let bad = || DroverError::Config(format!("invalid thread spec {spec:?} (expected MIN:MAX)"));
    match spec.split_once(':') {
        Some((min, max)) => {
            let min = min.trim().parse().map_err(|_| bad())?;
            let max = max.trim().parse().map_err(|_| bad())?;
            Ok((min, max))
        }
        None => {
            let max = spec.trim().parse().map_err(|_| bad())?;
            Ok((0, max))
        }
    }
}
