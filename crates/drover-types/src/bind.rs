//! Bind URLs for listeners and the control endpoint.
//!
//! Two schemes are understood: `tcp://host:port` and `unix://path`. A single
//! trailing slash on TCP URLs is accepted (`tcp://127.0.0.1:9293/`).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::DroverError;

/// Control URL value that asks for a generated local socket path.
pub const AUTO_CONTROL_URL: &str = "auto";

/// A parsed listener or control endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindUrl {
    /// TCP `host:port`, kept as text so hostnames resolve at bind time.
    Tcp(String),
    /// Local socket path.
    Unix(PathBuf),
}

impl BindUrl {
    /// Generate a fresh Unix socket URL in the system temp directory.
    pub fn auto_control() -> Self {
        let name = format!("drover-ctl-{}.sock", uuid::Uuid::new_v4().simple());
        BindUrl::Unix(std::env::temp_dir().join(name))
    }

    /// The socket path for Unix URLs.
    pub fn unix_path(&self) -> Option<&std::path::Path> {
        match self {
            BindUrl::Unix(path) => Some(path),
            BindUrl::Tcp(_) => None,
        }
    }
}

impl FromStr for BindUrl {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("tcp://") {
            let addr = rest.trim_end_matches('/');
            let Some((host, port)) = addr.rsplit_once(':') else {
                return Err(DroverError::Config(format!("missing port in bind url {s:?}")));
            };
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(DroverError::Config(format!("invalid tcp bind url {s:?}")));
            }
            return Ok(BindUrl::Tcp(addr.to_string()));
        }
        if let Some(rest) = s.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(DroverError::Config(format!("missing socket path in {s:?}")));
            }
            return Ok(BindUrl::Unix(PathBuf::from(rest)));
        }
        Err(DroverError::Config(format!(
            "unsupported bind url {s:?} (expected tcp:// or unix://)"
        )))
    }
}

impl fmt::Display for BindUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindUrl::Tcp(addr) => write!(f, "tcp://{addr}"),
            BindUrl::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}
