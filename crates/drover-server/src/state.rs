//! Discovery state file.
//!
//! Written once at boot so external tooling (`drover ctl -S`) can find the
//! control endpoint. The file is a flat JSON object; secrets and
//! process-local values are dropped before writing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::info;

use drover_types::{BindUrl, DroverConfig, DroverError};

/// Keys never written to the state file.
pub const KEYS_NOT_TO_PERSIST: &[&str] = &["control_token", "worker_env"];

/// Writes and reads the state file at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Filter `snapshot`, add the current pid, and replace the file
    /// atomically (write tmp, then rename).
    pub fn write(&self, snapshot: &Map<String, Value>) -> Result<(), DroverError> {
        let mut filtered: BTreeMap<String, Value> = snapshot
            .iter()
            .filter(|(key, _)| !KEYS_NOT_TO_PERSIST.contains(&key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        filtered.insert("pid".into(), Value::from(std::process::id()));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DroverError::StateWrite(format!("create {}: {e}", parent.display()))
                })?;
            }
        }

        let json = serde_json::to_string_pretty(&filtered)
            .map_err(|e| DroverError::StateWrite(format!("serialize state: {e}")))?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, json + "\n")
            .map_err(|e| DroverError::StateWrite(format!("write {}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            DroverError::StateWrite(format!("rename to {}: {e}", self.path.display()))
        })?;

        info!(path = %self.path.display(), "state file written");
        Ok(())
    }

    /// Parse a state file back into a mapping.
    pub fn read(path: &Path) -> Result<BTreeMap<String, Value>, DroverError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            DroverError::Config(format!("invalid state file {}: {e}", path.display()))
        })
    }
}

/// Snapshot of a launch: the resolved configuration plus runtime facts.
///
/// Includes the token so callers can see everything; [`StateStore::write`]
/// filters it out.
pub fn launch_snapshot(
    config: &DroverConfig,
    control_url: Option<&BindUrl>,
    control_token: &str,
) -> Map<String, Value> {
    let mut map = match serde_json::to_value(config) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    map.insert(
        "control_url".into(),
        control_url.map_or(Value::Null, |u| Value::from(u.to_string())),
    );
    map.insert("control_token".into(), Value::from(control_token));
    map.insert(
        "started_at".into(),
        Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    map.insert("version".into(), Value::from(env!("CARGO_PKG_VERSION")));
    map.insert(
        "mode".into(),
        Value::from(if config.is_clustered() { "cluster" } else { "single" }),
    );
    map
}
