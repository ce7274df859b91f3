//! Runtime status types surfaced through the `stats` control action.
//!
//! Field order matters: these serialize straight into the control protocol's
//! JSON line, so the declared order is the wire order.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Snapshot of a thread pool's load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Work items accepted but not yet picked up by a thread.
    pub backlog: usize,
    /// Threads currently executing work.
    pub running: usize,
    /// Spare thread capacity (`max_threads - running`, never negative).
    pub pool_capacity: usize,
    /// Configured thread ceiling.
    pub max_threads: usize,
}

impl PoolStatus {
    /// Build a snapshot from raw counters, clamping `running` to the ceiling.
    pub fn new(backlog: usize, running: usize, max_threads: usize) -> Self {
        let running = running.min(max_threads);
        Self {
            backlog,
            running,
            pool_capacity: max_threads.saturating_sub(running),
            max_threads,
        }
    }
}

/// `stats` payload in single mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStats {
    #[serde(serialize_with = "rfc3339_secs")]
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub pool: PoolStatus,
}

/// Supervisor-side record of one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    #[serde(serialize_with = "rfc3339_secs")]
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    /// Fleet slot, stable across replacements of that slot.
    pub index: usize,
    /// Generation the worker was spawned in.
    pub phase: u64,
    /// Became ready at least once.
    pub booted: bool,
    pub last_checkin: DateTime<Utc>,
    pub last_status: PoolStatus,
}

impl WorkerRecord {
    /// A fresh record for a worker that was just spawned.
    pub fn starting(index: usize, pid: u32, phase: u64) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            pid,
            index,
            phase,
            booted: false,
            last_checkin: now,
            last_status: PoolStatus::default(),
        }
    }
}

/// `stats` payload in cluster mode. Derived on every read, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStatus {
    #[serde(serialize_with = "rfc3339_secs")]
    pub started_at: DateTime<Utc>,
    /// Target worker count.
    pub workers: usize,
    pub phase: u64,
    pub booted_workers: usize,
    pub old_workers: usize,
    pub worker_status: Vec<WorkerRecord>,
    /// Unexpected worker exits since boot.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub crashes: u64,
    /// Slots whose last rollover kept the old worker after a boot timeout.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_slots: Vec<usize>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Serialize a timestamp as `YYYY-MM-DDTHH:MM:SSZ`.
fn rfc3339_secs<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}
