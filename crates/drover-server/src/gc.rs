//! Collector hook behind the `gc` and `gc-stats` control actions.
//!
//! Rust has no tracing garbage collector, so the built-in collector asks the
//! allocator to hand freed heap pages back to the OS and counts the cycles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Memory reclamation hook driven by the control plane.
pub trait Collector: Send + Sync {
    /// Run one collection cycle synchronously.
    fn force_collect(&self);

    /// Collector counters. Must contain a monotonically increasing `count`.
    fn stats(&self) -> Map<String, Value>;
}

/// Collector backed by the process allocator.
#[derive(Debug, Default)]
pub struct AllocatorCollector {
    count: AtomicU64,
    total_micros: AtomicU64,
    last_collect_at: Mutex<Option<DateTime<Utc>>>,
}

impl AllocatorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this platform can return memory to the OS on demand.
    pub fn trim_supported() -> bool {
        cfg!(all(target_os = "linux", target_env = "gnu"))
    }
}

impl Collector for AllocatorCollector {
    fn force_collect(&self) {
        let start = Instant::now();
        let released = trim_heap();
        let elapsed = start.elapsed();

        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if let Ok(mut last) = self.last_collect_at.lock() {
            *last = Some(Utc::now());
        }
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(count, released, elapsed_us = elapsed.as_micros() as u64, "collection cycle finished");
    }

    fn stats(&self) -> Map<String, Value> {
        let last = self
            .last_collect_at
            .lock()
            .ok()
            .and_then(|g| *g)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true));

        let mut map = Map::new();
        map.insert("count".into(), json!(self.count.load(Ordering::SeqCst)));
        map.insert(
            "total_time_us".into(),
            json!(self.total_micros.load(Ordering::Relaxed)),
        );
        map.insert("last_collect_at".into(), json!(last));
        map.insert("trim_supported".into(), json!(Self::trim_supported()));
        map
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn trim_heap() -> bool {
    // SAFETY: malloc_trim only walks allocator-internal free lists.
    unsafe { libc::malloc_trim(0) != 0 }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn trim_heap() -> bool {
    false
}
