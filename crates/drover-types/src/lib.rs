//! Core types shared across all drover crates.
//!
//! Defines the server configuration, listener addresses, status snapshots
//! surfaced through the control plane, and the shared error type.

pub mod bind;
pub mod config;
pub mod error;
pub mod status;

pub use bind::{BindUrl, AUTO_CONTROL_URL};
pub use config::{parse_threads, AppKind, DroverConfig, LogFormat, DEFAULT_BIND};
pub use error::DroverError;
pub use status::{FleetStatus, PoolStatus, ServerStats, WorkerRecord};
