//! Drover server runtime: a concurrent application server with an optional
//! supervised fleet of worker processes.
//!
//! # Architecture
//!
//! - [`launcher::Launcher`]: boot sequence, pid/state files, mode selection
//! - [`pool::ThreadPool`]: elastic worker threads with a shared backlog
//! - [`worker::WorkerServer`]: one pool plus acceptors over bound listeners
//! - [`cluster::Supervisor`]: spawns worker processes, respawns crashes,
//!   drives restarts and phased restarts
//! - [`heartbeat`]: NDJSON messages between workers and the supervisor
//! - [`control`]: control listener and signal forwarding thread
//! - [`state`] / [`persistence`]: discovery state file and pid file

pub mod app;
pub mod cluster;
pub mod control;
pub mod events;
pub mod gc;
pub mod heartbeat;
pub mod launcher;
pub mod listener;
pub mod logging;
pub mod persistence;
pub mod pool;
mod rollover;
pub mod single;
pub mod slot;
pub mod state;
pub mod worker;

pub use app::App;
pub use cluster::{FleetExit, Supervisor};
pub use events::{Events, LifecycleEvent};
pub use gc::{AllocatorCollector, Collector};
pub use launcher::{LaunchExit, Launcher, LauncherHandle};
pub use pool::{PoolConfig, ThreadPool};
pub use slot::WorkerCommand;
pub use state::{StateStore, KEYS_NOT_TO_PERSIST};
pub use worker::{WorkerExit, WorkerServer};
