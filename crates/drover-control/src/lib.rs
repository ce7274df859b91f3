//! Control plane for the drover server.
//!
//! Provides operational access to a running server via a single-request
//! text protocol over TCP or a Unix domain socket:
//! - [`action`]: actions, request-line parsing, token checks, reply encoding
//! - [`server`]: tokio listener forwarding actions to the server main loop
//! - [`client`]: blocking client used by `drover ctl` and tests

pub mod action;
pub mod client;
pub mod server;

pub use action::{ControlAction, ControlReply, ControlRequest, ReplyStatus};
pub use client::ControlClient;
pub use server::{control_channel, ControlCmdRx, ControlCmdTx, ControlListener, ControlServerConfig};
