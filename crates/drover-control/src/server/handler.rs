//! Transport-agnostic request handler.
//!
//! Parses the request line, checks the token, and forwards the action through
//! the command channel to the process main loop. Authentication and protocol
//! errors are answered here and never reach the main loop.

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::action::{authorize, parse_request_line, ControlAction, ControlReply, ReplyStatus};
use crate::server::ControlCmdTx;

/// Whether a raw line uses the HTTP request form. Used to pick the reply
/// encoding even when the line fails to parse.
pub fn looks_http(line: &str) -> bool {
    line.trim_start()
        .get(..4)
        .is_some_and(|m| m.eq_ignore_ascii_case("GET "))
}

/// Handle one request line. Returns the reply and whether to encode it as
/// HTTP.
pub async fn handle_request(line: &str, token: &str, tx: &ControlCmdTx) -> (ControlReply, bool) {
    let request = match parse_request_line(line) {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, "malformed control request");
            return (
                ControlReply::error(ReplyStatus::BadRequest, format!("malformed request: {e}")),
                looks_http(line),
            );
        }
    };

    if !authorize(token, request.token.as_deref()) {
        warn!(action = %request.action, "control request rejected: invalid auth token");
        return (
            ControlReply::error(ReplyStatus::Forbidden, "Invalid auth token"),
            request.http,
        );
    }

    let action: ControlAction = match request.action.parse() {
        Ok(action) => action,
        Err(e) => {
            debug!(error = %e, "unknown control action");
            return (
                ControlReply::error(ReplyStatus::NotFound, "Unsupported action"),
                request.http,
            );
        }
    };

    if action.is_read_only() {
        debug!(action = %action.as_str(), "control request");
    } else {
        info!(action = %action.as_str(), "control request");
    }
    (dispatch(tx, action).await, request.http)
}

/// Send an action to the main loop and wait for its reply.
pub async fn dispatch(tx: &ControlCmdTx, action: ControlAction) -> ControlReply {
    let (resp_tx, resp_rx) = oneshot::channel();
    if tx.send((action, resp_tx)).is_err() {
        return ControlReply::error(ReplyStatus::Unavailable, "server main loop disconnected");
    }
    match resp_rx.await {
        Ok(reply) => reply,
        Err(_) => ControlReply::error(ReplyStatus::Unavailable, "response channel dropped"),
    }
}
