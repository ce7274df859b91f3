//! Single mode: one in-process [`WorkerServer`] driven by control actions.

use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use drover_control::{ControlAction, ControlCmdRx, ControlReply, ReplyStatus};
use drover_types::{DroverConfig, DroverError};

use crate::events::{Events, LifecycleEvent};
use crate::gc::Collector;
use crate::worker::WorkerServer;

const TICK: Duration = Duration::from_millis(250);

/// How single mode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleExit {
    Stopped,
    Halted,
}

/// Serves control actions for one [`WorkerServer`].
pub struct SingleServer {
    server: Option<WorkerServer>,
    config: Arc<DroverConfig>,
    collector: Arc<dyn Collector>,
    events: Events,
}

impl SingleServer {
    pub fn new(
        server: WorkerServer,
        config: Arc<DroverConfig>,
        collector: Arc<dyn Collector>,
        events: Events,
    ) -> Self {
        Self {
            server: Some(server),
            config,
            collector,
            events,
        }
    }

    /// Run until `stop` or `halt`, or until every command sender is gone.
    pub fn run(mut self, commands: ControlCmdRx) -> Result<SingleExit, DroverError> {
        self.events.emit(LifecycleEvent::Booted { clustered: false });
        let exit = loop {
            match commands.recv_timeout(TICK) {
                Ok((action, reply)) => {
                    if let Some(exit) = self.handle(action, reply)? {
                        break exit;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("control channel closed, stopping");
                    break SingleExit::Stopped;
                }
            }
        };

        if let Some(server) = self.server.take() {
            match exit {
                SingleExit::Stopped => server.stop(),
                // Dropping the server only flags the acceptors; in-flight
                // work is abandoned when the process exits.
                SingleExit::Halted => drop(server),
            }
        }
        Ok(exit)
    }

    fn handle(
        &mut self,
        action: ControlAction,
        reply: oneshot::Sender<ControlReply>,
    ) -> Result<Option<SingleExit>, DroverError> {
        debug!(action = %action, "control action");
        let Some(server) = self.server.as_mut() else {
            let _ = reply.send(ControlReply::error(ReplyStatus::Unavailable, "server is stopping"));
            return Ok(None);
        };

        match action {
            ControlAction::Stats => {
                let response = match serde_json::to_value(server.stats()) {
                    Ok(body) => ControlReply::json(body),
                    Err(e) => ControlReply::error(ReplyStatus::Unavailable, format!("stats: {e}")),
                };
                let _ = reply.send(response);
            }
            ControlAction::Gc => {
                self.collector.force_collect();
                let _ = reply.send(ControlReply::ok());
            }
            ControlAction::GcStats => {
                let _ = reply.send(ControlReply::json(serde_json::Value::Object(
                    self.collector.stats(),
                )));
            }
            ControlAction::Stop => {
                let _ = reply.send(ControlReply::ok());
                return Ok(Some(SingleExit::Stopped));
            }
            ControlAction::Halt => {
                let _ = reply.send(ControlReply::ok());
                return Ok(Some(SingleExit::Halted));
            }
            ControlAction::Restart => {
                let _ = reply.send(ControlReply::ok());
                self.events.emit(LifecycleEvent::Restarting { phased: false });
                info!("restarting server");
                server.restart(&self.config)?;
            }
            ControlAction::PhasedRestart => {
                warn!("phased restart requested in single mode");
                let _ = reply.send(ControlReply::error(
                    ReplyStatus::BadRequest,
                    "phased-restart requires cluster mode (workers >= 1)",
                ));
            }
        }
        Ok(None)
    }
}
