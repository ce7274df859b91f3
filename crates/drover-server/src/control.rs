//! Control plane thread: the control listener and OS signal forwarding.
//!
//! Both run on a current-thread tokio runtime owned by a dedicated thread and
//! feed the same command channel the main loop drains, so a signal and the
//! matching control action take the same path:
//!
//! | signal          | action           |
//! |-----------------|------------------|
//! | SIGTERM, SIGINT | `stop`           |
//! | SIGUSR1         | `phased-restart` |
//! | SIGUSR2         | `restart`        |

use std::thread::JoinHandle;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use drover_control::server::{self, handler};
use drover_control::{ControlAction, ControlCmdTx};
use drover_types::{BindUrl, DroverError};

struct SignalSet {
    term: Signal,
    int: Signal,
    usr1: Signal,
    usr2: Signal,
}

impl SignalSet {
    fn register() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            usr1: signal(SignalKind::user_defined1())?,
            usr2: signal(SignalKind::user_defined2())?,
        })
    }
}

/// Handle to the running control plane.
pub struct ControlPlane {
    shutdown: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
    url: Option<BindUrl>,
}

impl ControlPlane {
    /// Start signal forwarding and, if `endpoint` is set, the control
    /// listener. Returns once both are installed; a bind failure is returned
    /// here.
    pub fn start(
        endpoint: Option<BindUrl>,
        token: String,
        cmd_tx: ControlCmdTx,
    ) -> Result<Self, DroverError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<Option<BindUrl>, String>>();

        let thread = std::thread::Builder::new()
            .name("control".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("failed to build control runtime: {e}")));
                        return;
                    }
                };

                rt.block_on(async move {
                    let listener = match &endpoint {
                        Some(endpoint) => match server::bind(endpoint).await {
                            Ok(listener) => Some(listener),
                            Err(e) => {
                                let _ = ready_tx.send(Err(e));
                                return;
                            }
                        },
                        None => None,
                    };
                    let signals = match SignalSet::register() {
                        Ok(signals) => Some(signals),
                        Err(e) => {
                            warn!(error = %e, "signal handlers not installed");
                            None
                        }
                    };
                    let url = listener.as_ref().and_then(|l| l.local_url());
                    let _ = ready_tx.send(Ok(url));

                    let serve = async {
                        if let Some(listener) = listener {
                            server::run(listener, &token, cmd_tx.clone(), shutdown_rx.clone()).await;
                        }
                    };
                    let forward = async {
                        if let Some(signals) = signals {
                            forward_signals(signals, &cmd_tx, shutdown_rx.clone()).await;
                        }
                    };
                    tokio::join!(serve, forward);
                });
            })
            .map_err(|e| DroverError::Spawn(format!("control thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(url)) => Ok(Self {
                shutdown: shutdown_tx,
                thread: Some(thread),
                url,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(DroverError::Bind(e))
            }
            Err(_) => {
                let _ = thread.join();
                Err(DroverError::Spawn("control thread exited during startup".into()))
            }
        }
    }

    /// The bound control URL, if a listener is running.
    pub fn url(&self) -> Option<&BindUrl> {
        self.url.as_ref()
    }

    /// Stop the listener and signal forwarding and wait for the thread. Replies
    /// still in flight are flushed first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("control thread panicked");
            }
        }
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn forward_signals(
    mut signals: SignalSet,
    cmd_tx: &ControlCmdTx,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (name, action) = tokio::select! {
            _ = signals.term.recv() => ("SIGTERM", ControlAction::Stop),
            _ = signals.int.recv() => ("SIGINT", ControlAction::Stop),
            _ = signals.usr1.recv() => ("SIGUSR1", ControlAction::PhasedRestart),
            _ = signals.usr2.recv() => ("SIGUSR2", ControlAction::Restart),
            _ = shutdown.wait_for(|&v| v) => return,
        };
        info!(signal = name, action = %action, "signal received");
        let reply = handler::dispatch(cmd_tx, action).await;
        if !reply.is_ok() {
            warn!(signal = name, reply = %reply.body, "signal action failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_control::{control_channel, ControlClient, ControlReply};

    #[test]
    fn serves_actions_and_cleans_up_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ctl.sock");
        let (tx, rx) = control_channel();

        let plane = ControlPlane::start(Some(BindUrl::Unix(path.clone())), "t0k".into(), tx).unwrap();
        assert_eq!(plane.url(), Some(&BindUrl::Unix(path.clone())));

        let responder = std::thread::spawn(move || {
            let (action, reply) = rx.recv().unwrap();
            let _ = reply.send(ControlReply::ok());
            action
        });
        let reply = ControlClient::new(BindUrl::Unix(path.clone()), Some("t0k".into()))
            .send("gc")
            .unwrap();
        assert!(reply.is_ok());
        assert_eq!(responder.join().unwrap(), ControlAction::Gc);

        plane.shutdown();
        assert!(!path.exists());
    }

    #[test]
    fn tcp_port_zero_reports_bound_url() {
        let (tx, _rx) = control_channel();
        let plane =
            ControlPlane::start(Some("tcp://127.0.0.1:0".parse().unwrap()), String::new(), tx)
                .unwrap();
        match plane.url() {
            Some(BindUrl::Tcp(addr)) => assert!(!addr.ends_with(":0")),
            other => panic!("unexpected {other:?}"),
        }
        plane.shutdown();
    }

    #[test]
    fn bind_failure_is_reported() {
        let (tx, _rx) = control_channel();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = BindUrl::Tcp(taken.local_addr().unwrap().to_string());
        assert!(matches!(
            ControlPlane::start(Some(url), String::new(), tx),
            Err(DroverError::Bind(_))
        ));
    }
}
