//! Control endpoint listener.
//!
//! - [`handler`]: transport-agnostic request handling
//!
//! The listener runs on a tokio runtime owned by the caller. Each accepted
//! connection carries one request; the reply is written and the connection is
//! closed. Actions are forwarded over a `std::sync::mpsc` channel so the
//! synchronous server main loop can `recv_timeout()` on it directly.

pub mod handler;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use drover_types::BindUrl;

use crate::action::{ControlAction, ControlReply, MAX_REQUEST_LINE};

/// Sender half used by the listener to reach the main loop.
pub type ControlCmdTx = std::sync::mpsc::Sender<(ControlAction, oneshot::Sender<ControlReply>)>;
/// Receiver half drained by the main loop.
pub type ControlCmdRx = std::sync::mpsc::Receiver<(ControlAction, oneshot::Sender<ControlReply>)>;

/// Create a command channel pair.
pub fn control_channel() -> (ControlCmdTx, ControlCmdRx) {
    std::sync::mpsc::channel()
}

/// How long a client may take to send its request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long in-flight replies may take to flush at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ControlServerConfig {
    pub endpoint: BindUrl,
    /// Required token; blank disables the check.
    pub token: String,
}

/// A bound control listener, ready to [`run`].
pub enum ControlListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl ControlListener {
    /// The URL clients should use (resolves TCP port 0).
    pub fn local_url(&self) -> Option<BindUrl> {
        match self {
            ControlListener::Tcp(l) => l.local_addr().ok().map(|a| BindUrl::Tcp(a.to_string())),
            ControlListener::Unix(_, path) => Some(BindUrl::Unix(path.clone())),
        }
    }
}

/// Bind the endpoint and serve until `shutdown` flips to `true`.
pub async fn serve(
    config: ControlServerConfig,
    cmd_tx: ControlCmdTx,
    shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let listener = bind(&config.endpoint).await?;
    run(listener, &config.token, cmd_tx, shutdown).await;
    Ok(())
}

/// Serve an already bound listener until `shutdown` flips to `true`.
pub async fn run(
    listener: ControlListener,
    token: &str,
    cmd_tx: ControlCmdTx,
    mut shutdown: watch::Receiver<bool>,
) {
    let shown = listener
        .local_url()
        .map(|u| u.to_string())
        .unwrap_or_default();
    info!(endpoint = %shown, "control server listening");

    let token: Arc<str> = Arc::from(token);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            accepted = accept(&listener, &token, &cmd_tx) => {
                match accepted {
                    Ok(fut) => {
                        tasks.spawn(fut);
                    }
                    Err(e) => warn!(error = %e, "control accept error"),
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = shutdown.wait_for(|&v| v) => {
                debug!("control server shutting down");
                break;
            }
        }
    }

    // Let replies already in flight (notably `stop`) reach their clients.
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if let ControlListener::Unix(_, path) = &listener {
        let _ = std::fs::remove_file(path);
    }
    info!(endpoint = %shown, "control server stopped");
}

/// Bind the control endpoint. Unix sockets get mode 0600 and replace a stale
/// socket file.
pub async fn bind(endpoint: &BindUrl) -> Result<ControlListener, String> {
    match endpoint {
        BindUrl::Tcp(addr) => TcpListener::bind(addr.as_str())
            .await
            .map(ControlListener::Tcp)
            .map_err(|e| format!("failed to bind control server at {addr}: {e}")),
        BindUrl::Unix(path) => bind_unix(path).map(|l| ControlListener::Unix(l, path.clone())),
    }
}

fn bind_unix(path: &Path) -> Result<UnixListener, String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create socket dir: {e}"))?;
        }
    }

    // Remove stale socket file (ignore NotFound to avoid TOCTOU race)
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(format!("failed to remove stale socket: {e}")),
    }

    let listener = UnixListener::bind(path)
        .map_err(|e| format!("failed to bind control socket at {}: {e}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            warn!(path = %path.display(), error = %e, "failed to set control socket permissions to 0600");
        }
    }
    Ok(listener)
}

type ConnFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

async fn accept(
    listener: &ControlListener,
    token: &Arc<str>,
    cmd_tx: &ControlCmdTx,
) -> std::io::Result<ConnFuture> {
    let token = Arc::clone(token);
    let tx = cmd_tx.clone();
    let fut: ConnFuture = match listener {
        ControlListener::Tcp(l) => {
            let (stream, _) = l.accept().await?;
            Box::pin(async move { log_result(handle_connection(stream, token, tx).await) })
        }
        ControlListener::Unix(l, _) => {
            let (stream, _) = l.accept().await?;
            Box::pin(async move { log_result(handle_connection(stream, token, tx).await) })
        }
    };
    Ok(fut)
}

fn log_result(result: Result<(), String>) {
    if let Err(e) = result {
        debug!(error = %e, "control connection ended");
    }
}

/// Serve one request on an accepted connection.
async fn handle_connection<S>(stream: S, token: Arc<str>, cmd_tx: ControlCmdTx) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    // Cap readable bytes so a line without a newline cannot grow unbounded.
    let mut reader = BufReader::new(reader.take((MAX_REQUEST_LINE * 4) as u64));

    let mut line = String::new();
    let n = tokio::time::timeout(REQUEST_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| "timed out waiting for request".to_string())?
        .map_err(|e| e.to_string())?;
    if n == 0 {
        return Ok(());
    }

    if handler::looks_http(&line) {
        // Consume the header block so closing the socket does not reset the
        // connection under unread data.
        loop {
            let mut header = String::new();
            match tokio::time::timeout(REQUEST_TIMEOUT, reader.read_line(&mut header)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(_)) if header.trim().is_empty() => break,
                Ok(Ok(_)) => {}
            }
        }
    }

    let (reply, http) = handler::handle_request(&line, &token, &cmd_tx).await;
    writer
        .write_all(reply.encode(http).as_bytes())
        .await
        .map_err(|e| e.to_string())?;
    writer.flush().await.map_err(|e| e.to_string())?;
    let _ = writer.shutdown().await;
    Ok(())
}
