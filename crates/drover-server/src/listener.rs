//! Listening sockets shared by every process of a server.
//!
//! The master binds each configured URL once. In cluster mode the raw fds are
//! made inheritable and passed to workers through `DROVER_LISTEN_FDS`
//! (`tcp:3,unix:4`), so the listening socket exists continuously while workers
//! come and go.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use drover_types::{BindUrl, DroverError};

/// A bound listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind a listener for `url`. A stale Unix socket file is replaced.
    pub fn bind(url: &BindUrl) -> Result<Self, DroverError> {
        match url {
            BindUrl::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())
                    .map_err(|e| DroverError::Bind(format!("{url}: {e}")))?;
                Ok(Listener::Tcp(listener))
            }
            BindUrl::Unix(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| DroverError::Bind(format!("{url}: {e}")))?;
                    }
                }
                match std::fs::remove_file(path) {
                    Ok(()) => warn!(path = %path.display(), "removed stale socket file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(DroverError::Bind(format!("{url}: {e}"))),
                }
                let listener = UnixListener::bind(path)
                    .map_err(|e| DroverError::Bind(format!("{url}: {e}")))?;
                Ok(Listener::Unix(listener))
            }
        }
    }

    /// The URL this listener is actually bound to (resolves port 0).
    pub fn local_url(&self) -> Option<BindUrl> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok().map(|a| BindUrl::Tcp(a.to_string())),
            Listener::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(Path::to_path_buf))
                .map(BindUrl::Unix),
        }
    }

    /// Filesystem path of a Unix listener.
    pub fn socket_path(&self) -> Option<PathBuf> {
        match self.local_url() {
            Some(BindUrl::Unix(path)) => Some(path),
            _ => None,
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(nonblocking),
            Listener::Unix(l) => l.set_nonblocking(nonblocking),
        }
    }

    /// Accept one connection. The returned stream is always blocking.
    pub fn accept(&self) -> io::Result<Connection> {
        match self {
            Listener::Tcp(l) => {
                let (stream, _) = l.accept()?;
                stream.set_nonblocking(false)?;
                Ok(Connection::Tcp(stream))
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept()?;
                stream.set_nonblocking(false)?;
                Ok(Connection::Unix(stream))
            }
        }
    }

    /// Let child processes inherit this socket across exec.
    pub fn clear_cloexec(&self) -> io::Result<()> {
        let fd = self.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by self.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        match self {
            Listener::Tcp(_) => "tcp",
            Listener::Unix(_) => "unix",
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l) => l.as_raw_fd(),
        }
    }
}

/// Bind every URL, skipping the ones that fail. Errors only if none bound.
pub fn bind_all(urls: &[BindUrl]) -> Result<Vec<Listener>, DroverError> {
    let mut listeners = Vec::with_capacity(urls.len());
    let mut errors = Vec::new();
    for url in urls {
        match Listener::bind(url) {
            Ok(listener) => {
                let shown = listener.local_url().unwrap_or_else(|| url.clone());
                info!(url = %shown, "listening");
                listeners.push(listener);
            }
            Err(e) => {
                warn!(url = %url, error = %e, "failed to bind listener");
                errors.push(e.to_string());
            }
        }
    }
    if listeners.is_empty() {
        return Err(DroverError::Bind(format!(
            "no listener could be bound ({})",
            errors.join("; ")
        )));
    }
    Ok(listeners)
}

/// Encode inheritable listeners for `DROVER_LISTEN_FDS`.
pub fn encode_inherited(listeners: &[Listener]) -> String {
    listeners
        .iter()
        .map(|l| format!("{}:{}", l.kind(), l.as_raw_fd()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Rebuild listeners from a `DROVER_LISTEN_FDS` value.
///
/// # Safety
///
/// Every fd named in `spec` must be an open listening socket of the stated
/// kind that this process owns and nothing else wraps.
pub unsafe fn decode_inherited(spec: &str) -> Result<Vec<Listener>, DroverError> {
    let mut listeners = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (kind, fd) = entry
            .split_once(':')
            .ok_or_else(|| DroverError::Config(format!("invalid listener entry {entry:?}")))?;
        let fd: RawFd = fd
            .parse()
            .map_err(|_| DroverError::Config(format!("invalid listener fd in {entry:?}")))?;
        if fd < 0 {
            return Err(DroverError::Config(format!("invalid listener fd in {entry:?}")));
        }
        let listener = match kind {
            "tcp" => Listener::Tcp(TcpListener::from_raw_fd(fd)),
            "unix" => Listener::Unix(UnixListener::from_raw_fd(fd)),
            other => {
                return Err(DroverError::Config(format!("unknown listener kind {other:?}")))
            }
        };
        listeners.push(listener);
    }
    if listeners.is_empty() {
        return Err(DroverError::Config("no inherited listeners".into()));
    }
    Ok(listeners)
}

/// An accepted client connection.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Connection {
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.set_read_timeout(timeout),
            Connection::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.set_write_timeout(timeout),
            Connection::Unix(s) => s.set_write_timeout(timeout),
        }
    }

    /// Half-close the write side so the peer sees EOF.
    pub fn shutdown_write(&self) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.shutdown(Shutdown::Write),
            Connection::Unix(s) => s.shutdown(Shutdown::Write),
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.read(buf),
            Connection::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.write(buf),
            Connection::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.flush(),
            Connection::Unix(s) => s.flush(),
        }
    }
}
