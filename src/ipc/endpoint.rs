//! Named Unix datagram endpoints.

use crate::error::{Error, Result};
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// State of a well-known endpoint path, as seen by [`probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// A socket is bound at the path.
    Live,
    /// The path exists but nothing is bound to it (left by a dead process).
    Stale,
    /// Nothing exists at the path.
    Absent,
}

/// Check whether a datagram socket is bound at `path`.
pub fn probe(path: &Path) -> Result<Probe> {
    let socket = UnixDatagram::unbound()?;
    match socket.connect(path) {
        Ok(()) => Ok(Probe::Live),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(Probe::Stale),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Probe::Absent),
        Err(e) => Err(e.into()),
    }
}

/// Map a socket I/O error to the broker's transport taxonomy.
pub(crate) fn transport_error(op: &str, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Transport(format!("{op}: {e}")),
    }
}

/// Device and inode of a filesystem entry.
type FileId = (u64, u64);

fn file_id(path: &Path) -> rustix::io::Result<FileId> {
    let stat = rustix::fs::stat(path)?;
    Ok((stat.st_dev as u64, stat.st_ino as u64))
}

/// A datagram socket bound to a filesystem path.
///
/// The path is unlinked when the endpoint is dropped, provided it still
/// refers to the socket this endpoint bound.
#[derive(Debug)]
pub struct Endpoint {
    socket: UnixDatagram,
    path: PathBuf,
    file: FileId,
}

impl Endpoint {
    /// Bind at `path`. Fails if the path already exists.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let socket = UnixDatagram::bind(&path)
            .map_err(|e| Error::Transport(format!("bind {}: {}", path.display(), e)))?;
        let file = file_id(&path)?;
        Ok(Self { socket, path, file })
    }

    /// Bind at `path`, first removing a stale socket file left by a dead
    /// process.
    ///
    /// Fails with [`Error::EndpointInUse`] if a live socket is bound there.
    pub fn bind_reclaiming(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match probe(path)? {
            Probe::Live => return Err(Error::EndpointInUse(path.display().to_string())),
            Probe::Stale => {
                std::fs::remove_file(path)?;
                tracing::debug!(path = %path.display(), "removed stale endpoint");
            }
            Probe::Absent => {}
        }
        Self::bind(path)
    }

    /// The bound path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying socket.
    pub fn socket(&self) -> &UnixDatagram {
        &self.socket
    }

    /// Bound receive waits. `None` blocks indefinitely.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Send one datagram to the endpoint at `peer`.
    pub fn send_to(&self, payload: &[u8], peer: &Path) -> Result<()> {
        let sent = self
            .socket
            .send_to(payload, peer)
            .map_err(|e| transport_error("send", e))?;
        if sent != payload.len() {
            return Err(Error::Transport(format!(
                "short send: {} of {} bytes",
                sent,
                payload.len()
            )));
        }
        Ok(())
    }

    /// Receive one datagram, returning its length and the sender's path if it
    /// has one.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<PathBuf>)> {
        let (len, addr) = self
            .socket
            .recv_from(buf)
            .map_err(|e| transport_error("recv", e))?;
        Ok((len, addr.as_pathname().map(Path::to_path_buf)))
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        match file_id(&self.path) {
            Ok(file) if file == self.file => {}
            Ok(_) => {
                tracing::debug!(path = %self.path.display(), "endpoint path taken over, not unlinking");
                return;
            }
            Err(e) if e == rustix::io::Errno::NOENT => return,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "failed to stat endpoint: {}", e);
                return;
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "failed to unlink endpoint: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_recv_with_source_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = Endpoint::bind(dir.path().join("a.sock")).unwrap();
        let b = Endpoint::bind(dir.path().join("b.sock")).unwrap();

        a.send_to(b"ping", b.path()).unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from.as_deref(), Some(a.path()));
    }

    #[test]
    fn test_probe_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.sock");
        assert_eq!(probe(&path).unwrap(), Probe::Absent);

        let endpoint = Endpoint::bind(&path).unwrap();
        assert_eq!(probe(&path).unwrap(), Probe::Live);
        drop(endpoint);
        assert_eq!(probe(&path).unwrap(), Probe::Absent);

        // A plain socket leaves its file behind when closed.
        drop(UnixDatagram::bind(&path).unwrap());
        assert_eq!(probe(&path).unwrap(), Probe::Stale);
    }

    #[test]
    fn test_bind_existing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.sock");
        let first = Endpoint::bind(&path).unwrap();
        assert!(Endpoint::bind(&path).is_err());
        drop(first);
        assert!(!path.exists());
    }

    #[test]
    fn test_reclaiming_refuses_live_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let live = Endpoint::bind(&path).unwrap();
        assert!(matches!(
            Endpoint::bind_reclaiming(&path),
            Err(Error::EndpointInUse(_))
        ));
        assert_eq!(probe(live.path()).unwrap(), Probe::Live);
    }

    #[test]
    fn test_reclaiming_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(UnixDatagram::bind(&path).unwrap());
        let reclaimed = Endpoint::bind_reclaiming(&path).unwrap();
        assert_eq!(probe(reclaimed.path()).unwrap(), Probe::Live);

        let fresh = Endpoint::bind_reclaiming(dir.path().join("fresh.sock")).unwrap();
        assert!(fresh.path().exists());
    }

    #[test]
    fn test_drop_leaves_foreign_socket_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.sock");
        let old = Endpoint::bind(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let new = Endpoint::bind(&path).unwrap();

        drop(old);
        assert!(path.exists());
        assert_eq!(probe(new.path()).unwrap(), Probe::Live);
        drop(new);
        assert!(!path.exists());
    }

    #[test]
    fn test_recv_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::bind(dir.path().join("t.sock")).unwrap();
        endpoint
            .set_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(endpoint.recv_from(&mut buf), Err(Error::Timeout)));
    }
}
