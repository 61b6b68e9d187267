use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

/// Default permission mode for created socket paths.
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

/// Unix `sockaddr_un.sun_path` is 108 bytes on Linux, 104 on macOS and the BSDs.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

/// Retry policy for connecting to a server that may not be listening yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRetry {
    /// Attempts after the first failed one.
    pub retries: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            retries: 10,
            delay: Duration::from_secs(1),
        }
    }
}

impl ConnectRetry {
    /// Fail on the first refused or missing socket.
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Blocking Unix domain socket listener bound to a filesystem path.
///
/// The socket file is removed on drop, unless something else has replaced it
/// at the same path in the meantime.
pub struct UnixDomainSocket {
    listener: UnixListener,
    owner: SocketFileOwner,
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = DEFAULT_SOCKET_MODE;

    /// Bind and listen on `path`, removing a stale socket left there first.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen on `path` with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = prepare_bind_path(path.as_ref())?;
        let listener = UnixListener::bind(&path).map_err(|e| bind_error(&path, e))?;
        let owner = SocketFileOwner::claim(path, mode)?;
        info!(path = ?owner.path, "listening on unix domain socket");
        Ok(Self { listener, owner })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!("accepted connection");
        Ok(stream)
    }

    /// Connect to a listening socket once (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<UnixStream> {
        Self::connect_with_retry(path, ConnectRetry::none())
    }

    /// Connect, retrying while the socket is missing or refusing connections.
    ///
    /// Any other connect error fails immediately.
    pub fn connect_with_retry(path: impl AsRef<Path>, retry: ConnectRetry) -> Result<UnixStream> {
        let path = path.as_ref();
        let mut retries_left = retry.retries;
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => {
                    debug!(?path, "connected to unix domain socket");
                    return Ok(stream);
                }
                Err(err) if is_not_listening(&err) && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(
                        ?path,
                        retries_left,
                        error = %err,
                        "server not listening yet, retrying connect"
                    );
                    std::thread::sleep(retry.delay);
                }
                Err(err) => {
                    return Err(TransportError::Connect {
                        path: path.to_path_buf(),
                        source: err,
                    })
                }
            }
        }
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.owner.path
    }
}

/// Tokio Unix domain socket listener bound to a filesystem path.
///
/// Same path lifecycle as [`UnixDomainSocket`]. Must be bound from within a
/// tokio runtime.
#[cfg(feature = "async")]
pub struct AsyncUnixSocket {
    listener: tokio::net::UnixListener,
    owner: SocketFileOwner,
}

#[cfg(feature = "async")]
impl AsyncUnixSocket {
    /// Bind and listen on `path`, removing a stale socket left there first.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen on `path` with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = prepare_bind_path(path.as_ref())?;
        let listener =
            tokio::net::UnixListener::bind(&path).map_err(|e| bind_error(&path, e))?;
        let owner = SocketFileOwner::claim(path, mode)?;
        info!(path = ?owner.path, "listening on unix domain socket");
        Ok(Self { listener, owner })
    }

    /// Wait for the next incoming connection.
    pub async fn accept(&self) -> Result<tokio::net::UnixStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        debug!("accepted connection");
        Ok(stream)
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.owner.path
    }
}

/// Identity of a socket file we created, so drop only removes our own.
struct SocketFileOwner {
    path: PathBuf,
    dev: u64,
    ino: u64,
}

impl SocketFileOwner {
    fn claim(path: PathBuf, mode: u32) -> Result<Self> {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| bind_error(&path, e))?;
        let metadata = std::fs::symlink_metadata(&path).map_err(|e| bind_error(&path, e))?;
        Ok(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
            path,
        })
    }
}

impl Drop for SocketFileOwner {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if metadata.file_type().is_socket()
            && metadata.dev() == self.dev
            && metadata.ino() == self.ino
        {
            debug!(path = ?self.path, "cleaning up socket file");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
        }
    }
}

/// Validate `path` and remove a stale socket at it.
///
/// A non-socket file at `path` is an error, never deleted.
fn prepare_bind_path(path: &Path) -> Result<PathBuf> {
    let path = path.to_path_buf();
    let len = path.as_os_str().len();
    if len >= MAX_PATH_LEN {
        return Err(TransportError::PathTooLong {
            path,
            len,
            max: MAX_PATH_LEN,
        });
    }

    match std::fs::symlink_metadata(&path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(|e| bind_error(&path, e))?;
        }
        Ok(_) => {
            return Err(bind_error(
                &path,
                std::io::Error::new(ErrorKind::AlreadyExists, "existing path is not a unix socket"),
            ));
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(bind_error(&path, err)),
    }

    Ok(path)
}

fn bind_error(path: &Path, source: std::io::Error) -> TransportError {
    TransportError::Bind {
        path: path.to_path_buf(),
        source,
    }
}

fn is_not_listening(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn unique_dir(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!(
            "/tmp/smfp-uds-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn bind_accept_connect() {
        let dir = unique_dir("bind");
        let sock_path = dir.join("test.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let path_clone = sock_path.clone();
        let handle = std::thread::spawn(move || {
            let mut client = UnixDomainSocket::connect(&path_clone).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        handle.join().unwrap();

        drop(listener);
        assert!(
            !sock_path.exists(),
            "socket file should be cleaned up on drop"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bind_replaces_stale_socket() {
        let dir = unique_dir("stale");
        let sock_path = dir.join("stale.sock");

        // A bound-then-leaked std listener leaves a socket file behind.
        let stale = UnixListener::bind(&sock_path).unwrap();
        drop(stale);
        assert!(sock_path.exists());

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        assert_eq!(listener.path(), sock_path.as_path());

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = UnixDomainSocket::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn default_permissions_are_owner_only() {
        let dir = unique_dir("perms");
        let sock_path = dir.join("perm.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bind_rejects_existing_regular_file() {
        let dir = unique_dir("regular");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = UnixDomainSocket::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        assert!(sock_path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn drop_keeps_replaced_path() {
        let dir = unique_dir("drop");
        let sock_path = dir.join("drop.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        std::fs::remove_file(&sock_path).unwrap();
        std::fs::write(&sock_path, b"replacement-file").unwrap();

        drop(listener);
        assert!(sock_path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_without_retry_fails_fast() {
        let dir = unique_dir("noretry");
        let sock_path = dir.join("missing.sock");

        let err = UnixDomainSocket::connect(&sock_path).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(err.io_source().map(|e| e.kind()), Some(ErrorKind::NotFound));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_retries_until_listener_appears() {
        let dir = unique_dir("retry");
        let sock_path = dir.join("late.sock");

        let path_clone = sock_path.clone();
        let server = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let listener = UnixDomainSocket::bind(&path_clone).unwrap();
            let _stream = listener.accept().unwrap();
        });

        let retry = ConnectRetry {
            retries: 50,
            delay: Duration::from_millis(20),
        };
        let stream = UnixDomainSocket::connect_with_retry(&sock_path, retry);
        assert!(stream.is_ok());

        server.join().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_bind_accept() {
        use tokio::io::AsyncReadExt;

        let dir = unique_dir("async");
        let sock_path = dir.join("async.sock");
        let listener = AsyncUnixSocket::bind(&sock_path).unwrap();

        let path_clone = sock_path.clone();
        let client = std::thread::spawn(move || {
            let mut stream = UnixDomainSocket::connect(&path_clone).unwrap();
            stream.write_all(b"ping").unwrap();
        });

        let mut stream = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client.join().unwrap();
        drop(listener);
        assert!(!sock_path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
