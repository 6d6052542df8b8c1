//! Unix socket endpoint lifecycle.
//!
//! [`acquire_endpoint`] binds the socket path, listens and applies the
//! permission mode. The returned [`Endpoint`] removes the socket file again
//! when dropped, whether the server returns normally, shuts down on a signal
//! or unwinds from a panic.
//!
//! A path that is already in use is only taken over when it is a socket that
//! nobody is listening on. A live server or a non-socket file at the path is
//! an error.

use socket2::{Domain, SockAddr, Socket, Type};
use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// How to create the endpoint.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub path: PathBuf,
    pub mode: u32,
    pub backlog: u32,
}

/// A bound, listening socket that owns its filesystem entry.
pub struct Endpoint {
    // Declared before `release` so the socket closes before the file is removed.
    listener: UnixListener,
    release: Release,
}

impl Endpoint {
    /// Wait for the next client connection.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.release.path
    }
}

/// Bind and listen at `options.path`.
///
/// Must be called from within a Tokio runtime.
pub fn acquire_endpoint(options: &EndpointOptions) -> Result<Endpoint, EndpointError> {
    let path = options.path.as_path();
    let io_err = |e: io::Error| EndpointError::Io(path.to_path_buf(), e);

    let socket = match bind(path) {
        Ok(socket) => socket,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            reclaim_stale(path)?;
            bind(path).map_err(|e| match e.kind() {
                io::ErrorKind::AddrInUse => EndpointError::Unavailable(path.to_path_buf()),
                _ => io_err(e),
            })?
        }
        Err(e) => return Err(io_err(e)),
    };

    // From here on the file is ours; any failure below removes it again.
    let release = Release::new(path).map_err(io_err)?;

    let backlog = i32::try_from(options.backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).map_err(io_err)?;
    fs::set_permissions(path, Permissions::from_mode(options.mode)).map_err(io_err)?;
    socket.set_nonblocking(true).map_err(io_err)?;

    let listener = UnixListener::from_std(socket.into()).map_err(io_err)?;

    info!(
        path = %path.display(),
        mode = %format!("{:#o}", options.mode),
        backlog = options.backlog,
        "Endpoint acquired"
    );

    Ok(Endpoint { listener, release })
}

fn bind(path: &Path) -> io::Result<Socket> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.bind(&SockAddr::unix(path)?)?;
    Ok(socket)
}

/// Remove a leftover socket file, but only if no server is listening on it.
fn reclaim_stale(path: &Path) -> Result<(), EndpointError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        // Gone already; the retry will tell.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(EndpointError::Io(path.to_path_buf(), e)),
    };

    if !metadata.file_type().is_socket() {
        return Err(EndpointError::NotASocket(path.to_path_buf()));
    }

    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => Err(EndpointError::Unavailable(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            warn!(path = %path.display(), "Removing stale socket");
            match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(EndpointError::Io(path.to_path_buf(), e)),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EndpointError::Io(path.to_path_buf(), e)),
    }
}

/// Removes the socket file on drop, if it is still the one we created.
struct Release {
    path: PathBuf,
    dev: u64,
    ino: u64,
}

impl Release {
    fn new(path: &Path) -> io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        let path = self.path.display();
        match fs::symlink_metadata(&self.path) {
            Ok(metadata) if metadata.dev() == self.dev && metadata.ino() == self.ino => {
                match fs::remove_file(&self.path) {
                    Ok(()) => debug!(path = %path, "Endpoint removed"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %path, error = %e, "Failed to remove endpoint"),
                }
            }
            Ok(_) => warn!(path = %path, "Endpoint was replaced, leaving it in place"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path, error = %e, "Failed to inspect endpoint"),
        }
    }
}

/// Endpoint acquisition errors
#[derive(Debug)]
pub enum EndpointError {
    /// Another live server is listening at the path
    Unavailable(PathBuf),
    /// The path exists and is not a socket
    NotASocket(PathBuf),
    Io(PathBuf, io::Error),
}

impl std::fmt::Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointError::Unavailable(path) => {
                write!(f, "Endpoint '{}' is in use by another server", path.display())
            }
            EndpointError::NotASocket(path) => {
                write!(f, "Endpoint '{}' exists and is not a socket", path.display())
            }
            EndpointError::Io(path, e) => {
                write!(f, "Failed to set up endpoint '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for EndpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EndpointError::Io(_, e) => Some(e),
            _ => None,
        }
    }
}
