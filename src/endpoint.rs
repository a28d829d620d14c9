//! Pipe names and the pipe factory.
//!
//! A pipe name maps to a Unix domain socket path `<dir>/<name>.sock`.
//! The default directory is per-user under `/tmp`, so names are scoped
//! to the local host (and effectively to the user, via 0600 socket
//! permissions). The server binds listeners here; clients discover an
//! endpoint by polling for its socket file and then connecting.
//!
//! Per-connection pipes take names `<wellKnown>_<n>` in the same
//! directory, so both sides resolve the redirect string identically.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use crate::constants::{CONNECT_TIMEOUT, POLL_INTERVAL};
use crate::error::{Error, Result};

/// Maximum socket path length (`sun_path` is 104 bytes on macOS, 108 on
/// Linux; use the conservative limit).
const MAX_SOCKET_PATH: usize = 104;

/// A named local pipe endpoint.
///
/// Equality of name and directory means equality of endpoint. Cheap to
/// clone; carries no OS resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeName {
    dir: PathBuf,
    name: String,
}

impl PipeName {
    /// A pipe name in the default per-user directory.
    ///
    /// # Errors
    ///
    /// Fails if the resulting socket path would exceed the OS limit.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let uid = unsafe { libc::getuid() };
        Self::in_dir(PathBuf::from(format!("/tmp/pipehub-{uid}")), name)
    }

    /// A pipe name in an explicit directory. Used by tests to isolate
    /// runs, and by applications that manage their own socket dirs.
    ///
    /// # Errors
    ///
    /// Fails if the resulting socket path would exceed the OS limit.
    pub fn in_dir(dir: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self> {
        let pipe = Self {
            dir: dir.into(),
            name: name.into(),
        };
        let path_len = pipe.path().as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            return Err(Error::Lifecycle("socket path exceeds the OS sun_path limit"));
        }
        Ok(pipe)
    }

    /// The bare pipe name (no directory, no extension).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem path of the socket file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.sock", self.name))
    }

    /// The `<name>_<n>` per-connection pipe derived from this one.
    pub fn child(&self, n: u32) -> Result<PipeName> {
        Self::in_dir(self.dir.clone(), format!("{}_{n}", self.name))
    }

    /// Another pipe name in the same directory. Resolves the redirect
    /// string a server sent during the handshake.
    pub fn sibling(&self, name: &str) -> Result<PipeName> {
        Self::in_dir(self.dir.clone(), name)
    }

    /// Non-blocking existence probe.
    pub fn exists(&self) -> bool {
        self.path().exists()
    }
}

/// Bind a listener on `pipe`, replacing any stale socket file.
///
/// Creates the parent directory if needed and applies `mode` to the
/// socket file so strangers cannot connect.
pub(crate) fn bind(pipe: &PipeName, mode: u32) -> Result<UnixListener> {
    let path = pipe.path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    // A socket file from a dead process blocks bind; remove it.
    if path.exists() {
        fs::remove_file(&path)?;
    }
    let listener = UnixListener::bind(&path)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
    log::debug!("[pipe] bound {}", path.display());
    Ok(listener)
}

/// Remove the socket file behind `pipe`, ignoring failures.
pub(crate) fn cleanup(pipe: &PipeName) {
    let _ = fs::remove_file(pipe.path());
}

/// Wait for `pipe` to exist, then connect to it.
///
/// The existence spin probes every [`POLL_INTERVAL`]; with no
/// `deadline` it runs until the name appears or `cancel` goes true.
/// Once the name exists the connect itself is bounded by
/// [`CONNECT_TIMEOUT`] (or the earlier `deadline`), retrying while the
/// listener has not reached accept yet.
pub(crate) fn wait_and_connect(
    pipe: &PipeName,
    deadline: Option<Instant>,
    cancel: &AtomicBool,
) -> Result<UnixStream> {
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Lifecycle("connect cancelled"));
        }
        if pipe.exists() {
            break;
        }
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return Err(Error::ConnectTimeout(pipe.name().to_owned()));
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    let mut connect_deadline = Instant::now() + CONNECT_TIMEOUT;
    if let Some(d) = deadline {
        connect_deadline = connect_deadline.min(d);
    }
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Lifecycle("connect cancelled"));
        }
        match UnixStream::connect(pipe.path()) {
            Ok(stream) => return Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                // The file can vanish (listener shutting down) or refuse
                // (backlog full) between the probe and the connect.
                if Instant::now() >= connect_deadline {
                    return Err(Error::ConnectTimeout(pipe.name().to_owned()));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(Error::Transport(e)),
        }
    }
}

/// Accept exactly one connection, polling so the wait is bounded.
///
/// Used for the data-pipe side of the handshake: the redirected client
/// either arrives before `deadline` or the session is abandoned. The
/// shutdown wake-up also lands here, so the wait must be allowed to
/// complete even while the server is stopping.
pub(crate) fn accept_one(listener: &UnixListener, deadline: Instant) -> Result<UnixStream> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(Error::ConnectTimeout("data pipe accept".to_owned()));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(Error::Transport(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn path_layout() {
        let pipe = PipeName::in_dir("/tmp/x", "chat").unwrap();
        assert_eq!(pipe.name(), "chat");
        assert_eq!(pipe.path(), PathBuf::from("/tmp/x/chat.sock"));
    }

    #[test]
    fn child_and_sibling_share_the_directory() {
        let pipe = PipeName::in_dir("/tmp/x", "chat").unwrap();
        let child = pipe.child(3).unwrap();
        assert_eq!(child.name(), "chat_3");
        assert_eq!(child.path(), PathBuf::from("/tmp/x/chat_3.sock"));
        let sib = pipe.sibling("chat_7").unwrap();
        assert_eq!(sib.path(), PathBuf::from("/tmp/x/chat_7.sock"));
    }

    #[test]
    fn default_dir_is_per_user() {
        let pipe = PipeName::new("chat").unwrap();
        let path = pipe.path().to_string_lossy().into_owned();
        assert!(path.starts_with("/tmp/pipehub-"), "got: {path}");
        assert!(path.ends_with("/chat.sock"), "got: {path}");
    }

    #[test]
    fn overlong_path_rejected() {
        let long = "x".repeat(200);
        assert!(PipeName::in_dir("/tmp", long).is_err());
    }

    #[test]
    fn bind_creates_and_cleanup_removes_the_socket_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pipe = PipeName::in_dir(tmp.path(), "probe").unwrap();
        assert!(!pipe.exists());
        let listener = bind(&pipe, 0o600).unwrap();
        assert!(pipe.exists());
        let mode = fs::metadata(pipe.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        drop(listener);
        cleanup(&pipe);
        assert!(!pipe.exists());
    }

    #[test]
    fn bind_replaces_a_stale_socket_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pipe = PipeName::in_dir(tmp.path(), "stale").unwrap();
        drop(bind(&pipe, 0o600).unwrap());
        // First listener is gone but its file remains; a new bind must win.
        assert!(pipe.exists());
        let second = bind(&pipe, 0o600);
        assert!(second.is_ok());
    }

    #[test]
    fn connect_times_out_when_nothing_listens() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pipe = PipeName::in_dir(tmp.path(), "ghost").unwrap();
        let cancel = AtomicBool::new(false);
        let started = Instant::now();
        let deadline = started + Duration::from_millis(120);
        let err = wait_and_connect(&pipe, Some(deadline), &cancel).unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout(_)), "got: {err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn connect_spin_honors_the_cancel_flag() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pipe = PipeName::in_dir(tmp.path(), "never").unwrap();
        let cancel = AtomicBool::new(true);
        let err = wait_and_connect(&pipe, None, &cancel).unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)), "got: {err}");
    }

    #[test]
    fn connect_reaches_a_live_listener() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pipe = PipeName::in_dir(tmp.path(), "live").unwrap();
        let listener = bind(&pipe, 0o600).unwrap();
        let cancel = AtomicBool::new(false);
        let stream = wait_and_connect(&pipe, None, &cancel).unwrap();
        let accepted = accept_one(&listener, Instant::now() + Duration::from_secs(1));
        assert!(accepted.is_ok());
        drop(stream);
    }

    #[test]
    fn accept_one_gives_up_at_the_deadline() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pipe = PipeName::in_dir(tmp.path(), "lonely").unwrap();
        let listener = bind(&pipe, 0o600).unwrap();
        let err = accept_one(&listener, Instant::now() + Duration::from_millis(80)).unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout(_)), "got: {err}");
    }
}
