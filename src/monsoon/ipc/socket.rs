// Listening socket bootstrap
//
// Two ways to get the listener: inherit it from a service manager
// that did the bind for us, or bind the well-known filesystem path
// ourselves. Only a socket we bound gets unlinked at shutdown.
extern crate nix;

use crate::monsoon::ServerError;
use utils::log;

use nix::sys::socket::{
    accept, bind, listen, socket, AddressFamily, SockFlag, SockType, UnixAddr,
};
use nix::unistd;

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// listen(2) backlog, which also bounds how many clients can ever
/// be queued at the door
pub const MAX_CLIENTS: usize = 8;

const SOCK_NAME: &str = "monsoon_comp_ipc";

/// Inherited listeners start here by convention: right after
/// stdin/stdout/stderr
const LISTEN_FDS_START: RawFd = 3;

/// The well-known rendezvous path
pub fn default_socket_path() -> PathBuf {
    let runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(runtime).join(SOCK_NAME)
}

/// How many listening fds the service manager handed us
///
/// Zero unless LISTEN_PID names this exact process, per the socket
/// activation convention.
fn inherited_fd_count(pid_var: Option<&str>, fds_var: Option<&str>, my_pid: u32) -> usize {
    let pid = match pid_var.and_then(|p| p.parse::<u32>().ok()) {
        Some(p) => p,
        None => return 0,
    };
    if pid != my_pid {
        return 0;
    }

    fds_var.and_then(|f| f.parse::<usize>().ok()).unwrap_or(0)
}

/// The bound, listening socket
pub struct Listener {
    ls_fd: RawFd,
    /// Set iff we bound the path ourselves and own its lifetime
    ls_path: Option<PathBuf>,
    ls_activated: bool,
}

impl Listener {
    /// Acquire the listening socket
    ///
    /// Prefers a handed-off listener; more than one inherited fd is
    /// a configuration error we refuse to guess our way out of.
    pub fn bootstrap(path_override: Option<PathBuf>) -> Result<Listener, ServerError> {
        let pid_var = std::env::var("LISTEN_PID").ok();
        let fds_var = std::env::var("LISTEN_FDS").ok();
        let count = inherited_fd_count(pid_var.as_deref(), fds_var.as_deref(), std::process::id());

        if count > 1 {
            return Err(ServerError::TooManyInheritedSockets);
        }
        if count == 1 {
            log::info!("got existing socket from the service manager");
            return Ok(Listener {
                ls_fd: LISTEN_FDS_START,
                ls_path: None,
                ls_activated: true,
            });
        }

        let path = path_override.unwrap_or_else(default_socket_path);
        Self::bind_at(&path)
    }

    pub fn bind_at(path: &Path) -> Result<Listener, ServerError> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .map_err(ServerError::ListenerBind)?;

        let addr = match UnixAddr::new(path) {
            Ok(a) => a,
            Err(e) => {
                let _ = unistd::close(fd);
                return Err(ServerError::ListenerBind(e));
            }
        };

        if let Err(e) = bind(fd, &addr) {
            log::error!(
                "could not bind socket to {:?}: is the service already running, or its socket unit active?",
                path
            );
            let _ = unistd::close(fd);
            return Err(ServerError::ListenerBind(e));
        }

        if let Err(e) = listen(fd, MAX_CLIENTS) {
            let _ = unistd::close(fd);
            let _ = unistd::unlink(path);
            return Err(ServerError::ListenerBind(e));
        }

        log::info!("created listening socket at {:?}", path);
        Ok(Listener {
            ls_fd: fd,
            ls_path: Some(path.to_path_buf()),
            ls_activated: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.ls_fd
    }

    /// True when the listener was inherited rather than bound
    pub fn activated(&self) -> bool {
        self.ls_activated
    }

    /// Take one pending connection off the backlog
    pub fn accept(&self) -> Result<RawFd, ServerError> {
        accept(self.ls_fd).map_err(ServerError::Accept)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = unistd::close(self.ls_fd);
        // Unlink only paths we bound. An inherited socket belongs
        // to the service manager.
        if let Some(path) = self.ls_path.take() {
            let _ = unistd::unlink(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_requires_matching_pid() {
        assert_eq!(inherited_fd_count(Some("42"), Some("1"), 42), 1);
        assert_eq!(inherited_fd_count(Some("42"), Some("1"), 43), 0);
        assert_eq!(inherited_fd_count(None, Some("1"), 42), 0);
        assert_eq!(inherited_fd_count(Some("42"), None, 42), 0);
        assert_eq!(inherited_fd_count(Some("garbage"), Some("1"), 42), 0);
    }

    #[test]
    fn activation_reports_every_fd() {
        // Two listeners is the misconfiguration bootstrap must
        // reject, so the count has to come through unclamped
        assert_eq!(inherited_fd_count(Some("7"), Some("2"), 7), 2);
    }

    #[test]
    fn bind_creates_and_drop_unlinks() {
        let path = std::env::temp_dir().join("monsoon_test_bind.sock");
        let _ = std::fs::remove_file(&path);

        {
            let listener = Listener::bind_at(&path).unwrap();
            assert!(!listener.activated());
            assert!(path.exists());

            // A second bind on the same path must fail with a hint
            let err = Listener::bind_at(&path);
            assert!(matches!(err, Err(ServerError::ListenerBind(_))));
        }

        // Dropping the bound listener removed the file
        assert!(!path.exists());
    }
}
