//! # The ipc subsystem
//!
//! Everything that faces the client processes: the listening
//! socket, the readiness poller the main loop ticks, the framed
//! wire codec and the per-client session worker.
//!
//! The main loop never blocks in here. Polling is level-triggered
//! with a zero timeout and connection servicing happens on the
//! session's worker thread, so compositor pacing stays in the
//! hands of the frame loop.

pub mod proto;
pub mod session;
pub mod socket;

use crate::monsoon::ServerError;
use utils::fdwatch::FdWatch;
use utils::log;

use std::os::unix::io::RawFd;

/// What a poll tick observed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// Somebody new at the door
    NewConnection,
    /// The operator typed at us or closed our stdin
    ShutdownRequested,
    /// The poller itself failed
    Error(nix::errno::Errno),
}

/// Level-triggered readiness multiplexer over the listener and,
/// when we own the terminal, stdin
pub struct EventPoller {
    ep_watch: FdWatch,
    ep_listener: RawFd,
}

impl EventPoller {
    /// Create the poller and register its fds. Stdin is only
    /// watched when the process was started by hand; a service
    /// manager's stdin is not ours to read.
    pub fn new(listener: RawFd, watch_stdin: bool) -> Result<EventPoller, ServerError> {
        let mut watch = FdWatch::new().map_err(ServerError::PollerInit)?;
        watch.add_fd(listener).map_err(ServerError::PollerInit)?;
        if watch_stdin {
            watch.add_fd(0).map_err(ServerError::PollerInit)?;
        }

        Ok(EventPoller {
            ep_watch: watch,
            ep_listener: listener,
        })
    }

    /// One zero-timeout poll. Call once per main loop iteration.
    pub fn poll(&mut self) -> Vec<Event> {
        let ready = match self.ep_watch.poll_ready(0) {
            Ok(fds) => fds,
            Err(e) => {
                log::error!("poll failed: {}", e);
                return vec![Event::Error(e)];
            }
        };

        ready
            .iter()
            .filter_map(|fd| {
                if *fd == self.ep_listener {
                    Some(Event::NewConnection)
                } else if *fd == 0 {
                    // Any stdin activity, including EOF, means quit
                    Some(Event::ShutdownRequested)
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn quiet_listener_reports_nothing() {
        let path = std::env::temp_dir().join("monsoon_test_poller_quiet.sock");
        let _ = std::fs::remove_file(&path);
        let listener = socket::Listener::bind_at(&path).unwrap();

        let mut poller = EventPoller::new(listener.fd(), false).unwrap();
        assert!(poller.poll().is_empty());
    }

    #[test]
    fn pending_connection_reports_new_connection() {
        let path = std::env::temp_dir().join("monsoon_test_poller_conn.sock");
        let _ = std::fs::remove_file(&path);
        let listener = socket::Listener::bind_at(&path).unwrap();
        let mut poller = EventPoller::new(listener.fd(), false).unwrap();

        let _client = UnixStream::connect(&path).unwrap();
        let events = poller.poll();
        assert_eq!(events, vec![Event::NewConnection]);

        // Level-triggered: the connection is still pending until
        // accepted
        assert_eq!(poller.poll(), vec![Event::NewConnection]);

        let fd = listener.accept().unwrap();
        assert!(poller.poll().is_empty());
        let _ = nix::unistd::close(fd);
    }

}
