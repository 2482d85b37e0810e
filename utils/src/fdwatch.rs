// Helper class for watching file descriptors
// OS-compatibility layer
extern crate nix;

#[cfg(target_os = "freebsd")]
use nix::sys::event::*;
#[cfg(not(target_os = "freebsd"))]
use nix::sys::epoll::*;

use std::os::unix::io::RawFd;

/// The most events one poll call will report. Anything beyond
/// this is picked up on the next call since polling is
/// level-triggered.
pub const MAX_WATCH_EVENTS: usize = 8;

// =============================================
// epoll version
// =============================================

// A file descriptor watcher
//
// Readiness is reported per-fd so the caller can tell which of
// its descriptors woke it up.
#[cfg(not(target_os = "freebsd"))]
pub struct FdWatch {
    // The epoll fd
    fdw_epoll: RawFd,
    // Fds currently registered
    fdw_fds: Vec<RawFd>,
}

#[cfg(not(target_os = "freebsd"))]
impl FdWatch {
    pub fn new() -> nix::Result<FdWatch> {
        Ok(FdWatch {
            fdw_epoll: epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?,
            fdw_fds: Vec::new(),
        })
    }

    /// Watch fd for readability. The fd is reported back from
    /// `poll_ready` whenever it has data.
    pub fn add_fd(&mut self, fd: RawFd) -> nix::Result<()> {
        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
        epoll_ctl(self.fdw_epoll, EpollOp::EpollCtlAdd, fd, &mut ev)?;
        self.fdw_fds.push(fd);
        Ok(())
    }

    pub fn remove_fd(&mut self, fd: RawFd) -> nix::Result<()> {
        epoll_ctl(self.fdw_epoll, EpollOp::EpollCtlDel, fd, None)?;
        self.fdw_fds.retain(|f| *f != fd);
        Ok(())
    }

    /// Poll all registered fds, waiting at most `timeout_ms`.
    ///
    /// A timeout of zero returns immediately. Level-triggered, so
    /// an fd that is not drained keeps showing up.
    pub fn poll_ready(&mut self, timeout_ms: isize) -> nix::Result<Vec<RawFd>> {
        let mut events = [EpollEvent::empty(); MAX_WATCH_EVENTS];
        let count = epoll_wait(self.fdw_epoll, &mut events, timeout_ms)?;

        Ok(events[..count].iter().map(|ev| ev.data() as RawFd).collect())
    }
}

#[cfg(not(target_os = "freebsd"))]
impl Drop for FdWatch {
    fn drop(&mut self) {
        // The epoll fd is ours to close. The watched fds are not.
        let _ = nix::unistd::close(self.fdw_epoll);
    }
}

// =============================================
// kqueue version
// =============================================

// A file descriptor watcher
#[cfg(target_os = "freebsd")]
pub struct FdWatch {
    // The kqueue fd
    fdw_kq: RawFd,
    fdw_fds: Vec<RawFd>,
}

#[cfg(target_os = "freebsd")]
impl FdWatch {
    // Helper for creating a kevent for reading an fd
    fn read_fd_kevent(fd: RawFd, flags: EventFlag) -> KEvent {
        KEvent::new(
            fd as usize,
            EventFilter::EVFILT_READ,
            flags,
            FilterFlag::empty(),
            0,
            0,
        )
    }

    pub fn new() -> nix::Result<FdWatch> {
        Ok(FdWatch {
            fdw_kq: kqueue()?,
            fdw_fds: Vec::new(),
        })
    }

    pub fn add_fd(&mut self, fd: RawFd) -> nix::Result<()> {
        let changes = [Self::read_fd_kevent(fd, EventFlag::EV_ADD)];
        kevent_ts(self.fdw_kq, &changes, &mut [], None)?;
        self.fdw_fds.push(fd);
        Ok(())
    }

    pub fn remove_fd(&mut self, fd: RawFd) -> nix::Result<()> {
        let changes = [Self::read_fd_kevent(fd, EventFlag::EV_DELETE)];
        kevent_ts(self.fdw_kq, &changes, &mut [], None)?;
        self.fdw_fds.retain(|f| *f != fd);
        Ok(())
    }

    pub fn poll_ready(&mut self, timeout_ms: isize) -> nix::Result<Vec<RawFd>> {
        let mut events = [Self::read_fd_kevent(0, EventFlag::empty()); MAX_WATCH_EVENTS];
        let timeout = nix::sys::time::TimeSpec::from_duration(
            std::time::Duration::from_millis(timeout_ms as u64),
        );
        let count = kevent_ts(self.fdw_kq, &[], &mut events, Some(timeout))?;

        Ok(events[..count].iter().map(|ev| ev.ident() as RawFd).collect())
    }
}

#[cfg(target_os = "freebsd")]
impl Drop for FdWatch {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fdw_kq);
    }
}
