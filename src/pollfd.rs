//! The poll-fd set (C5): the file descriptors the backend wants multiplexed,
//! plus the add/remove notification hooks a host event loop can hang off of.

use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::backend::PollFdSink;

bitflags! {
    /// Readable/writable interest for a single fd, mirroring `POLLIN`/`POLLOUT`.
    pub struct PollEvents: i16 {
        const READABLE = libc::POLLIN;
        const WRITABLE = libc::POLLOUT;
    }
}

/// A single (fd, interest) pair contributed by the backend.
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: RawFd,
    pub events: PollEvents,
}

type AddedCb = Box<dyn Fn(RawFd, PollEvents) + Send + Sync>;
type RemovedCb = Box<dyn Fn(RawFd) + Send + Sync>;

struct Notifiers {
    added: Option<AddedCb>,
    removed: Option<RemovedCb>,
}

/// Owns the live set of poll fds for one [`crate::Context`].
///
/// The canonical usage pattern drives `poll` from a single thread, but the
/// set itself is guarded by a mutex so a backend's `open`/`close` can
/// register fds from a different thread without racing that loop.
pub(crate) struct PollFdSet {
    fds: Mutex<Vec<PollFd>>,
    notifiers: Mutex<Notifiers>,
}

impl PollFdSet {
    pub(crate) fn new() -> Self {
        PollFdSet {
            fds: Mutex::new(Vec::new()),
            notifiers: Mutex::new(Notifiers {
                added: None,
                removed: None,
            }),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<PollFd> {
        self.fds.lock().unwrap().clone()
    }

    pub(crate) fn set_notifiers(
        &self,
        added: Option<AddedCb>,
        removed: Option<RemovedCb>,
    ) {
        let mut n = self.notifiers.lock().unwrap();
        n.added = added;
        n.removed = removed;
    }
}

impl PollFdSink for PollFdSet {
    fn add(&self, fd: RawFd, events: PollEvents) {
        log::debug!("add pollfd {} events {:?}", fd, events);
        self.fds.lock().unwrap().push(PollFd { fd, events });
        if let Some(cb) = &self.notifiers.lock().unwrap().added {
            cb(fd, events);
        }
    }

    fn remove(&self, fd: RawFd) {
        log::debug!("remove pollfd {}", fd);
        let mut fds = self.fds.lock().unwrap();
        if let Some(pos) = fds.iter().position(|p| p.fd == fd) {
            fds.remove(pos);
        } else {
            log::error!("couldn't find fd {} to remove", fd);
            return;
        }
        drop(fds);
        if let Some(cb) = &self.notifiers.lock().unwrap().removed {
            cb(fd);
        }
    }
}
