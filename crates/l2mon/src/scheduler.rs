//! Cooperative socket scheduler.
//!
//! A registry of file descriptors with per-descriptor read/write
//! interest, multiplexed through `poll(2)`. [`SocketScheduler::run`]
//! blocks until a descriptor is ready or the next timer deadline, fires
//! due timers, then dispatches socket handlers, always in that order
//! within one wake.
//!
//! Handlers run on the scheduler thread and must not block beyond a
//! syscall. They may register or deregister sockets and arm or stop
//! timers while a dispatch pass is in flight: removal only tombstones
//! the entry, and the pass iterates a snapshot taken before the first
//! handler ran.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::timer::TimerWheel;

/// Handler invoked when a registered descriptor becomes ready.
///
/// `readable`/`writable` mirror the poll result filtered through the
/// entry's interest flags. Both false means the descriptor reported an
/// error condition (`POLLERR`/`POLLHUP`/`POLLNVAL`); the owner is
/// expected to discover the details through its next read or write.
pub type SocketHandler = Box<dyn FnMut(bool, bool)>;

/// A registered socket.
///
/// Created by the owner, registered at most once, and removed by the
/// owner before the descriptor is closed.
pub struct SocketEntry {
    fd: RawFd,
    read: Cell<bool>,
    write: Cell<bool>,
    removed: Cell<bool>,
    handler: RefCell<SocketHandler>,
}

impl SocketEntry {
    /// Create an entry for `fd`. Interest flags start cleared.
    pub fn new(fd: RawFd, handler: SocketHandler) -> Rc<Self> {
        Rc::new(Self {
            fd,
            read: Cell::new(false),
            write: Cell::new(false),
            removed: Cell::new(false),
            handler: RefCell::new(handler),
        })
    }

    /// The registered descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Enable or disable read interest. Takes effect on the next wait.
    pub fn set_read(&self, event_read: bool) {
        self.read.set(event_read);
    }

    /// Enable or disable write interest. Takes effect on the next wait.
    pub fn set_write(&self, event_write: bool) {
        self.write.set(event_write);
    }

    /// Replace the handler. Used by owners that need the entry to exist
    /// before the final handler can capture a reference back to them.
    pub fn set_handler(&self, handler: SocketHandler) {
        *self.handler.borrow_mut() = handler;
    }
}

impl std::fmt::Debug for SocketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketEntry")
            .field("fd", &self.fd)
            .field("read", &self.read.get())
            .field("write", &self.write.get())
            .field("removed", &self.removed.get())
            .finish()
    }
}

/// Why [`SocketScheduler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    /// The stop predicate returned true.
    Predicate,
    /// The absolute deadline passed.
    Deadline,
}

/// Registry of socket entries plus the poll loop that drives them.
pub struct SocketScheduler {
    entries: RefCell<Vec<Rc<SocketEntry>>>,
    dispatching: Cell<bool>,
}

impl SocketScheduler {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            dispatching: Cell::new(false),
        }
    }

    /// Register an entry. Re-adding an entry that was removed earlier
    /// (even within the current dispatch pass) revives it.
    pub fn add(&self, entry: &Rc<SocketEntry>) {
        let mut entries = self.entries.borrow_mut();
        if let Some(existing) = entries.iter().find(|e| Rc::ptr_eq(e, entry)) {
            // Still present as a tombstone from an earlier remove.
            existing.removed.set(false);
            return;
        }
        entry.removed.set(false);
        entries.push(entry.clone());
    }

    /// Deregister an entry. Safe to call from within a handler: the
    /// current pass skips tombstoned entries and they are swept after
    /// the pass completes.
    pub fn remove(&self, entry: &Rc<SocketEntry>) {
        entry.removed.set(true);
        if !self.dispatching.get() {
            self.sweep();
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries
            .borrow()
            .iter()
            .filter(|e| !e.removed.get())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self) {
        self.entries.borrow_mut().retain(|e| !e.removed.get());
    }

    /// Drive events until `stop` returns true, `deadline` (absolute ms)
    /// passes, or a fatal poll error occurs.
    pub fn run(
        &self,
        clock: &Clock,
        timers: &TimerWheel,
        mut stop: impl FnMut() -> bool,
        deadline: Option<u64>,
    ) -> Result<Stopped> {
        loop {
            if stop() {
                return Ok(Stopped::Predicate);
            }
            let now = clock.now();
            if let Some(limit) = deadline
                && now >= limit
            {
                return Ok(Stopped::Deadline);
            }

            // Next wakeup: earliest of the timer wheel and the run deadline.
            let mut next = timers.next_deadline();
            if let Some(limit) = deadline {
                next = Some(next.map_or(limit, |n| n.min(limit)));
            }
            let timeout_ms: libc::c_int = match next {
                None => -1,
                Some(n) => n.saturating_sub(now).min(i32::MAX as u64) as libc::c_int,
            };

            let snapshot: Vec<Rc<SocketEntry>> = self
                .entries
                .borrow()
                .iter()
                .filter(|e| !e.removed.get())
                .cloned()
                .collect();

            let mut pollfds: Vec<libc::pollfd> = snapshot
                .iter()
                .map(|e| {
                    let mut events: libc::c_short = 0;
                    if e.read.get() {
                        events |= libc::POLLIN;
                    }
                    if e.write.get() {
                        events |= libc::POLLOUT;
                    }
                    libc::pollfd {
                        fd: e.fd,
                        events,
                        revents: 0,
                    }
                })
                .collect();

            let rc = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    Some(libc::ENOMEM) => {
                        warn!("poll failed transiently: {}", err);
                        continue;
                    }
                    _ => {
                        warn!("poll failed: {}", err);
                        return Err(Error::Io(err));
                    }
                }
            }

            let now = clock.now();
            timers.process(now);

            self.dispatching.set(true);
            for (entry, pfd) in snapshot.iter().zip(pollfds.iter()) {
                if entry.removed.get() {
                    continue;
                }
                let revents = pfd.revents;
                let readable = revents & libc::POLLIN != 0 && entry.read.get();
                let writable = revents & libc::POLLOUT != 0 && entry.write.get();
                let failed =
                    revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
                if readable || writable || failed {
                    if failed && !readable && !writable {
                        debug!(fd = entry.fd, "error condition on socket");
                    }
                    (*entry.handler.borrow_mut())(readable, writable);
                }
            }
            self.dispatching.set(false);
            self.sweep();
        }
    }
}

impl Default for SocketScheduler {
    fn default() -> Self {
        Self::new()
    }
}
