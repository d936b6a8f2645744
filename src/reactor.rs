//! Readiness interest flags and the epoll wrapper.
//!
//! [`Poller`] is a thin, always-edge-triggered wrapper over `epoll(7)`:
//! registrations carry a caller-chosen `u64` key that comes back verbatim
//! in every [`PollEvent`]. The [`IoManager`](crate::IoManager) keys its
//! registrations by fd so a readiness report indexes the fd-context table
//! directly.
//!
//! | Operation | Kernel call |
//! |-----------|-------------|
//! | [`Poller::add`] | `epoll_ctl(EPOLL_CTL_ADD)` |
//! | [`Poller::modify`] | `epoll_ctl(EPOLL_CTL_MOD)` |
//! | [`Poller::delete`] | `epoll_ctl(EPOLL_CTL_DEL)` |
//! | [`Poller::wait`] | `epoll_wait` |
//!
//! Edge-triggered discipline: a readiness condition is reported once per
//! transition, so consumers must drain until `EAGAIN` and re-arm by
//! explicit registration.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Interest flags indicating which I/O events to monitor or which fired.
///
/// `READABLE` and `WRITABLE` are registerable; `ERROR` and `HUP` are
/// reported by the kernel regardless of registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// No events.
    pub const NONE: Interest = Interest(0);
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b0001);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b0010);
    /// An error condition was reported.
    pub const ERROR: Interest = Interest(0b0100);
    /// The peer hung up.
    pub const HUP: Interest = Interest(0b1000);

    /// Returns interest in both readable and writable events.
    #[must_use]
    pub const fn both() -> Self {
        Interest(0b0011)
    }

    /// True if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if readable interest is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// True if writable interest is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// True if an error condition is set.
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    /// True if hang-up is set.
    #[must_use]
    pub const fn is_hup(self) -> bool {
        self.0 & Self::HUP.0 != 0
    }

    /// True if every flag in `other` is also set in `self`.
    #[must_use]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }

    /// `self` without the flags in `other`.
    #[must_use]
    pub const fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }

    /// Flags present in both sets.
    #[must_use]
    pub const fn intersect(self, other: Interest) -> Self {
        Interest(self.0 & other.0)
    }

    fn to_epoll(self) -> u32 {
        let mut bits = 0u32;
        if self.is_readable() {
            bits |= libc::EPOLLIN as u32;
        }
        if self.is_writable() {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    fn from_epoll(bits: u32) -> Self {
        let mut interest = Self::NONE;
        if bits & libc::EPOLLIN as u32 != 0 {
            interest = interest.add(Self::READABLE);
        }
        if bits & libc::EPOLLOUT as u32 != 0 {
            interest = interest.add(Self::WRITABLE);
        }
        if bits & libc::EPOLLERR as u32 != 0 {
            interest = interest.add(Self::ERROR);
        }
        if bits & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0 {
            interest = interest.add(Self::HUP);
        }
        interest
    }
}

/// A single readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    /// The key supplied at registration.
    pub key: u64,
    /// Readiness flags that fired.
    pub ready: Interest,
}

/// Reusable buffer for [`Poller::wait`] results.
///
/// Allocate once with the desired capacity and reuse it across waits; the
/// kernel reports at most `capacity` events per wait.
pub struct PollEvents {
    buf: Vec<libc::epoll_event>,
}

impl PollEvents {
    /// Creates a buffer holding up to `capacity` events per wait.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.max(1)),
        }
    }

    /// Number of events from the most recent wait.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if the most recent wait reported nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discards the events from the most recent wait.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Iterates over the reported events.
    pub fn iter(&self) -> impl Iterator<Item = PollEvent> + '_ {
        self.buf.iter().map(|raw| PollEvent {
            key: raw.u64,
            ready: Interest::from_epoll(raw.events),
        })
    }
}

impl std::fmt::Debug for PollEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollEvents")
            .field("len", &self.len())
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}

/// An edge-triggered epoll instance.
pub struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    /// Creates a new epoll instance (close-on-exec).
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall; the returned fd is owned here and nowhere else.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by epoll_create1 and is unowned.
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Registers `fd` for the given interest, edge-triggered.
    pub fn add(&self, fd: RawFd, interest: Interest, key: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, key)
    }

    /// Rewrites the registration of `fd` to the given interest.
    pub fn modify(&self, fd: RawFd, interest: Interest, key: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, key)
    }

    /// Removes the registration of `fd`.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        // SAFETY: epfd and ev are valid; DEL ignores the event argument.
        let rc = unsafe {
            libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut ev)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest, key: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.to_epoll() | libc::EPOLLET as u32,
            u64: key,
        };
        // SAFETY: epfd is a live epoll fd and ev points at a valid event.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks up to `timeout_ms` for readiness, filling `events`.
    ///
    /// A negative timeout blocks indefinitely; zero polls. Returns the
    /// number of events reported. `EINTR` surfaces as
    /// [`io::ErrorKind::Interrupted`]; callers retry.
    pub fn wait(&self, events: &mut PollEvents, timeout_ms: i32) -> io::Result<usize> {
        events.clear();
        let capacity = events.buf.capacity() as libc::c_int;
        // SAFETY: the spare capacity of events.buf is valid for `capacity`
        // epoll_event writes; set_len below only covers what the kernel
        // reported as written.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.buf.as_mut_ptr(),
                capacity,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the kernel initialized the first n entries.
        unsafe { events.buf.set_len(n as usize) };
        Ok(n as usize)
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("epfd", &self.epfd.as_raw_fd())
            .finish()
    }
}
