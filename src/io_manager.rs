//! The reactor-augmented scheduler.
//!
//! An [`IoManager`] is a [`Scheduler`] whose idle workers, instead of
//! spinning, block in `epoll_wait`. A coroutine that would block on a file
//! descriptor arms a one-shot readiness registration with
//! [`IoManager::add_event`] and yields; when the kernel reports the fd
//! ready, the idle worker converts the event back into a scheduled task and
//! the coroutine resumes where it left off.
//!
//! ```text
//!  worker A                 worker B (idle)            kernel
//!  ────────                 ───────────────            ──────
//!  coroutine reads fd
//!  add_event(fd, Read)  ──► registration (EPOLLET) ──► epoll_ctl
//!  yield
//!                           epoll_wait ◄────────────── fd readable
//!                           trigger: schedule(co)
//!                           yield to dispatcher
//!  resume coroutine ◄────── queue
//! ```
//!
//! # One-shot registrations
//!
//! Registrations are one-shot from the waiter's perspective: triggering an
//! event clears its bit before the waiter runs, and the waiter re-arms if
//! it wants further notifications. Per (fd, event) pair:
//!
//! ```text
//! UNREGISTERED --add_event--> ARMED --trigger------> UNREGISTERED
//!                               \---- del_event ---> (silent)
//!                               \---- cancel_event-> (runs the waiter)
//! ```
//!
//! # The tickle pipe
//!
//! Workers parked in `epoll_wait` cannot see the task queue, so the
//! manager's `tickle` writes one byte into a self-pipe whose read end is
//! registered with the poller; at least one parked worker wakes, drains the
//! pipe, and returns to its dispatch loop.

use crate::coroutine::{Coroutine, State};
use crate::error::Result;
use crate::reactor::{Interest, PollEvent, PollEvents, Poller};
use crate::scheduler::{Scheduler, Task, WaitStrategy};
use parking_lot::{Mutex, RwLock};
use std::io;
use std::ops::Deref;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Initial size of the fd-context table.
const INITIAL_FD_SLOTS: usize = 32;
/// Events buffer capacity for one `epoll_wait` round.
const MAX_EVENTS: usize = 256;
/// Upper bound on one idle wait; timer integration would shorten this.
const MAX_TIMEOUT_MS: i32 = 3000;

/// The two registerable event directions on a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// Readiness for reading.
    Read,
    /// Readiness for writing.
    Write,
}

impl IoEvent {
    fn interest(self) -> Interest {
        match self {
            Self::Read => Interest::READABLE,
            Self::Write => Interest::WRITABLE,
        }
    }
}

/// The wake-up target armed for one event direction.
enum Waiter {
    Coroutine(Arc<Coroutine>),
    Call(crate::coroutine::EntryFn),
}

/// The (scheduler, waiter) pair for one event direction of one fd.
struct EventContext {
    scheduler: Weak<Scheduler>,
    waiter: Option<Waiter>,
}

impl EventContext {
    const fn empty() -> Self {
        Self {
            scheduler: Weak::new(),
            waiter: None,
        }
    }

    fn reset(&mut self) {
        self.scheduler = Weak::new();
        self.waiter = None;
    }
}

struct FdInner {
    /// Union of the directions currently registered with the kernel.
    events: Interest,
    read: EventContext,
    write: EventContext,
}

impl FdInner {
    fn event_context_mut(&mut self, event: IoEvent) -> &mut EventContext {
        match event {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }
}

/// Per-descriptor record binding READ and WRITE waiters to their scheduler.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdInner {
                events: Interest::NONE,
                read: EventContext::empty(),
                write: EventContext::empty(),
            }),
        }
    }
}

/// A scheduler whose idle workers block in the epoll reactor.
///
/// Dereferences to [`Scheduler`], so `schedule`, `stop`, and the counter
/// accessors are available directly on an `IoManager`.
///
/// # Shutdown
///
/// [`Scheduler::stop`] on an `IoManager` returns only once the queue has
/// drained **and** no event registration remains armed; cancel or trigger
/// outstanding events before stopping.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    poller: Poller,
    tickle_reader: OwnedFd,
    tickle_writer: OwnedFd,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Number of armed (fd, event) pairs.
    pending: AtomicUsize,
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl IoManager {
    /// Creates an I/O manager and starts its worker pool.
    ///
    /// See [`Scheduler::new`] for the meaning of `threads` and
    /// `use_caller`. Fails if the epoll instance or the tickle pipe cannot
    /// be created.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Result<Arc<Self>> {
        let poller = Poller::new()?;
        let (tickle_reader, tickle_writer) = tickle_pipe()?;
        poller.add(
            tickle_reader.as_raw_fd(),
            Interest::READABLE,
            tickle_reader.as_raw_fd() as u64,
        )?;

        let scheduler = Scheduler::new(threads, use_caller, name);
        let manager = Arc::new(Self {
            scheduler,
            poller,
            tickle_reader,
            tickle_writer,
            fd_contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
        });
        manager.grow_table(INITIAL_FD_SLOTS);

        let strategy: Weak<dyn WaitStrategy> = Arc::downgrade(&(manager.clone() as Arc<dyn WaitStrategy>));
        manager.scheduler.set_strategy(strategy);
        manager.scheduler.start();
        debug!(name = %manager.scheduler.name(), "io manager started");
        Ok(manager)
    }

    /// Number of armed (fd, event) pairs.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Arms `event` on `fd` with the currently running coroutine as the
    /// wake-up target.
    ///
    /// The coroutine should yield right after arming; it is rescheduled on
    /// its owning scheduler when the event fires. The registration is
    /// one-shot.
    ///
    /// # Panics
    ///
    /// Panics if the event is already registered on this fd.
    pub fn add_event(&self, fd: RawFd, event: IoEvent) -> Result<()> {
        let co = Coroutine::current();
        assert_eq!(
            co.state(),
            State::Running,
            "add_event() caller coroutine must be RUNNING"
        );
        self.arm(fd, event, Waiter::Coroutine(co))
    }

    /// Arms `event` on `fd` with a callable wake-up target.
    ///
    /// # Panics
    ///
    /// Panics if the event is already registered on this fd.
    pub fn add_event_with(
        &self,
        fd: RawFd,
        event: IoEvent,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.arm(fd, event, Waiter::Call(Box::new(f)))
    }

    fn arm(&self, fd: RawFd, event: IoEvent, waiter: Waiter) -> Result<()> {
        let fd_ctx = self.context_for(fd);
        let mut inner = fd_ctx.inner.lock();
        assert!(
            !inner.events.contains(event.interest()),
            "event {event:?} already registered for fd {fd}"
        );

        let first = inner.events.is_empty();
        let new_events = inner.events.add(event.interest());
        let result = if first {
            self.poller.add(fd, new_events, fd as u64)
        } else {
            self.poller.modify(fd, new_events, fd as u64)
        };
        if let Err(e) = result {
            error!(
                fd,
                ?event,
                op = if first { "add" } else { "modify" },
                error = %e,
                "epoll registration failed"
            );
            return Err(e.into());
        }

        self.pending.fetch_add(1, Ordering::Relaxed);
        inner.events = new_events;
        let ctx = inner.event_context_mut(event);
        debug_assert!(ctx.waiter.is_none(), "armed event context not empty");
        ctx.scheduler = Arc::downgrade(&self.owning_scheduler());
        ctx.waiter = Some(waiter);
        trace!(fd, ?event, "event armed");
        Ok(())
    }

    /// Disarms `event` on `fd` without waking its waiter.
    ///
    /// Returns false if the fd is unknown or the event is not registered.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let Some(fd_ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock();
        if !inner.events.contains(event.interest()) {
            return false;
        }

        let remaining = inner.events.remove(event.interest());
        if !self.rewrite_registration(fd, remaining) {
            return false;
        }

        inner.events = remaining;
        inner.event_context_mut(event).reset();
        self.pending.fetch_sub(1, Ordering::Relaxed);
        trace!(fd, ?event, "event deleted");
        true
    }

    /// Disarms `event` on `fd` and wakes its waiter, so the waiter observes
    /// a wake-up rather than silent loss.
    ///
    /// Returns false if the fd is unknown or the event is not registered.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let Some(fd_ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock();
        if !inner.events.contains(event.interest()) {
            return false;
        }

        let remaining = inner.events.remove(event.interest());
        if !self.rewrite_registration(fd, remaining) {
            return false;
        }

        self.trigger_event(fd, &mut inner, event);
        trace!(fd, ?event, "event cancelled");
        true
    }

    /// Disarms every event on `fd`, waking each armed waiter.
    ///
    /// Returns false if the fd is unknown or nothing is registered.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(fd_ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock();
        if inner.events.is_empty() {
            return false;
        }

        if let Err(e) = self.poller.delete(fd) {
            error!(fd, error = %e, "epoll deregistration failed");
            return false;
        }

        if inner.events.is_readable() {
            self.trigger_event(fd, &mut inner, IoEvent::Read);
        }
        if inner.events.is_writable() {
            self.trigger_event(fd, &mut inner, IoEvent::Write);
        }
        debug_assert!(inner.events.is_empty());
        trace!(fd, "all events cancelled");
        true
    }

    /// Rewrites the kernel registration after removing a direction:
    /// modify when bits remain, delete otherwise.
    fn rewrite_registration(&self, fd: RawFd, remaining: Interest) -> bool {
        let result = if remaining.is_empty() {
            self.poller.delete(fd)
        } else {
            self.poller.modify(fd, remaining, fd as u64)
        };
        if let Err(e) = result {
            error!(fd, error = %e, "epoll rewrite failed");
            return false;
        }
        true
    }

    /// Converts one armed event into a scheduled task. The event bit must
    /// be set; it is cleared here, making registrations one-shot.
    fn trigger_event(&self, fd: RawFd, inner: &mut FdInner, event: IoEvent) {
        assert!(
            inner.events.contains(event.interest()),
            "triggered event {event:?} is not registered for fd {fd}"
        );
        inner.events = inner.events.remove(event.interest());

        let ctx = inner.event_context_mut(event);
        let scheduler = ctx.scheduler.upgrade();
        let waiter = ctx.waiter.take();
        ctx.reset();
        self.pending.fetch_sub(1, Ordering::Relaxed);

        match (scheduler, waiter) {
            (Some(s), Some(Waiter::Coroutine(co))) => s.schedule(Task::coroutine(co)),
            (Some(s), Some(Waiter::Call(f))) => s.schedule(Task::call_boxed(f)),
            _ => warn!(fd, ?event, "armed waiter lost its scheduler"),
        }
    }

    /// The scheduler wake-ups should land on: the calling thread's, or this
    /// manager's own when the caller is not a worker.
    fn owning_scheduler(&self) -> Arc<Scheduler> {
        Scheduler::current().unwrap_or_else(|| self.scheduler.clone())
    }

    /// Fd-context lookup with monotonic growth to 1.5 × fd.
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        let index = fd as usize;
        {
            let table = self.fd_contexts.read();
            if index < table.len() {
                return table[index].clone();
            }
        }
        self.grow_table((index * 3 / 2).max(index + 1));
        self.fd_contexts.read()[index].clone()
    }

    /// Fd-context lookup without growth.
    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.fd_contexts.read().get(fd as usize).cloned()
    }

    fn grow_table(&self, to: usize) {
        let mut table = self.fd_contexts.write();
        while table.len() < to {
            let next_fd = table.len() as RawFd;
            table.push(Arc::new(FdContext::new(next_fd)));
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            // SAFETY: buf is a live, writable buffer of the stated length.
            let n = unsafe {
                libc::read(
                    self.tickle_reader.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if n > 0 {
                continue;
            }
            if n == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => {
                    error!(error = %err, "tickle pipe drain failed");
                    break;
                }
            }
        }
    }

    /// Handles one readiness report from the poller.
    fn dispatch_ready(&self, event: PollEvent) {
        if event.key == self.tickle_reader.as_raw_fd() as u64 {
            trace!("tickled");
            self.drain_tickle();
            return;
        }

        let fd = event.key as RawFd;
        let Some(fd_ctx) = self.lookup(fd) else {
            return;
        };
        let mut inner = fd_ctx.inner.lock();

        // Error or hang-up wakes both directions so waiters can observe the
        // failure through their own I/O calls.
        let mut ready = event.ready;
        if ready.is_error() || ready.is_hup() {
            ready = ready.add(Interest::both());
        }
        let fired = ready.intersect(inner.events);
        if fired.is_empty() {
            return;
        }

        let remaining = inner.events.remove(fired);
        if !self.rewrite_registration(fd, remaining) {
            return;
        }

        if fired.is_readable() {
            self.trigger_event(fd, &mut inner, IoEvent::Read);
        }
        if fired.is_writable() {
            self.trigger_event(fd, &mut inner, IoEvent::Write);
        }
        debug_assert_eq!(inner.events, remaining);
    }
}

impl WaitStrategy for IoManager {
    /// Wakes a parked worker by writing one byte into the tickle pipe.
    fn tickle(&self) {
        if self.scheduler.idle_workers() == 0 {
            return;
        }
        let byte = [b'T'];
        // SAFETY: writing one byte from a live buffer into an owned fd.
        let n = unsafe { libc::write(self.tickle_writer.as_raw_fd(), byte.as_ptr().cast(), 1) };
        assert_eq!(
            n,
            1,
            "tickle pipe write failed: {}",
            io::Error::last_os_error()
        );
    }

    fn stopping(&self) -> bool {
        self.pending.load(Ordering::Relaxed) == 0 && self.scheduler.base_stopping()
    }

    /// The reactor-driven idle loop: wait for readiness, drain the tickle
    /// pipe, convert events into scheduled tasks, and yield back to the
    /// dispatcher once per round.
    fn idle(&self) {
        debug!(name = %self.scheduler.name(), "idle");
        let mut events = PollEvents::with_capacity(MAX_EVENTS);
        loop {
            if WaitStrategy::stopping(self) {
                debug!(name = %self.scheduler.name(), "idle loop exiting");
                break;
            }

            match self.poller.wait(&mut events, MAX_TIMEOUT_MS) {
                Ok(n) => trace!(events = n, "epoll_wait returned"),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "epoll_wait failed");
                    break;
                }
            }
            for event in events.iter() {
                self.dispatch_ready(event);
            }

            // Hand the newly scheduled tasks to the dispatch loop.
            Coroutine::yield_now();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        debug_assert_eq!(self.pending_events(), 0, "io manager dropped with armed events");
        // The scheduler's Drop asserts it was stopped; the poller and pipe
        // fds close with their OwnedFd fields.
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("pending_events", &self.pending_events())
            .field("fd_slots", &self.fd_contexts.read().len())
            .finish_non_exhaustive()
    }
}

/// Creates the tickle pipe: read end non-blocking, both ends owned.
fn tickle_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds is a valid two-element buffer.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both fds were just created and are unowned.
    let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    // SAFETY: fcntl on an owned, live fd.
    let flags = unsafe { libc::fcntl(reader.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(reader.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((reader, writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    /// Opt-in log capture: run tests with `RUST_LOG=corio=trace` to see the
    /// reactor's decisions.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn manager(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        init_tracing();
        IoManager::new(threads, use_caller, name).expect("manager")
    }

    fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn pipe_read_wakes_a_callable() {
        let io = manager(1, true, "io-callable");
        let (mut tx, rx) = UnixStream::pair().expect("pair");
        let recorded = Arc::new(StdMutex::new(Vec::new()));

        let r = recorded.clone();
        let mut rx_inner = rx.try_clone().expect("clone");
        io.add_event_with(rx.as_raw_fd(), IoEvent::Read, move || {
            let mut buf = [0u8; 1];
            rx_inner.read_exact(&mut buf).expect("read");
            r.lock().unwrap().push(buf[0]);
        })
        .expect("add_event_with");
        assert_eq!(io.pending_events(), 1);

        tx.write_all(b"x").expect("write");
        io.stop();

        assert_eq!(*recorded.lock().unwrap(), vec![b'x']);
        assert_eq!(io.pending_events(), 0);
    }

    #[test]
    fn coroutine_waiter_resumes_after_readiness() {
        let io = manager(1, false, "io-coro");
        let (mut tx, rx) = UnixStream::pair().expect("pair");
        let (done_tx, done_rx) = mpsc::channel();

        let mgr = io.clone();
        let mut rx_inner = rx.try_clone().expect("clone");
        let raw = rx.as_raw_fd();
        io.schedule(Task::call(move || {
            mgr.add_event(raw, IoEvent::Read).expect("add_event");
            Coroutine::yield_now();
            // Resumed by the reactor: one byte is waiting.
            let mut buf = [0u8; 1];
            rx_inner.read_exact(&mut buf).expect("read");
            done_tx.send(buf[0]).expect("send");
        }));

        std::thread::sleep(Duration::from_millis(20));
        tx.write_all(b"z").expect("write");

        let got = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("coroutine never woke");
        assert_eq!(got, b'z');
        io.stop();
        assert_eq!(io.pending_events(), 0);
    }

    #[test]
    fn tickle_wakes_an_idle_worker() {
        let io = manager(2, false, "io-tickle");
        assert!(
            wait_for(Duration::from_secs(5), || io.idle_workers() == 2),
            "workers never went idle"
        );

        let (done_tx, done_rx) = mpsc::channel();
        io.schedule(Task::call(move || {
            done_tx.send(()).expect("send");
        }));
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("task never ran");
        io.stop();
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_arm_panics() {
        let io = manager(1, false, "io-double");
        let (_tx, rx) = UnixStream::pair().expect("pair");
        let raw = rx.as_raw_fd();
        let armed = io.add_event_with(raw, IoEvent::Read, || {});
        assert!(armed.is_ok());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            io.add_event_with(raw, IoEvent::Read, || {})
        }));

        // Kernel state is untouched by the failed arm: the other direction
        // still registers cleanly.
        assert!(io.add_event_with(raw, IoEvent::Write, || {}).is_ok());

        // The WRITE side fires on its own (a fresh socket is writable); the
        // READ side never will, so cancel it before shutting down.
        let _ = io.cancel_event(raw, IoEvent::Read);
        assert!(
            wait_for(Duration::from_secs(5), || io.pending_events() == 0),
            "armed waiters never drained"
        );
        io.stop();

        std::panic::resume_unwind(result.expect_err("second arm did not panic"));
    }

    #[test]
    fn del_event_suppresses_the_wakeup() {
        let io = manager(1, false, "io-del");
        let (mut tx, rx) = UnixStream::pair().expect("pair");
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        io.add_event_with(rx.as_raw_fd(), IoEvent::Read, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .expect("arm");
        assert_eq!(io.pending_events(), 1);

        assert!(io.del_event(rx.as_raw_fd(), IoEvent::Read));
        assert_eq!(io.pending_events(), 0);

        tx.write_all(b"!").expect("write");
        std::thread::sleep(Duration::from_millis(50));
        io.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn del_event_on_unknown_fd_or_event_is_false() {
        let io = manager(1, false, "io-del-miss");
        let (_tx, rx) = UnixStream::pair().expect("pair");
        assert!(!io.del_event(9999, IoEvent::Read));
        assert!(!io.del_event(rx.as_raw_fd(), IoEvent::Write));
        io.stop();
    }

    #[test]
    fn cancel_event_runs_the_waiter_without_io() {
        let io = manager(1, false, "io-cancel");
        let (_tx, rx) = UnixStream::pair().expect("pair");
        let (done_tx, done_rx) = mpsc::channel();

        io.add_event_with(rx.as_raw_fd(), IoEvent::Read, move || {
            done_tx.send(()).expect("send");
        })
        .expect("arm");

        assert!(io.cancel_event(rx.as_raw_fd(), IoEvent::Read));
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("cancelled waiter never ran");
        assert_eq!(io.pending_events(), 0);
        io.stop();
    }

    #[test]
    fn cancel_all_wakes_both_directions() {
        let io = manager(1, true, "io-cancel-all");
        let (_tx, rx) = UnixStream::pair().expect("pair");
        let hits = Arc::new(AtomicUsize::new(0));

        // No spawned workers (use-caller, one thread): nothing can trigger
        // the armed events behind our back before cancel_all runs.
        let (h1, h2) = (hits.clone(), hits.clone());
        io.add_event_with(rx.as_raw_fd(), IoEvent::Read, move || {
            h1.fetch_add(1, Ordering::SeqCst);
        })
        .expect("arm read");
        io.add_event_with(rx.as_raw_fd(), IoEvent::Write, move || {
            h2.fetch_add(1, Ordering::SeqCst);
        })
        .expect("arm write");
        assert_eq!(io.pending_events(), 2);

        assert!(io.cancel_all(rx.as_raw_fd()));
        assert_eq!(io.pending_events(), 0);
        io.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rearm_after_trigger_succeeds() {
        let io = manager(1, false, "io-rearm");
        let (mut tx, rx) = UnixStream::pair().expect("pair");
        let raw = rx.as_raw_fd();

        for round in 0..2u8 {
            let (done_tx, done_rx) = mpsc::channel();
            let mut rx_inner = rx.try_clone().expect("clone");
            io.add_event_with(raw, IoEvent::Read, move || {
                let mut buf = [0u8; 1];
                rx_inner.read_exact(&mut buf).expect("read");
                done_tx.send(buf[0]).expect("send");
            })
            .expect("arm");

            tx.write_all(&[round]).expect("write");
            let got = done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("waiter never ran");
            assert_eq!(got, round);
        }
        io.stop();
        assert_eq!(io.pending_events(), 0);
    }

    #[test]
    fn fd_table_grows_monotonically() {
        let io = manager(1, false, "io-grow");
        let before = io.fd_contexts.read().len();
        assert_eq!(before, INITIAL_FD_SLOTS);

        // Force growth past the initial table without registering anything.
        let slot = io.context_for(100);
        assert_eq!(slot.fd, 100);
        let after = io.fd_contexts.read().len();
        assert!(after > 100);
        assert!(after >= before);
        io.stop();
    }

    #[test]
    fn use_caller_single_thread_round_trip() {
        let io = manager(1, true, "io-caller");
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        io.schedule(Task::call(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        io.stop();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
