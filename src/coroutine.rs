//! The stackful coroutine primitive.
//!
//! A [`Coroutine`] is a resumable computation with its own stack,
//! cooperatively scheduled: it runs until it calls [`Coroutine::yield_now`]
//! or its entry function returns, at which point control transfers back to
//! whoever resumed it.
//!
//! # Thread-local slots
//!
//! Every OS thread carries three slots:
//!
//! - **current**: the coroutine presently on the CPU;
//! - **main**: the coroutine representing the thread's native stack,
//!   synthesized lazily by [`Coroutine::current`]; it never leaves the
//!   thread and is only ever [`State::Running`];
//! - **dispatcher**: set by a scheduler worker; the coroutine running the
//!   dispatch loop on this thread.
//!
//! # Swap discipline
//!
//! `resume` saves the resumer's context into the *swap target* and restores
//! the resumed coroutine; `yield_now` does the inverse. The swap target is
//! the thread's dispatcher coroutine for scheduler-owned coroutines, and
//! the thread's main coroutine otherwise, in particular for the root
//! dispatcher of a use-caller scheduler, which must hand control back to
//! the thread that called [`Scheduler::stop`](crate::Scheduler::stop).
//!
//! # States
//!
//! ```text
//!           resume                entry returns
//!   READY ──────────▶ RUNNING ─────────────────▶ TERM ──reset──▶ READY
//!     ▲                  │
//!     └────── yield ─────┘
//! ```
//!
//! There is no distinct initial or suspended state: a coroutine that is not
//! running and not finished is READY. A coroutine with an owned stack may
//! only be dropped in TERM.

use crate::config;
use crate::context::Context;
use crate::error::Result;
use crate::stack::Stack;
use parking_lot::Mutex;
use std::cell::{RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, trace};

/// Entry function stored in a coroutine.
pub(crate) type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// Execution state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Runnable: newly created, reset, or yielded.
    Ready = 0,
    /// On the CPU of some thread.
    Running = 1,
    /// Entry function has returned.
    Term = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Term,
            _ => unreachable!("invalid coroutine state {v}"),
        }
    }
}

/// Process-wide id source; ids are never reused.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);
/// Live coroutine count, mains included.
static LIVE: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
    static MAIN: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
    static DISPATCHER: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
}

/// Installs the dispatcher coroutine slot for this thread.
pub(crate) fn set_dispatcher(co: Arc<Coroutine>) {
    DISPATCHER.with(|d| *d.borrow_mut() = Some(co));
}

/// Clears the dispatcher coroutine slot for this thread.
pub(crate) fn clear_dispatcher() {
    DISPATCHER.with(|d| *d.borrow_mut() = None);
}

/// Returns this thread's dispatcher coroutine, if a worker installed one.
pub(crate) fn dispatcher() -> Option<Arc<Coroutine>> {
    DISPATCHER.with(|d| d.borrow().clone())
}

/// A stackful coroutine.
///
/// Handles are reference counted (`Arc`); the runtime holds one for a
/// queued task, one in the thread-local current slot while running, and
/// one per armed I/O event context.
pub struct Coroutine {
    /// Unique, monotonically assigned, never reused.
    id: u64,
    state: AtomicU8,
    /// Back-reference to the owning `Arc`, so `resume` can install a handle
    /// to itself in the current slot.
    self_ref: Weak<Coroutine>,
    /// `None` exactly for a thread's main coroutine.
    stack: Option<Stack>,
    ctx: UnsafeCell<Context>,
    entry: Mutex<Option<EntryFn>>,
    /// Swap against the thread's dispatcher coroutine rather than its main
    /// coroutine. False for main coroutines and for a scheduler's root
    /// dispatcher.
    yield_to_dispatcher: bool,
}

// SAFETY: `ctx` is only read or written by the thread that currently runs
// or resumes the coroutine; the READY->RUNNING CAS in `resume` serializes
// claimants. All other fields are atomics or lock-protected.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    fn next_id() -> u64 {
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Synthesizes the main coroutine for the calling thread.
    fn new_main() -> Arc<Self> {
        let co = Arc::new_cyclic(|weak| Self {
            id: Self::next_id(),
            state: AtomicU8::new(State::Running as u8),
            self_ref: weak.clone(),
            stack: None,
            ctx: UnsafeCell::new(Context::empty()),
            entry: Mutex::new(None),
            yield_to_dispatcher: false,
        });
        LIVE.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the coroutine was just created on this thread; no other
        // thread can reach its context yet.
        unsafe { (*co.ctx.get()).capture() };
        trace!(id = co.id, "main coroutine created");
        co
    }

    /// Ensures the calling thread has a main coroutine, returning it.
    fn ensure_main() -> Arc<Self> {
        if let Some(main) = MAIN.with(|m| m.borrow().clone()) {
            return main;
        }
        let main = Self::new_main();
        MAIN.with(|m| *m.borrow_mut() = Some(main.clone()));
        CURRENT.with(|c| {
            let mut cur = c.borrow_mut();
            if cur.is_none() {
                *cur = Some(main.clone());
            }
        });
        main
    }

    /// Returns the coroutine currently running on this thread.
    ///
    /// The first call on a thread synthesizes that thread's main coroutine
    /// (state [`State::Running`], no owned stack) and installs it as both
    /// the main and the current coroutine.
    #[must_use]
    pub fn current() -> Arc<Self> {
        Self::ensure_main();
        CURRENT.with(|c| c.borrow().clone()).expect("current coroutine slot empty")
    }

    /// Id of the coroutine running on this thread, or 0 if the thread has
    /// never touched the coroutine machinery.
    #[must_use]
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map_or(0, |co| co.id))
    }

    /// Number of live coroutines in the process, main coroutines included.
    #[must_use]
    pub fn total() -> u64 {
        LIVE.load(Ordering::Relaxed)
    }

    /// Creates a coroutine with the default stack size.
    pub fn new(entry: impl FnOnce() + Send + 'static) -> Result<Arc<Self>> {
        Self::with_stack_size(entry, config::stack_size())
    }

    /// Creates a coroutine with an explicit stack size.
    pub fn with_stack_size(
        entry: impl FnOnce() + Send + 'static,
        stack_size: usize,
    ) -> Result<Arc<Self>> {
        Self::build(Box::new(entry), stack_size, true)
    }

    /// Creates a coroutine that swaps against the thread main coroutine
    /// even when a dispatcher is installed. Used for the root dispatcher
    /// of a use-caller scheduler.
    pub(crate) fn root(entry: impl FnOnce() + Send + 'static) -> Result<Arc<Self>> {
        Self::build(Box::new(entry), config::stack_size(), false)
    }

    /// Boxed-entry constructor used by the dispatch loop.
    pub(crate) fn new_boxed(entry: EntryFn) -> Result<Arc<Self>> {
        Self::build(entry, config::stack_size(), true)
    }

    fn build(entry: EntryFn, stack_size: usize, yield_to_dispatcher: bool) -> Result<Arc<Self>> {
        let stack = Stack::allocate(stack_size)?;
        let stack_size = stack.size();
        let mut ctx = Context::empty();
        ctx.bootstrap(&stack, trampoline);
        let co = Arc::new_cyclic(|weak| Self {
            id: Self::next_id(),
            state: AtomicU8::new(State::Ready as u8),
            self_ref: weak.clone(),
            stack: Some(stack),
            ctx: UnsafeCell::new(ctx),
            entry: Mutex::new(Some(entry)),
            yield_to_dispatcher,
        });
        LIVE.fetch_add(1, Ordering::Relaxed);
        trace!(id = co.id, stack_size, "coroutine created");
        Ok(co)
    }

    /// Unique coroutine id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Re-initializes a finished coroutine around the same stack.
    ///
    /// Permitted only when the coroutine owns a stack and is in
    /// [`State::Term`]; this is what lets a dispatcher pool one coroutine
    /// across many queued callables.
    pub fn reset(&self, entry: impl FnOnce() + Send + 'static) {
        self.reset_boxed(Box::new(entry));
    }

    pub(crate) fn reset_boxed(&self, entry: EntryFn) {
        let stack = self
            .stack
            .as_ref()
            .expect("reset() on a coroutine without an owned stack");
        assert_eq!(
            self.state(),
            State::Term,
            "reset() on coroutine {} that has not terminated",
            self.id
        );
        *self.entry.lock() = Some(entry);
        // SAFETY: the coroutine is TERM, so no thread is running it and
        // nothing will swap into the old context again.
        unsafe { (*self.ctx.get()).bootstrap(stack, trampoline) };
        self.state.store(State::Ready as u8, Ordering::Release);
    }

    /// Resumes this coroutine on the calling thread.
    ///
    /// The caller is suspended at the swap point until the coroutine yields
    /// or terminates. Panics if the coroutine is not [`State::Ready`].
    pub fn resume(&self) {
        if let Err(actual) = self.state.compare_exchange(
            State::Ready as u8,
            State::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "resume() on coroutine {} in state {:?}",
                self.id,
                State::from_u8(actual)
            );
        }
        let this = self.self_ref.upgrade().expect("coroutine outside an Arc");
        let back = swap_target(self);
        CURRENT.with(|c| *c.borrow_mut() = Some(this));
        // SAFETY: `back` is kept alive by this frame and by the main or
        // dispatcher slot; `self` is kept alive by the caller's handle for
        // the whole call, so both context records stay valid across the
        // swap.
        unsafe { Context::switch(back.ctx.get(), self.ctx.get()) };
        // Control returns here once the coroutine yields or terminates.
    }

    /// Suspends the coroutine currently running on this thread.
    ///
    /// Sets it back to [`State::Ready`] (unless it already terminated) and
    /// resumes its swap target. On the next `resume` execution continues
    /// right after the swap.
    pub fn yield_now() {
        let cur = CURRENT
            .with(|c| c.borrow().clone())
            .expect("yield_now() on a thread with no coroutine");
        let state = cur.state();
        assert!(
            state == State::Running || state == State::Term,
            "yield_now() on coroutine {} in state {state:?}",
            cur.id
        );
        let back = swap_target(&cur);
        assert!(
            !Arc::ptr_eq(&cur, &back),
            "yield_now() on the thread main coroutine"
        );
        if state != State::Term {
            cur.state.store(State::Ready as u8, Ordering::Release);
        }
        CURRENT.with(|c| *c.borrow_mut() = Some(back.clone()));
        // SAFETY: `cur` outlives the swap (the resumer still holds a handle
        // until its resume() call returns) and `back` is held by this frame.
        unsafe { Context::switch(cur.ctx.get(), back.ctx.get()) };
        // Resumed again.
    }
}

/// The context a coroutine swaps against: the thread's dispatcher when the
/// coroutine belongs to a scheduler and one is installed, else the thread's
/// main coroutine.
fn swap_target(co: &Coroutine) -> Arc<Coroutine> {
    if co.yield_to_dispatcher {
        if let Some(d) = dispatcher() {
            return d;
        }
    }
    Coroutine::ensure_main()
}

/// Entry invoked by the machine-context layer on a fresh coroutine stack.
extern "C" fn trampoline() {
    let cur = CURRENT
        .with(|c| c.borrow().clone())
        .expect("trampoline with no current coroutine");
    let entry = cur.entry.lock().take();
    if let Some(f) = entry {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            // The framework does not propagate application panics; the
            // coroutine still takes the TERM/yield path.
            error!(id = cur.id, "coroutine entry panicked: {}", panic_message(&payload));
        }
    }
    cur.state.store(State::Term as u8, Ordering::Release);
    drop(cur);
    Coroutine::yield_now();
    unreachable!("terminated coroutine was resumed");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        LIVE.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            assert_eq!(
                self.state(),
                State::Term,
                "coroutine {} dropped before terminating",
                self.id
            );
        } else {
            debug_assert!(self.entry.get_mut().is_none());
            debug_assert_eq!(self.state(), State::Running);
        }
        trace!(id = self.id, "coroutine destroyed");
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("main", &self.stack.is_none())
            .finish_non_exhaustive()
    }
}
