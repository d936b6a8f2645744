//! The N:M task scheduler.
//!
//! A [`Scheduler`] owns a pool of worker threads and a shared FIFO queue of
//! [`Task`]s. Each worker runs a dispatch loop: dequeue a task, resume the
//! corresponding coroutine, and take the next one when it yields or
//! terminates. When the queue is empty a worker switches to its *idle
//! coroutine* instead of parking; the base scheduler's idle coroutine just
//! yields in a loop, and the [`IoManager`](crate::IoManager) replaces it
//! with one that blocks in `epoll_wait`.
//!
//! # Use-caller mode
//!
//! With `use_caller = true` the constructing thread is counted as one of
//! the workers: only `threads - 1` OS threads are spawned, and the caller's
//! dispatch loop runs inside a dedicated *root dispatcher* coroutine that
//! [`Scheduler::stop`] resumes. The caller thread therefore drains the
//! queue during `stop`, and `stop` must be invoked on that same thread.
//!
//! # Polymorphism seam
//!
//! The scheduler's wake-up discipline is pluggable through the
//! [`WaitStrategy`] trait: `tickle` (cross-worker wake-up), `idle` (what an
//! idle worker does), and `stopping` (when the idle coroutine may exit).
//! The base scheduler uses built-in defaults; the `IoManager` injects
//! itself at construction.

use crate::coroutine::{self, Coroutine, EntryFn, State};
use crate::util::thread_id;
pub use crate::util::ThreadId;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error};

thread_local! {
    static SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
}

/// The wake-up discipline of a scheduler.
///
/// The three operations the base scheduler leaves open for specialisation,
/// mirroring its dispatch loop hooks: how workers are woken, what an idle
/// worker does, and when the idle coroutine is allowed to exit.
pub trait WaitStrategy: Send + Sync + 'static {
    /// Wakes at least one worker currently executing [`WaitStrategy::idle`].
    fn tickle(&self);

    /// Runs inside a worker's idle coroutine until [`WaitStrategy::stopping`]
    /// holds. Must yield regularly so the dispatch loop can re-check the
    /// queue.
    fn idle(&self);

    /// True once the scheduler may shut down: stop was requested and no
    /// work remains anywhere.
    fn stopping(&self) -> bool;
}

enum Payload {
    Coroutine(Arc<Coroutine>),
    Call(EntryFn),
}

/// A unit of schedulable work: a coroutine handle or a plain callable,
/// optionally pinned to one worker thread.
///
/// The payload is a sum type, so exactly one of the two forms is populated
/// for any live task. A coroutine handed to the queue must be
/// [`State::Ready`]; a callable is wrapped in a (pooled) coroutine by the
/// worker that dequeues it.
pub struct Task {
    payload: Payload,
    target: Option<ThreadId>,
}

impl Task {
    /// A task resuming an existing coroutine.
    #[must_use]
    pub fn coroutine(co: Arc<Coroutine>) -> Self {
        Self {
            payload: Payload::Coroutine(co),
            target: None,
        }
    }

    /// A task invoking a callable on some worker.
    #[must_use]
    pub fn call(f: impl FnOnce() + Send + 'static) -> Self {
        Self::call_boxed(Box::new(f))
    }

    pub(crate) fn call_boxed(f: EntryFn) -> Self {
        Self {
            payload: Payload::Call(f),
            target: None,
        }
    }

    /// Restricts the task to the worker with the given OS thread id.
    #[must_use]
    pub fn pinned_to(mut self, thread: ThreadId) -> Self {
        self.target = Some(thread);
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.payload {
            Payload::Coroutine(co) => format!("coroutine {}", co.id()),
            Payload::Call(_) => "call".to_string(),
        };
        f.debug_struct("Task")
            .field("payload", &kind)
            .field("target", &self.target)
            .finish()
    }
}

/// An N:M coroutine scheduler over a pool of named worker threads.
///
/// Construct with [`Scheduler::new`], submit work with
/// [`Scheduler::schedule`], and shut down with [`Scheduler::stop`]. A
/// scheduler must be stopped before it is dropped.
pub struct Scheduler {
    name: String,
    self_ref: Weak<Scheduler>,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Mutex<Vec<ThreadId>>,
    /// OS threads to spawn (excludes the caller in use-caller mode).
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    use_caller: bool,
    root_coroutine: Mutex<Option<Arc<Coroutine>>>,
    /// Thread id of the constructing thread in use-caller mode.
    root_thread: Option<ThreadId>,
    stopping: AtomicBool,
    strategy: OnceLock<Weak<dyn WaitStrategy>>,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers.
    ///
    /// With `use_caller` the constructing thread counts as one worker and
    /// will dispatch inside [`Scheduler::stop`]; only `threads - 1` OS
    /// threads are spawned by [`Scheduler::start`]. The conventional
    /// default configuration is `(1, true, ..)`.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is zero, or in use-caller mode if the calling
    /// thread already hosts a scheduler.
    #[must_use]
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<Self> {
        assert!(threads > 0, "scheduler needs at least one worker");
        if use_caller {
            assert!(
                Self::current().is_none(),
                "thread already hosts a scheduler"
            );
        }
        let name = name.into();
        let spawn_count = if use_caller { threads - 1 } else { threads };
        let sched = Arc::new_cyclic(|weak| Self {
            name,
            self_ref: weak.clone(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            worker_ids: Mutex::new(Vec::new()),
            thread_count: spawn_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            use_caller,
            root_coroutine: Mutex::new(None),
            root_thread: use_caller.then(thread_id),
            stopping: AtomicBool::new(false),
            strategy: OnceLock::new(),
        });

        if use_caller {
            Coroutine::current();
            SCHEDULER.with(|s| *s.borrow_mut() = Some(sched.clone()));

            let weak = Arc::downgrade(&sched);
            let root = Coroutine::root(move || {
                if let Some(s) = weak.upgrade() {
                    Scheduler::dispatch(&s);
                }
            })
            .expect("failed to allocate the root dispatcher coroutine");
            coroutine::set_dispatcher(root.clone());
            *sched.root_coroutine.lock() = Some(root);
            sched.worker_ids.lock().push(thread_id());
            debug!(name = %sched.name, "scheduler created in use-caller mode");
        } else {
            debug!(name = %sched.name, "scheduler created");
        }
        sched
    }

    /// Creates a single-worker scheduler in use-caller mode, the
    /// conventional default configuration.
    #[must_use]
    pub fn with_name(name: impl Into<String>) -> Arc<Self> {
        Self::new(1, true, name)
    }

    /// The scheduler installed on the calling thread, if any.
    #[must_use]
    pub fn current() -> Option<Arc<Scheduler>> {
        SCHEDULER.with(|s| s.borrow().clone())
    }

    /// The dispatcher coroutine of the calling thread, if it is a worker.
    #[must_use]
    pub fn dispatcher() -> Option<Arc<Coroutine>> {
        coroutine::dispatcher()
    }

    /// Scheduler name, used as the worker thread-name prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS thread ids of all workers, the caller (in use-caller mode) first.
    ///
    /// Populated during [`Scheduler::start`]; use these with
    /// [`Task::pinned_to`].
    #[must_use]
    pub fn worker_ids(&self) -> Vec<ThreadId> {
        self.worker_ids.lock().clone()
    }

    /// Number of workers currently resuming a task.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Number of workers currently inside their idle coroutine.
    #[must_use]
    pub fn idle_workers(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }

    /// Number of tasks waiting in the queue.
    #[must_use]
    pub fn queued_tasks(&self) -> usize {
        self.queue.lock().len()
    }

    /// Appends a task to the queue. Thread-safe, non-blocking.
    ///
    /// If the queue was empty the worker pool is tickled so a parked worker
    /// picks the task up promptly.
    pub fn schedule(&self, task: Task) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Spawns the worker threads. May only be called once.
    pub fn start(&self) {
        debug!(name = %self.name, workers = self.thread_count, "start");
        let mut threads = self.threads.lock();
        if self.stopping.load(Ordering::SeqCst) {
            error!(name = %self.name, "start() on a stopped scheduler");
            return;
        }
        assert!(threads.is_empty(), "start() called twice");
        let this = self.self_ref.upgrade().expect("scheduler outside an Arc");

        let (tx, rx) = mpsc::channel::<(usize, ThreadId)>();
        for i in 0..self.thread_count {
            let sched = this.clone();
            let tx = tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}_{i}", self.name))
                .spawn(move || {
                    let _ = tx.send((i, thread_id()));
                    drop(tx);
                    Scheduler::dispatch(&sched);
                })
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
        drop(tx);

        let mut reported: Vec<(usize, ThreadId)> = Vec::with_capacity(self.thread_count);
        for _ in 0..self.thread_count {
            reported.push(rx.recv().expect("worker failed to report its thread id"));
        }
        reported.sort_unstable_by_key(|&(i, _)| i);
        let mut ids = self.worker_ids.lock();
        ids.extend(reported.into_iter().map(|(_, tid)| tid));
    }

    /// Stops the scheduler and drains the queue.
    ///
    /// Sets the stopping flag, tickles every worker, and in use-caller mode
    /// resumes the root dispatcher so the calling thread dispatches until
    /// the queue is empty. Returns after every spawned worker has joined.
    ///
    /// # Panics
    ///
    /// In use-caller mode `stop` must run on the constructing thread;
    /// otherwise it must not run on one of the scheduler's own workers.
    pub fn stop(&self) {
        debug!(name = %self.name, "stop");
        if self.effective_stopping() {
            return;
        }
        self.stopping.store(true, Ordering::SeqCst);

        if self.use_caller {
            let on_caller = Self::current()
                .is_some_and(|s| std::ptr::eq(Arc::as_ptr(&s), self))
                && self.root_thread == Some(thread_id());
            assert!(
                on_caller,
                "stop() on a use-caller scheduler must run on the constructing thread"
            );
        } else {
            let on_worker =
                Self::current().is_some_and(|s| std::ptr::eq(Arc::as_ptr(&s), self));
            assert!(!on_worker, "stop() must not run on one of the scheduler's own workers");
        }

        for _ in 0..self.thread_count {
            self.tickle();
        }

        let root = self.root_coroutine.lock().take();
        if root.is_some() {
            self.tickle();
        }
        if let Some(root) = root {
            root.resume();
            debug!(name = %self.name, "root dispatcher finished");
        }

        let handles = mem::take(&mut *self.threads.lock());
        for handle in handles {
            handle.join().expect("worker thread panicked");
        }

        if self.use_caller {
            coroutine::clear_dispatcher();
            SCHEDULER.with(|s| {
                let mut slot = s.borrow_mut();
                if slot
                    .as_ref()
                    .is_some_and(|cur| std::ptr::eq(Arc::as_ptr(cur), self))
                {
                    *slot = None;
                }
            });
        }
        debug!(name = %self.name, "stopped");
    }

    /// Installs the wait strategy; done once by the `IoManager`.
    pub(crate) fn set_strategy(&self, strategy: Weak<dyn WaitStrategy>) {
        let _ = self.strategy.set(strategy);
    }

    fn strategy(&self) -> Option<Arc<dyn WaitStrategy>> {
        self.strategy.get().and_then(Weak::upgrade)
    }

    fn tickle(&self) {
        if let Some(s) = self.strategy() {
            s.tickle();
        } else {
            debug!(name = %self.name, "tickle");
        }
    }

    /// The base stopping predicate: stop requested, queue empty, nothing
    /// being resumed. A wait strategy may strengthen this.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().is_empty()
            && self.active.load(Ordering::Relaxed) == 0
    }

    fn effective_stopping(&self) -> bool {
        match self.strategy() {
            Some(s) => s.stopping(),
            None => self.base_stopping(),
        }
    }

    /// The base idle coroutine body: yield until the scheduler drains.
    fn base_idle(&self) {
        debug!(name = %self.name, "idle");
        while !self.base_stopping() {
            Coroutine::yield_now();
        }
    }

    fn idle_entry(&self) {
        if let Some(s) = self.strategy() {
            s.idle();
        } else {
            self.base_idle();
        }
    }

    /// The dispatch loop. Runs on every worker thread, and inside the root
    /// dispatcher coroutine on the caller thread in use-caller mode.
    fn dispatch(this: &Arc<Self>) {
        let me = thread_id();
        debug!(name = %this.name, tid = me, "dispatch loop started");

        SCHEDULER.with(|s| {
            let mut slot = s.borrow_mut();
            if slot.is_none() {
                *slot = Some(this.clone());
            }
        });
        if this.root_thread != Some(me) {
            // On spawned workers the dispatch loop runs on the thread's
            // native stack, so the main coroutine is the dispatcher.
            coroutine::set_dispatcher(Coroutine::current());
        }

        let weak = Arc::downgrade(this);
        let idle_coroutine = Coroutine::new(move || {
            if let Some(s) = weak.upgrade() {
                s.idle_entry();
            }
        })
        .expect("failed to allocate the idle coroutine");
        let mut call_coroutine: Option<Arc<Coroutine>> = None;

        loop {
            let mut tickle_me = false;
            let mut task = None;
            {
                let mut queue = this.queue.lock();
                let mut i = 0;
                while i < queue.len() {
                    if matches!(queue[i].target, Some(t) if t != me) {
                        // Pinned to another worker; leave it and make sure
                        // someone else gets woken.
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    if let Payload::Coroutine(co) = &queue[i].payload {
                        assert_eq!(
                            co.state(),
                            State::Ready,
                            "scheduled coroutine {} is not READY",
                            co.id()
                        );
                    }
                    task = queue.remove(i);
                    break;
                }
                if task.is_some() {
                    tickle_me |= i < queue.len();
                    this.active.fetch_add(1, Ordering::Relaxed);
                }
            }
            if tickle_me {
                this.tickle();
            }

            match task.map(|t| t.payload) {
                Some(Payload::Coroutine(co)) => {
                    co.resume();
                    this.active.fetch_sub(1, Ordering::Relaxed);
                }
                Some(Payload::Call(f)) => {
                    let co = match call_coroutine.take() {
                        Some(co) => {
                            co.reset_boxed(f);
                            co
                        }
                        None => Coroutine::new_boxed(f)
                            .expect("failed to allocate a callable coroutine"),
                    };
                    co.resume();
                    this.active.fetch_sub(1, Ordering::Relaxed);
                    if co.state() == State::Term {
                        // Keep the stack around for the next callable.
                        call_coroutine = Some(co);
                    }
                }
                None => {
                    if idle_coroutine.state() == State::Term {
                        debug!(name = %this.name, tid = me, "idle coroutine terminated");
                        break;
                    }
                    this.idle.fetch_add(1, Ordering::Relaxed);
                    idle_coroutine.resume();
                    this.idle.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        debug!(name = %this.name, tid = me, "dispatch loop finished");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug!(name = %self.name, "scheduler dropped");
        assert!(
            self.stopping.load(Ordering::SeqCst),
            "scheduler `{}` dropped without stop()",
            self.name
        );
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("workers", &self.thread_count)
            .field("use_caller", &self.use_caller)
            .field("queued", &self.queued_tasks())
            .field("active", &self.active_workers())
            .field("idle", &self.idle_workers())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn single_worker_runs_tasks_in_fifo_order() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let sched = Scheduler::new(1, false, "fifo");
        sched.start();

        let (o1, o2) = (order.clone(), order.clone());
        sched.schedule(Task::call(move || o1.lock().unwrap().push("A")));
        sched.schedule(Task::call(move || o2.lock().unwrap().push("B")));
        sched.stop();

        assert_eq!(*order.lock().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn callable_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let sched = Scheduler::new(2, false, "once");
        sched.start();
        let c = count.clone();
        sched.schedule(Task::call(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pinned_task_runs_on_the_target_worker() {
        let sched = Scheduler::new(2, false, "pinned");
        sched.start();
        let target = sched.worker_ids()[0];

        let observed = Arc::new(AtomicUsize::new(0));
        let o = observed.clone();
        sched.schedule(Task::call(move || {
            o.store(thread_id() as usize, Ordering::SeqCst);
        })
        .pinned_to(target));
        sched.stop();

        assert_eq!(observed.load(Ordering::SeqCst), target as usize);
    }

    #[test]
    fn use_caller_drains_on_the_constructing_thread() {
        let here = thread_id();
        let sched = Scheduler::with_name("caller");
        sched.start();

        let ran_on = Arc::new(StdMutex::new(Vec::new()));
        for _ in 0..3 {
            let r = ran_on.clone();
            sched.schedule(Task::call(move || r.lock().unwrap().push(thread_id())));
        }
        sched.stop();

        assert_eq!(*ran_on.lock().unwrap(), vec![here, here, here]);
    }

    #[test]
    fn scheduled_coroutine_is_resumed_to_term() {
        let hit = Arc::new(AtomicUsize::new(0));
        let sched = Scheduler::new(1, false, "coro");
        sched.start();

        let h = hit.clone();
        let co = Coroutine::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .expect("create");
        sched.schedule(Task::coroutine(co.clone()));
        sched.stop();

        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(co.state(), State::Term);
    }

    #[test]
    fn task_can_yield_and_reschedule_itself() {
        let phases = Arc::new(StdMutex::new(Vec::new()));
        let sched = Scheduler::new(1, false, "yielder");
        sched.start();

        let p = phases.clone();
        let s = sched.clone();
        sched.schedule(Task::call(move || {
            p.lock().unwrap().push("first");
            s.schedule(Task::coroutine(Coroutine::current()));
            Coroutine::yield_now();
            p.lock().unwrap().push("second");
        }));
        sched.stop();

        assert_eq!(*phases.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn counters_are_clean_after_stop() {
        let sched = Scheduler::new(3, false, "counters");
        sched.start();
        for _ in 0..16 {
            sched.schedule(Task::call(|| {
                std::thread::sleep(Duration::from_millis(1));
            }));
        }
        sched.stop();

        assert_eq!(sched.queued_tasks(), 0);
        assert_eq!(sched.active_workers(), 0);
        assert_eq!(sched.idle_workers(), 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let sched = Scheduler::new(1, false, "twice");
        sched.start();
        sched.stop();
        sched.stop();
    }

    #[test]
    fn schedule_before_start_is_drained() {
        let count = Arc::new(AtomicUsize::new(0));
        let sched = Scheduler::new(1, false, "early");
        let c = count.clone();
        sched.schedule(Task::call(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        sched.start();
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_threads_are_named_after_the_scheduler() {
        let name = Arc::new(StdMutex::new(String::new()));
        let sched = Scheduler::new(1, false, "titled");
        sched.start();
        let n = name.clone();
        sched.schedule(Task::call(move || {
            *n.lock().unwrap() = std::thread::current().name().unwrap_or("").to_string();
        }));
        sched.stop();
        assert_eq!(*name.lock().unwrap(), "titled_0");
    }
}
