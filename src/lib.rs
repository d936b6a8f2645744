//! Corio: an N:M stackful coroutine runtime with an epoll reactor.
//!
//! # Overview
//!
//! Corio multiplexes a large population of stackful coroutines over a small
//! pool of OS worker threads. Application code is written in straight-line,
//! blocking style; whenever it would block on a file descriptor it registers
//! interest with the [`IoManager`] and yields, and the reactor resumes it when
//! the kernel reports readiness. The result is event-driven I/O concurrency
//! without callback inversion.
//!
//! The runtime is built from three layers, bottom up:
//!
//! | Layer | Component | Responsibility |
//! |-------|-----------|----------------|
//! | L1 | [`Coroutine`] | Stackful execution unit with explicit resume/yield over an owned stack |
//! | L2 | [`Scheduler`] | Worker-thread pool draining a shared FIFO queue of [`Task`]s |
//! | L3 | [`IoManager`] | Scheduler whose idle workers block in `epoll_wait` and convert readiness into wake-ups |
//!
//! # Core guarantees
//!
//! - **One running coroutine per thread**: resume/yield always swap through
//!   the thread's main (or dispatcher) coroutine; no lock is held across a
//!   context switch.
//! - **FIFO dispatch**: the shared task queue is strict FIFO; a single worker
//!   completes tasks in dequeue order.
//! - **One-shot I/O registrations**: a readiness event disarms its
//!   registration before the waiter runs; waiters re-arm explicitly.
//! - **Clean drain on stop**: [`Scheduler::stop`] returns only after the
//!   queue is empty, every worker has joined, and (for the [`IoManager`]) no
//!   armed event remains.
//!
//! # Example
//!
//! ```
//! use corio::{Scheduler, Task};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! let sched = Scheduler::new(2, false, "example");
//! sched.start();
//!
//! for _ in 0..4 {
//!     let counter = counter.clone();
//!     sched.schedule(Task::call(move || {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     }));
//! }
//!
//! sched.stop();
//! assert_eq!(counter.load(Ordering::SeqCst), 4);
//! ```
//!
//! # Platform support
//!
//! Linux with glibc only: the context-switch primitive is `ucontext(3)` and
//! the readiness primitive is `epoll(7)`.
//!
//! # Module structure
//!
//! - [`config`]: the coroutine stack-size tunable and its env override
//! - [`error`]: typed errors for the recoverable failure paths
//! - [`coroutine`]: the stackful coroutine primitive (L1)
//! - [`scheduler`]: task queue, worker pool, and dispatch loop (L2)
//! - [`reactor`]: interest flags and the epoll wrapper
//! - [`io_manager`]: fd-event bookkeeping and the reactor-driven idle loop (L3)

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
compile_error!("corio requires Linux with glibc (ucontext + epoll)");

pub mod config;
mod context;
pub mod coroutine;
pub mod error;
pub mod io_manager;
pub mod reactor;
pub mod scheduler;
mod stack;
mod util;

pub use coroutine::{Coroutine, State};
pub use error::{Error, Result};
pub use io_manager::{IoEvent, IoManager};
pub use reactor::{Interest, PollEvent, PollEvents, Poller};
pub use scheduler::{Scheduler, Task, ThreadId, WaitStrategy};
pub use util::thread_id;
