//! Small OS helpers.

use std::cell::Cell;

/// An OS thread identifier, as reported by `gettid(2)`.
///
/// Tasks may be pinned to a worker by its `ThreadId`; see
/// [`Task::pinned_to`](crate::Task::pinned_to).
pub type ThreadId = i32;

thread_local! {
    static TID: Cell<ThreadId> = const { Cell::new(0) };
}

/// Returns the calling thread's kernel thread id.
///
/// The id is fetched once per thread and cached.
#[must_use]
pub fn thread_id() -> ThreadId {
    TID.with(|tid| {
        let cached = tid.get();
        if cached != 0 {
            return cached;
        }
        // SAFETY: gettid takes no arguments and cannot fail.
        let id = unsafe { libc::syscall(libc::SYS_gettid) } as ThreadId;
        tid.set(id);
        id
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonzero_and_stable() {
        let a = thread_id();
        let b = thread_id();
        assert_ne!(a, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn differs_across_threads() {
        let here = thread_id();
        let there = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
