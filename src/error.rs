//! Error types for the recoverable failure paths.
//!
//! Only two failure classes are recoverable and therefore surfaced as values:
//! coroutine stack allocation (resource exhaustion) and kernel reactor
//! operations (`epoll_ctl` and friends). Everything else the runtime treats
//! as a programming error (resuming a terminated coroutine, registering the
//! same fd/event twice, stopping a scheduler from the wrong thread) and
//! fails an assertion instead, because the violated invariants are the basis
//! of memory safety for the context-switch layer.

use std::io;
use thiserror::Error;

/// Errors produced by coroutine construction and reactor registration.
#[derive(Debug, Error)]
pub enum Error {
    /// Allocating a coroutine stack failed.
    #[error("coroutine stack allocation of {size} bytes failed")]
    StackAlloc {
        /// The requested usable stack size in bytes.
        size: usize,
        /// The underlying allocation failure.
        #[source]
        source: io::Error,
    },

    /// A kernel reactor operation failed; observable state is unchanged.
    #[error("reactor operation failed: {0}")]
    Io(#[from] io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_alloc_display_names_size() {
        let err = Error::StackAlloc {
            size: 4096,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        };
        let msg = err.to_string();
        assert!(msg.contains("4096"), "unexpected message: {msg}");
    }

    #[test]
    fn io_error_converts() {
        let err: Error = io::Error::from_raw_os_error(libc::EBADF).into();
        assert!(matches!(err, Error::Io(_)));
    }
}
