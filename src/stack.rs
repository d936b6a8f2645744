//! Coroutine stack allocation.
//!
//! Stacks are `mmap`-backed rather than heap-allocated so that each one can
//! carry a `PROT_NONE` guard page below the usable region. An overflowing
//! coroutine then faults instead of silently corrupting a neighbouring
//! allocation. Allocation failure is recoverable and propagates to the
//! caller of coroutine construction.

use crate::error::{Error, Result};
use std::io;
use std::ptr;
use std::sync::OnceLock;

/// Returns the system page size, cached for the process.
pub(crate) fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf with a valid name has no side effects.
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(n).unwrap_or(4096)
    })
}

/// An owned, guard-paged coroutine stack.
///
/// The mapping layout, low to high: one inaccessible guard page, then
/// `size` usable bytes. The usable region's base is [`Stack::bottom`].
pub(crate) struct Stack {
    /// Base of the whole mapping (the guard page).
    base: *mut u8,
    /// Total mapping length including the guard page.
    total: usize,
    /// Usable stack bytes above the guard page.
    size: usize,
}

// SAFETY: the mapping is exclusively owned; the pointer never aliases
// another Stack and the region is only touched by the coroutine machinery.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Maps a new stack with `size` usable bytes (rounded up to page size).
    pub(crate) fn allocate(size: usize) -> Result<Self> {
        let page = page_size();
        let size = size.max(page).div_ceil(page) * page;
        let total = size + page;

        // SAFETY: anonymous private mapping, no fd, checked for MAP_FAILED.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::StackAlloc {
                size,
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: base..base+page lies inside the mapping created above.
        let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if rc != 0 {
            let source = io::Error::last_os_error();
            // SAFETY: unmapping the mapping created above.
            unsafe { libc::munmap(base, total) };
            return Err(Error::StackAlloc { size, source });
        }

        Ok(Self {
            base: base.cast(),
            total,
            size,
        })
    }

    /// Lowest usable address, just above the guard page.
    pub(crate) fn bottom(&self) -> *mut u8 {
        // SAFETY: total - size == one page, inside the owned mapping.
        unsafe { self.base.add(self.total - self.size) }
    }

    /// Usable stack size in bytes.
    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact mapping this Stack owns.
        unsafe { libc::munmap(self.base.cast(), self.total) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_rounds_to_page() {
        let page = page_size();
        let stack = Stack::allocate(page + 1).expect("allocate");
        assert_eq!(stack.size() % page, 0);
        assert!(stack.size() >= page + 1);
    }

    #[test]
    fn usable_region_is_writable() {
        let stack = Stack::allocate(64 * 1024).expect("allocate");
        let bottom = stack.bottom();
        // SAFETY: bottom and the last byte are inside the usable region.
        unsafe {
            bottom.write(0xA5);
            bottom.add(stack.size() - 1).write(0x5A);
            assert_eq!(bottom.read(), 0xA5);
        }
    }

    #[test]
    fn bottom_sits_one_page_above_base() {
        let stack = Stack::allocate(32 * 1024).expect("allocate");
        let gap = stack.bottom() as usize - stack.base as usize;
        assert_eq!(gap, page_size());
    }
}
