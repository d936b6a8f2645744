//! Machine-context save/restore over `ucontext(3)`.
//!
//! A [`Context`] is a saved CPU register set plus stack pointer. Swapping
//! two contexts suspends the current flow of control mid-function and
//! resumes another one exactly where it last suspended. This is the only
//! primitive the coroutine layer needs; everything above it is bookkeeping.
//!
//! Failure of any ucontext primitive is fatal: the invariants these calls
//! maintain are the basis of memory safety for every stack in the process.

use crate::stack::Stack;
use std::io;
use std::mem;
use std::ptr;

/// A saved machine context.
///
/// Either captured from the running thread (a return slot for `swap`) or
/// bootstrapped onto an owned [`Stack`] with an entry function.
pub(crate) struct Context {
    uc: libc::ucontext_t,
}

impl Context {
    /// An all-zero context; must be captured or bootstrapped before use as
    /// a swap restore target.
    pub(crate) fn empty() -> Self {
        Self {
            // SAFETY: ucontext_t is a plain C struct; all-zero is a valid
            // byte pattern, and getcontext/swapcontext overwrite it fully.
            uc: unsafe { mem::zeroed() },
        }
    }

    /// Captures the current thread context into this record.
    pub(crate) fn capture(&mut self) {
        // SAFETY: self.uc is valid for writes.
        let rc = unsafe { libc::getcontext(&mut self.uc) };
        assert_eq!(rc, 0, "getcontext failed: {}", io::Error::last_os_error());
    }

    /// Re-initializes this context to start `entry` on `stack`.
    ///
    /// The context has no successor (`uc_link` is null): `entry` must never
    /// return, yielding terminally instead.
    pub(crate) fn bootstrap(&mut self, stack: &Stack, entry: extern "C" fn()) {
        self.capture();
        self.uc.uc_link = ptr::null_mut();
        self.uc.uc_stack.ss_sp = stack.bottom().cast();
        self.uc.uc_stack.ss_size = stack.size();
        // SAFETY: uc was just captured and points at a live private stack.
        unsafe { libc::makecontext(&mut self.uc, entry, 0) };
    }

    /// Saves the current flow into `save` and resumes `restore`.
    ///
    /// # Safety
    ///
    /// `save` must be valid for writes and `restore` must hold a context
    /// that was captured or bootstrapped and whose stack is still alive.
    /// Both must remain valid until control returns through them.
    pub(crate) unsafe fn switch(save: *mut Context, restore: *const Context) {
        // SAFETY: contract forwarded to the caller.
        let rc = unsafe { libc::swapcontext(&mut (*save).uc, &(*restore).uc) };
        assert_eq!(rc, 0, "swapcontext failed: {}", io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static TRACE: Cell<u32> = const { Cell::new(0) };
        static HERE: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
        static THERE: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
    }

    extern "C" fn bounce() {
        TRACE.with(|t| t.set(t.get() | 0b01));
        let here = HERE.with(Cell::get);
        let there = THERE.with(Cell::get);
        // SAFETY: both contexts outlive the test body below.
        unsafe { Context::switch(there, here) };
        TRACE.with(|t| t.set(t.get() | 0b10));
        // SAFETY: as above; final hop back to the test body.
        unsafe { Context::switch(there, here) };
        unreachable!("context resumed after final switch");
    }

    #[test]
    fn switch_round_trips_through_a_private_stack() {
        let stack = Stack::allocate(64 * 1024).expect("stack");
        let mut main_ctx = Context::empty();
        let mut co_ctx = Context::empty();
        co_ctx.bootstrap(&stack, bounce);

        HERE.with(|c| c.set(&mut main_ctx));
        THERE.with(|c| c.set(&mut co_ctx));

        TRACE.with(|t| t.set(0));
        // SAFETY: both contexts and the stack live until the end of the test.
        unsafe { Context::switch(&mut main_ctx, &co_ctx) };
        assert_eq!(TRACE.with(Cell::get), 0b01);
        unsafe { Context::switch(&mut main_ctx, &co_ctx) };
        assert_eq!(TRACE.with(Cell::get), 0b11);
    }
}
