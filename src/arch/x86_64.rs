//! # x86_64 Port Layer
//!
//! Stackful context switching for the System V ABI.
//!
//! ## Context Switch Mechanism
//!
//! `switch` is an ordinary function call from the compiler's point of view,
//! so only the callee-saved registers (`rbx rbp r12–r15`) and the stack
//! pointer have to survive it. They are pushed on the suspending stack and
//! the resulting stack pointer is the whole [`Continuation`]. Resuming pops
//! them from the other stack and `ret`s to wherever that stack last called
//! `switch`.
//!
//! A task preempted by the timer calls `switch` from inside the signal
//! handler. Its volatile registers, flags and signal mask sit in the kernel's
//! signal frame further up the same stack and are restored by `sigreturn`
//! once the handler returns after resumption.
//!
//! ## Fresh Stack Layout (top = high address, growing down)
//!
//! ```text
//! [top - 8 ]  fairfiber_trampoline   <- popped by `ret`, leaves rsp 16-aligned
//! [top - 16]  rbp = 0                (terminates frame-pointer walks)
//! [top - 24]  rbx = 0
//! [top - 32]  r12 = start function
//! [top - 40]  r13 = start argument
//! [top - 48]  r14 = 0
//! [top - 56]  r15 = 0                <- saved stack pointer
//! ```

use core::arch::global_asm;

use super::StartFn;
use crate::config::STACK_TOP_RESERVE;

/// Saved stack pointer of a suspended context.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation(*mut u8);

extern "C" {
    fn fairfiber_switch(from: *mut Continuation, to: *const Continuation);
    fn fairfiber_trampoline();
}

global_asm!(
    ".text",
    ".global fairfiber_switch",
    ".type fairfiber_switch,@function",
    ".p2align 4",
    "fairfiber_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size fairfiber_switch, .-fairfiber_switch",
    ".global fairfiber_trampoline",
    ".type fairfiber_trampoline,@function",
    ".p2align 4",
    "fairfiber_trampoline:",
    "mov rdi, r13",
    "call r12",
    "ud2",
    ".size fairfiber_trampoline, .-fairfiber_trampoline",
);

impl Continuation {
    /// Placeholder for a context that has not been captured yet.
    pub const fn null() -> Self {
        Self(core::ptr::null_mut())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Seed the stack ending at `stack_top` so that switching to the
    /// returned continuation calls `start(arg)`.
    ///
    /// # Safety
    /// `stack_top` must be the exclusive upper end of writable memory with
    /// at least `STACK_TOP_RESERVE + 64` bytes below it, not in use by any
    /// other context.
    pub unsafe fn prepare(stack_top: *mut u8, start: StartFn, arg: usize) -> Self {
        let top = (stack_top as usize - STACK_TOP_RESERVE) & !0xF;
        let frame = (top - 7 * 8) as *mut usize;

        frame.add(0).write(0); // r15
        frame.add(1).write(0); // r14
        frame.add(2).write(arg); // r13
        frame.add(3).write(start as usize); // r12
        frame.add(4).write(0); // rbx
        frame.add(5).write(0); // rbp
        frame.add(6).write(fairfiber_trampoline as usize); // return address

        Self(frame.cast())
    }

    /// Address of the saved stack pointer (null if never captured).
    pub fn stack_pointer(&self) -> usize {
        self.0 as usize
    }
}

/// Save the calling context into `from` and resume `to`.
///
/// Returns when another context switches back to `from`.
///
/// # Safety
/// `to` must hold a continuation produced by [`Continuation::prepare`] or by
/// an earlier `switch`, whose stack has not been reused since. Both pointers
/// must be valid for the duration of the call. Violations corrupt the
/// process; nothing is detected.
#[inline]
pub unsafe fn switch(from: *mut Continuation, to: *const Continuation) {
    fairfiber_switch(from, to);
}
