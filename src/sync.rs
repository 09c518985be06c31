//! # Synchronization Primitives
//!
//! The runtime's only locking discipline: a single, global, non-reentrant
//! critical section. While it is held the preemption signal (`SIGALRM`) is
//! blocked at the OS level and the timer handler refuses to switch tasks, so
//! anything done inside is atomic with respect to task switching.
//!
//! Tasks should hold it around system calls and around any use of
//! per-thread, non-reentrant process state (std's stdout/stderr handles, the
//! logger, the heap allocator): every fiber runs on the same OS thread, so a
//! fiber preempted inside such a resource leaves it locked or half-updated
//! for the next one.
//!
//! Misuse (entering twice, exiting without entering) ends the process.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{fatal, FatalError};

static IN_CRITICAL: AtomicBool = AtomicBool::new(false);

/// Enter the critical section.
///
/// The flag is raised before the signal is blocked, so a tick landing in
/// between already sees the lease and is dropped.
pub fn enter_critical() {
    if IN_CRITICAL.swap(true, Ordering::SeqCst) {
        fatal(FatalError::CriticalSectionMisuse);
    }
    set_preempt_signal_mask(libc::SIG_BLOCK);
}

/// Leave the critical section.
///
/// The flag is dropped before the signal is unblocked, so a tick that
/// arrived inside the section is delivered on the way out and preempts.
/// The reverse order would drop that tick; keep this one.
pub fn exit_critical() {
    if !IN_CRITICAL.swap(false, Ordering::SeqCst) {
        fatal(FatalError::CriticalSectionMisuse);
    }
    set_preempt_signal_mask(libc::SIG_UNBLOCK);
}

/// Whether a critical-section lease is currently held.
#[inline]
pub fn in_critical() -> bool {
    IN_CRITICAL.load(Ordering::SeqCst)
}

/// Token proving the critical section is held. Leaves it on drop.
pub struct CriticalSection {
    // not Send: the lease belongs to the OS thread's signal mask
    _not_send: PhantomData<*const ()>,
}

impl CriticalSection {
    /// Enter and return the guard.
    pub fn enter() -> Self {
        enter_critical();
        Self { _not_send: PhantomData }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        exit_critical();
    }
}

/// Execute a closure within the critical section (preemption suppressed).
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     println!("safe to print from a fiber");
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let cs = CriticalSection::enter();
    f(&cs)
}

fn set_preempt_signal_mask(how: libc::c_int) {
    unsafe {
        let mut set = core::mem::MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), crate::preempt::PREEMPT_SIGNAL);
        let rc = libc::pthread_sigmask(how, set.as_ptr(), core::ptr::null_mut());
        debug_assert_eq!(rc, 0, "pthread_sigmask rejected a well-formed request");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::sync::atomic::AtomicU8;
    use std::sync::Mutex;

    /// Serializes tests that touch the process-wide lease flag.
    pub(crate) static LEASE_LOCK: Mutex<()> = Mutex::new(());

    fn preempt_signal_blocked() -> bool {
        unsafe {
            let mut current = core::mem::MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(current.as_mut_ptr());
            libc::pthread_sigmask(libc::SIG_BLOCK, core::ptr::null(), current.as_mut_ptr());
            libc::sigismember(current.as_ptr(), crate::preempt::PREEMPT_SIGNAL) == 1
        }
    }

    #[test]
    fn test_enter_exit_toggles_flag_and_mask() {
        let _serial = LEASE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        assert!(!in_critical());
        assert!(!preempt_signal_blocked());

        enter_critical();
        assert!(in_critical());
        assert!(preempt_signal_blocked(), "SIGALRM must be masked inside");

        exit_critical();
        assert!(!in_critical());
        assert!(!preempt_signal_blocked());
    }

    #[test]
    fn test_closure_form_returns_value_and_releases() {
        let _serial = LEASE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let value = critical_section(|_cs| {
            assert!(in_critical());
            42
        });
        assert_eq!(value, 42);
        assert!(!in_critical());
    }

    const NOT_DELIVERED: u8 = 0;
    const SAW_LEASE_FREE: u8 = 1;
    const SAW_LEASE_HELD: u8 = 2;

    static HELD_AT_DELIVERY: AtomicU8 = AtomicU8::new(NOT_DELIVERED);

    extern "C" fn record_lease(_sig: libc::c_int) {
        let seen = if in_critical() { SAW_LEASE_HELD } else { SAW_LEASE_FREE };
        HELD_AT_DELIVERY.store(seen, Ordering::SeqCst);
    }

    #[test]
    fn test_tick_pending_at_exit_sees_lease_released() {
        let _serial = LEASE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        HELD_AT_DELIVERY.store(NOT_DELIVERED, Ordering::SeqCst);

        let previous = unsafe {
            let mut action: libc::sigaction = core::mem::zeroed();
            action.sa_sigaction = record_lease as extern "C" fn(libc::c_int) as usize;
            libc::sigemptyset(&mut action.sa_mask);
            let mut previous: libc::sigaction = core::mem::zeroed();
            assert_eq!(libc::sigaction(crate::preempt::PREEMPT_SIGNAL, &action, &mut previous), 0);
            previous
        };

        enter_critical();
        unsafe { libc::raise(crate::preempt::PREEMPT_SIGNAL) };
        assert_eq!(
            HELD_AT_DELIVERY.load(Ordering::SeqCst),
            NOT_DELIVERED,
            "the tick must stay pending inside the section"
        );
        exit_critical();

        unsafe { libc::sigaction(crate::preempt::PREEMPT_SIGNAL, &previous, core::ptr::null_mut()) };
        assert_eq!(
            HELD_AT_DELIVERY.load(Ordering::SeqCst),
            SAW_LEASE_FREE,
            "a pending tick is delivered on exit, after the lease is dropped"
        );
    }
}
