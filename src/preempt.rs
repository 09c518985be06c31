//! # Preemption
//!
//! An `ITIMER_REAL` interval timer delivers `SIGALRM` every tick. The handler
//! runs on the stack of whatever task was executing; if preemption is
//! currently permitted it parks that task and switches to the dispatch loop,
//! exactly as a voluntary `sleep_for(0)` would.
//!
//! ## Permission gate
//!
//! ```text
//!   initialized?  ──no──►  NotReady      (runtime not dispatching yet)
//!        │yes
//!   scheduler active or
//!   critical section held? ──yes──►  Guarded   (signal dropped)
//!        │no
//!        ▼
//!   Preemptible  ──► claim the active flag, suspend the task
//! ```
//!
//! The handler is installed with `SA_NODEFER` because it may not return for a
//! long time: the task it interrupted is resumed, still inside the handler,
//! only when the scheduler selects it again. Without `SA_NODEFER` the signal
//! would stay blocked for every other task in the meantime.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::io;

use crate::config::SLEEP_FATAL_RATIO;
use crate::error::RuntimeError;
use crate::{kernel, sync};

/// Signal used to drive preemption.
pub const PREEMPT_SIGNAL: libc::c_int = libc::SIGALRM;

/// Whether the timer handler may switch tasks right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// The dispatch loop has not started.
    NotReady,
    /// The scheduler is running or a task holds the critical section.
    Guarded,
    /// The interrupted code is an ordinary task.
    Preemptible,
}

/// The flags behind [`Permission`].
#[derive(Debug)]
pub struct PreemptGate {
    initialized: AtomicBool,
    scheduler_active: AtomicBool,
}

impl PreemptGate {
    pub const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            scheduler_active: AtomicBool::new(false),
        }
    }

    /// Called once, right before the first dispatch.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn permission(&self) -> Permission {
        if !self.initialized.load(Ordering::SeqCst) {
            Permission::NotReady
        } else if self.scheduler_active.load(Ordering::SeqCst) || sync::in_critical() {
            Permission::Guarded
        } else {
            Permission::Preemptible
        }
    }

    /// Claim the scheduler. Fails if it is already active.
    pub fn try_activate(&self) -> bool {
        self.scheduler_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release the scheduler. Called by the task that was just resumed.
    pub fn deactivate(&self) {
        self.scheduler_active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.scheduler_active.load(Ordering::SeqCst)
    }
}

impl Default for PreemptGate {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Install the handler and start the interval timer.
pub fn install(tick: Duration) -> Result<(), RuntimeError> {
    unsafe {
        let mut action: libc::sigaction = core::mem::MaybeUninit::zeroed().assume_init();
        action.sa_sigaction = on_tick as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = libc::SA_NODEFER | libc::SA_RESTART;
        if libc::sigaction(PREEMPT_SIGNAL, &action, core::ptr::null_mut()) != 0 {
            return Err(RuntimeError::Timer(io::Error::last_os_error()));
        }
    }
    arm(tick)
}

/// Re-arm the timer with a new period. On failure the old period stays.
pub fn retune(tick: Duration) -> Result<(), RuntimeError> {
    arm(tick)
}

/// Stop the timer. Pending ticks are simply never delivered.
pub fn disarm() {
    let _ = arm(Duration::ZERO);
}

fn arm(tick: Duration) -> Result<(), RuntimeError> {
    let interval = libc::timeval {
        tv_sec: tick.as_secs() as libc::time_t,
        tv_usec: tick.subsec_micros() as libc::suseconds_t,
    };
    let timer = libc::itimerval { it_interval: interval, it_value: interval };
    if unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, core::ptr::null_mut()) } != 0 {
        return Err(RuntimeError::Timer(io::Error::last_os_error()));
    }
    Ok(())
}

/// `SIGALRM` handler.
extern "C" fn on_tick(_signum: libc::c_int) {
    let errno = unsafe { *libc::__errno_location() };

    if let Some(rt) = kernel::runtime() {
        let gate = rt.gate();
        if gate.permission() == Permission::Preemptible && gate.try_activate() {
            // returns once the scheduler picks this task again
            unsafe { rt.suspend() };
        }
    }

    unsafe { *libc::__errno_location() = errno };
}

// ---------------------------------------------------------------------------
// Sleep accuracy
// ---------------------------------------------------------------------------

/// How far a completed sleep strayed from its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepAccuracy {
    /// Within one tick of the request.
    Accurate,
    /// Off by `excess` beyond the tick, but under the fatal ratio.
    Drifted { excess: Duration },
    /// Off by so much the scheduler cannot be trusted.
    Broken { excess: Duration },
}

impl SleepAccuracy {
    /// Classify a sleep of `requested` that actually took `observed`.
    ///
    /// One tick of deviation in either direction is quantization and is
    /// ignored. A zero-length request is always `Accurate`.
    pub fn classify(requested: Duration, observed: Duration, tick: Duration) -> Self {
        if requested.is_zero() {
            return SleepAccuracy::Accurate;
        }
        let deviation = if observed > requested { observed - requested } else { requested - observed };
        let excess = deviation.saturating_sub(tick);
        if excess.is_zero() {
            SleepAccuracy::Accurate
        } else if excess.as_secs_f64() < SLEEP_FATAL_RATIO * requested.as_secs_f64() {
            SleepAccuracy::Drifted { excess }
        } else {
            SleepAccuracy::Broken { excess }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tests::LEASE_LOCK;

    const TICK: Duration = Duration::from_millis(10);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_gate_not_ready_before_start() {
        let gate = PreemptGate::new();
        assert_eq!(gate.permission(), Permission::NotReady);
        assert!(!gate.is_active());
    }

    #[test]
    fn test_gate_guarded_while_scheduler_active() {
        let _serial = LEASE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let gate = PreemptGate::new();
        gate.mark_initialized();
        assert_eq!(gate.permission(), Permission::Preemptible);

        assert!(gate.try_activate());
        assert_eq!(gate.permission(), Permission::Guarded);
        assert!(!gate.try_activate(), "second claim must fail");

        gate.deactivate();
        assert_eq!(gate.permission(), Permission::Preemptible);
    }

    #[test]
    fn test_gate_guarded_inside_critical_section() {
        let _serial = LEASE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let gate = PreemptGate::new();
        gate.mark_initialized();
        sync::critical_section(|_cs| {
            assert_eq!(gate.permission(), Permission::Guarded);
        });
        assert_eq!(gate.permission(), Permission::Preemptible);
    }

    #[test]
    fn test_sleep_within_one_tick_is_accurate() {
        assert_eq!(SleepAccuracy::classify(ms(100), ms(100), TICK), SleepAccuracy::Accurate);
        assert_eq!(SleepAccuracy::classify(ms(100), ms(110), TICK), SleepAccuracy::Accurate);
        assert_eq!(SleepAccuracy::classify(ms(100), ms(92), TICK), SleepAccuracy::Accurate);
    }

    #[test]
    fn test_small_overshoot_drifts() {
        assert_eq!(
            SleepAccuracy::classify(ms(100), ms(125), TICK),
            SleepAccuracy::Drifted { excess: ms(15) }
        );
        // early wakeups count too
        assert_eq!(
            SleepAccuracy::classify(ms(100), ms(80), TICK),
            SleepAccuracy::Drifted { excess: ms(10) }
        );
    }

    #[test]
    fn test_large_overshoot_is_broken() {
        assert_eq!(
            SleepAccuracy::classify(ms(100), ms(150), TICK),
            SleepAccuracy::Broken { excess: ms(40) }
        );
        assert!(matches!(
            SleepAccuracy::classify(ms(20), ms(500), TICK),
            SleepAccuracy::Broken { .. }
        ));
    }

    #[test]
    fn test_zero_sleep_is_never_classified_as_error() {
        assert_eq!(SleepAccuracy::classify(Duration::ZERO, ms(50), TICK), SleepAccuracy::Accurate);
    }
}
