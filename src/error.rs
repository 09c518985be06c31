//! # Errors
//!
//! Two kinds of failure exist in the runtime:
//!
//! - [`RuntimeError`]: reported through `Result`, recoverable by the caller
//!   (setup failures, bad configuration, epoll/timer errors).
//! - [`FatalError`]: the runtime's state can no longer be trusted. These end
//!   the process through [`fatal`] after a diagnostic line written with a
//!   raw `write(2)`, so they are safe to raise from the signal handler or from
//!   a stack that is about to overflow.

use std::io;

use crate::config::CAPACITY_EXIT_CODE;
use crate::diag;

/// Recoverable runtime error.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("runtime already initialized")]
    AlreadyInitialized,
    #[error("runtime not initialized")]
    NotInitialized,
    #[error("runtime already started")]
    AlreadyStarted,
    #[error("no tasks registered; the idle task must exist before start")]
    NoTasks,
    #[error("task table full ({capacity} tasks)")]
    CapacityExceeded { capacity: usize },
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("stack mapping failed: {0}")]
    StackMap(#[source] io::Error),
    #[error("epoll: {0}")]
    Epoll(#[source] io::Error),
    #[error("interval timer: {0}")]
    Timer(#[source] io::Error),
}

/// Unrecoverable failure. See [`fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// A task's stack pointer came within the guard margin.
    StackOverflow,
    /// More tasks than the table can hold.
    CapacityExceeded,
    /// Nested `enter_critical`, unmatched `exit_critical`, or suspending
    /// while holding the lease.
    CriticalSectionMisuse,
    /// A sleep overshot by far more than the tick can explain.
    SleepAccuracy,
}

impl FatalError {
    /// Fixed diagnostic line. Must not need formatting or allocation.
    pub const fn message(self) -> &'static str {
        match self {
            FatalError::StackOverflow => "Overflow stack detected\n",
            FatalError::CapacityExceeded => "fairfiber: task table capacity exceeded\n",
            FatalError::CriticalSectionMisuse => "fairfiber: critical section misuse\n",
            FatalError::SleepAccuracy => "fairfiber: sleep accuracy out of tolerance\n",
        }
    }
}

impl RuntimeError {
    /// The fatal class of this error, if startup cannot continue past it.
    pub fn as_fatal(&self) -> Option<FatalError> {
        match self {
            RuntimeError::CapacityExceeded { .. } => Some(FatalError::CapacityExceeded),
            _ => None,
        }
    }
}

/// Terminate the process for `err`.
///
/// Capacity overflow exits with [`CAPACITY_EXIT_CODE`]; everything else
/// aborts. Stack overflow is not routed here: it faults on the guard page
/// instead (see [`crate::stack::StackRegion::fault`]).
pub fn fatal(err: FatalError) -> ! {
    diag::write_raw(err.message());
    match err {
        FatalError::CapacityExceeded => unsafe { libc::_exit(CAPACITY_EXIT_CODE) },
        _ => unsafe { libc::abort() },
    }
}
