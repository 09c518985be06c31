//! # Task Control Block
//!
//! Defines the task model for Fairfiber. Each task owns a private stack and
//! a saved continuation, and carries the bookkeeping the fair scheduler
//! needs: remaining sleep, fairness credit and an I/O readiness flag.
//!
//! ## Eligibility
//!
//! ```text
//!              sleep_for(d)                    timer ticks drain d
//!   ┌──────────┐ ─────────────► ┌──────────┐ ──────────────────────┐
//!   │ Runnable │                │ Sleeping │                       │
//!   └──────────┘ ◄───────────── └──────────┘ ◄─────────────────────┘
//!        │  ▲
//!        │  │ fd readable (epoll)
//!        ▼  │
//!   ┌──────────┐
//!   │ Waiting  │  clear_ready_and_wait()
//!   └──────────┘
//! ```
//!
//! A task is eligible when it has no sleep left *and* its ready flag is set.
//! The idle task (index 0) is always eligible and only chosen as a fallback.

use core::fmt;
use core::time::Duration;

use crate::arch::Continuation;
use crate::stack::StackRegion;

// ---------------------------------------------------------------------------
// Task identity
// ---------------------------------------------------------------------------

/// Stable index of a task in the registry. Valid for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    /// The idle task: never sleeps, never blocks, never competes for credit.
    pub const IDLE: TaskId = TaskId(0);

    pub const fn index(self) -> usize {
        self.0
    }

    pub const fn is_idle(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counters maintained by the scheduler, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskStats {
    /// Times the task was selected to run.
    pub dispatches: u64,
    /// Wall time charged to the task while it was current.
    pub run_time: Duration,
    /// Times the I/O monitor set the ready flag.
    pub wakeups: u64,
}

/// Read-only copy of a task's scheduling state.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: &'static str,
    pub sleep_remaining: Duration,
    pub credit: f64,
    pub ready: bool,
    pub stats: TaskStats,
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB): everything needed to suspend, resume and
/// schedule one task.
pub struct TaskControlBlock {
    /// Index in the scheduler's table.
    pub id: TaskId,

    /// Label used in diagnostics.
    pub name: &'static str,

    /// Saved execution state. Overwritten each time the task is suspended.
    pub continuation: Continuation,

    /// Private stack; the continuation points into it.
    pub stack: StackRegion,

    /// Sleep left before the task becomes eligible again.
    pub sleep_remaining: Duration,

    /// Fairness balance in microseconds. Debited while running, credited
    /// while others run.
    pub credit: f64,

    /// False while waiting for a registered descriptor to become readable.
    pub ready: bool,

    pub stats: TaskStats,
}

impl TaskControlBlock {
    /// A fresh, runnable TCB with zero credit.
    pub fn new(id: TaskId, name: &'static str, continuation: Continuation, stack: StackRegion) -> Self {
        Self {
            id,
            name,
            continuation,
            stack,
            sleep_remaining: Duration::ZERO,
            credit: 0.0,
            ready: true,
            stats: TaskStats::default(),
        }
    }

    /// Sleeping tasks and tasks waiting on I/O are skipped by selection.
    #[inline]
    pub fn is_eligible(&self) -> bool {
        self.ready && self.sleep_remaining.is_zero()
    }

    /// Drain `elapsed` from the sleep counter. A remainder at or below
    /// `snap` collapses to zero so timer jitter cannot cost a whole tick.
    pub fn drain_sleep(&mut self, elapsed: Duration, snap: Duration) {
        if self.sleep_remaining.is_zero() {
            return;
        }
        self.sleep_remaining = self.sleep_remaining.saturating_sub(elapsed);
        if self.sleep_remaining <= snap {
            self.sleep_remaining = Duration::ZERO;
        }
    }

    /// Add `delta` to the credit.
    #[inline]
    pub fn adjust_credit(&mut self, delta: f64) {
        self.credit += delta;
    }

    /// Keep the credit within `±cap`.
    #[inline]
    pub fn clamp_credit(&mut self, cap: f64) {
        self.credit = self.credit.clamp(-cap, cap);
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name,
            sleep_remaining: self.sleep_remaining,
            credit: self.credit,
            ready: self.ready,
            stats: self.stats,
        }
    }
}

impl fmt::Debug for TaskControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskControlBlock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sleep_remaining", &self.sleep_remaining)
            .field("credit", &self.credit)
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
