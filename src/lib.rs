//! # Fairfiber — Fair, Preemptive Green Threads
//!
//! A user-space fiber runtime for Linux x86_64. Many tasks share one OS
//! thread; each has its own guard-protected stack, and a credit-based fair
//! scheduler decides who runs next whenever a task sleeps, waits for I/O,
//! yields, or is preempted by the interval timer.
//!
//! ## Overview
//!
//! - **Stackful tasks**: a task is an ordinary `fn()` running on a private
//!   `mmap`ed stack. Suspension can happen anywhere in its call chain.
//! - **Fairness**: CPU time, not dispatch count, is what gets shared. The
//!   running task is debited the wall time it used; everybody else is
//!   credited a share of it.
//! - **Preemption**: `SIGALRM` every tick (10 ms by default) interrupts the
//!   running task unless it holds the critical section.
//! - **I/O readiness**: tasks park until a registered descriptor becomes
//!   readable; epoll is polled (never blocking) at every tick.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │   init · create_task · start · sleep_for · yield_now    │
//! │   clear_ready_and_wait · register_interest · exit       │
//! ├──────────────┬──────────────────┬─────────────────────┤
//! │  Scheduler   │   Preemption     │  Sync Primitives    │
//! │  scheduler.rs│   preempt.rs     │  sync.rs            │
//! │  ─ tick()    │   ─ SIGALRM      │  ─ critical_section │
//! │  ─ select()  │   ─ gate         │                     │
//! ├──────────────┼──────────────────┼─────────────────────┤
//! │  Task Model  │  I/O Monitor     │  Stacks             │
//! │  task.rs     │  io.rs (epoll)   │  stack.rs (guards)  │
//! ├──────────────┴──────────────────┴─────────────────────┤
//! │            Arch Port (arch/x86_64.rs)                   │
//! │          Continuation · switch · fresh stack frame      │
//! ├────────────────────────────────────────────────────────┤
//! │               Linux x86_64 (System V ABI)               │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Contexts
//!
//! The dispatch loop runs on the thread's original stack. Tasks switch to it
//! when they suspend, voluntarily or from inside the timer handler; it runs
//! one scheduler tick and switches to the selected task. Scheduler code
//! never allocates or takes locks and reports through [`diag`].
//!
//! Task code runs on task stacks and may do anything, with one rule: use of
//! per-thread non-reentrant state (`println!`, `log` records, heap
//! allocation) belongs inside [`kernel::critical_section`].
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use fairfiber::{kernel, RuntimeConfig};
//!
//! fn idle() {
//!     loop {
//!         kernel::yield_now();
//!     }
//! }
//!
//! fn ticker() {
//!     loop {
//!         kernel::critical_section(|_cs| println!("tick"));
//!         kernel::sleep_for(Duration::from_millis(300), "ticker");
//!     }
//! }
//!
//! kernel::run(RuntimeConfig::default(), idle, &[("ticker", ticker)]);
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("fairfiber requires Linux (epoll, setitimer)");

pub mod config;
pub mod error;
pub mod diag;
pub mod sync;
pub mod arch;
pub mod stack;
pub mod task;
pub mod io;
pub mod scheduler;
pub mod preempt;
pub mod kernel;

pub use config::RuntimeConfig;
pub use error::{FatalError, RuntimeError};
pub use task::{TaskId, TaskSnapshot};
