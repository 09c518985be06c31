//! # Kernel
//!
//! Top-level runtime initialization and public API for Fairfiber.
//!
//! The kernel owns the global runtime instance (scheduler, I/O monitor,
//! preemption gate and the dispatch loop's own continuation), provides task
//! creation and lifecycle APIs, and coordinates startup.
//!
//! ## Startup Sequence
//!
//! ```text
//! main()
//!   ├─► kernel::init(config)     ← Allocate the task table, open epoll
//!   ├─► kernel::create_task()    ← Register the idle task, then workers (×N)
//!   └─► kernel::start()          ← Never returns
//!         ├─► Install SIGALRM handler, arm ITIMER_REAL
//!         └─► Dispatch loop on the original thread stack:
//!               switch to task ─► task suspends ─► tick ─► switch to next
//! ```
//!
//! ## Execution contexts
//!
//! - *Task context*: code running on a task stack. Shared per-thread
//!   resources (stdout, the logger, the allocator) must be used inside a
//!   critical section.
//! - *Scheduler context*: the dispatch loop and the suspend path. Runs with
//!   the preemption gate claimed; never allocates, never locks.

use core::cell::UnsafeCell;
use core::convert::Infallible;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use core::time::Duration;
use std::os::fd::RawFd;
use std::time::Instant;

use crate::arch::{self, Continuation};
use crate::config::RuntimeConfig;
use crate::diag;
use crate::error::{fatal, FatalError, RuntimeError};
use crate::io::IoMonitor;
use crate::preempt::{self, PreemptGate, SleepAccuracy};
use crate::scheduler::Scheduler;
use crate::sync;
use crate::task::{TaskId, TaskSnapshot};

pub use crate::sync::{critical_section, enter_critical, exit_critical, CriticalSection};

// ---------------------------------------------------------------------------
// Global runtime instance
// ---------------------------------------------------------------------------

/// Everything the dispatch loop, the timer handler and task code share.
///
/// # Safety
/// Interior state is only touched by one party at a time:
/// - before `start`, by the thread calling `init`/`create_task`;
/// - afterwards, by whoever holds the preemption gate (the dispatch loop or
///   a task on its way to suspension) or by a task inside a critical
///   section, during which the gate cannot be claimed.
pub struct Runtime {
    scheduler: UnsafeCell<Scheduler>,
    config: UnsafeCell<RuntimeConfig>,
    /// Dispatch loop continuation; tasks switch back to it.
    home: UnsafeCell<Continuation>,
    io: IoMonitor,
    gate: PreemptGate,
    started: AtomicBool,
}

unsafe impl Sync for Runtime {}

/// Set once by `init`, read from task and signal context.
static RUNTIME: AtomicPtr<Runtime> = AtomicPtr::new(ptr::null_mut());

impl Runtime {
    pub(crate) fn gate(&self) -> &PreemptGate {
        &self.gate
    }

    /// # Safety
    /// See the type-level invariant: the caller must be the single party
    /// currently allowed to touch runtime state.
    #[allow(clippy::mut_from_ref)]
    unsafe fn scheduler(&self) -> &mut Scheduler {
        &mut *self.scheduler.get()
    }

    fn tick(&self) -> Duration {
        unsafe { (*self.config.get()).tick }
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Claim the scheduler from task code before a voluntary suspension.
    fn claim(&self) {
        if sync::in_critical() {
            fatal(FatalError::CriticalSectionMisuse);
        }
        let claimed = self.gate.try_activate();
        debug_assert!(claimed, "scheduler already active in task context");
    }

    /// Park the current task and resume the dispatch loop. Returns when the
    /// task is selected again.
    ///
    /// # Safety
    /// Must run on the current task's stack with the gate claimed.
    pub(crate) unsafe fn suspend(&self) {
        let margin = (*self.config.get()).stack_margin;
        let sched = self.scheduler();
        let current = sched.current_tcb_mut();
        current.stack.check(margin);
        let from: *mut Continuation = &mut current.continuation;
        arch::switch(from, self.home.get());
        resumed();
    }

    /// Runs on the original thread stack forever.
    fn dispatch_loop(&self) -> ! {
        let mut last_tick = Instant::now();
        let mut next = unsafe { self.scheduler() }.tick(Duration::ZERO, &self.io);

        loop {
            let to = unsafe { self.scheduler() }.continuation_ptr(next);
            unsafe { arch::switch(self.home.get(), to) };

            // back with the gate claimed by the task that just suspended
            let now = Instant::now();
            let elapsed = now.duration_since(last_tick);
            last_tick = now;
            next = unsafe { self.scheduler() }.tick(elapsed, &self.io);
        }
    }

    /// Run `f` with the scheduler locked out: inside a critical section once
    /// tasks are running, directly before that.
    fn guarded<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.is_started() && !sync::in_critical() {
            sync::critical_section(|_cs| f())
        } else {
            f()
        }
    }
}

pub(crate) fn runtime() -> Option<&'static Runtime> {
    unsafe { RUNTIME.load(Ordering::Acquire).as_ref() }
}

fn require() -> Result<&'static Runtime, RuntimeError> {
    runtime().ok_or(RuntimeError::NotInitialized)
}

/// The runtime, if tasks are being dispatched.
fn running() -> Option<&'static Runtime> {
    runtime().filter(|rt| rt.is_started())
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

/// Initialize the runtime.
///
/// Must be called before any other kernel function, from the thread that
/// will call [`start`]. The runtime lives until the process exits.
pub fn init(config: RuntimeConfig) -> Result<(), RuntimeError> {
    config.validate()?;
    if runtime().is_some() {
        return Err(RuntimeError::AlreadyInitialized);
    }

    let runtime = Box::new(Runtime {
        scheduler: UnsafeCell::new(Scheduler::new(&config)),
        config: UnsafeCell::new(config),
        home: UnsafeCell::new(Continuation::null()),
        io: IoMonitor::new()?,
        gate: PreemptGate::new(),
        started: AtomicBool::new(false),
    });
    let raw = Box::into_raw(runtime);
    if RUNTIME
        .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        drop(unsafe { Box::from_raw(raw) });
        return Err(RuntimeError::AlreadyInitialized);
    }

    log::info!(
        "fairfiber: tick {:?}, {} task slots, {} KiB stacks",
        config.tick,
        config.max_tasks,
        config.stack_size / 1024
    );
    Ok(())
}

/// Create a new task and register it with the scheduler.
///
/// The first task created is the idle task: it runs only when no other task
/// is eligible and is never charged for CPU time. Tasks can only be created
/// before [`start`].
///
/// # Returns
/// - `Ok(task_id)`: the task's index in the table
/// - `Err(NotInitialized)` or `Err(AlreadyStarted)`
///
/// A full table is not returned to the caller: the process exits with
/// [`crate::config::CAPACITY_EXIT_CODE`].
///
/// # Example
/// ```ignore
/// kernel::init(RuntimeConfig::default())?;
/// kernel::create_task("idle", idle_loop)?;
/// let reader = kernel::create_task("reader", read_stdin)?;
/// kernel::register_interest(0, reader)?;
/// kernel::start();
/// ```
pub fn create_task(name: &'static str, entry: fn()) -> Result<TaskId, RuntimeError> {
    let rt = require()?;
    if rt.is_started() {
        return Err(RuntimeError::AlreadyStarted);
    }
    match unsafe { rt.scheduler() }.create_task(name, entry) {
        Err(RuntimeError::CapacityExceeded { .. }) => fatal(FatalError::CapacityExceeded),
        created => created,
    }
}

/// Start dispatching tasks. **Does not return.**
///
/// Arms the preemption timer and enters the dispatch loop. If the timer
/// cannot be installed the error is logged and tasks are scheduled only at
/// their voluntary suspension points.
///
/// Startup errors end the process with exit code 1.
pub fn start() -> ! {
    match launch() {
        Ok(never) => match never {},
        Err(err) => fail(err),
    }
}

fn launch() -> Result<Infallible, RuntimeError> {
    let rt = require()?;
    if rt.started.swap(true, Ordering::SeqCst) {
        return Err(RuntimeError::AlreadyStarted);
    }
    let count = unsafe { rt.scheduler() }.task_count();
    if count == 0 {
        rt.started.store(false, Ordering::SeqCst);
        return Err(RuntimeError::NoTasks);
    }

    log::info!("fairfiber: starting {} tasks", count);

    // the dispatch loop owns the CPU until the first task resumes
    let _ = rt.gate.try_activate();
    if let Err(err) = preempt::install(rt.tick()) {
        log::error!("fairfiber: {}; continuing without preemption", err);
    }
    rt.gate.mark_initialized();
    rt.dispatch_loop()
}

fn fail(err: RuntimeError) -> ! {
    if let Some(kind) = err.as_fatal() {
        fatal(kind);
    }
    log::error!("fairfiber: {}", err);
    std::process::exit(1)
}

/// Initialize, register `idle` plus `workers` in order, and start.
///
/// Worker ids are assigned from 1 in slice order.
pub fn run(config: RuntimeConfig, idle: fn(), workers: &[(&'static str, fn())]) -> ! {
    if let Err(err) = setup(config, idle, workers) {
        fail(err);
    }
    start()
}

fn setup(config: RuntimeConfig, idle: fn(), workers: &[(&'static str, fn())]) -> Result<(), RuntimeError> {
    init(config)?;
    create_task("idle", idle)?;
    for &(name, entry) in workers {
        create_task(name, entry)?;
    }
    Ok(())
}

/// Suspend the calling task for at least `duration`.
///
/// Sleep is quantized to the tick. On wakeup the actual delay is checked:
/// a deviation of more than a tick is logged with `label`, and one of 30 %
/// of the request or more ends the process.
///
/// Outside a running runtime this blocks the OS thread instead. Calling it
/// inside a critical section is fatal.
pub fn sleep_for(duration: Duration, label: &str) {
    let Some(rt) = running() else {
        std::thread::sleep(duration);
        return;
    };

    let began = Instant::now();
    rt.claim();
    let id = unsafe {
        let sched = rt.scheduler();
        sched.sleep_current(duration);
        sched.current()
    };
    unsafe { rt.suspend() };

    if id.is_idle() || duration.is_zero() {
        return;
    }
    let observed = began.elapsed();
    match SleepAccuracy::classify(duration, observed, rt.tick()) {
        SleepAccuracy::Accurate => {}
        SleepAccuracy::Drifted { excess } => sync::critical_section(|_cs| {
            log::warn!(
                "{} '{}': slept {:?} for {:?} ({:?} beyond a tick)",
                id,
                label,
                observed,
                duration,
                excess
            );
        }),
        SleepAccuracy::Broken { .. } => {
            diag::line(format_args!(
                "fairfiber: {} '{}' slept {:?}, requested {:?}",
                id, label, observed, duration
            ));
            fatal(FatalError::SleepAccuracy);
        }
    }
}

/// Give up the rest of the time slice.
pub fn yield_now() {
    let Some(rt) = running() else {
        std::thread::yield_now();
        return;
    };
    rt.claim();
    unsafe { rt.suspend() };
}

/// Suspend the calling task until one of its registered descriptors is
/// readable.
///
/// Interest is level-triggered, so data that arrived before the call wakes
/// the task on the very next tick. The idle task cannot wait: for it this
/// is a yield.
pub fn clear_ready_and_wait() {
    let Some(rt) = running() else { return };
    rt.claim();
    unsafe { rt.scheduler() }.block_current();
    unsafe { rt.suspend() };
}

/// Wake `task` whenever `fd` becomes readable.
///
/// `fd` must stay open for the rest of the process. Registering the same
/// descriptor twice fails with `EEXIST`.
pub fn register_interest(fd: RawFd, task: TaskId) -> Result<(), RuntimeError> {
    let rt = require()?;
    rt.io.register_interest(fd, task)
}

/// The calling task's id ([`TaskId::IDLE`] outside the runtime).
pub fn current_task() -> TaskId {
    running()
        .map(|rt| unsafe { rt.scheduler() }.current())
        .unwrap_or(TaskId::IDLE)
}

/// Scheduling state of every registered task.
///
/// From task context the returned `Vec` must be dropped inside
/// [`critical_section`]; [`with_snapshot`] does that for you.
pub fn snapshot() -> Vec<TaskSnapshot> {
    match runtime() {
        Some(rt) => rt.guarded(|| unsafe { rt.scheduler() }.snapshot()),
        None => Vec::new(),
    }
}

/// Run `f` over the scheduling state of every task. The table is built,
/// inspected and freed inside one critical section, so `f` must not
/// suspend.
pub fn with_snapshot<R>(f: impl FnOnce(&[TaskSnapshot]) -> R) -> R {
    let Some(rt) = runtime() else {
        return f(&[]);
    };
    rt.guarded(|| {
        let tasks = unsafe { rt.scheduler() }.snapshot();
        f(&tasks)
    })
}

/// Change the tick interval, re-arming the timer if tasks are running.
pub fn set_tick(tick: Duration) -> Result<(), RuntimeError> {
    let rt = require()?;
    let config = unsafe { *rt.config.get() }.with_tick(tick);
    config.validate()?;

    rt.guarded(|| -> Result<(), RuntimeError> {
        if rt.is_started() {
            preempt::retune(tick)?;
        }
        unsafe {
            *rt.config.get() = config;
            rt.scheduler().set_tick_interval(tick, config.credit_cap());
        }
        log::info!("fairfiber: tick set to {:?}", tick);
        Ok(())
    })
}

/// End the process with `code`. The terminal exit path for task code.
pub fn exit(code: i32) -> ! {
    halt_scheduling();
    log::info!("Ending (status {})", code);
    std::process::exit(code)
}

/// Stop preemption for good so exit handlers run undisturbed.
fn halt_scheduling() {
    if let Some(rt) = runtime() {
        let _ = rt.gate.try_activate();
        preempt::disarm();
    }
}

// ---------------------------------------------------------------------------
// Hooks for the task entry shim
// ---------------------------------------------------------------------------

/// Completes a switch into task code: the scheduler is no longer active.
pub(crate) fn resumed() {
    if let Some(rt) = runtime() {
        rt.gate.deactivate();
    }
}

/// A task body returned normally. Ends the process with status 0.
pub(crate) fn task_returned() -> ! {
    let id = current_task();
    halt_scheduling();
    log::info!("{} returned; ending", id);
    std::process::exit(0)
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
