//! # Scheduler
//!
//! Task registry and the credit-based fair scheduling policy. This module is
//! pure bookkeeping: it never switches stacks itself. The dispatch loop in
//! [`kernel`](crate::kernel) calls [`Scheduler::tick`] every time a task is
//! suspended and then resumes whichever task the tick selected.
//!
//! ## Scheduling Algorithm
//!
//! Each tick, with `elapsed` = wall time since the previous tick:
//! 1. **Poll I/O**: tasks whose descriptors became readable get `ready = true`
//! 2. **Debit**: the task that just ran loses `elapsed` credit
//! 3. **Drain & credit**: every non-idle task drains `elapsed` from its sleep
//!    (remainders ≤ half a tick snap to zero) and earns
//!    `elapsed / task_count` credit
//! 4. **Select**: highest credit among eligible non-idle tasks, ties to the
//!    lowest index
//! 5. **Fallback**: nobody eligible → the idle task
//!
//! A task that never sleeps is still preempted every tick: it is debited
//! while it runs and everybody else is credited, so the balance tips to the
//! next task. This is a simplified completely-fair-scheduling policy with no
//! priority classes.

use core::time::Duration;

use crate::arch::{Continuation, StartFn};
use crate::config::RuntimeConfig;
use crate::diag;
use crate::error::RuntimeError;
use crate::io::IoMonitor;
use crate::stack::StackRegion;
use crate::task::{TaskControlBlock, TaskId, TaskSnapshot};

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The central scheduler state: all TCBs plus the scheduling parameters.
///
/// ## Design Notes
///
/// - The table is allocated once with its full capacity; ticks never
///   allocate, so the scheduler can run in signal context
/// - `current` tracks the index of the task that was dispatched last
/// - The idle task (index 0) is always present once the runtime starts
pub struct Scheduler {
    /// Registered tasks, indexed by `TaskId`. Index 0 is the idle task.
    tasks: Vec<TaskControlBlock>,

    /// Maximum number of tasks, idle task included.
    capacity: usize,

    /// Task dispatched by the last tick.
    current: TaskId,

    /// Timer period; sleep remainders at or below half of it snap to zero.
    tick: Duration,

    /// Credit clamp in microseconds.
    credit_cap: f64,

    /// Stack size for new tasks.
    stack_size: usize,

    /// Number of ticks processed.
    tick_count: u64,
}

impl Scheduler {
    /// Create an empty scheduler sized by `config`.
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            tasks: Vec::with_capacity(config.max_tasks),
            capacity: config.max_tasks,
            current: TaskId::IDLE,
            tick: config.tick,
            credit_cap: config.credit_cap(),
            stack_size: config.stack_size,
            tick_count: 0,
        }
    }

    /// Register a new task that will run `entry` on its own stack.
    ///
    /// The first task registered becomes the idle task.
    ///
    /// # Returns
    /// - `Ok(task_id)`: the index of the newly created task
    /// - `Err(CapacityExceeded)`: the table is full
    /// - `Err(StackMap)`: the stack could not be mapped
    pub fn create_task(&mut self, name: &'static str, entry: fn()) -> Result<TaskId, RuntimeError> {
        self.create_task_with(name, task_start, entry as usize)
    }

    /// Like [`create_task`](Self::create_task) with an explicit start shim.
    pub(crate) fn create_task_with(
        &mut self,
        name: &'static str,
        start: StartFn,
        arg: usize,
    ) -> Result<TaskId, RuntimeError> {
        if self.tasks.len() >= self.capacity {
            return Err(RuntimeError::CapacityExceeded { capacity: self.capacity });
        }

        let id = TaskId(self.tasks.len());
        let stack = StackRegion::new(self.stack_size)?;
        let continuation = unsafe { Continuation::prepare(stack.top(), start, arg) };
        log::debug!(
            "{} '{}': stack {:#x}..{:#x}, guard below {:#x}",
            id,
            name,
            stack.guard_end(),
            stack.top() as usize,
            stack.guard_end()
        );

        self.tasks.push(TaskControlBlock::new(id, name, continuation, stack));
        Ok(id)
    }

    /// Run one full scheduling decision and return the task to resume.
    ///
    /// The caller must already have captured the outgoing task's
    /// continuation into its TCB.
    pub fn tick(&mut self, elapsed: Duration, io: &IoMonitor) -> TaskId {
        self.poll_io(io);
        self.account(elapsed);
        let next = self.select();
        self.dispatch(next);
        next
    }

    /// Mark every task with a readable descriptor as ready. Poll failures
    /// are reported and otherwise ignored.
    pub fn poll_io(&mut self, io: &IoMonitor) {
        let result = io.poll(|id| self.mark_ready(id));
        if let Err(err) = result {
            diag::report(format_args!("fairfiber: watch for io failed: {}", err));
        }
    }

    /// Set `id`'s ready flag (I/O readiness observed).
    pub fn mark_ready(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(id.index()) {
            task.ready = true;
            task.stats.wakeups += 1;
            diag::note(format_args!("Waking {}", id.index()));
        }
    }

    /// Charge `elapsed` to the current task, then drain sleep and hand out
    /// credit to every non-idle task.
    ///
    /// Credits are then re-centred on zero (a uniform shift, which never
    /// changes a selection) and clamped to `±credit_cap`, bounding how far a
    /// long sleeper can get ahead of everybody else.
    pub fn account(&mut self, elapsed: Duration) {
        self.tick_count += 1;
        if self.tasks.is_empty() {
            return;
        }

        let elapsed_us = elapsed.as_secs_f64() * 1e6;
        let snap = self.tick / 2;

        if let Some(current) = self.tasks.get_mut(self.current.index()) {
            current.stats.run_time += elapsed;
            if !current.id.is_idle() {
                current.adjust_credit(-elapsed_us);
            }
        }

        let share = elapsed_us / self.tasks.len() as f64;
        for task in self.tasks.iter_mut().skip(1) {
            task.drain_sleep(elapsed, snap);
            task.adjust_credit(share);
        }

        self.normalize_credit();
    }

    fn normalize_credit(&mut self) {
        let workers = self.tasks.len() - 1;
        if workers == 0 {
            return;
        }
        let mean = self.tasks.iter().skip(1).map(|t| t.credit).sum::<f64>() / workers as f64;
        let cap = self.credit_cap;
        for task in self.tasks.iter_mut().skip(1) {
            task.adjust_credit(-mean);
            task.clamp_credit(cap);
        }
    }

    /// Pick the eligible non-idle task with the most credit, falling back to
    /// the idle task.
    pub fn select(&self) -> TaskId {
        let mut best = TaskId::IDLE;
        let mut best_credit = f64::NEG_INFINITY;

        for task in self.tasks.iter().skip(1) {
            if task.is_eligible() && task.credit > best_credit {
                best_credit = task.credit;
                best = task.id;
            }
        }
        best
    }

    /// Make `next` the current task.
    pub fn dispatch(&mut self, next: TaskId) {
        self.current = next;
        if let Some(task) = self.tasks.get_mut(next.index()) {
            task.stats.dispatches += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Task-side requests (called with the scheduler guard held)
    // -----------------------------------------------------------------------

    /// Add `duration` to the current task's sleep. The idle task never
    /// sleeps; for it this is a plain yield.
    pub fn sleep_current(&mut self, duration: Duration) {
        let current = self.current_tcb_mut();
        if !current.id.is_idle() {
            current.sleep_remaining += duration;
        }
    }

    /// Clear the current task's ready flag; it will not be selected until
    /// the I/O monitor sets it again.
    pub fn block_current(&mut self) {
        let current = self.current_tcb_mut();
        if !current.id.is_idle() {
            current.ready = false;
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn current(&self) -> TaskId {
        self.current
    }

    /// Get a reference to the current task's TCB.
    pub fn current_tcb(&self) -> &TaskControlBlock {
        &self.tasks[self.current.index()]
    }

    /// Get a mutable reference to the current task's TCB.
    pub fn current_tcb_mut(&mut self) -> &mut TaskControlBlock {
        &mut self.tasks[self.current.index()]
    }

    /// Where `id`'s continuation is saved. Stable for the process lifetime:
    /// the table never reallocates.
    pub(crate) fn continuation_ptr(&mut self, id: TaskId) -> *mut Continuation {
        &mut self.tasks[id.index()].continuation
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskControlBlock> {
        self.tasks.get(id.index())
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut TaskControlBlock> {
        self.tasks.get_mut(id.index())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Change the quantization tick (after the interval timer was re-armed).
    pub fn set_tick_interval(&mut self, tick: Duration, credit_cap: f64) {
        self.tick = tick;
        self.credit_cap = credit_cap;
    }

    /// Copy of every task's scheduling state. Allocates.
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.tasks.iter().map(TaskControlBlock::snapshot).collect()
    }
}

// ---------------------------------------------------------------------------
// Task entry shim
// ---------------------------------------------------------------------------

/// First code run on every fresh task stack.
///
/// Completes the switch-in the resumed side normally performs (dropping the
/// scheduler guard), runs the task body, and ends the process if the body
/// ever returns.
extern "C" fn task_start(entry: usize) -> ! {
    crate::kernel::resumed();
    let entry: fn() = unsafe { core::mem::transmute::<usize, fn()>(entry) };
    entry();
    crate::kernel::task_returned()
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tests::{pipe, write_byte};
    use std::os::fd::AsRawFd;

    const TICK: Duration = Duration::from_millis(10);

    fn noop() {}

    fn make_scheduler(workers: usize) -> Scheduler {
        let config = RuntimeConfig::default().with_stack_size(16 * 1024);
        let mut sched = Scheduler::new(&config);
        sched.create_task("idle", noop).unwrap();
        for _ in 0..workers {
            sched.create_task("worker", noop).unwrap();
        }
        sched
    }

    /// Advance one tick with no I/O and return the selection.
    fn step(sched: &mut Scheduler, elapsed: Duration) -> TaskId {
        sched.account(elapsed);
        let next = sched.select();
        sched.dispatch(next);
        next
    }

    #[test]
    fn test_create_task_assigns_sequential_ids() {
        let sched = make_scheduler(3);
        assert_eq!(sched.task_count(), 4);
        for i in 0..4 {
            assert_eq!(sched.task(TaskId(i)).unwrap().id, TaskId(i));
        }
        assert!(!sched.task(TaskId(1)).unwrap().continuation.is_null());
    }

    #[test]
    fn test_capacity_exceeded() {
        let config = RuntimeConfig::default().with_stack_size(16 * 1024).with_max_tasks(2);
        let mut sched = Scheduler::new(&config);
        sched.create_task("idle", noop).unwrap();
        sched.create_task("a", noop).unwrap();
        let err = sched.create_task("b", noop).unwrap_err();
        assert!(matches!(err, RuntimeError::CapacityExceeded { capacity: 2 }));
        assert_eq!(sched.task_count(), sched.capacity(), "a full table stays full");
    }

    #[test]
    fn test_set_tick_interval_moves_snap_window() {
        let mut sched = make_scheduler(1);
        assert_eq!(sched.tick_interval(), TICK);

        let coarse = Duration::from_millis(40);
        sched.set_tick_interval(coarse, 100.0 * coarse.as_micros() as f64);
        assert_eq!(sched.tick_interval(), coarse);

        // 15ms left is within half of the new tick, so it snaps to zero
        step(&mut sched, coarse);
        sched.sleep_current(Duration::from_millis(55));
        step(&mut sched, coarse);
        assert!(sched.task(TaskId(1)).unwrap().is_eligible(), "remainder under half a tick must snap");
    }

    #[test]
    fn test_each_tick_dispatches_exactly_one_task() {
        let mut sched = make_scheduler(3);
        let io = IoMonitor::new().unwrap();
        let (rx, tx) = pipe();
        let reader = TaskId(3);
        io.register_interest(rx.as_raw_fd(), reader).unwrap();

        for round in 0..200u32 {
            let next = sched.tick(TICK, &io);
            assert_eq!(sched.current(), next, "tick {round} resumed a task it did not make current");
            assert_eq!(sched.current_tcb().id, next, "current TCB disagrees with current id");

            match round % 7 {
                0 => sched.sleep_current(Duration::from_millis(30)),
                3 if next == reader => sched.block_current(),
                5 => write_byte(&tx),
                _ => {}
            }

            let dispatches: u64 = sched.snapshot().iter().map(|t| t.stats.dispatches).sum();
            assert_eq!(dispatches, sched.tick_count(), "tick {round} dispatched more than one task");
        }
    }

    #[test]
    fn test_idle_only_when_nothing_else_is_eligible() {
        let mut sched = make_scheduler(2);
        assert_eq!(step(&mut sched, TICK), TaskId(1));

        sched.task_mut(TaskId(1)).unwrap().sleep_remaining = Duration::from_secs(1);
        sched.task_mut(TaskId(2)).unwrap().ready = false;
        for _ in 0..10 {
            assert_eq!(step(&mut sched, TICK), TaskId::IDLE, "all workers parked");
        }
    }

    #[test]
    fn test_idle_never_earns_or_spends_credit() {
        let mut sched = make_scheduler(1);
        sched.task_mut(TaskId(1)).unwrap().ready = false;
        for _ in 0..20 {
            step(&mut sched, TICK);
        }
        assert_eq!(sched.task(TaskId::IDLE).unwrap().credit, 0.0);
        assert_eq!(sched.current(), TaskId::IDLE);
    }

    #[test]
    fn test_ties_go_to_lowest_index() {
        let mut sched = make_scheduler(3);
        // all workers start at equal credit
        assert_eq!(step(&mut sched, Duration::ZERO), TaskId(1));
    }

    #[test]
    fn test_running_task_is_debited() {
        let mut sched = make_scheduler(2);
        step(&mut sched, TICK); // task 1 dispatched
        step(&mut sched, TICK); // task 1 charged a full tick
        let one = sched.task(TaskId(1)).unwrap().credit;
        let two = sched.task(TaskId(2)).unwrap().credit;
        assert!(one < two, "runner {one} should trail waiter {two}");
        assert_eq!(sched.current(), TaskId(2));
    }

    #[test]
    fn test_fairness_converges_to_equal_share() {
        let mut sched = make_scheduler(2);
        let ticks = 1_000;
        for _ in 0..ticks {
            step(&mut sched, TICK);
        }
        let a = sched.task(TaskId(1)).unwrap().stats.run_time.as_secs_f64();
        let b = sched.task(TaskId(2)).unwrap().stats.run_time.as_secs_f64();
        let total = a + b;
        assert!((a / total - 0.5).abs() < 0.01, "share a={a} b={b}");
    }

    #[test]
    fn test_fairness_with_uneven_slices() {
        // alternate long and short ticks; credit still evens out run time
        let mut sched = make_scheduler(3);
        for i in 0..3_000u64 {
            let elapsed = Duration::from_micros(5_000 + (i % 7) * 1_000);
            step(&mut sched, elapsed);
        }
        let shares: Vec<f64> = (1..=3)
            .map(|i| sched.task(TaskId(i)).unwrap().stats.run_time.as_secs_f64())
            .collect();
        let total: f64 = shares.iter().sum();
        for share in &shares {
            assert!((share / total - 1.0 / 3.0).abs() < 0.02, "shares {shares:?}");
        }
    }

    #[test]
    fn test_sleep_ratio_matches_request_ratio() {
        // fast sleeps 100ms, slow sleeps 300ms, over 9s of 10ms ticks
        let mut sched = make_scheduler(2);
        let (fast, slow) = (TaskId(1), TaskId(2));
        let mut runs = [0u32; 3];
        for _ in 0..900 {
            let next = step(&mut sched, TICK);
            runs[next.index()] += 1;
            let sleep = match next {
                id if id == fast => Duration::from_millis(100),
                id if id == slow => Duration::from_millis(300),
                _ => continue,
            };
            sched.sleep_current(sleep);
        }
        assert!((89..=91).contains(&runs[1]), "fast ran {}", runs[1]);
        assert!((29..=31).contains(&runs[2]), "slow ran {}", runs[2]);
    }

    #[test]
    fn test_sleep_snaps_within_half_tick() {
        let mut sched = make_scheduler(1);
        step(&mut sched, TICK);
        sched.sleep_current(Duration::from_millis(20));
        // 16ms elapsed leaves 4ms, under half a tick: eligible right away
        assert_eq!(step(&mut sched, Duration::from_millis(16)), TaskId(1));
    }

    #[test]
    fn test_sleeper_not_selected_early() {
        let mut sched = make_scheduler(1);
        step(&mut sched, TICK);
        sched.sleep_current(Duration::from_millis(50));
        let mut idle_ticks = 0;
        while step(&mut sched, TICK) == TaskId::IDLE {
            idle_ticks += 1;
        }
        // woken on the tick that leaves ≤ 5ms, i.e. after 5 ticks
        assert_eq!(idle_ticks, 4);
    }

    #[test]
    fn test_credit_is_capped_for_long_sleepers() {
        let config = RuntimeConfig::default().with_stack_size(16 * 1024);
        let mut sched = make_scheduler(2);
        sched.task_mut(TaskId(2)).unwrap().sleep_remaining = Duration::from_secs(3600);
        for _ in 0..100_000 {
            step(&mut sched, TICK);
        }
        let credit = sched.task(TaskId(2)).unwrap().credit;
        assert!(credit <= config.credit_cap(), "credit {credit}");
    }

    #[test]
    fn test_io_readiness_wakes_within_one_tick() {
        let mut sched = make_scheduler(2);
        let io = IoMonitor::new().unwrap();
        let (rx, tx) = pipe();
        let reader = TaskId(2);
        io.register_interest(rx.as_raw_fd(), reader).unwrap();

        // reader runs once, then parks itself waiting for data
        while sched.tick(TICK, &io) != reader {}
        sched.block_current();

        for _ in 0..50 {
            assert_ne!(sched.tick(TICK, &io), reader, "selected before data arrived");
        }

        write_byte(&tx);
        // accumulated credit makes the woken reader the very next pick
        assert_eq!(sched.tick(TICK, &io), reader);
        assert_eq!(sched.task(reader).unwrap().stats.wakeups, 1);
    }

    #[test]
    fn test_idle_cannot_be_blocked() {
        let mut sched = make_scheduler(0);
        step(&mut sched, TICK);
        sched.block_current();
        assert!(sched.task(TaskId::IDLE).unwrap().ready);
    }

    #[test]
    fn test_idle_sleep_is_a_yield() {
        let mut sched = make_scheduler(0);
        step(&mut sched, TICK);
        sched.sleep_current(Duration::from_secs(5));
        assert_eq!(sched.task(TaskId::IDLE).unwrap().sleep_remaining, Duration::ZERO);
    }

    #[test]
    fn test_unknown_ready_id_is_ignored() {
        let mut sched = make_scheduler(1);
        sched.mark_ready(TaskId(99));
        assert_eq!(sched.task_count(), 2);
    }
}
