//! # Fairfiber Configuration
//!
//! Compile-time defaults governing the scheduler and the task table, plus the
//! [`RuntimeConfig`] handed to [`kernel::init`](crate::kernel::init).
//!
//! The tick interval is the one parameter everything else is measured in:
//! sleep durations should be multiples of it, sleep remainders are quantized
//! to half of it, and the credit cap is expressed in ticks.

use core::time::Duration;

use crate::error::RuntimeError;

/// Maximum number of tasks the runtime can manage, idle task included.
/// The task table is allocated once with this capacity and never grows.
pub const MAX_TASKS: usize = 30;

/// Default interval between two scheduler ticks, in milliseconds.
pub const TICK_MS: u64 = 10;

/// Per-task stack size in bytes, excluding the guard page.
/// Must leave room for the deepest call chain plus a kernel signal frame
/// (which can reach several KiB with extended register state).
pub const STACK_SIZE: usize = 64 * 1024;

/// Safety margin used by the stack-bounds check. A task whose stack pointer
/// comes within this many bytes of its guard page is terminated.
pub const STACK_MARGIN: usize = 0x800;

/// Bytes left untouched at the very top of a fresh stack.
pub const STACK_TOP_RESERVE: usize = 256;

/// Maximum number of readiness events drained per tick.
pub const MAX_IO_EVENTS: usize = 30;

/// Credit is clamped to `±CREDIT_CAP_TICKS × tick` so a long sleeper
/// cannot return with an unbounded head start.
pub const CREDIT_CAP_TICKS: u32 = 100;

/// Sleep excess (beyond one tick of quantization) at or above this share of
/// the requested duration is treated as a scheduler malfunction.
pub const SLEEP_FATAL_RATIO: f64 = 0.3;

/// Process exit code used when the task table overflows.
pub const CAPACITY_EXIT_CODE: i32 = 89;

/// Environment variable overriding the tick interval (milliseconds).
pub const ENV_TICK_MS: &str = "FAIRFIBER_TICK_MS";

/// Environment variable overriding the per-task stack size (bytes).
pub const ENV_STACK_SIZE: &str = "FAIRFIBER_STACK_SIZE";

/// Runtime parameters, fixed at [`kernel::init`](crate::kernel::init).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeConfig {
    /// Interval timer period.
    pub tick: Duration,
    /// Usable stack bytes per task (rounded up to whole pages).
    pub stack_size: usize,
    /// Guard proximity margin in bytes.
    pub stack_margin: usize,
    /// Task table capacity, idle task included.
    pub max_tasks: usize,
    /// Credit clamp, in ticks.
    pub credit_cap_ticks: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(TICK_MS),
            stack_size: STACK_SIZE,
            stack_margin: STACK_MARGIN,
            max_tasks: MAX_TASKS,
            credit_cap_ticks: CREDIT_CAP_TICKS,
        }
    }
}

impl RuntimeConfig {
    /// Defaults, overridden by `FAIRFIBER_TICK_MS` / `FAIRFIBER_STACK_SIZE`
    /// when they are set and parse.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = read_env::<u64>(ENV_TICK_MS) {
            config.tick = Duration::from_millis(ms);
        }
        if let Some(bytes) = read_env::<usize>(ENV_STACK_SIZE) {
            config.stack_size = bytes;
        }
        config
    }

    /// Set the tick interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set the per-task stack size.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Set how close to the guard page a suspending task may get.
    pub fn with_stack_margin(mut self, stack_margin: usize) -> Self {
        self.stack_margin = stack_margin;
        self
    }

    /// Set the task table capacity.
    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.tick.is_zero() {
            return Err(RuntimeError::InvalidConfig("tick must be non-zero"));
        }
        // setitimer takes the interval as seconds + microseconds
        if self.tick.as_micros() == 0 {
            return Err(RuntimeError::InvalidConfig("tick must be at least 1us"));
        }
        if self.stack_size < 4 * self.stack_margin {
            return Err(RuntimeError::InvalidConfig(
                "stack must be at least four times the guard margin",
            ));
        }
        if self.max_tasks < 1 {
            return Err(RuntimeError::InvalidConfig("task table needs room for the idle task"));
        }
        Ok(())
    }

    /// Credit clamp in microseconds.
    pub fn credit_cap(&self) -> f64 {
        self.tick.as_micros() as f64 * self.credit_cap_ticks as f64
    }
}

fn read_env<T: core::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}
