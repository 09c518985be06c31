//! # Fairfiber Demo and Scenarios
//!
//! Runs one scenario on the runtime and, for the measuring scenarios, prints
//! a single result line on stdout before exiting:
//!
//! | Scenario   | Tasks                                   | Result line |
//! |------------|-----------------------------------------|-------------|
//! | `demo`     | foo (300 ms), bar (100 ms), hog, echo   | none, runs until stdin closes |
//! | `fairness` | two CPU hogs + supervisor               | `fairness hog_a=<share> hog_b=<share>` |
//! | `periodic` | fast (100 ms), slow (300 ms), hog       | `periodic fast=<runs> slow=<runs>` |
//! | `critical` | two tasks updating a pair under lease   | `critical iterations=<n> violations=<n>` |
//! | `io`       | pipe writer + waiting reader            | `io rounds=<n> max_latency_us=<us>` |
//! | `idle`     | a waiter that is never woken            | `idle idle_dispatches=<n> waiter_dispatches=<n>` |
//! | `overflow` | unbounded recursion, yielding per frame | killed by `SIGSEGV` |
//! | `overflow-preempted` | unbounded recursion that never yields | killed by `SIGSEGV` |
//! | `capacity` | more tasks than the table holds         | exit code 89 |
//! | `capacity-unchecked` | same, creation errors ignored | exit code 89 |

use std::fmt;
use std::hint::black_box;
use std::os::fd::RawFd;
use std::process::exit;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use fairfiber::error::fatal;
use fairfiber::{kernel, RuntimeConfig, RuntimeError, TaskId};

#[macro_use]
extern crate log;

#[derive(Parser, Debug)]
#[command(name = "fairfiber", version, about = "Fairfiber demo and test scenarios")]
struct Cli {
    /// Tick interval in milliseconds (overrides FAIRFIBER_TICK_MS)
    #[arg(long)]
    tick_ms: Option<u64>,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Scenario {
    /// Two periodic printers, a CPU hog and a stdin echo task
    Demo,
    /// Two CPU-bound tasks; report each one's share of run time
    Fairness {
        #[arg(long, default_value_t = 2000)]
        millis: u64,
    },
    /// Sleepers at 100 ms and 300 ms next to a CPU hog; report run counts
    Periodic {
        #[arg(long, default_value_t = 3000)]
        millis: u64,
    },
    /// Two tasks update a counter pair inside critical sections
    Critical {
        #[arg(long, default_value_t = 1000)]
        millis: u64,
    },
    /// Wake a reader through a pipe; report the worst wake latency
    Io {
        #[arg(long, default_value_t = 10)]
        rounds: u32,
    },
    /// Park every worker; only the idle task should run
    Idle {
        #[arg(long, default_value_t = 500)]
        millis: u64,
    },
    /// Recurse until the stack guard trips
    Overflow,
    /// Recurse without yielding; only preemption can catch the overflow
    OverflowPreempted,
    /// Register more tasks than the table holds
    Capacity,
    /// Overfill the table, drop every creation result and start anyway
    CapacityUnchecked,
}

// ---------------------------------------------------------------------------
// Shared scenario state (task entries are plain `fn()`)
// ---------------------------------------------------------------------------

static RUN_MILLIS: AtomicU64 = AtomicU64::new(0);

static FAST_RUNS: AtomicU64 = AtomicU64::new(0);
static SLOW_RUNS: AtomicU64 = AtomicU64::new(0);

static PAIR_A: AtomicU64 = AtomicU64::new(0);
static PAIR_B: AtomicU64 = AtomicU64::new(0);
static VIOLATIONS: AtomicU64 = AtomicU64::new(0);

/// Busy time per frame in `overflow-preempted`.
static SPIN_NANOS: AtomicU64 = AtomicU64::new(0);

static PIPE_RX: AtomicI32 = AtomicI32::new(-1);
static PIPE_TX: AtomicI32 = AtomicI32::new(-1);
static IO_ROUNDS: AtomicU32 = AtomicU32::new(0);
/// Nanoseconds since `EPOCH` at the last pipe write.
static SENT_AT: AtomicU64 = AtomicU64::new(0);
static EPOCH: OnceLock<Instant> = OnceLock::new();

fn since_epoch() -> u64 {
    EPOCH.get().map_or(0, |epoch| epoch.elapsed().as_nanos() as u64)
}

fn run_for() -> Duration {
    Duration::from_millis(RUN_MILLIS.load(Ordering::Relaxed))
}

/// Print one line from task context.
fn say(line: impl fmt::Display) {
    kernel::critical_section(|_cs| println!("{}", line));
}

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

/// Idle task: sleeps the OS thread until the next timer tick.
fn idle() {
    loop {
        unsafe { libc::pause() };
    }
}

/// Never yields; only the timer takes the CPU away from it.
fn hog() {
    let mut counter: u64 = 0;
    loop {
        counter = black_box(counter.wrapping_add(1));
    }
}

fn foo() {
    loop {
        say("foo");
        kernel::sleep_for(Duration::from_millis(300), "foo");
    }
}

fn bar() {
    loop {
        say("bar");
        kernel::sleep_for(Duration::from_millis(100), "bar");
    }
}

/// Echo stdin line chunks until EOF.
fn echo() {
    let mut buf = [0u8; 256];
    loop {
        kernel::clear_ready_and_wait();
        let n = kernel::critical_section(|_cs| unsafe { libc::read(0, buf.as_mut_ptr().cast(), buf.len()) });
        match n {
            0 => kernel::exit(0),
            n if n > 0 => kernel::critical_section(|_cs| {
                println!("echo: {}", String::from_utf8_lossy(&buf[..n as usize]).trim_end());
            }),
            _ => {}
        }
    }
}

fn fairness_report() {
    kernel::sleep_for(run_for(), "fairness");
    let (a, b) = kernel::with_snapshot(|tasks| {
        let time_of = |name: &str| {
            tasks
                .iter()
                .find(|t| t.name == name)
                .map_or(0.0, |t| t.stats.run_time.as_secs_f64())
        };
        (time_of("hog_a"), time_of("hog_b"))
    });
    let total = (a + b).max(f64::EPSILON);
    say(format_args!("fairness hog_a={:.3} hog_b={:.3}", a / total, b / total));
    kernel::exit(0);
}

fn fast() {
    loop {
        FAST_RUNS.fetch_add(1, Ordering::Relaxed);
        kernel::sleep_for(Duration::from_millis(100), "fast");
    }
}

fn slow() {
    loop {
        SLOW_RUNS.fetch_add(1, Ordering::Relaxed);
        kernel::sleep_for(Duration::from_millis(300), "slow");
    }
}

fn periodic_report() {
    kernel::sleep_for(run_for(), "periodic");
    say(format_args!(
        "periodic fast={} slow={}",
        FAST_RUNS.load(Ordering::Relaxed),
        SLOW_RUNS.load(Ordering::Relaxed)
    ));
    kernel::exit(0);
}

/// Bumps both halves of the pair inside one critical section; any other
/// task seeing them differ means the section was interrupted.
fn pair_updater() {
    loop {
        kernel::critical_section(|_cs| {
            if PAIR_A.load(Ordering::Relaxed) != PAIR_B.load(Ordering::Relaxed) {
                VIOLATIONS.fetch_add(1, Ordering::Relaxed);
            }
            PAIR_A.fetch_add(1, Ordering::Relaxed);
            let mut spin: u64 = 0;
            for _ in 0..20_000 {
                spin = black_box(spin + 1);
            }
            PAIR_B.fetch_add(1, Ordering::Relaxed);
        });
    }
}

fn critical_report() {
    kernel::sleep_for(run_for(), "critical");
    say(format_args!(
        "critical iterations={} violations={}",
        PAIR_B.load(Ordering::Relaxed),
        VIOLATIONS.load(Ordering::Relaxed)
    ));
    kernel::exit(0);
}

fn pipe_writer() {
    let tx = PIPE_TX.load(Ordering::Relaxed);
    loop {
        kernel::sleep_for(Duration::from_millis(50), "writer");
        kernel::critical_section(|_cs| {
            SENT_AT.store(since_epoch(), Ordering::Relaxed);
            unsafe { libc::write(tx, b"x".as_ptr().cast(), 1) };
        });
    }
}

fn pipe_reader() {
    let rx = PIPE_RX.load(Ordering::Relaxed);
    let rounds = IO_ROUNDS.load(Ordering::Relaxed);
    let mut seen = 0;
    let mut worst = Duration::ZERO;
    while seen < rounds {
        kernel::clear_ready_and_wait();
        let mut byte = [0u8; 1];
        let n = kernel::critical_section(|_cs| unsafe { libc::read(rx, byte.as_mut_ptr().cast(), 1) });
        if n == 1 {
            let latency = Duration::from_nanos(since_epoch().saturating_sub(SENT_AT.load(Ordering::Relaxed)));
            worst = worst.max(latency);
            seen += 1;
        }
    }
    say(format_args!("io rounds={} max_latency_us={}", seen, worst.as_micros()));
    kernel::exit(0);
}

fn waiter() {
    loop {
        kernel::clear_ready_and_wait();
    }
}

fn idle_report() {
    kernel::sleep_for(run_for(), "idle");
    // waiter is the first worker
    let (idle_runs, waiter_runs) = kernel::with_snapshot(|tasks| {
        let dispatches = |index: usize| tasks.get(index).map_or(0, |t| t.stats.dispatches);
        (dispatches(TaskId::IDLE.index()), dispatches(1))
    });
    say(format_args!(
        "idle idle_dispatches={} waiter_dispatches={}",
        idle_runs, waiter_runs
    ));
    kernel::exit(0);
}

#[inline(never)]
fn recurse(depth: u64) -> u64 {
    if depth == u64::MAX {
        return 0;
    }
    let frame = black_box([depth as u8; 512]);
    kernel::yield_now();
    let below = recurse(depth + 1);
    below.wrapping_add(frame[(depth % 512) as usize] as u64)
}

fn overflow() {
    let total = recurse(0);
    say(total);
}

/// Each frame outlasts a tick, so the timer interrupts every frame before
/// the next one is pushed.
#[inline(never)]
fn recurse_busy(depth: u64) -> u64 {
    if depth == u64::MAX {
        return 0;
    }
    let frame = black_box([depth as u8; 2048]);
    let spin = Duration::from_nanos(SPIN_NANOS.load(Ordering::Relaxed));
    let began = Instant::now();
    while began.elapsed() < spin {
        black_box(&frame);
    }
    let below = recurse_busy(depth + 1);
    below.wrapping_add(frame[(depth % 2048) as usize] as u64)
}

fn overflow_preempted() {
    let total = recurse_busy(0);
    say(total);
}

fn quit() {
    kernel::exit(0);
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

fn demo(config: RuntimeConfig) -> Result<(), RuntimeError> {
    kernel::init(config)?;
    kernel::create_task("idle", idle)?;
    kernel::create_task("foo", foo)?;
    kernel::create_task("bar", bar)?;
    kernel::create_task("hog", hog)?;
    let echo = kernel::create_task("echo", echo)?;
    kernel::register_interest(0, echo)?;
    kernel::start()
}

fn io(config: RuntimeConfig, rounds: u32) -> Result<(), RuntimeError> {
    let (rx, tx) = pipe()?;
    PIPE_RX.store(rx, Ordering::Relaxed);
    PIPE_TX.store(tx, Ordering::Relaxed);
    IO_ROUNDS.store(rounds, Ordering::Relaxed);

    kernel::init(config)?;
    kernel::create_task("idle", idle)?;
    kernel::create_task("writer", pipe_writer)?;
    let reader = kernel::create_task("reader", pipe_reader)?;
    kernel::register_interest(rx, reader)?;
    kernel::start()
}

fn overflow_unyielding(config: RuntimeConfig) -> Result<(), RuntimeError> {
    SPIN_NANOS.store(2 * config.tick.as_nanos() as u64, Ordering::Relaxed);
    // a signal frame plus the handler must fit below the check point
    let config = config.with_stack_margin(config.stack_margin.max(8 * 1024));
    kernel::run(config, idle, &[("deep", overflow_preempted)])
}

/// A host that ignores creation errors must still not start.
fn capacity_unchecked(config: RuntimeConfig) -> Result<(), RuntimeError> {
    kernel::init(config)?;
    let _ = kernel::create_task("idle", idle);
    for _ in 0..config.max_tasks + 10 {
        let _ = kernel::create_task("filler", quit);
    }
    kernel::start()
}

fn pipe() -> Result<(RawFd, RawFd), RuntimeError> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
        return Err(RuntimeError::Epoll(std::io::Error::last_os_error()));
    }
    Ok((fds[0], fds[1]))
}

fn run_scenario(scenario: Scenario, config: RuntimeConfig) -> Result<(), RuntimeError> {
    match scenario {
        Scenario::Demo => demo(config),
        Scenario::Fairness { millis } => {
            RUN_MILLIS.store(millis, Ordering::Relaxed);
            kernel::run(config, idle, &[("hog_a", hog), ("hog_b", hog), ("report", fairness_report)])
        }
        Scenario::Periodic { millis } => {
            RUN_MILLIS.store(millis, Ordering::Relaxed);
            kernel::run(
                config,
                idle,
                &[("fast", fast), ("slow", slow), ("hog", hog), ("report", periodic_report)],
            )
        }
        Scenario::Critical { millis } => {
            RUN_MILLIS.store(millis, Ordering::Relaxed);
            kernel::run(
                config,
                idle,
                &[("pair_1", pair_updater), ("pair_2", pair_updater), ("report", critical_report)],
            )
        }
        Scenario::Io { rounds } => io(config, rounds),
        Scenario::Idle { millis } => {
            RUN_MILLIS.store(millis, Ordering::Relaxed);
            kernel::run(config, idle, &[("waiter", waiter), ("report", idle_report)])
        }
        Scenario::Overflow => kernel::run(config, idle, &[("deep", overflow)]),
        Scenario::OverflowPreempted => overflow_unyielding(config),
        Scenario::Capacity => {
            let workers: Vec<(&'static str, fn())> = (0..config.max_tasks).map(|_| ("filler", hog as fn())).collect();
            kernel::run(config, idle, &workers)
        }
        Scenario::CapacityUnchecked => capacity_unchecked(config),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let _ = EPOCH.set(Instant::now());

    let mut config = RuntimeConfig::from_env();
    if let Some(ms) = cli.tick_ms {
        config = config.with_tick(Duration::from_millis(ms));
    }
    debug!("scenario {:?} with {:?}", cli.scenario, config);

    if let Err(err) = run_scenario(cli.scenario, config) {
        if let Some(kind) = err.as_fatal() {
            fatal(kind);
        }
        error!("{}", err);
        exit(1);
    }
}
