//! End-to-end scenarios. Each runs the `fairfiber` binary in a child
//! process: `start` never returns and the timer signal is process-wide, so
//! the runtime cannot share a process with the test harness.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fairfiber"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to launch fairfiber")
}

/// Parse the `key=value` pairs of the result line starting with `tag`.
fn result_line(output: &Output, tag: &str) -> HashMap<String, f64> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .find(|l| l.starts_with(tag))
        .unwrap_or_else(|| {
            panic!(
                "no '{tag}' line; status {:?}\nstdout:\n{stdout}\nstderr:\n{}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )
        });
    line.split_whitespace()
        .skip(1)
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.parse().expect("numeric value")))
        .collect()
}

#[test]
fn test_cpu_bound_tasks_share_evenly() {
    let output = run(&["fairness", "--millis", "2000"]);
    assert!(output.status.success(), "status {:?}", output.status);
    let values = result_line(&output, "fairness");
    for task in ["hog_a", "hog_b"] {
        let share = values[task];
        assert!((0.4..=0.6).contains(&share), "{task} got {share}");
    }
}

#[test]
fn test_sleep_periods_set_run_ratio() {
    let output = run(&["periodic", "--millis", "3000"]);
    assert!(output.status.success(), "status {:?}", output.status);
    let values = result_line(&output, "periodic");
    let (fast, slow) = (values["fast"], values["slow"]);
    assert!((25.0..=35.0).contains(&fast), "fast ran {fast} times");
    assert!((8.0..=12.0).contains(&slow), "slow ran {slow} times");
    let ratio = fast / slow;
    assert!((2.4..=3.6).contains(&ratio), "ratio {ratio}");
}

#[test]
fn test_critical_sections_are_never_interrupted() {
    let output = run(&["critical", "--millis", "1000"]);
    assert!(output.status.success(), "status {:?}", output.status);
    let values = result_line(&output, "critical");
    assert!(values["iterations"] > 0.0);
    assert_eq!(values["violations"], 0.0);
}

#[test]
fn test_readable_pipe_wakes_reader_within_a_tick() {
    let output = run(&["io", "--rounds", "8"]);
    assert!(output.status.success(), "status {:?}", output.status);
    let values = result_line(&output, "io");
    assert_eq!(values["rounds"], 8.0);
    // one 10ms tick plus scheduling slack
    assert!(values["max_latency_us"] < 20_000.0, "latency {}", values["max_latency_us"]);
}

#[test]
fn test_idle_runs_when_nothing_is_eligible() {
    let output = run(&["idle", "--millis", "300"]);
    assert!(output.status.success(), "status {:?}", output.status);
    let values = result_line(&output, "idle");
    assert_eq!(values["waiter_dispatches"], 1.0, "waiter must run once, then park");
    assert!(values["idle_dispatches"] >= 10.0, "idle ran {} times", values["idle_dispatches"]);
}

/// A bare guard-page fault also ends in `SIGSEGV`; only the check prints
/// the diagnostic before touching the guard.
fn assert_overflow_detected(output: &Output) {
    assert_eq!(output.status.signal(), Some(libc::SIGSEGV), "status {:?}", output.status);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Overflow stack detected"), "stderr: {stderr}");
}

#[test]
fn test_stack_overflow_faults() {
    assert_overflow_detected(&run(&["overflow"]));
}

#[test]
fn test_stack_overflow_caught_on_preemption() {
    assert_overflow_detected(&run(&["overflow-preempted"]));
}

#[test]
fn test_task_table_overflow_exits_89() {
    let output = run(&["capacity"]);
    assert_eq!(output.status.code(), Some(89));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("capacity exceeded"), "stderr: {stderr}");
}

#[test]
fn test_ignored_capacity_error_still_exits_89() {
    let output = run(&["capacity-unchecked"]);
    assert_eq!(output.status.code(), Some(89), "status {:?}", output.status);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("capacity exceeded"), "stderr: {stderr}");
}

#[test]
fn test_demo_echoes_stdin_until_eof() {
    use std::io::Write;
    use std::process::Stdio;

    let mut child = Command::new(env!("CARGO_BIN_EXE_fairfiber"))
        .arg("demo")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to launch fairfiber");
    {
        let mut stdin = child.stdin.take().expect("stdin piped");
        stdin.write_all(b"hello fibers\n").unwrap();
    }
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success(), "status {:?}", output.status);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("echo: hello fibers"), "stdout:\n{stdout}");
    assert!(stdout.lines().any(|l| l == "foo"));
    assert!(stdout.lines().any(|l| l == "bar"));
}
