//! # Signal-safe diagnostics
//!
//! Output path for code that runs in scheduler context (the timer signal
//! handler and the dispatch loop) or on a nearly exhausted stack. Nothing
//! here allocates or takes a lock: messages are formatted into a small fixed
//! buffer and handed to a single `write(2)` on stderr.
//!
//! Task and host code should use the `log` macros instead.

use core::fmt::{self, Write};

/// Capacity of one formatted diagnostic line. Longer output is truncated.
const LINE_CAPACITY: usize = 128;

const STDERR: libc::c_int = 2;

/// Write `msg` to stderr with one raw system call. Errors are ignored:
/// there is nowhere left to report them.
pub fn write_raw(msg: &str) {
    write_bytes(msg.as_bytes());
}

fn write_bytes(bytes: &[u8]) {
    unsafe {
        let _ = libc::write(STDERR, bytes.as_ptr().cast(), bytes.len());
    }
}

/// Fixed-capacity line buffer implementing [`fmt::Write`].
pub struct LineBuf {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuf {
    pub const fn new() -> Self {
        Self { buf: [0; LINE_CAPACITY], len: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Emit the buffered line on stderr.
    pub fn flush(&self) {
        write_bytes(self.as_bytes());
    }
}

impl Default for LineBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Format and write one line unconditionally.
pub fn line(args: fmt::Arguments<'_>) {
    let mut buf = LineBuf::new();
    let _ = buf.write_fmt(args);
    let _ = buf.write_char('\n');
    buf.flush();
}

/// Scheduler-context equivalent of `log::debug!`: only emitted when the
/// global log filter admits debug records.
pub fn note(args: fmt::Arguments<'_>) {
    if log::max_level() >= log::LevelFilter::Debug {
        line(args);
    }
}

/// Scheduler-context equivalent of `log::error!`.
pub fn report(args: fmt::Arguments<'_>) {
    if log::max_level() >= log::LevelFilter::Error {
        line(args);
    }
}
