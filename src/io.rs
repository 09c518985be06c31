//! # I/O Readiness Monitor
//!
//! Associates file descriptors with tasks through one epoll instance. The
//! scheduler polls it (never blocking) at the start of every tick, so a task
//! whose descriptor became readable is eligible in that same decision.
//!
//! Interest is level-triggered `EPOLLIN`: as long as unread data remains the
//! owning task keeps being marked ready.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::config::MAX_IO_EVENTS;
use crate::error::RuntimeError;
use crate::task::TaskId;

/// Epoll-backed readiness monitor.
#[derive(Debug)]
pub struct IoMonitor {
    epoll: OwnedFd,
}

impl IoMonitor {
    pub fn new() -> Result<Self, RuntimeError> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(RuntimeError::Epoll(io::Error::last_os_error()));
        }
        Ok(Self { epoll: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Wake `task` whenever `fd` has data to read.
    ///
    /// There is no unregistration; registering the same descriptor twice
    /// fails with `EEXIST`.
    pub fn register_interest(&self, fd: RawFd, task: TaskId) -> Result<(), RuntimeError> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: task.index() as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc != 0 {
            return Err(RuntimeError::Epoll(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Drain pending readiness without blocking, calling `on_ready` once per
    /// event. Returns the number of events.
    ///
    /// Allocation-free: safe to call from the scheduler.
    pub fn poll(&self, mut on_ready: impl FnMut(TaskId)) -> Result<usize, io::Error> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_IO_EVENTS];
        let n = loop {
            let n = unsafe {
                libc::epoll_wait(self.epoll.as_raw_fd(), events.as_mut_ptr(), MAX_IO_EVENTS as libc::c_int, 0)
            };
            if n >= 0 {
                break n;
            }
            // epoll_wait is never restarted after a signal, even with SA_RESTART
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };
        for event in &events[..n as usize] {
            let data = event.u64;
            on_ready(TaskId(data as usize));
        }
        Ok(n as usize)
    }
}

impl AsRawFd for IoMonitor {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}
