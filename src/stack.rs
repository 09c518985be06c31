//! # Task stacks and guard pages
//!
//! Each task runs on its own `mmap`ed stack. The lowest page of the mapping
//! is made inaccessible, so running off the end of the stack (it grows
//! downwards) faults immediately instead of silently scribbling over a
//! neighbour. On top of the hardware trap there is a software proximity
//! check, run whenever a task is suspended, that stops the process while the
//! task still has `margin` bytes left.
//!
//! ```text
//!   high  ┌──────────────────────┐ <- top()
//!         │   usable stack       │
//!         │   (grows down)       │
//!         ├──────────────────────┤ <- guard_end()
//!         │   PROT_NONE page     │
//!   low   └──────────────────────┘ <- guard_start()
//! ```

use std::io;
use std::ptr::NonNull;

use crate::diag;
use crate::error::{FatalError, RuntimeError};

/// System page size.
pub fn page_size() -> usize {
    // sysconf cannot fail for _SC_PAGESIZE on Linux
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An owned task stack with its guard page.
///
/// Never unmapped while a task might still be suspended on it; in practice
/// stacks live as long as the process.
#[derive(Debug)]
pub struct StackRegion {
    base: NonNull<u8>,
    mapped: usize,
    guard: usize,
}

impl StackRegion {
    /// Map `size` usable bytes (rounded up to whole pages) plus one guard page.
    pub fn new(size: usize) -> Result<Self, RuntimeError> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let mapped = usable + page;

        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::StackMap(io::Error::last_os_error()));
        }

        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base, mapped) };
            return Err(RuntimeError::StackMap(err));
        }

        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| RuntimeError::StackMap(io::Error::other("mmap returned null")))?;
        Ok(Self { base, mapped, guard: page })
    }

    /// Lowest address of the guard page.
    pub fn guard_start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// First usable byte, just above the guard page.
    pub fn guard_end(&self) -> usize {
        self.guard_start() + self.guard
    }

    /// Exclusive upper end of the stack.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.mapped) }
    }

    /// Usable bytes (excluding the guard).
    pub fn usable(&self) -> usize {
        self.mapped - self.guard
    }

    /// Whether `sp` lies in this stack (guard included).
    pub fn contains(&self, sp: usize) -> bool {
        sp >= self.guard_start() && sp < self.top() as usize
    }

    /// True when `sp`, lowered by `margin`, reaches the guard page.
    pub fn is_near_guard(&self, sp: usize, margin: usize) -> bool {
        sp.saturating_sub(margin) < self.guard_end()
    }

    /// Stop the process if the calling code is within `margin` bytes of the
    /// guard page.
    ///
    /// Must be called on this stack. On violation the fixed message is
    /// written with a raw syscall (anything heavier could itself overflow)
    /// and the guard page is read to force a `SIGSEGV`.
    #[inline(never)]
    pub fn check(&self, margin: usize) {
        let marker = 0u8;
        let sp = core::ptr::addr_of!(marker) as usize;
        if self.contains(sp) && self.is_near_guard(sp, margin) {
            diag::write_raw(FatalError::StackOverflow.message());
            self.fault();
        }
    }

    /// Touch the guard page. Never returns.
    pub fn fault(&self) -> ! {
        unsafe {
            core::ptr::read_volatile(self.guard_start() as *const u8);
            // unreachable unless the guard was unprotected behind our back
            libc::abort();
        }
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.mapped);
        }
    }
}
