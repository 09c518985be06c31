//! # Architecture Abstraction Layer
//!
//! The continuation primitive: capture the running context into one
//! [`Continuation`] and resume another. Currently implements the x86_64
//! System V port; extensible to other architectures by adding sibling
//! modules.

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{switch, Continuation};

#[cfg(not(target_arch = "x86_64"))]
compile_error!("fairfiber only supports x86_64");

/// Entry shim called on a fresh stack with the argument given to
/// [`Continuation::prepare`]. Must never return.
pub type StartFn = extern "C" fn(usize) -> !;
