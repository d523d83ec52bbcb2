//! Kestrel kernel core.
//!
//! The execution engine of a small multi-core kernel: interrupt priority
//! levels, the vector table, per-core schedulers, address spaces, the
//! system-call dispatcher and the ELF loader.
//!
//! # Architecture
//!
//! - `arch`: the bare-metal x86_64 layer, or recording stand-ins on a host
//! - `ipl`, `interrupts`: priority levels, vector table, shared IRQ chains
//! - `sched`: tasks and the per-core round-robin scheduler
//! - `mm`: frames, page tables and address spaces
//! - `process`: processes, ELF loading and the initial user stack
//! - `syscall`: the dispatcher and its handlers
//! - `kernel`: the [`Kernel`] context tying everything together
//!
//! Everything above `arch` is architecture-agnostic and runs unchanged in
//! hosted tests.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod allocator;
pub mod arch;
pub mod boot;
pub mod config;
pub mod fs;
pub mod interrupts;
pub mod ipl;
pub mod kernel;
pub mod mm;
pub mod modules;
pub mod process;
pub mod sched;
pub mod syscall;
#[cfg(not(target_os = "none"))]
pub mod testutil;

pub use kernel::{Core, Kernel, Platform};

/// Report an unrecoverable kernel condition and stop.
///
/// The message is logged at `error` level first so it reaches the serial
/// log even if the panic path cannot print.
#[track_caller]
pub fn fatal(args: core::fmt::Arguments) -> ! {
    log::error!(target: "kernel", "fatal: {}", args);
    panic!("{}", args)
}
