//! Kestrel ABI definitions shared between the kernel and userspace.
//!
//! Everything in this crate is part of the stable binary interface: syscall
//! numbers, error codes, protection and capability bitmasks, and the layout
//! of event records copied out to user buffers.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod capability;
pub mod error;
pub mod event;
pub mod memory;
pub mod syscall;

pub use capability::Capabilities;
pub use error::KernelError;
pub use event::{Event, EventKind};
pub use memory::Protection;
