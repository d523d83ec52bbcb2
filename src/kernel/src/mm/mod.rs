//! Memory management: physical frames, page tables, address spaces.

pub mod address_space;
pub mod paging;
pub mod phys;

use core::fmt;

use kestrel_common::KernelError;

pub use address_space::{AddressSpace, KernelMapping, Placement, Region};
pub use paging::{CacheMode, MapFlags, Mapping, PageMap};
pub use phys::{FramePool, PhysMemory};

/// Errors from the page-table and address-space layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No physical frame or address range available.
    NoMemory,
    /// The address is already mapped.
    AlreadyMapped,
    /// Nothing is mapped at the address.
    NotMapped,
    /// Address or size does not match the page size.
    Misaligned,
    /// The range covers part of a huge page and `SPLIT` was not granted.
    HugeOverlap,
    /// Empty, overflowing or non-canonical range.
    InvalidRange,
    /// The address is outside what the caller may touch.
    BadAddress,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::NoMemory => write!(f, "out of memory"),
            MapError::AlreadyMapped => write!(f, "already mapped"),
            MapError::NotMapped => write!(f, "not mapped"),
            MapError::Misaligned => write!(f, "misaligned address or size"),
            MapError::HugeOverlap => write!(f, "partial huge page without SPLIT"),
            MapError::InvalidRange => write!(f, "invalid range"),
            MapError::BadAddress => write!(f, "bad address"),
        }
    }
}

impl From<MapError> for KernelError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::NoMemory => KernelError::NoMem,
            MapError::NotMapped | MapError::BadAddress => KernelError::Fault,
            MapError::AlreadyMapped
            | MapError::Misaligned
            | MapError::HugeOverlap
            | MapError::InvalidRange => KernelError::InvalidArg,
        }
    }
}
