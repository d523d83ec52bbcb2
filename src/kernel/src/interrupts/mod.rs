//! Interrupt vector table.
//!
//! 256 slots. Vectors 0-31 are architecture exceptions and are only ever
//! installed explicitly with [`InterruptTable::set_handler`]. Vectors 32-254
//! are handed out by [`InterruptTable::alloc`]; the spurious vector 255 is
//! never allocated.
//!
//! The used-vector bitmap is shared by every core and claimed with atomic
//! test-and-set, so concurrent allocations on different cores never return
//! the same vector. Handler slots are written only by the core that claimed
//! the vector.

pub mod generic;

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use kestrel_hal::Registers;
use spin::RwLock;

use crate::config::{FIRST_ALLOCATABLE_VECTOR, SPURIOUS_VECTOR, VECTOR_COUNT};
use crate::ipl::Ipl;
use crate::Kernel;

pub use generic::{GenericIrq, InstallStatus, IrqActionId, IrqReturn, RemoveStatus};

/// State handed to an interrupt handler.
pub struct IrqContext<'a> {
    /// Vector being serviced.
    pub vector: u8,
    /// Core servicing it.
    pub core: usize,
    /// Register state of the interrupted code.
    pub frame: &'a mut Registers,
    /// The kernel instance.
    pub kernel: &'a Kernel,
}

/// An installed interrupt handler.
///
/// The closure carries whatever context the handler needs.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(&mut IrqContext<'_>) + Send + Sync>);

impl Handler {
    /// Wrap a closure.
    pub fn new(f: impl Fn(&mut IrqContext<'_>) + Send + Sync + 'static) -> Self {
        Handler(Arc::new(f))
    }

    /// Invoke the handler.
    pub fn call(&self, ctx: &mut IrqContext<'_>) {
        (self.0)(ctx)
    }

    /// Returns `true` if both values refer to the same installation.
    pub fn same_as(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({:p})", Arc::as_ptr(&self.0))
    }
}

/// Vector allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// Every allocatable vector is in use.
    NoVector,
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrqError::NoVector => write!(f, "no interrupt vector available"),
        }
    }
}

impl From<IrqError> for kestrel_common::KernelError {
    fn from(_: IrqError) -> Self {
        kestrel_common::KernelError::NoMem
    }
}

/// Decoded architecture trap information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    /// Vector number.
    pub vector: u8,
    /// Error code pushed by the CPU, 0 if none.
    pub error_code: u64,
    /// Faulting linear address (page faults only).
    pub fault_address: u64,
}

impl Trap {
    /// A trap without error code or address.
    pub const fn vector(vector: u8) -> Self {
        Self {
            vector,
            error_code: 0,
            fault_address: 0,
        }
    }
}

/// Architecture exceptions the kernel distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// #DE
    DivideError,
    /// #BP
    Breakpoint,
    /// #UD
    InvalidOpcode,
    /// #DF
    DoubleFault,
    /// #GP
    GeneralProtection,
    /// #PF
    PageFault,
    /// Any other reserved vector.
    Other(u8),
}

impl Exception {
    /// Decode an exception vector (0-31).
    pub fn from_vector(vector: u8) -> Self {
        match vector {
            0 => Exception::DivideError,
            3 => Exception::Breakpoint,
            6 => Exception::InvalidOpcode,
            8 => Exception::DoubleFault,
            13 => Exception::GeneralProtection,
            14 => Exception::PageFault,
            v => Exception::Other(v),
        }
    }
}

/// Global vector table.
pub struct InterruptTable {
    used: [AtomicU64; VECTOR_COUNT / 64],
    slots: [RwLock<Option<Handler>>; VECTOR_COUNT],
    classes: [AtomicU8; VECTOR_COUNT],
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptTable {
    /// Create an empty table. Only the spurious vector is reserved.
    pub fn new() -> Self {
        let table = Self {
            used: core::array::from_fn(|_| AtomicU64::new(0)),
            slots: core::array::from_fn(|_| RwLock::new(None)),
            classes: core::array::from_fn(|_| AtomicU8::new(Ipl::Dev as u8)),
        };
        table.reserve(SPURIOUS_VECTOR);
        table
    }

    fn bit(vector: u8) -> (usize, u64) {
        (usize::from(vector) / 64, 1u64 << (vector % 64))
    }

    /// Atomically claim `vector`. Returns `false` if it was already used.
    fn try_claim(&self, vector: u8) -> bool {
        let (word, mask) = Self::bit(vector);
        self.used[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Mark `vector` used without installing a handler.
    pub fn reserve(&self, vector: u8) -> bool {
        self.try_claim(vector)
    }

    /// Returns `true` if `vector` is marked used.
    pub fn is_used(&self, vector: u8) -> bool {
        let (word, mask) = Self::bit(vector);
        self.used[word].load(Ordering::Acquire) & mask != 0
    }

    /// Number of allocatable vectors still free.
    pub fn available(&self) -> usize {
        (FIRST_ALLOCATABLE_VECTOR..=u8::MAX)
            .filter(|&v| !self.is_used(v))
            .count()
    }

    /// Allocate a free vector and install `handler` on it.
    ///
    /// Returns `None` when every allocatable vector is in use.
    pub fn alloc(&self, handler: Handler) -> Option<u8> {
        let vector = (FIRST_ALLOCATABLE_VECTOR..=u8::MAX).find(|&v| self.try_claim(v))?;
        *self.slots[usize::from(vector)].write() = Some(handler);
        log::debug!(target: "irq", "allocated vector {:#x}", vector);
        Some(vector)
    }

    /// Force-install `handler` at `vector`, returning the previous one.
    pub fn set_handler(&self, vector: u8, handler: Option<Handler>) -> Option<Handler> {
        if vector >= FIRST_ALLOCATABLE_VECTOR && handler.is_some() {
            self.try_claim(vector);
        }
        core::mem::replace(&mut *self.slots[usize::from(vector)].write(), handler)
    }

    /// Release `vector` and remove its handler.
    pub fn dealloc(&self, vector: u8) {
        *self.slots[usize::from(vector)].write() = None;
        if vector >= FIRST_ALLOCATABLE_VECTOR && vector != SPURIOUS_VECTOR {
            let (word, mask) = Self::bit(vector);
            self.used[word].fetch_and(!mask, Ordering::AcqRel);
        }
    }

    /// Handler currently installed at `vector`.
    pub fn handler(&self, vector: u8) -> Option<Handler> {
        self.slots[usize::from(vector)].read().clone()
    }

    /// Priority class of `vector`.
    pub fn class(&self, vector: u8) -> Ipl {
        match self.classes[usize::from(vector)].load(Ordering::Relaxed) {
            0 => Ipl::Normal,
            1 => Ipl::Dev,
            2 => Ipl::Timer,
            3 => Ipl::InterCpu,
            _ => Ipl::Critical,
        }
    }

    /// Change the priority class of `vector`.
    pub fn set_class(&self, vector: u8, class: Ipl) {
        self.classes[usize::from(vector)].store(class as u8, Ordering::Relaxed);
    }
}

/// Vectors that arrived while masked by the core's IPL.
#[derive(Debug, Default)]
pub struct PendingVectors {
    bits: [AtomicU64; VECTOR_COUNT / 64],
}

impl PendingVectors {
    /// Record `vector` for later replay.
    pub fn mark(&self, vector: u8) {
        let (word, mask) = InterruptTable::bit(vector);
        self.bits[word].fetch_or(mask, Ordering::AcqRel);
    }

    /// Returns `true` if `vector` is pending.
    pub fn is_pending(&self, vector: u8) -> bool {
        let (word, mask) = InterruptTable::bit(vector);
        self.bits[word].load(Ordering::Acquire) & mask != 0
    }

    /// Take the highest-class pending vector whose class is above `level`.
    pub fn take_unmasked(&self, table: &InterruptTable, level: Ipl) -> Option<u8> {
        let mut best: Option<(Ipl, u8)> = None;
        for (word, bits) in self.bits.iter().enumerate() {
            let mut pending = bits.load(Ordering::Acquire);
            while pending != 0 {
                let bit = pending.trailing_zeros() as usize;
                pending &= pending - 1;
                let vector = (word * 64 + bit) as u8;
                let class = table.class(vector);
                if class > level && best.map_or(true, |(c, _)| class > c) {
                    best = Some((class, vector));
                }
            }
        }
        let (_, vector) = best?;
        let (word, mask) = InterruptTable::bit(vector);
        let prev = self.bits[word].fetch_and(!mask, Ordering::AcqRel);
        (prev & mask != 0).then_some(vector)
    }
}
