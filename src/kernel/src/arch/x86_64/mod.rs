//! x86_64 bare-metal support.
//!
//! Descriptor tables, the trap stubs, the context switch, the 8259 PICs,
//! the PIT and the COM1 logger.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod serial;
pub mod timer;

pub use context::X86Cpu;
pub use timer::PitClock;

/// Halts the CPU until the next interrupt.
#[inline]
pub fn hlt() {
    x86_64::instructions::hlt();
}

/// Halts the CPU in an infinite loop with interrupts masked.
///
/// Used after unrecoverable errors (panics).
pub fn halt_loop() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        hlt();
    }
}
