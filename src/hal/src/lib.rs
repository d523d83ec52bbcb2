//! Kestrel Hardware Abstraction Layer (HAL).
//!
//! This crate defines the narrow boundary between the architecture-agnostic
//! kernel core and the machine it runs on: interrupt controller, time source,
//! and the CPU trap/context primitives. Everything above these traits is
//! portable; everything below them is inline assembly and port I/O.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

/// Trait for a serial port or similar character-based communication channel.
pub trait Serial {
    /// Writes a single byte to the serial port.
    fn write_byte(&mut self, byte: u8);
    /// Reads a single byte from the serial port, if available.
    fn read_byte(&mut self) -> Option<u8>;
}

/// Trait for an interrupt controller (PIC, APIC, GIC...).
pub trait InterruptController {
    /// Signals the end of an interrupt to the controller.
    fn end_of_interrupt(&self, vector: u8);
    /// Masks a hardware interrupt line.
    fn mask(&self, vector: u8);
    /// Unmasks a hardware interrupt line.
    fn unmask(&self, vector: u8);
}

/// Trait for a system timer.
pub trait Timer: Send + Sync {
    /// Returns the number of ticks since the system started.
    fn current_ticks(&self) -> u64;
}

/// General-purpose register snapshot of a trapped or switched-out task.
///
/// Trap entry copies the saved frame into this struct and back on exit.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Registers {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Registers {
    /// Returns `true` if the snapshot was taken while running in user mode.
    pub fn from_user(&self) -> bool {
        self.cs & 0b11 == 0b11
    }
}

/// Legacy FXSAVE area for x87/SSE state.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpState(pub [u8; 512]);

impl Default for FpState {
    fn default() -> Self {
        let mut area = [0u8; 512];
        // FCW = 0x037F, MXCSR = 0x1F80: the reset defaults.
        area[0] = 0x7F;
        area[1] = 0x03;
        area[24] = 0x80;
        area[25] = 0x1F;
        FpState(area)
    }
}

impl core::fmt::Debug for FpState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("FpState { .. }")
    }
}

/// Full saved execution state of one task.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskContext {
    /// General-purpose and control registers.
    pub regs: Registers,
    /// Floating point / vector state.
    pub fp: FpState,
    /// FS segment base (thread pointer).
    pub fs_base: u64,
    /// Inactive GS base (user value while in the kernel).
    pub gs_base: u64,
    /// Top of the task's private kernel stack, used for traps from user mode.
    pub kernel_stack: u64,
}

/// Initial state for the first switch into a brand-new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bootstrap {
    /// First instruction to execute.
    pub entry: u64,
    /// Initial stack pointer.
    pub stack_top: u64,
    /// Value placed in the first argument register.
    pub arg: u64,
    /// Drop to user mode on entry.
    pub user: bool,
}

/// CPU trap and context primitives.
///
/// Implementations must be usable from every core. All methods that mutate
/// task state are only invoked with the core's IPL at `CRITICAL`.
pub trait Cpu: InterruptController + Send + Sync {
    /// Returns whether maskable interrupts are enabled on this core.
    fn interrupts_enabled(&self) -> bool;
    /// Masks interrupts on this core.
    fn disable_interrupts(&self);
    /// Unmasks interrupts on this core.
    fn enable_interrupts(&self);
    /// Swaps the user and kernel GS bases (trap entry/exit from user mode).
    fn swap_segments(&self);
    /// Loads the page-table root for the next task.
    fn load_page_table(&self, root: u64);
    /// Saves the running state into `from` and resumes `to`.
    ///
    /// # Safety
    ///
    /// Both pointers must reference live contexts that stay pinned until the
    /// old task is resumed again.
    unsafe fn switch(&self, from: *mut TaskContext, to: *const TaskContext);
    /// Saves the running state into `from` and enters a never-run task,
    /// initializing `to` from `bootstrap`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Cpu::switch`].
    unsafe fn switch_from_init(
        &self,
        from: *mut TaskContext,
        to: *mut TaskContext,
        bootstrap: &Bootstrap,
    );
    /// Powers the machine off. May return if unsupported.
    fn power_off(&self);
}
