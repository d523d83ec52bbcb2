//! Kernel tunables.
//!
//! Compile-time layout constants live here as `const`s; values that differ
//! between boards or test harnesses are carried by [`KernelConfig`].

use kestrel_common::Capabilities;

/// Small page size.
pub const PAGE_SIZE: u64 = 4096;
/// Huge (level-2) page size.
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;
/// Small pages per huge page.
pub const PAGES_PER_HUGE: u64 = HUGE_PAGE_SIZE / PAGE_SIZE;

/// Number of interrupt vectors.
pub const VECTOR_COUNT: usize = 256;
/// First vector available to [`crate::interrupts::InterruptTable::alloc`].
pub const FIRST_ALLOCATABLE_VECTOR: u8 = 32;
/// Local timer vector.
pub const TIMER_VECTOR: u8 = 32;
/// Inter-processor interrupt vector.
pub const IPI_VECTOR: u8 = 0xF0;
/// Software-interrupt vector used for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;
/// Spurious vector, never allocated.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Kernel stack size for every task.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;
/// Capacity of a task's event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 64;
/// Capacity of a core's remote wake inbox.
pub const WAKE_INBOX_CAPACITY: usize = 256;

/// Lowest user address handed out by the allocator.
pub const USER_ALLOC_BASE: u64 = 0x0000_0000_4000_0000;
/// One past the highest user address.
pub const USER_ADDR_END: u64 = 0x0000_8000_0000_0000;
/// Top of the main thread's stack.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFF0_0000;
/// Size of the main thread's stack.
pub const USER_STACK_SIZE: u64 = 64 * 1024;

/// Length of the system-call trap instruction (`int 0x80`), used to
/// restart a blocked call.
pub const SYSCALL_INSN_LEN: u64 = 2;

/// Exit code recorded for tasks that were killed.
pub const KILLED_EXIT_CODE: i64 = -1;

/// Run-time kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Number of cores running the scheduler loop.
    pub cores: usize,
    /// Physical address of the first frame managed by the frame allocator.
    pub phys_base: u64,
    /// Bytes of physical memory managed by the frame allocator.
    pub phys_size: u64,
    /// Timer ticks a task may run before it is preempted.
    pub quantum_ticks: u32,
    /// Milliseconds per timer tick.
    pub tick_ms: u64,
    /// Capability ceiling handed to processes created by the kernel itself.
    pub root_capabilities: Capabilities,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cores: 1,
            phys_base: HUGE_PAGE_SIZE,
            phys_size: 16 * 1024 * 1024,
            quantum_ticks: 5,
            tick_ms: 10,
            root_capabilities: Capabilities::all(),
        }
    }
}

impl KernelConfig {
    /// Convert a millisecond duration to timer ticks, rounding up.
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        let tick = self.tick_ms.max(1);
        ms.div_ceil(tick)
    }
}

/// Round `value` down to a multiple of `align` (a power of two).
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1234, PAGE_SIZE), 0x1000);
        assert_eq!(align_up(0x1234, PAGE_SIZE), Some(0x2000));
        assert_eq!(align_up(0x2000, PAGE_SIZE), Some(0x2000));
        assert_eq!(align_up(u64::MAX, PAGE_SIZE), None);
    }

    #[test]
    fn ms_rounds_up_to_ticks() {
        let config = KernelConfig::default();
        assert_eq!(config.ms_to_ticks(0), 0);
        assert_eq!(config.ms_to_ticks(1), 1);
        assert_eq!(config.ms_to_ticks(25), 3);
    }
}
