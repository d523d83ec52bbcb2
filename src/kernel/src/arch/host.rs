//! Hosted stand-ins for the CPU and the time source.
//!
//! [`HostCpu`] performs no real register switching: it records what the
//! kernel asked for so tests can check the sequence. After a switch the
//! caller simply carries on as the new task. TLB invalidations are counted
//! per page.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use kestrel_hal::{Bootstrap, Cpu, InterruptController, TaskContext, Timer};
use spin::Mutex;

use crate::config::PAGE_SIZE;

/// Per-page TLB invalidation counts.
static FLUSHES: Mutex<BTreeMap<u64, usize>> = Mutex::new(BTreeMap::new());

pub(super) fn record_flush(virt: u64) {
    *FLUSHES.lock().entry(virt & !(PAGE_SIZE - 1)).or_default() += 1;
}

/// How often the page containing `virt` has been invalidated.
pub fn flush_count(virt: u64) -> usize {
    FLUSHES
        .lock()
        .get(&(virt & !(PAGE_SIZE - 1)))
        .copied()
        .unwrap_or(0)
}

/// One request the kernel made of the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuEvent {
    /// Switch into an already-started task; carries the target's kernel
    /// stack top, which identifies it.
    Switch { to_stack: u64 },
    /// First entry into a task.
    FirstRun(Bootstrap),
    /// Page-table root load.
    PageTable(u64),
    /// End of interrupt.
    Eoi(u8),
    /// User/kernel segment swap.
    SegmentSwap,
    /// Machine power off.
    PowerOff,
}

/// Recording [`Cpu`] for hosted builds.
#[derive(Debug, Default)]
pub struct HostCpu {
    events: Mutex<Vec<CpuEvent>>,
    interrupts: AtomicBool,
    powered_off: AtomicBool,
}

impl HostCpu {
    /// A CPU with interrupts enabled.
    pub fn new() -> Self {
        Self {
            interrupts: AtomicBool::new(true),
            ..Default::default()
        }
    }

    fn record(&self, event: CpuEvent) {
        self.events.lock().push(event);
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<CpuEvent> {
        self.events.lock().clone()
    }

    /// Drain the record.
    pub fn take_events(&self) -> Vec<CpuEvent> {
        core::mem::take(&mut *self.events.lock())
    }

    /// Number of context switches of either kind.
    pub fn switch_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, CpuEvent::Switch { .. } | CpuEvent::FirstRun(_)))
            .count()
    }

    /// Number of EOIs sent for `vector`.
    pub fn eoi_count(&self, vector: u8) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| **e == CpuEvent::Eoi(vector))
            .count()
    }

    /// Returns `true` once `power_off` was called.
    pub fn powered_off(&self) -> bool {
        self.powered_off.load(Ordering::Acquire)
    }
}

impl InterruptController for HostCpu {
    fn end_of_interrupt(&self, vector: u8) {
        self.record(CpuEvent::Eoi(vector));
    }

    fn mask(&self, _vector: u8) {}

    fn unmask(&self, _vector: u8) {}
}

impl Cpu for HostCpu {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::Acquire)
    }

    fn disable_interrupts(&self) {
        self.interrupts.store(false, Ordering::Release);
    }

    fn enable_interrupts(&self) {
        self.interrupts.store(true, Ordering::Release);
    }

    fn swap_segments(&self) {
        self.record(CpuEvent::SegmentSwap);
    }

    fn load_page_table(&self, root: u64) {
        self.record(CpuEvent::PageTable(root));
    }

    unsafe fn switch(&self, _from: *mut TaskContext, to: *const TaskContext) {
        // SAFETY: the caller guarantees `to` is live.
        let to_stack = unsafe { (*to).kernel_stack };
        self.record(CpuEvent::Switch { to_stack });
    }

    unsafe fn switch_from_init(
        &self,
        _from: *mut TaskContext,
        to: *mut TaskContext,
        bootstrap: &Bootstrap,
    ) {
        // SAFETY: the caller guarantees `to` is live and not aliased.
        let regs = unsafe { &mut (*to).regs };
        regs.rip = bootstrap.entry;
        regs.rsp = bootstrap.stack_top;
        regs.rdi = bootstrap.arg;
        regs.cs = if bootstrap.user { 0x23 } else { 0x08 };
        self.record(CpuEvent::FirstRun(*bootstrap));
    }

    fn power_off(&self) {
        self.powered_off.store(true, Ordering::Release);
        self.record(CpuEvent::PowerOff);
    }
}

/// A tick counter advanced by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    /// A clock at tick zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `ticks`.
    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::AcqRel);
    }

    /// Jump to `ticks`.
    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Release);
    }
}

impl Timer for ManualClock {
    fn current_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}
