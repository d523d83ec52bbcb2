//! Drivers shared by the hosted integration tests.

#![allow(dead_code)]

use kestrel_common::syscall::Syscall;
use kestrel_hal::Registers;
use kestrel_kernel::arch::host::ManualClock;
use kestrel_kernel::config::{SYSCALL_INSN_LEN, SYSCALL_VECTOR, TIMER_VECTOR};
use kestrel_kernel::interrupts::Trap;
use kestrel_kernel::process::Process;
use kestrel_kernel::sched::TaskId;
use kestrel_kernel::testutil::MINIMAL_ELF_BASE;
use kestrel_kernel::Kernel;

pub const USER_CS: u64 = 0x23;
pub const KERNEL_CS: u64 = 0x08;

pub fn user_regs() -> Registers {
    Registers {
        cs: USER_CS,
        ..Registers::default()
    }
}

pub fn kernel_regs() -> Registers {
    Registers {
        cs: KERNEL_CS,
        ..Registers::default()
    }
}

/// One timer interrupt on `core` after advancing the clock a tick.
pub fn tick(kernel: &Kernel, clock: &ManualClock, core: usize) {
    clock.advance(1);
    let mut regs = user_regs();
    kernel.handle_trap(core, Trap::vector(TIMER_VECTOR), &mut regs);
}

/// Tick `core` until `task` runs there. Panics after `limit` ticks.
pub fn run_until_current(kernel: &Kernel, clock: &ManualClock, core: usize, task: TaskId, limit: usize) {
    for _ in 0..limit {
        if kernel.current_task(core) == task {
            return;
        }
        tick(kernel, clock, core);
    }
    assert_eq!(kernel.current_task(core), task, "task never scheduled");
}

/// Issue `number` from user mode at the `int 0x80` of the minimal image
/// and return `rax`.
pub fn user_call(kernel: &Kernel, core: usize, regs: &mut Registers, number: Syscall, args: &[u64]) -> i64 {
    regs.rax = number as u64;
    let slots = [&mut regs.rdi, &mut regs.rsi, &mut regs.rdx, &mut regs.r10, &mut regs.r8, &mut regs.r9];
    for (slot, value) in slots.into_iter().zip(args.iter().copied().chain(core::iter::repeat(0))) {
        *slot = value;
    }
    regs.rip = MINIMAL_ELF_BASE + SYSCALL_INSN_LEN;
    kernel.handle_trap(core, Trap::vector(SYSCALL_VECTOR), regs);
    regs.rax as i64
}

pub fn main_task(process: &Process) -> TaskId {
    process.task_ids()[0]
}
