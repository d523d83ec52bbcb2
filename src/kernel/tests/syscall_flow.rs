//! System calls driven end to end through the trap entry.

mod common;

use std::sync::atomic::{AtomicU8, Ordering};

use common::{kernel_regs, main_task, run_until_current, tick, user_call, user_regs};
use kestrel_common::syscall::Syscall;
use kestrel_common::{Event, EventKind, KernelError};
use kestrel_hal::Registers;
use kestrel_kernel::config::{KILLED_EXIT_CODE, SYSCALL_VECTOR};
use kestrel_kernel::interrupts::{Handler, Trap};
use kestrel_kernel::sched::TaskStatus;
use kestrel_kernel::syscall::{SyscallCtx, SyscallResult, SyscallTable};
use kestrel_kernel::testutil::{self, MINIMAL_ELF_BASE};
use kestrel_kernel::Kernel;

#[test]
fn unbound_number_reports_not_supported() {
    let (kernel, _cpu, clock) = testutil::hosted_kernel();
    let process = testutil::user_process(&kernel);
    run_until_current(&kernel, &clock, 0, main_task(&process), 4);

    let mut regs = user_regs();
    regs.rax = 9999;
    regs.rip = MINIMAL_ELF_BASE + 2;
    kernel.handle_trap(0, Trap::vector(SYSCALL_VECTOR), &mut regs);
    assert_eq!(regs.rax as i64, KernelError::OperationNotSupported.to_errno());
    assert_eq!(kernel.current_task(0), main_task(&process));
}

#[test]
fn wait_for_event_blocks_then_completes_on_restart() {
    let (kernel, cpu, clock) = testutil::hosted_kernel();
    let process = testutil::user_process(&kernel);
    let task = main_task(&process);
    let buf = testutil::put_user(&process, &[0u8; Event::SIZE]);
    run_until_current(&kernel, &clock, 0, task, 4);

    let mut regs = user_regs();
    user_call(&kernel, 0, &mut regs, Syscall::WaitForEvent, &[buf]);
    assert_eq!(regs.rip, MINIMAL_ELF_BASE, "restart rewinds to the trap instruction");
    assert_eq!(kernel.task_status(0, task), Some(TaskStatus::Waiting));
    assert_eq!(kernel.current_task(0), kernel.core(0).idle());

    let switches = cpu.switch_count();
    kernel
        .post_event(task, Event::new(EventKind::User, 7, 9))
        .unwrap();
    run_until_current(&kernel, &clock, 0, task, 4);
    assert!(cpu.switch_count() > switches);

    assert_eq!(user_call(&kernel, 0, &mut regs, Syscall::WaitForEvent, &[buf]), 0);
    let mut raw = [0u8; Event::SIZE];
    process.space().copy_from_user(buf, &mut raw).unwrap();
    assert_eq!(Event::from_bytes(&raw), Some(Event::new(EventKind::User, 7, 9)));
}

#[test]
fn wake_before_block_is_not_lost() {
    let (kernel, _cpu, clock) = testutil::hosted_kernel();
    let process = testutil::user_process(&kernel);
    let task = main_task(&process);
    let buf = testutil::put_user(&process, &[0u8; Event::SIZE]);
    run_until_current(&kernel, &clock, 0, task, 4);

    assert!(kernel.wake(task));
    let mut regs = user_regs();
    user_call(&kernel, 0, &mut regs, Syscall::WaitForEvent, &[buf]);
    // The call restarts but the task keeps the core.
    assert_eq!(regs.rip, MINIMAL_ELF_BASE);
    assert_eq!(kernel.task_status(0, task), Some(TaskStatus::Running));
    assert_eq!(kernel.current_task(0), task);
}

#[test]
fn sleep_returns_after_the_deadline() {
    let (kernel, _cpu, clock) = testutil::hosted_kernel();
    let process = testutil::user_process(&kernel);
    let task = main_task(&process);
    run_until_current(&kernel, &clock, 0, task, 4);

    let start = kernel.now();
    let mut regs = user_regs();
    user_call(&kernel, 0, &mut regs, Syscall::Sleep, &[25]);
    assert_eq!(kernel.task_status(0, task), Some(TaskStatus::Waiting));

    tick(&kernel, &clock, 0);
    tick(&kernel, &clock, 0);
    assert_ne!(kernel.current_task(0), task);
    tick(&kernel, &clock, 0);
    assert_eq!(kernel.current_task(0), task);
    assert_eq!(kernel.now() - start, kernel.config().ms_to_ticks(25));

    assert_eq!(user_call(&kernel, 0, &mut regs, Syscall::Sleep, &[25]), 0);
}

#[test]
fn exited_process_stays_zombie_until_waited() {
    let (kernel, _cpu, clock) = testutil::hosted_kernel();
    let parent = testutil::user_process(&kernel);
    let child = testutil::user_process(&kernel);
    let (parent_task, child_task) = (main_task(&parent), main_task(&child));
    run_until_current(&kernel, &clock, 0, parent_task, 4);

    let mut parent_regs = user_regs();
    let pid = child.id().as_u64();
    user_call(&kernel, 0, &mut parent_regs, Syscall::WaitProcess, &[pid]);
    assert_eq!(kernel.current_task(0), child_task);

    let mut child_regs = user_regs();
    user_call(&kernel, 0, &mut child_regs, Syscall::Exit, &[7]);
    assert_eq!(child.exit_code(), Some(7));
    assert!(kernel.process(child.id()).is_some(), "zombie kept for the waiter");

    run_until_current(&kernel, &clock, 0, parent_task, 4);
    assert_eq!(user_call(&kernel, 0, &mut parent_regs, Syscall::WaitProcess, &[pid]), 7);
    assert!(kernel.process(child.id()).is_none());
    assert_eq!(
        user_call(&kernel, 0, &mut parent_regs, Syscall::WaitProcess, &[pid]),
        KernelError::NotExists.to_errno()
    );
}

#[test]
fn kill_is_honoured_at_syscall_return() {
    let (kernel, _cpu, clock) = testutil::hosted_kernel();
    let process = testutil::user_process(&kernel);
    let task = main_task(&process);
    run_until_current(&kernel, &clock, 0, task, 4);

    kernel.kill_task(task).unwrap();
    assert_eq!(kernel.current_task(0), task, "a running task is not stopped mid-flight");

    let text = testutil::put_user(&process, b"last words\n");
    let mut regs = user_regs();
    user_call(&kernel, 0, &mut regs, Syscall::Dprint, &[text, 11]);
    assert_eq!(kernel.current_task(0), kernel.core(0).idle());
    assert_eq!(process.exit_code(), Some(KILLED_EXIT_CODE));
}

fn kernel_page_fault(kernel: &Kernel, core: usize) {
    let mut regs = Registers {
        rip: 0xFFFF_8000_0010_0000,
        ..kernel_regs()
    };
    let trap = Trap {
        vector: 14,
        error_code: 0,
        fault_address: 0x10,
    };
    kernel.handle_trap(core, trap, &mut regs);
}

fn faulting_devmsg(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    kernel_page_fault(ctx.kernel, ctx.core);
    Ok(1)
}

static DEVICE_VECTOR: AtomicU8 = AtomicU8::new(0);

/// Raises the device vector in the middle of the call, as a device would.
fn interrupted_devmsg(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let vector = DEVICE_VECTOR.load(Ordering::SeqCst);
    ctx.kernel
        .handle_trap(ctx.core, Trap::vector(vector), &mut kernel_regs());
    Ok(1)
}

#[test]
fn kernel_fault_inside_a_syscall_returns_fault() {
    let (kernel, _cpu, clock) = testutil::hosted_kernel();
    let mut table = SyscallTable::standard();
    assert!(table.bind(Syscall::Devmsg as u64, faulting_devmsg));
    kernel.install_syscalls(table);

    let process = testutil::user_process(&kernel);
    let task = main_task(&process);
    run_until_current(&kernel, &clock, 0, task, 4);

    let mut regs = user_regs();
    let ret = user_call(&kernel, 0, &mut regs, Syscall::Devmsg, &[]);
    assert_eq!(ret, KernelError::Fault.to_errno());
    assert!(!kernel.is_halted());
    assert_eq!(kernel.current_task(0), task);

    // The flag does not leak into the next call.
    let text = testutil::put_user(&process, b"ok");
    assert_eq!(user_call(&kernel, 0, &mut regs, Syscall::Dprint, &[text, 2]), 2);
}

#[test]
#[should_panic(expected = "interrupt handler")]
fn kernel_fault_in_an_irq_handler_during_a_syscall_is_fatal() {
    let (kernel, _cpu, clock) = testutil::hosted_kernel();
    let vector = kernel
        .alloc_vector(Handler::new(|ctx| kernel_page_fault(ctx.kernel, ctx.core)))
        .unwrap();
    DEVICE_VECTOR.store(vector, Ordering::SeqCst);
    let mut table = SyscallTable::standard();
    assert!(table.bind(Syscall::Devmsg as u64, interrupted_devmsg));
    kernel.install_syscalls(table);

    let process = testutil::user_process(&kernel);
    run_until_current(&kernel, &clock, 0, main_task(&process), 4);

    let mut regs = user_regs();
    user_call(&kernel, 0, &mut regs, Syscall::Devmsg, &[]);
}

#[test]
fn user_fault_terminates_only_the_faulting_task() {
    let (kernel, _cpu, clock) = testutil::hosted_kernel();
    let victim = testutil::user_process(&kernel);
    let bystander = testutil::user_process(&kernel);
    run_until_current(&kernel, &clock, 0, main_task(&victim), 4);

    let mut regs = user_regs();
    regs.rip = MINIMAL_ELF_BASE;
    let trap = Trap {
        vector: 13,
        error_code: 0,
        fault_address: 0,
    };
    kernel.handle_trap(0, trap, &mut regs);

    assert_eq!(victim.exit_code(), Some(KernelError::Fault.to_errno()));
    assert_eq!(kernel.current_task(0), main_task(&bystander));
    assert!(!kernel.is_halted());
}

#[test]
#[should_panic(expected = "unhandled kernel")]
fn kernel_fault_outside_a_syscall_is_fatal() {
    let (kernel, _cpu, _clock) = testutil::hosted_kernel();
    let mut regs = kernel_regs();
    let trap = Trap {
        vector: 14,
        error_code: 2,
        fault_address: 0xdead_0000,
    };
    kernel.handle_trap(0, trap, &mut regs);
}

#[test]
fn shutdown_from_a_kernel_thread_powers_off() {
    let (kernel, cpu, _clock) = testutil::hosted_kernel();
    let mut regs = kernel_regs();
    regs.rax = Syscall::Shutdown as u64;
    kernel.handle_trap(0, Trap::vector(SYSCALL_VECTOR), &mut regs);
    assert!(cpu.powered_off());
    assert!(kernel.is_halted());
}
