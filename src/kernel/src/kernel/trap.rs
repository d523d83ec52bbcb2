//! Trap entry: exceptions, device interrupts and system calls all arrive
//! here through one path.

use core::sync::atomic::Ordering;

use kestrel_common::KernelError;
use kestrel_hal::Registers;

use super::Kernel;
use crate::config::{FIRST_ALLOCATABLE_VECTOR, KILLED_EXIT_CODE, SYSCALL_VECTOR};
use crate::fatal;
use crate::interrupts::{Exception, IrqContext, Trap};
use crate::ipl::Ipl;
use crate::sched::TaskStatus;
use crate::syscall::{SyscallCtx, SyscallError, SyscallFrame};

impl Kernel {
    /// Route one trap taken on `core`.
    ///
    /// Traps from user mode swap to the kernel segment state on entry and
    /// back on exit.
    pub fn handle_trap(&self, core: usize, trap: Trap, frame: &mut Registers) {
        let from_user = frame.from_user();
        if from_user {
            self.cpu.swap_segments();
        }
        match trap.vector {
            v if v < FIRST_ALLOCATABLE_VECTOR => self.handle_exception(core, trap, frame),
            SYSCALL_VECTOR => self.syscall_entry(core, frame),
            v => self.handle_interrupt(core, v, frame),
        }
        if from_user {
            self.cpu.swap_segments();
        }
    }

    fn handle_exception(&self, core: usize, trap: Trap, frame: &mut Registers) {
        let exception = Exception::from_vector(trap.vector);
        if exception == Exception::DoubleFault {
            fatal(format_args!(
                "core {}: double fault at {:#x}, rsp {:#x}",
                core, frame.rip, frame.rsp
            ));
        }
        if let Some(handler) = self.interrupts.handler(trap.vector) {
            let mut ctx = IrqContext {
                vector: trap.vector,
                core,
                frame,
                kernel: self,
            };
            handler.call(&mut ctx);
            return;
        }
        match exception {
            Exception::Breakpoint => {
                log::info!(target: "irq", "core {}: breakpoint at {:#x}", core, frame.rip);
            }
            _ => self.handle_fault(core, exception, trap, frame),
        }
    }

    /// Contain or escalate a CPU fault.
    ///
    /// User-mode faults kill the faulting task. Kernel-mode faults are
    /// converted into a `FAULT` return when they hit syscall code running
    /// at `Normal`; inside an interrupt handler or critical section they
    /// are fatal, whatever the interrupted task was doing.
    pub fn handle_fault(&self, core: usize, exception: Exception, trap: Trap, frame: &Registers) {
        if frame.from_user() {
            log::warn!(
                target: "sched",
                "core {}: user {:?} at {:#x} (address {:#x}, error {:#x}), killing task",
                core,
                exception,
                frame.rip,
                trap.fault_address,
                trap.error_code
            );
            self.exit_current(core, KernelError::Fault.to_errno());
            return;
        }
        match self.core(core).ipl.current() {
            Ipl::Normal => {}
            Ipl::Critical => fatal(format_args!(
                "core {}: {:?} at {:#x} inside critical section (address {:#x})",
                core, exception, frame.rip, trap.fault_address
            )),
            ipl => fatal(format_args!(
                "core {}: {:?} at {:#x} in {:?} interrupt handler (address {:#x})",
                core, exception, frame.rip, ipl, trap.fault_address
            )),
        }
        let contained = self.critical(core, |sched| {
            let task = sched.current_mut();
            if task.inside_syscall {
                task.syscall_faulted = true;
                (Some(task.id), None)
            } else {
                (None, None)
            }
        });
        match contained {
            Some(task) => log::warn!(
                target: "syscall",
                "core {}: {:?} at {:#x} while serving task {} (address {:#x})",
                core,
                exception,
                frame.rip,
                task.as_u64(),
                trap.fault_address
            ),
            None => fatal(format_args!(
                "core {}: unhandled kernel {:?} at {:#x} (address {:#x}, error {:#x})",
                core, exception, frame.rip, trap.fault_address, trap.error_code
            )),
        }
    }

    /// Deliver a device, timer or IPI vector.
    ///
    /// If the core's IPL masks the vector's class, it is recorded and
    /// replayed once the IPL drops. Preemption requested by the timer is
    /// carried out on the way out, and only if the interrupted code ran
    /// below `TIMER`.
    pub fn handle_interrupt(&self, core: usize, vector: u8, frame: &mut Registers) {
        let c = self.core(core);
        let class = self.interrupts.class(vector);
        if c.ipl.current() >= class {
            c.pending.mark(vector);
            self.cpu.end_of_interrupt(vector);
            log::trace!(target: "irq", "core {}: deferred vector {:#x}", core, vector);
            return;
        }
        let previous = c.ipl.raise(class);
        self.dispatch_vector(core, vector, frame);
        self.cpu.end_of_interrupt(vector);
        c.ipl.lower(previous);
        self.replay_pending(core);

        if previous < Ipl::Timer && c.need_resched.swap(false, Ordering::AcqRel) {
            self.reschedule(core);
        }
    }

    pub(super) fn dispatch_vector(&self, core: usize, vector: u8, frame: &mut Registers) {
        let mut ctx = IrqContext {
            vector,
            core,
            frame,
            kernel: self,
        };
        let direct = match self.interrupts.handler(vector) {
            Some(handler) => {
                handler.call(&mut ctx);
                true
            }
            None => false,
        };
        let chained = self.irq.handle(&mut ctx);
        if !direct && !chained {
            log::warn!(target: "irq", "core {}: unhandled interrupt {:#x}", core, vector);
        }
    }

    /// Serve one system call for the task running on `core`.
    ///
    /// The call runs at `NORMAL` bracketed by the task's inside-syscall
    /// flag. On return the result is written to `rax`; a restart rewinds
    /// `rip` and blocks the task, and a pending kill or an exit switches
    /// away for good.
    pub fn syscall_entry(&self, core: usize, regs: &mut Registers) {
        let mut frame = SyscallFrame::new(regs);
        let number = frame.number();

        let (task, shared, process) = self.critical(core, |sched| {
            let task = sched.current_mut();
            task.inside_syscall = true;
            task.syscall_faulted = false;
            ((task.id, task.shared.clone(), task.process.clone()), None)
        });

        let mut ctx = SyscallCtx {
            kernel: self,
            core,
            task,
            shared,
            process,
            args: frame.args(),
        };
        let table = self.syscall_table();
        let result = table.dispatch(number, &mut ctx);
        drop(ctx);

        self.critical(core, |sched| {
            if sched.current_id() != task {
                fatal(format_args!(
                    "core {}: syscall of task {} returned on another task",
                    core,
                    task.as_u64()
                ));
            }
            let current = sched.current_mut();
            current.inside_syscall = false;
            let result = if core::mem::take(&mut current.syscall_faulted) {
                Err(SyscallError::Kernel(KernelError::Fault))
            } else {
                result
            };
            let killed = current.shared.kill_requested() && current.status != TaskStatus::Dead;
            let restart = frame.complete(result);
            if killed {
                self.finish_task(sched, task, KILLED_EXIT_CODE);
            } else if restart && current.status == TaskStatus::Running {
                if !current.shared.wake_pending.swap(false, Ordering::AcqRel) {
                    current.status = TaskStatus::Waiting;
                }
            }
            if sched.current().status() == TaskStatus::Running {
                return ((), None);
            }
            ((), self.switch_away(core, sched))
        });
    }

    /// Give up on a syscall whose handler faulted in a way that cannot be
    /// resumed: the task exits with `FAULT`.
    pub fn abort_syscall(&self, core: usize) {
        log::warn!(target: "syscall", "core {}: aborting faulted syscall", core);
        self.exit_current(core, KernelError::Fault.to_errno());
    }
}
