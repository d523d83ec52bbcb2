//! System call dispatch.
//!
//! A trap on [`crate::config::SYSCALL_VECTOR`] is decoded into a
//! [`SyscallFrame`]: the number in `rax`, arguments in `rdi`, `rsi`, `rdx`,
//! `r10`, `r8`, `r9`, and the result written back to `rax`. The number is
//! looked up in a [`SyscallTable`]; unbound numbers return
//! `OPERATION_NOT_SUPPORTED` without invoking anything.
//!
//! Handlers that must wait arrange a wake-up and return
//! [`SyscallError::Restart`]. The instruction pointer is then rewound over
//! the trap instruction and the task blocks, so the call is issued again
//! from scratch when the task next runs.

pub mod handlers;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use kestrel_common::syscall::{PosixSyscall, Syscall, POSIX_SYSCALL_BASE};
use kestrel_common::KernelError;
use kestrel_hal::Registers;

use crate::config::SYSCALL_INSN_LEN;
use crate::fs::FsError;
use crate::mm::MapError;
use crate::process::{ElfError, Process};
use crate::sched::{TaskId, TaskShared};
use crate::Kernel;

/// Longest path accepted from userspace.
pub const MAX_PATH_LEN: usize = 4096;
/// Largest single copy between user and kernel memory.
pub const MAX_USER_COPY: usize = 64 * 1024;

/// Register view of one system call.
pub struct SyscallFrame<'a> {
    regs: &'a mut Registers,
}

impl<'a> SyscallFrame<'a> {
    /// Wrap the trapped register state.
    pub fn new(regs: &'a mut Registers) -> Self {
        Self { regs }
    }

    /// Requested syscall number.
    pub fn number(&self) -> u64 {
        self.regs.rax
    }

    /// The six argument registers in ABI order.
    pub fn args(&self) -> [u64; 6] {
        let r = &self.regs;
        [r.rdi, r.rsi, r.rdx, r.r10, r.r8, r.r9]
    }

    /// Raw return slot.
    pub fn ret(&self) -> u64 {
        self.regs.rax
    }

    /// Write the outcome of a call. Returns `true` if the call must be
    /// restarted, in which case `rax` still holds the number and `rip`
    /// points back at the trap instruction.
    pub fn complete(&mut self, result: SyscallResult) -> bool {
        match result {
            Ok(value) => {
                self.regs.rax = value;
                false
            }
            Err(SyscallError::Kernel(err)) => {
                self.regs.rax = err.to_errno() as u64;
                false
            }
            Err(SyscallError::Restart) => {
                self.regs.rip = self.regs.rip.wrapping_sub(SYSCALL_INSN_LEN);
                true
            }
        }
    }
}

/// Failure of a syscall handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Return this error to the caller.
    Kernel(KernelError),
    /// Block and issue the call again when woken.
    Restart,
}

impl From<KernelError> for SyscallError {
    fn from(err: KernelError) -> Self {
        SyscallError::Kernel(err)
    }
}

impl From<MapError> for SyscallError {
    fn from(err: MapError) -> Self {
        SyscallError::Kernel(err.into())
    }
}

impl From<FsError> for SyscallError {
    fn from(err: FsError) -> Self {
        SyscallError::Kernel(err.into())
    }
}

impl From<ElfError> for SyscallError {
    fn from(err: ElfError) -> Self {
        SyscallError::Kernel(err.into())
    }
}

/// Handler result: the value for `rax` or an error.
pub type SyscallResult = Result<u64, SyscallError>;

/// Signature of a syscall handler.
pub type SyscallFn = fn(&mut SyscallCtx<'_>) -> SyscallResult;

/// Everything a handler needs about the calling task.
pub struct SyscallCtx<'a> {
    /// The kernel.
    pub kernel: &'a Kernel,
    /// Core the call arrived on.
    pub core: usize,
    /// Calling task.
    pub task: TaskId,
    /// Calling task's shared record.
    pub shared: Arc<TaskShared>,
    /// Calling process, `None` for kernel threads.
    pub process: Option<Arc<Process>>,
    /// Raw argument registers.
    pub args: [u64; 6],
}

impl SyscallCtx<'_> {
    /// Argument `index` (0-5).
    pub fn arg(&self, index: usize) -> u64 {
        self.args[index]
    }

    /// The calling process. Kernel threads get `INVALID_ARG`.
    pub fn process(&self) -> Result<&Arc<Process>, KernelError> {
        self.process.as_ref().ok_or(KernelError::InvalidArg)
    }

    /// Copy `len` bytes out of the caller's memory.
    pub fn read_user(&self, addr: u64, len: usize) -> Result<Vec<u8>, KernelError> {
        if len > MAX_USER_COPY {
            return Err(KernelError::InvalidArg);
        }
        let process = self.process.as_ref().ok_or(KernelError::Fault)?;
        let mut buf = vec![0u8; len];
        process.space().copy_from_user(addr, &mut buf)?;
        Ok(buf)
    }

    /// Copy a UTF-8 string argument out of the caller's memory.
    pub fn read_str(&self, addr: u64, len: u64) -> Result<String, KernelError> {
        let len = usize::try_from(len).map_err(|_| KernelError::InvalidArg)?;
        if len > MAX_PATH_LEN {
            return Err(KernelError::InvalidArg);
        }
        let bytes = self.read_user(addr, len)?;
        String::from_utf8(bytes).map_err(|_| KernelError::InvalidArg)
    }

    /// Copy `data` into the caller's memory.
    pub fn write_user(&self, addr: u64, data: &[u8]) -> Result<(), KernelError> {
        let process = self.process.as_ref().ok_or(KernelError::Fault)?;
        process.space().copy_to_user(addr, data)?;
        Ok(())
    }
}

/// Fixed-size handler tables for the core and POSIX syscall ranges.
#[derive(Clone, Copy)]
pub struct SyscallTable {
    core: [Option<SyscallFn>; Syscall::COUNT],
    posix: [Option<SyscallFn>; PosixSyscall::COUNT],
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl SyscallTable {
    /// A table with nothing bound.
    pub const fn empty() -> Self {
        Self {
            core: [None; Syscall::COUNT],
            posix: [None; PosixSyscall::COUNT],
        }
    }

    /// The kernel's handler set.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        handlers::bind_all(&mut table);
        table
    }

    fn slot(&mut self, number: u64) -> Option<&mut Option<SyscallFn>> {
        if number >= POSIX_SYSCALL_BASE {
            let index = usize::try_from(number - POSIX_SYSCALL_BASE).ok()?;
            self.posix.get_mut(index)
        } else {
            self.core.get_mut(usize::try_from(number).ok()?)
        }
    }

    /// Bind `handler` to `number`. Returns `false` if the number lies
    /// outside both tables.
    pub fn bind(&mut self, number: u64, handler: SyscallFn) -> bool {
        match self.slot(number) {
            Some(slot) => {
                *slot = Some(handler);
                true
            }
            None => false,
        }
    }

    /// Remove the handler bound to `number`.
    pub fn unbind(&mut self, number: u64) -> Option<SyscallFn> {
        self.slot(number)?.take()
    }

    /// Handler bound to `number`.
    pub fn lookup(&self, number: u64) -> Option<SyscallFn> {
        if number >= POSIX_SYSCALL_BASE {
            let index = usize::try_from(number - POSIX_SYSCALL_BASE).ok()?;
            *self.posix.get(index)?
        } else {
            *self.core.get(usize::try_from(number).ok()?)?
        }
    }

    /// Run the handler for `number`.
    pub fn dispatch(&self, number: u64, ctx: &mut SyscallCtx<'_>) -> SyscallResult {
        match self.lookup(number) {
            Some(handler) => handler(ctx),
            None => {
                log::debug!(
                    target: "syscall",
                    "task {} called unbound syscall {:#x}",
                    ctx.task.as_u64(),
                    number
                );
                Err(KernelError::OperationNotSupported.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static SPY_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn spy(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
        SPY_CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(ctx.arg(0) + 1)
    }

    #[test]
    fn numbers_map_to_both_tables() {
        let mut table = SyscallTable::empty();
        assert!(table.bind(Syscall::Sleep.number(), spy));
        assert!(table.bind(POSIX_SYSCALL_BASE + PosixSyscall::Kill as u64, spy));
        assert!(!table.bind(Syscall::COUNT as u64, spy));
        assert!(!table.bind(POSIX_SYSCALL_BASE + PosixSyscall::COUNT as u64, spy));
        assert!(table.lookup(Syscall::Sleep.number()).is_some());
        assert!(table.lookup(9999).is_none());
        assert!(table.unbind(Syscall::Sleep.number()).is_some());
        assert!(table.lookup(Syscall::Sleep.number()).is_none());
    }

    #[test]
    fn standard_table_leaves_driver_calls_unbound() {
        let table = SyscallTable::standard();
        assert!(table.lookup(Syscall::Devmsg.number()).is_none());
        assert!(table.lookup(Syscall::Devenum.number()).is_none());
        assert!(table
            .lookup(POSIX_SYSCALL_BASE + PosixSyscall::Sigrestore as u64)
            .is_none());
        for nr in [Syscall::Exit, Syscall::Sleep, Syscall::Mmap, Syscall::Readdir] {
            assert!(table.lookup(nr.number()).is_some(), "{:?}", nr);
        }
    }

    #[test]
    fn frame_completion() {
        let mut regs = Registers {
            rax: 7,
            rip: 0x1002,
            rdi: 1,
            rsi: 2,
            rdx: 3,
            r10: 4,
            r8: 5,
            r9: 6,
            ..Default::default()
        };
        let mut frame = SyscallFrame::new(&mut regs);
        assert_eq!(frame.number(), 7);
        assert_eq!(frame.args(), [1, 2, 3, 4, 5, 6]);
        assert!(frame.complete(Err(SyscallError::Restart)));
        assert_eq!(frame.ret(), 7);
        assert!(!frame.complete(Err(KernelError::NotDir.into())));
        assert_eq!(frame.ret() as i64, -7);
        assert_eq!(regs.rip, 0x1000);
    }

    #[test]
    fn unbound_number_invokes_nothing() {
        let (kernel, _cpu, _clock) = crate::testutil::hosted_kernel();
        let mut table = SyscallTable::empty();
        table.bind(0, spy);
        let mut ctx = crate::testutil::kernel_ctx(&kernel);
        let before = SPY_CALLS.load(Ordering::SeqCst);
        assert_eq!(
            table.dispatch(9999, &mut ctx),
            Err(SyscallError::Kernel(KernelError::OperationNotSupported))
        );
        assert_eq!(SPY_CALLS.load(Ordering::SeqCst), before);
        assert_eq!(table.dispatch(0, &mut ctx), Ok(1));
    }
}
