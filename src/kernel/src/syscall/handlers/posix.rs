//! POSIX-compatibility calls.
//!
//! Signals are bookkeeping only: dispositions are recorded, and a signal
//! sent to a target without a registered handler terminates it. No
//! handler frames are ever pushed.

use kestrel_common::{KernelError, Protection};

use super::memory::protection;
use crate::mm::Placement;
use crate::process::{Process, ProcessId, SignalAction};
use crate::sched::TaskId;
use crate::syscall::{SyscallCtx, SyscallResult};

const MAP_FIXED: u64 = 0x10;
const MAP_ANONYMOUS: u64 = 0x20;

const SIG_BLOCK: u64 = 0;
const SIG_UNBLOCK: u64 = 1;
const SIG_SETMASK: u64 = 2;

const SIGKILL: u32 = 9;
const MAX_SIGNAL: u64 = 64;

/// `mmap(addr, len, prot, flags, fd, off)`: anonymous mappings only.
pub(super) fn mmap(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let (addr, len, flags) = (ctx.arg(0), ctx.arg(1), ctx.arg(3));
    // PROT_NONE still reserves and maps the range.
    let prot = protection(ctx.arg(2))?;
    if flags & MAP_ANONYMOUS == 0 {
        log::debug!(target: "syscall", "file-backed mmap requested, flags {:#x}", flags);
        return Err(KernelError::OperationNotSupported.into());
    }
    let placement = if flags & MAP_FIXED != 0 {
        Placement::Exact(addr)
    } else if addr == 0 {
        Placement::Anywhere
    } else {
        Placement::Prefer(addr)
    };
    Ok(ctx.process()?.allocate(placement, len, prot)?)
}

/// `munmap(addr, len)`
pub(super) fn munmap(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    ctx.process()?.free(ctx.arg(0), ctx.arg(1))?;
    Ok(0)
}

/// `mprotect(addr, len, prot)`
pub(super) fn mprotect(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let prot: Protection = protection(ctx.arg(2))?;
    ctx.process()?
        .space()
        .protect(ctx.arg(0), ctx.arg(1), prot)?;
    Ok(0)
}

/// `sigprocmask(how, set, oldset_ptr)` on the calling thread's mask.
pub(super) fn sigprocmask(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let (how, set, old_ptr) = (ctx.arg(0), ctx.arg(1), ctx.arg(2));
    let apply: fn(u64, u64) -> u64 = match how {
        SIG_BLOCK => |mask, set| mask | set,
        SIG_UNBLOCK => |mask, set| mask & !set,
        SIG_SETMASK => |_, set| set,
        _ => return Err(KernelError::InvalidArg.into()),
    };
    // SIGKILL cannot be blocked.
    let set = set & !(1 << (SIGKILL - 1));
    let old = ctx.kernel.critical(ctx.core, |sched| {
        let task = sched.current_mut();
        let old = task.signal_mask;
        task.signal_mask = apply(old, set);
        (old, None)
    });
    if old_ptr != 0 {
        ctx.write_user(old_ptr, &old.to_le_bytes())?;
    }
    Ok(0)
}

/// `sigaction(sig, handler, flags) -> previous handler`
pub(super) fn sigaction(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let sig = signal_number(ctx.arg(0))?;
    if sig == SIGKILL {
        return Err(KernelError::InvalidArg.into());
    }
    let action = SignalAction {
        handler: ctx.arg(1),
        flags: ctx.arg(2),
    };
    let previous = ctx.process()?.set_signal_action(sig, action);
    Ok(previous.handler)
}

/// `tgkill(pid, tid, sig)`
pub(super) fn tgkill(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let process = lookup(ctx, ctx.arg(0))?;
    let tid = TaskId::from_raw(ctx.arg(1));
    let target = ctx.kernel.task_shared(tid).ok_or(KernelError::NotExists)?;
    if target.process_id() != Some(process.id().as_u64()) {
        return Err(KernelError::NotExists.into());
    }
    let sig = match ctx.arg(2) {
        0 => return Ok(0),
        raw => signal_number(raw)?,
    };
    if handled(&process, sig) {
        return Ok(0);
    }
    ctx.kernel.kill_task(tid)?;
    Ok(0)
}

/// `kill(pid, sig)`
pub(super) fn kill(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let process = lookup(ctx, ctx.arg(0))?;
    let sig = match ctx.arg(1) {
        0 => return Ok(0),
        raw => signal_number(raw)?,
    };
    if handled(&process, sig) {
        return Ok(0);
    }
    ctx.kernel.kill_process(process.id())?;
    Ok(0)
}

fn signal_number(raw: u64) -> Result<u32, KernelError> {
    match raw {
        1..=MAX_SIGNAL => Ok(raw as u32),
        _ => Err(KernelError::InvalidArg),
    }
}

fn lookup(ctx: &SyscallCtx<'_>, pid: u64) -> Result<alloc::sync::Arc<Process>, KernelError> {
    let process = ctx
        .kernel
        .process(ProcessId::from_raw(pid))
        .ok_or(KernelError::NotExists)?;
    if process.exit_code().is_some() {
        return Err(KernelError::NotExists);
    }
    Ok(process)
}

/// Returns `true` if `sig` is caught and therefore only recorded.
fn handled(process: &Process, sig: u32) -> bool {
    if sig == SIGKILL {
        return false;
    }
    let action = process.signal_action(sig);
    if action.handler != 0 {
        log::debug!(
            target: "syscall",
            "signal {} to process {} caught by handler {:#x}",
            sig,
            process.id().as_u64(),
            action.handler
        );
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::syscall::SyscallError;
    use crate::testutil;

    #[test]
    fn mmap_requires_anonymous() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let process = testutil::user_process(&kernel);
        let mut ctx = testutil::user_ctx(&kernel, &process);
        ctx.args = [0, PAGE_SIZE, 3, 0x02, 3, 0];
        assert_eq!(
            mmap(&mut ctx),
            Err(SyscallError::Kernel(KernelError::OperationNotSupported))
        );
    }

    #[test]
    fn fixed_mapping_conflicts_are_reported() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let process = testutil::user_process(&kernel);
        let mut ctx = testutil::user_ctx(&kernel, &process);
        let at = 0x5000_0000;
        ctx.args = [at, PAGE_SIZE, 3, MAP_ANONYMOUS | MAP_FIXED, 0, 0];
        assert_eq!(mmap(&mut ctx), Ok(at));
        assert!(mmap(&mut ctx).is_err());

        ctx.args = [at, PAGE_SIZE, 1, 0, 0, 0];
        assert_eq!(mprotect(&mut ctx), Ok(0));
        assert_eq!(ctx.write_user(at, b"x"), Err(KernelError::Fault));
    }

    #[test]
    fn prot_none_reserves_the_range() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let process = testutil::user_process(&kernel);
        let mut ctx = testutil::user_ctx(&kernel, &process);
        ctx.args = [0, PAGE_SIZE, 0, MAP_ANONYMOUS, 0, 0];
        let addr = mmap(&mut ctx).unwrap();
        assert!(process.space().region_at(addr).is_some());
        assert_eq!(ctx.write_user(addr, b"x"), Err(KernelError::Fault));
    }

    #[test]
    fn sigaction_returns_previous_handler() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let process = testutil::user_process(&kernel);
        let mut ctx = testutil::user_ctx(&kernel, &process);
        ctx.args = [15, 0x40_1000, 0, 0, 0, 0];
        assert_eq!(sigaction(&mut ctx), Ok(0));
        ctx.args[1] = 0x40_2000;
        assert_eq!(sigaction(&mut ctx), Ok(0x40_1000));
        ctx.args[0] = SIGKILL as u64;
        assert_eq!(sigaction(&mut ctx), Err(SyscallError::Kernel(KernelError::InvalidArg)));
        ctx.args[0] = 65;
        assert_eq!(sigaction(&mut ctx), Err(SyscallError::Kernel(KernelError::InvalidArg)));
    }

    #[test]
    fn sigprocmask_updates_and_reports_mask() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let process = testutil::user_process(&kernel);
        let old = testutil::put_user(&process, &[0xFF; 8]);
        let mut ctx = testutil::user_ctx(&kernel, &process);

        ctx.args = [SIG_BLOCK, 0b1010, 0, 0, 0, 0];
        assert_eq!(sigprocmask(&mut ctx), Ok(0));
        ctx.args = [SIG_UNBLOCK, 0b0010, old, 0, 0, 0];
        assert_eq!(sigprocmask(&mut ctx), Ok(0));
        let mut raw = [0u8; 8];
        process.space().copy_from_user(old, &mut raw).unwrap();
        assert_eq!(u64::from_le_bytes(raw), 0b1010);

        ctx.args = [7, 0, 0, 0, 0, 0];
        assert_eq!(sigprocmask(&mut ctx), Err(SyscallError::Kernel(KernelError::InvalidArg)));
    }

    #[test]
    fn kill_terminates_unless_caught() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let target = testutil::user_process(&kernel);
        let main = target.task_ids()[0];
        let mut ctx = testutil::kernel_ctx(&kernel);

        ctx.args = [target.id().as_u64(), 0, 0, 0, 0, 0];
        assert_eq!(kill(&mut ctx), Ok(0));
        assert!(!kernel.task_shared(main).unwrap().kill_requested());

        target.set_signal_action(15, SignalAction { handler: 0x40_1000, flags: 0 });
        ctx.args[1] = 15;
        assert_eq!(kill(&mut ctx), Ok(0));
        assert!(!kernel.task_shared(main).unwrap().kill_requested());

        ctx.args[1] = SIGKILL as u64;
        assert_eq!(kill(&mut ctx), Ok(0));
        assert!(kernel.task_shared(main).unwrap().kill_requested());

        ctx.args = [0xFFFF, 9, 0, 0, 0, 0];
        assert_eq!(kill(&mut ctx), Err(SyscallError::Kernel(KernelError::NotExists)));
    }

    #[test]
    fn tgkill_checks_thread_membership() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let a = testutil::user_process(&kernel);
        let b = testutil::user_process(&kernel);
        let mut ctx = testutil::kernel_ctx(&kernel);
        ctx.args = [a.id().as_u64(), b.task_ids()[0].as_u64(), 15, 0, 0, 0];
        assert_eq!(tgkill(&mut ctx), Err(SyscallError::Kernel(KernelError::NotExists)));
        ctx.args[1] = a.task_ids()[0].as_u64();
        assert_eq!(tgkill(&mut ctx), Ok(0));
        assert!(kernel.task_shared(a.task_ids()[0]).unwrap().kill_requested());
    }
}
