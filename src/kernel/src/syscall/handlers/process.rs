//! Process and thread lifecycle calls.

use kestrel_common::KernelError;

use crate::process::ProcessId;
use crate::sched::TaskId;
use crate::syscall::{SyscallCtx, SyscallError, SyscallResult};

/// `CREATE_PROCESS(path_ptr, path_len) -> pid`
pub(super) fn create_process(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let path = ctx.read_str(ctx.arg(0), ctx.arg(1))?;
    let pid = ctx.kernel.spawn_path(&path, ctx.process.as_ref())?;
    Ok(pid.as_u64())
}

/// `KILL_PROCESS(pid)`
pub(super) fn kill_process(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    ctx.kernel.kill_process(ProcessId::from_raw(ctx.arg(0)))?;
    Ok(0)
}

/// `WAIT_PROCESS(pid) -> exit code`
pub(super) fn wait_process(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let pid = ProcessId::from_raw(ctx.arg(0));
    if ctx.process.as_ref().is_some_and(|p| p.id() == pid) {
        return Err(KernelError::InvalidArg.into());
    }
    match ctx.kernel.join_process(pid, ctx.task)? {
        Some(code) => Ok(code as u64),
        None => Err(SyscallError::Restart),
    }
}

/// `CREATE_THREAD(entry, stack_top, arg) -> tid`
pub(super) fn create_thread(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let process = ctx.process()?.clone();
    let (entry, stack_top, arg) = (ctx.arg(0), ctx.arg(1), ctx.arg(2));
    if process.space().region_at(entry).is_none() {
        return Err(KernelError::Fault.into());
    }
    let core = ctx.kernel.pick_core();
    let tid = ctx.kernel.spawn_user_task(core, &process, entry, stack_top, arg);
    Ok(tid.as_u64())
}

/// `KILL_THREAD(tid)`: only threads of the caller's own process.
pub(super) fn kill_thread(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let tid = TaskId::from_raw(ctx.arg(0));
    let target = ctx.kernel.task_shared(tid).ok_or(KernelError::NotExists)?;
    if let Some(process) = &ctx.process {
        if target.process_id() != Some(process.id().as_u64()) {
            return Err(KernelError::NoPermissions.into());
        }
    }
    ctx.kernel.kill_task(tid)?;
    Ok(0)
}

/// `WAIT_THREAD(tid) -> exit code`
pub(super) fn wait_thread(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    match ctx.kernel.join_task(TaskId::from_raw(ctx.arg(0)), ctx.task)? {
        Some(code) => Ok(code as u64),
        None => Err(SyscallError::Restart),
    }
}

/// `EXIT(code)`: never returns to the caller.
pub(super) fn exit(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    ctx.kernel.terminate_current(ctx.core, ctx.arg(0) as i64);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn create_process_from_path() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        kernel.fs().add_file("/bin/init", &testutil::minimal_elf());
        let parent = testutil::user_process(&kernel);
        let path = testutil::put_user(&parent, b"/bin/init");

        let mut ctx = testutil::user_ctx(&kernel, &parent);
        ctx.args = [path, 9, 0, 0, 0, 0];
        let pid = create_process(&mut ctx).unwrap();
        let child = kernel.process(ProcessId::from_raw(pid)).unwrap();
        assert_eq!(child.parent(), Some(parent.id()));
        assert_eq!(child.live_tasks(), 1);

        ctx.args = [path, 8, 0, 0, 0, 0];
        assert_eq!(
            create_process(&mut ctx),
            Err(SyscallError::Kernel(KernelError::NotExists))
        );
    }

    #[test]
    fn kill_thread_is_confined_to_own_process() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let a = testutil::user_process(&kernel);
        let b = testutil::user_process(&kernel);
        let foreign = b.task_ids()[0];
        let own = a.task_ids()[0];

        let mut ctx = testutil::user_ctx(&kernel, &a);
        ctx.args[0] = foreign.as_u64();
        assert_eq!(
            kill_thread(&mut ctx),
            Err(SyscallError::Kernel(KernelError::NoPermissions))
        );
        ctx.args[0] = own.as_u64();
        assert_eq!(kill_thread(&mut ctx), Ok(0));
        assert!(kernel.task_shared(own).unwrap().kill_requested());
    }

    #[test]
    fn wait_thread_on_self_is_rejected() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let mut ctx = testutil::kernel_ctx(&kernel);
        ctx.args[0] = ctx.task.as_u64();
        assert_eq!(
            wait_thread(&mut ctx),
            Err(SyscallError::Kernel(KernelError::InvalidArg))
        );
        ctx.args[0] = 0xDEAD_BEEF;
        assert_eq!(
            wait_thread(&mut ctx),
            Err(SyscallError::Kernel(KernelError::NotExists))
        );
    }

    #[test]
    fn create_thread_needs_a_process() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let mut ctx = testutil::kernel_ctx(&kernel);
        assert_eq!(
            create_thread(&mut ctx),
            Err(SyscallError::Kernel(KernelError::InvalidArg))
        );
    }
}
