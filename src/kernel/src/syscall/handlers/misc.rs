//! Debug output, power and capabilities.

use alloc::string::String;

use kestrel_common::{Capabilities, KernelError};

use crate::syscall::{SyscallCtx, SyscallResult, MAX_USER_COPY};

/// `DPRINT(ptr, len)`
pub(super) fn dprint(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let len = usize::try_from(ctx.arg(1))
        .map_err(|_| KernelError::InvalidArg)?
        .min(MAX_USER_COPY);
    let bytes = ctx.read_user(ctx.arg(0), len)?;
    let text = String::from_utf8_lossy(&bytes);
    log::info!(target: "dprint", "[{}] {}", ctx.task.as_u64(), text.trim_end_matches('\n'));
    Ok(len as u64)
}

/// `SHUTDOWN()`: processes need `MANAGE_POWER`.
pub(super) fn shutdown(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    if let Some(process) = &ctx.process {
        if !process.has_capability(Capabilities::MANAGE_POWER) {
            log::warn!(
                target: "syscall",
                "process {} denied shutdown",
                process.id().as_u64()
            );
            return Err(KernelError::NoPermissions.into());
        }
    }
    ctx.kernel.halt();
    Ok(0)
}

/// `REQUEST_CAP(mask) -> granted mask`
pub(super) fn request_cap(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let requested = u32::try_from(ctx.arg(0))
        .ok()
        .and_then(Capabilities::from_bits)
        .ok_or(KernelError::InvalidArg)?;
    let granted = ctx.process()?.request_capabilities(requested)?;
    Ok(u64::from(granted.bits()))
}
