//! Native memory calls.

use kestrel_common::{KernelError, Protection};

use crate::mm::Placement;
use crate::syscall::{SyscallCtx, SyscallResult};

pub(super) fn protection(raw: u64) -> Result<Protection, KernelError> {
    u32::try_from(raw)
        .ok()
        .and_then(Protection::from_bits)
        .ok_or(KernelError::InvalidArg)
}

/// `MMAP(hint, size, prot) -> addr`
pub(super) fn mmap(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let (hint, size) = (ctx.arg(0), ctx.arg(1));
    let prot = protection(ctx.arg(2))?;
    let placement = match hint {
        0 => Placement::Anywhere,
        addr => Placement::Prefer(addr),
    };
    let addr = ctx.process()?.allocate(placement, size, prot)?;
    log::trace!(target: "syscall", "task {} mmap {:#x} bytes at {:#x}", ctx.task.as_u64(), size, addr);
    Ok(addr)
}

/// `MUNMAP(addr, size)`
pub(super) fn munmap(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    ctx.process()?.free(ctx.arg(0), ctx.arg(1))?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::syscall::SyscallError;
    use crate::testutil;

    #[test]
    fn map_use_unmap() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let process = testutil::user_process(&kernel);
        let mut ctx = testutil::user_ctx(&kernel, &process);

        ctx.args = [0, 3 * PAGE_SIZE, 3, 0, 0, 0];
        let addr = mmap(&mut ctx).unwrap();
        assert_eq!(addr % PAGE_SIZE, 0);
        ctx.write_user(addr + PAGE_SIZE, b"hello").unwrap();

        ctx.args = [addr, 3 * PAGE_SIZE, 0, 0, 0, 0];
        assert_eq!(munmap(&mut ctx), Ok(0));
        assert_eq!(ctx.write_user(addr, b"x"), Err(KernelError::Fault));
        assert_eq!(munmap(&mut ctx), Ok(0));
    }

    #[test]
    fn unknown_protection_bits_are_rejected() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let process = testutil::user_process(&kernel);
        let mut ctx = testutil::user_ctx(&kernel, &process);
        ctx.args = [0, PAGE_SIZE, 0x10, 0, 0, 0];
        assert_eq!(mmap(&mut ctx), Err(SyscallError::Kernel(KernelError::InvalidArg)));
    }

    #[test]
    fn occupied_hint_falls_back() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let process = testutil::user_process(&kernel);
        let mut ctx = testutil::user_ctx(&kernel, &process);
        ctx.args = [0, PAGE_SIZE, 1, 0, 0, 0];
        let first = mmap(&mut ctx).unwrap();
        ctx.args[0] = first;
        let second = mmap(&mut ctx).unwrap();
        assert_ne!(first, second);
    }
}
