//! File and directory calls on the boot filesystem.

use alloc::vec;

use kestrel_common::KernelError;

use crate::fs::FileSystem;
use crate::process::Handle;
use crate::syscall::{SyscallCtx, SyscallResult, MAX_USER_COPY};

fn path(ctx: &SyscallCtx<'_>) -> Result<alloc::string::String, KernelError> {
    ctx.read_str(ctx.arg(0), ctx.arg(1))
}

/// `OPEN(path_ptr, path_len) -> handle`
pub(super) fn open(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let process = ctx.process()?;
    let path = path(ctx)?;
    let file = ctx.kernel.fs().open(&path)?;
    Ok(process.handles().insert(Handle::File { file, offset: 0 }))
}

/// `READ(handle, buf_ptr, len) -> bytes read`
pub(super) fn read(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let process = ctx.process()?;
    let id = ctx.arg(0);
    let len = usize::try_from(ctx.arg(2))
        .map_err(|_| KernelError::InvalidArg)?
        .min(MAX_USER_COPY);
    let (file, offset) = match process.handles().get_mut(id) {
        Some(Handle::File { file, offset }) => (*file, *offset),
        Some(Handle::Dir { .. }) | None => return Err(KernelError::InvalidArg.into()),
    };
    let mut buf = vec![0u8; len];
    let n = ctx.kernel.fs().read(file, &mut buf, offset)?;
    ctx.write_user(ctx.arg(1), &buf[..n])?;
    if let Some(Handle::File { offset, .. }) = process.handles().get_mut(id) {
        *offset += n;
    }
    Ok(n as u64)
}

/// `CLOSE(handle)`
pub(super) fn close(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let handle = ctx
        .process()?
        .handles()
        .remove(ctx.arg(0))
        .ok_or(KernelError::InvalidArg)?;
    if let Handle::File { file, .. } = handle {
        ctx.kernel.fs().close(file);
    }
    Ok(0)
}

/// `STAT(path_ptr, path_len, stat_ptr)`
pub(super) fn stat(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let path = path(ctx)?;
    let meta = ctx.kernel.fs().stat(&path)?;
    ctx.write_user(ctx.arg(2), &meta.to_bytes())?;
    Ok(0)
}

/// `OPENDIR(path_ptr, path_len) -> handle`
pub(super) fn opendir(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let process = ctx.process()?;
    let path = path(ctx)?;
    let entries = ctx.kernel.fs().list_dir(&path)?;
    Ok(process.handles().insert(Handle::Dir { entries, cursor: 0 }))
}

/// `READDIR(handle, buf_ptr, len) -> name length, 0 at end`
pub(super) fn readdir(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let process = ctx.process()?;
    let capacity = ctx.arg(2);
    let mut handles = process.handles();
    let (entries, cursor) = match handles.get_mut(ctx.arg(0)) {
        Some(Handle::Dir { entries, cursor }) => (entries, cursor),
        Some(Handle::File { .. }) => return Err(KernelError::NotDir.into()),
        None => return Err(KernelError::InvalidArg.into()),
    };
    let Some(name) = entries.get(*cursor) else {
        return Ok(0);
    };
    if name.len() as u64 > capacity {
        return Err(KernelError::InvalidArg.into());
    }
    ctx.write_user(ctx.arg(1), name.as_bytes())?;
    *cursor += 1;
    Ok(name.len() as u64)
}

/// `CLOSEDIR(handle)`
pub(super) fn closedir(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let process = ctx.process()?;
    let id = ctx.arg(0);
    let mut handles = process.handles();
    let is_dir = handles
        .get_mut(id)
        .map(|h| matches!(h, Handle::Dir { .. }))
        .ok_or(KernelError::InvalidArg)?;
    if !is_dir {
        return Err(KernelError::NotDir.into());
    }
    handles.remove(id);
    Ok(0)
}
