//! Sleeping and event queues.

use kestrel_common::Event;

use crate::syscall::{SyscallCtx, SyscallError, SyscallResult};

/// `SLEEP(milliseconds)`
///
/// The first pass arms a timer and restarts; the call completes on the
/// first pass that finds the deadline behind it.
pub(super) fn sleep(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let ms = ctx.arg(0);
    if ms == 0 {
        return Ok(0);
    }
    let kernel = ctx.kernel;
    let now = kernel.now();
    let ticks = kernel.config().ms_to_ticks(ms).max(1);
    kernel.critical(ctx.core, |sched| {
        let task = sched.current_mut();
        let id = task.id;
        match task.sleep_deadline {
            Some(deadline) if now >= deadline => {
                task.sleep_deadline = None;
                (Ok(0), None)
            }
            Some(_) => (Err(SyscallError::Restart), None),
            None => {
                let deadline = now.saturating_add(ticks);
                task.sleep_deadline = Some(deadline);
                sched.add_sleeper(deadline, id);
                (Err(SyscallError::Restart), None)
            }
        }
    })
}

/// `WAIT_FOR_EVENT(event_ptr)`
pub(super) fn wait_for_event(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let ptr = ctx.arg(0);
    // Check the buffer is writable before taking anything off the queue.
    ctx.write_user(ptr, &[0u8; Event::SIZE])?;
    match ctx.shared.pop_event() {
        Some(event) => {
            ctx.write_user(ptr, &event.to_bytes())?;
            Ok(0)
        }
        None => Err(SyscallError::Restart),
    }
}

/// `POLL_EVENT(event_ptr) -> 1 if an event was copied, else 0`
pub(super) fn poll_event(ctx: &mut SyscallCtx<'_>) -> SyscallResult {
    let ptr = ctx.arg(0);
    ctx.write_user(ptr, &[0u8; Event::SIZE])?;
    match ctx.shared.pop_event() {
        Some(event) => {
            ctx.write_user(ptr, &event.to_bytes())?;
            Ok(1)
        }
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use kestrel_common::{EventKind, KernelError};

    #[test]
    fn poll_copies_one_event() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let process = testutil::user_process(&kernel);
        let buf = testutil::put_user(&process, &[0xAA; Event::SIZE]);
        let mut ctx = testutil::user_ctx(&kernel, &process);
        ctx.args[0] = buf;

        assert_eq!(poll_event(&mut ctx), Ok(0));
        ctx.shared
            .push_event(Event::new(EventKind::Key, 30, 1))
            .unwrap();
        assert_eq!(poll_event(&mut ctx), Ok(1));

        let mut raw = [0u8; Event::SIZE];
        process.space().copy_from_user(buf, &mut raw).unwrap();
        assert_eq!(Event::from_bytes(&raw), Some(Event::new(EventKind::Key, 30, 1)));
    }

    #[test]
    fn bad_buffer_keeps_the_event_queued() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let process = testutil::user_process(&kernel);
        let mut ctx = testutil::user_ctx(&kernel, &process);
        ctx.shared
            .push_event(Event::new(EventKind::User, 1, 2))
            .unwrap();
        ctx.args[0] = 0x10;
        assert_eq!(
            wait_for_event(&mut ctx),
            Err(SyscallError::Kernel(KernelError::Fault))
        );
        assert_eq!(ctx.shared.pending_events(), 1);
    }

    #[test]
    fn zero_sleep_returns_immediately() {
        let (kernel, _cpu, _clock) = testutil::hosted_kernel();
        let mut ctx = testutil::kernel_ctx(&kernel);
        assert_eq!(sleep(&mut ctx), Ok(0));
    }
}
