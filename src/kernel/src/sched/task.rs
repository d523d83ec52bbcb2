//! Task records.

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use kestrel_common::Event;
use kestrel_hal::{Bootstrap, TaskContext};
use spin::Mutex;

use crate::config::{EVENT_QUEUE_CAPACITY, KERNEL_STACK_SIZE};
use crate::process::Process;

/// A unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocate a fresh id.
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Id as seen by userspace.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an id received from userspace.
    pub fn from_raw(raw: u64) -> Self {
        TaskId(raw)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Eligible to run, sitting in a run queue.
    Ready,
    /// Currently executing on its core.
    Running,
    /// Blocked until something wakes it.
    Waiting,
    /// Exited; reclaimed at the next schedule point.
    Dead,
}

/// Exit status and joiners of a task.
#[derive(Debug, Default)]
pub struct ExitRecord {
    /// Exit code once the task is dead.
    pub code: Option<i64>,
    /// Tasks blocked in a join on this task.
    pub waiters: BTreeSet<TaskId>,
}

/// The part of a task that other cores and producers may touch.
///
/// Everything else lives in [`Task`] and is owned by one core's scheduler.
#[derive(Debug)]
pub struct TaskShared {
    id: TaskId,
    core: usize,
    process: Option<u64>,
    /// Set by producers before queuing a wake; consumed by the scheduler.
    pub(crate) wake_pending: AtomicBool,
    pub(crate) kill_requested: AtomicBool,
    events: ArrayQueue<Event>,
    exit: Mutex<ExitRecord>,
}

impl TaskShared {
    fn new(id: TaskId, core: usize, process: Option<u64>) -> Self {
        Self {
            id,
            core,
            process,
            wake_pending: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
            events: ArrayQueue::new(EVENT_QUEUE_CAPACITY),
            exit: Mutex::new(ExitRecord::default()),
        }
    }

    /// Task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Core the task is pinned to.
    pub fn core(&self) -> usize {
        self.core
    }

    /// Raw id of the owning process, if any.
    pub fn process_id(&self) -> Option<u64> {
        self.process
    }

    /// Queue an event. Returns the event back if the queue is full.
    pub fn push_event(&self, event: Event) -> Result<(), Event> {
        self.events.push(event)
    }

    /// Take the oldest pending event.
    pub fn pop_event(&self) -> Option<Event> {
        self.events.pop()
    }

    /// Number of queued events.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Exit code if the task has exited.
    pub fn exit_code(&self) -> Option<i64> {
        self.exit.lock().code
    }

    /// Returns `true` once a kill has been requested.
    pub fn kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::Acquire)
    }

    /// Record the exit code and hand back the joiners to wake.
    ///
    /// Only the first call records anything.
    pub(crate) fn record_exit(&self, code: i64) -> Option<BTreeSet<TaskId>> {
        let mut exit = self.exit.lock();
        if exit.code.is_some() {
            return None;
        }
        exit.code = Some(code);
        Some(core::mem::take(&mut exit.waiters))
    }

    /// Register `waiter` as a joiner. Returns the exit code instead if the
    /// task is already dead.
    pub(crate) fn join(&self, waiter: TaskId) -> Result<(), i64> {
        let mut exit = self.exit.lock();
        if let Some(code) = exit.code {
            return Err(code);
        }
        exit.waiters.insert(waiter);
        Ok(())
    }
}

/// A schedulable thread of execution.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) context: TaskContext,
    pub(crate) status: TaskStatus,
    pub(crate) bootstrap: Option<Bootstrap>,
    pub(crate) process: Option<Arc<Process>>,
    pub(crate) shared: Arc<TaskShared>,
    pub(crate) page_table: Option<u64>,
    pub(crate) inside_syscall: bool,
    pub(crate) syscall_faulted: bool,
    pub(crate) sleep_deadline: Option<u64>,
    pub(crate) signal_mask: u64,
    kernel_stack: Box<[u8]>,
}

impl Task {
    fn build(name: &str, core: usize, process: Option<Arc<Process>>, stack_size: usize) -> Self {
        let id = TaskId::new();
        let shared = Arc::new(TaskShared::new(
            id,
            core,
            process.as_ref().map(|p| p.id().as_u64()),
        ));
        let page_table = process.as_ref().map(|p| p.page_table_root());
        let kernel_stack = vec![0u8; stack_size].into_boxed_slice();
        let mut context = TaskContext::default();
        context.kernel_stack = kernel_stack.as_ptr_range().end as u64 & !0xF;
        Self {
            id,
            name: String::from(name),
            context,
            status: TaskStatus::Ready,
            bootstrap: None,
            process,
            shared,
            page_table,
            inside_syscall: false,
            syscall_faulted: false,
            sleep_deadline: None,
            signal_mask: 0,
            kernel_stack,
        }
    }

    /// Wrap the context that is already executing on `core` (its boot
    /// thread). It becomes that core's idle task.
    pub fn adopt_current(name: &str, core: usize) -> Self {
        let mut task = Self::build(name, core, None, 0);
        task.status = TaskStatus::Running;
        task
    }

    /// A kernel thread starting at `entry(arg)` on its own kernel stack.
    pub fn kernel(name: &str, core: usize, entry: u64, arg: u64) -> Self {
        let mut task = Self::build(name, core, None, KERNEL_STACK_SIZE);
        let stack_top = task.context.kernel_stack;
        task.bootstrap = Some(Bootstrap {
            entry,
            stack_top,
            arg,
            user: false,
        });
        task
    }

    /// A user thread of `process` entering `entry` with `stack_top`.
    pub fn user(
        name: &str,
        core: usize,
        process: Arc<Process>,
        entry: u64,
        stack_top: u64,
        arg: u64,
    ) -> Self {
        let mut task = Self::build(name, core, Some(process), KERNEL_STACK_SIZE);
        task.bootstrap = Some(Bootstrap {
            entry,
            stack_top,
            arg,
            user: true,
        });
        task
    }

    /// Task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Owning process, `None` for kernel threads.
    pub fn process(&self) -> Option<&Arc<Process>> {
        self.process.as_ref()
    }

    /// Shared half of the task.
    pub fn shared(&self) -> &Arc<TaskShared> {
        &self.shared
    }

    /// Saved register state.
    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    /// Returns `true` until the task has been switched to once.
    pub fn is_fresh(&self) -> bool {
        self.bootstrap.is_some()
    }

    /// Returns `true` while a syscall is being serviced for this task.
    pub fn inside_syscall(&self) -> bool {
        self.inside_syscall
    }

    /// Size of the private kernel stack.
    pub fn kernel_stack_size(&self) -> usize {
        self.kernel_stack.len()
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Task::kernel("a", 0, 0x1000, 0);
        let b = Task::kernel("b", 0, 0x1000, 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn kernel_task_bootstraps_on_own_stack() {
        let task = Task::kernel("worker", 0, 0xdead, 7);
        let boot = task.bootstrap.unwrap();
        assert_eq!(boot.entry, 0xdead);
        assert_eq!(boot.arg, 7);
        assert!(!boot.user);
        assert_eq!(boot.stack_top % 16, 0);
        assert_eq!(task.kernel_stack_size(), KERNEL_STACK_SIZE);
        assert_eq!(task.status(), TaskStatus::Ready);
    }

    #[test]
    fn exit_record_is_written_once() {
        let task = Task::kernel("t", 0, 0, 0);
        let shared = task.shared().clone();
        let joiner = TaskId::from_raw(999);
        assert_eq!(shared.join(joiner), Ok(()));
        assert_eq!(shared.join(joiner), Ok(()), "restarted join");
        assert_eq!(shared.record_exit(3), Some(BTreeSet::from([joiner])));
        assert_eq!(shared.record_exit(4), None);
        assert_eq!(shared.exit_code(), Some(3));
        assert_eq!(shared.join(joiner), Err(3));
    }
}
