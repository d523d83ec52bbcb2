//! Task lifecycle: spawning, blocking, waking, exiting, preemption.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use kestrel_common::{Event, KernelError};

use super::Kernel;
use crate::config::KILLED_EXIT_CODE;
use crate::process::Process;
use crate::sched::{Scheduler, Switch, Task, TaskId, TaskStatus};

impl Kernel {
    /// Hand a new task to its core's scheduler.
    fn admit(&self, task: Task) -> TaskId {
        let id = task.id();
        let core = task.shared().core();
        if let Some(process) = task.process() {
            process.add_task(id);
        }
        self.directory.write().insert(id, task.shared().clone());
        self.critical(core, |sched| (sched.add(task), None))
    }

    /// Start a kernel thread at `entry(arg)` on `core`.
    pub fn spawn_kernel_task(&self, core: usize, name: &str, entry: u64, arg: u64) -> TaskId {
        self.admit(Task::kernel(name, self.core(core).id(), entry, arg))
    }

    /// Create a kernel thread that starts out `WAITING` and only runs once
    /// something wakes it (for example an input handler waiting for its
    /// first event).
    pub fn spawn_parked(&self, core: usize, name: &str, entry: u64, arg: u64) -> TaskId {
        let mut task = Task::kernel(name, self.core(core).id(), entry, arg);
        task.status = TaskStatus::Waiting;
        self.admit(task)
    }

    /// Start a user thread of `process`.
    pub fn spawn_user_task(
        &self,
        core: usize,
        process: &Arc<Process>,
        entry: u64,
        stack_top: u64,
        arg: u64,
    ) -> TaskId {
        let task = Task::user(
            process.name(),
            self.core(core).id(),
            process.clone(),
            entry,
            stack_top,
            arg,
        );
        self.admit(task)
    }

    /// Reap, requeue the running task and switch to the next one.
    pub(super) fn switch_away(&self, core: usize, sched: &mut Scheduler) -> Option<Switch> {
        self.drain_wakes(self.core(core), sched);
        drop(sched.reap());
        sched.schedule()
    }

    /// Yield `core` to the next ready task.
    ///
    /// A pending kill of the running task is honoured here.
    pub fn reschedule(&self, core: usize) {
        self.critical(core, |sched| {
            let current = sched.current_id();
            if sched.current().shared().kill_requested() {
                self.finish_task(sched, current, KILLED_EXIT_CODE);
            }
            ((), self.switch_away(core, sched))
        })
    }

    /// Block the running task until something wakes it.
    ///
    /// Returns `false` without blocking if a wake arrived since the task
    /// last ran, so a wake issued between checking a condition and calling
    /// `block` is never lost.
    pub fn block(&self, core: usize) -> bool {
        self.critical(core, |sched| {
            let idle = self.core(core).idle();
            let task = sched.current_mut();
            if task.shared.wake_pending.swap(false, Ordering::AcqRel) {
                return (false, None);
            }
            if task.id == idle {
                log::warn!(target: "sched", "core {}: idle task tried to block", core);
                return (false, None);
            }
            task.status = TaskStatus::Waiting;
            (true, self.switch_away(core, sched))
        })
    }

    /// Exit the running task with `code` and switch away. On bare metal
    /// this does not return.
    pub fn exit_current(&self, core: usize, code: i64) {
        self.critical(core, |sched| {
            let current = sched.current_id();
            self.finish_task(sched, current, code);
            ((), self.switch_away(core, sched))
        })
    }

    /// Mark the running task dead without switching. The caller switches
    /// away on its way out (syscall return).
    pub(crate) fn terminate_current(&self, core: usize, code: i64) {
        self.critical(core, |sched| {
            let current = sched.current_id();
            self.finish_task(sched, current, code);
            ((), None)
        })
    }

    /// Request termination of `id`.
    ///
    /// Tasks that are not running die at the next scheduling point of their
    /// core; a running task continues until it is preempted or returns from
    /// a syscall.
    pub fn kill_task(&self, id: TaskId) -> Result<(), KernelError> {
        let shared = self.task_shared(id).ok_or(KernelError::NotExists)?;
        if self.cores.iter().any(|c| c.idle() == id) {
            return Err(KernelError::NoPermissions);
        }
        if shared.exit_code().is_some() {
            return Ok(());
        }
        shared.kill_requested.store(true, Ordering::Release);
        self.queue_wake(&shared);
        log::debug!(target: "sched", "kill requested for task {}", id.as_u64());
        Ok(())
    }

    /// Queue `event` on `id` and wake it.
    pub fn post_event(&self, id: TaskId, event: Event) -> Result<(), KernelError> {
        let shared = self.task_shared(id).ok_or(KernelError::NotExists)?;
        shared.push_event(event).map_err(|_| {
            log::warn!(target: "sched", "event queue of task {} full", id.as_u64());
            KernelError::NoMem
        })?;
        self.wake(id);
        Ok(())
    }

    /// Timer interrupt work: fire expired sleep timers and count down the
    /// running task's quantum.
    pub fn timer_tick(&self, core: usize) {
        let c = self.core(core);
        c.ticks.fetch_add(1, Ordering::Relaxed);
        let now = self.now();
        let preempt = self.critical(core, |sched| {
            for id in sched.expire_sleepers(now) {
                if !sched.wake(id) {
                    // Not blocked yet: make its pending block fall through.
                    if let Some(task) = sched.task(id) {
                        task.shared().wake_pending.store(true, Ordering::Release);
                    }
                }
            }
            (sched.tick(), None)
        });
        if preempt {
            c.need_resched.store(true, Ordering::Release);
        }
    }

    /// Id of the task running on `core`.
    pub fn current_task(&self, core: usize) -> TaskId {
        self.critical(core, |sched| (sched.current_id(), None))
    }

    /// Status of a task owned by `core`.
    pub fn task_status(&self, core: usize, id: TaskId) -> Option<TaskStatus> {
        self.critical(core, |sched| (sched.task(id).map(|t| t.status()), None))
    }

    /// Number of tasks owned by `core`, idle included.
    pub fn task_count(&self, core: usize) -> usize {
        self.critical(core, |sched| (sched.len(), None))
    }
}
