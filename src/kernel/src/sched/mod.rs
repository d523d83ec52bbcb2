//! Per-core preemptive round-robin scheduler.
//!
//! Each core owns one [`Scheduler`] inside a [`crate::ipl::CoreLocal`], so
//! every method here runs with the core at `CRITICAL`. Switching is split in
//! two phases: the scheduler makes the decision and hands back a [`Switch`]
//! holding raw context pointers, then the caller performs the architecture
//! switch after the `&mut Scheduler` borrow has ended.
//!
//! Tasks are boxed so their saved contexts keep a stable address while the
//! task map is modified.

pub mod task;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::vec::Vec;

use kestrel_hal::{Bootstrap, Cpu, TaskContext};

pub use task::{ExitRecord, Task, TaskId, TaskShared, TaskStatus};

use crate::fatal;

/// A switch decided by the scheduler, performed by the caller.
#[must_use = "the switch does nothing until performed"]
pub struct Switch {
    from: *mut TaskContext,
    to: *mut TaskContext,
    bootstrap: Option<Bootstrap>,
    page_table: Option<u64>,
    /// Task being switched away from.
    pub prev: TaskId,
    /// Task being switched to.
    pub next: TaskId,
}

impl Switch {
    /// Returns `true` if the target has never run before.
    pub fn is_first_run(&self) -> bool {
        self.bootstrap.is_some()
    }

    /// Load the target address space and swap register state.
    ///
    /// # Safety
    ///
    /// Must run on the scheduler's core at `CRITICAL`, with neither task
    /// reaped until this call returns into the previous task.
    pub unsafe fn perform(self, cpu: &dyn Cpu) {
        if let Some(root) = self.page_table {
            cpu.load_page_table(root);
        }
        match self.bootstrap {
            // SAFETY: forwarded from the caller.
            Some(bootstrap) => unsafe { cpu.switch_from_init(self.from, self.to, &bootstrap) },
            None => unsafe { cpu.switch(self.from, self.to) },
        }
    }
}

/// Scheduler state of one core.
pub struct Scheduler {
    core: usize,
    tasks: BTreeMap<TaskId, Box<Task>>,
    run_queue: VecDeque<TaskId>,
    current: TaskId,
    idle: TaskId,
    quantum: u32,
    remaining: u32,
    sleepers: BTreeSet<(u64, TaskId)>,
}

impl Scheduler {
    /// Create the scheduler around the context already running on `core`,
    /// which becomes the idle task.
    pub fn new(core: usize, idle: Task, quantum: u32) -> Self {
        let idle_id = idle.id();
        let mut tasks = BTreeMap::new();
        let mut idle = Box::new(idle);
        idle.status = TaskStatus::Running;
        tasks.insert(idle_id, idle);
        Self {
            core,
            tasks,
            run_queue: VecDeque::new(),
            current: idle_id,
            idle: idle_id,
            quantum: quantum.max(1),
            remaining: quantum.max(1),
            sleepers: BTreeSet::new(),
        }
    }

    /// Core this scheduler runs on.
    pub fn core(&self) -> usize {
        self.core
    }

    /// Id of the running task.
    pub fn current_id(&self) -> TaskId {
        self.current
    }

    /// Id of the idle task.
    pub fn idle_id(&self) -> TaskId {
        self.idle
    }

    /// The running task.
    pub fn current(&self) -> &Task {
        match self.tasks.get(&self.current) {
            Some(task) => task,
            None => fatal(format_args!("core {}: current task missing", self.core)),
        }
    }

    /// The running task, mutably.
    pub fn current_mut(&mut self) -> &mut Task {
        let core = self.core;
        match self.tasks.get_mut(&self.current) {
            Some(task) => task,
            None => fatal(format_args!("core {}: current task missing", core)),
        }
    }

    /// Look up a task owned by this core.
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id).map(|t| &**t)
    }

    /// Look up a task owned by this core, mutably.
    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id).map(|t| &mut **t)
    }

    /// Iterate over every task on this core.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().map(|t| &**t)
    }

    /// Number of tasks, idle included.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if no task is registered on this core. The idle task
    /// is registered by [`Scheduler::new`] and never removed.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of entries waiting in the run queue.
    pub fn queued(&self) -> usize {
        self.run_queue.len()
    }

    /// Take ownership of `task`. `Ready` tasks are queued at the tail.
    pub fn add(&mut self, task: Task) -> TaskId {
        let id = task.id();
        let ready = task.status == TaskStatus::Ready;
        if self.tasks.insert(id, Box::new(task)).is_some() {
            fatal(format_args!("core {}: task {:?} added twice", self.core, id));
        }
        if ready {
            self.run_queue.push_back(id);
        }
        log::debug!(target: "sched", "core {}: added task {:?}", self.core, id);
        id
    }

    /// Pop the next `READY` task in FIFO order.
    ///
    /// Stale queue entries (tasks that blocked, died or were reaped after
    /// being queued) are skipped.
    pub fn get_next_task(&mut self) -> Option<TaskId> {
        while let Some(id) = self.run_queue.pop_front() {
            if self.tasks.get(&id).is_some_and(|t| t.status == TaskStatus::Ready) {
                return Some(id);
            }
        }
        None
    }

    /// Move a `WAITING` task back to `READY`. Returns `false` if it was
    /// not waiting.
    pub fn wake(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        if task.status != TaskStatus::Waiting {
            return false;
        }
        task.shared.wake_pending.store(false, core::sync::atomic::Ordering::Release);
        task.status = TaskStatus::Ready;
        self.run_queue.push_back(id);
        log::trace!(target: "sched", "core {}: woke {:?}", self.core, id);
        true
    }

    /// Put the running task back at the tail if it is still runnable.
    pub fn retire_current(&mut self) {
        let idle = self.idle;
        let task = self.current_mut();
        if task.status != TaskStatus::Running {
            return;
        }
        task.status = TaskStatus::Ready;
        let id = task.id;
        if id != idle {
            self.run_queue.push_back(id);
        }
    }

    /// Make `next` current and describe the register swap.
    ///
    /// The previous task's status must already be updated by the caller.
    /// Returns `None` when `next` is already running.
    pub fn switch_from(&mut self, next: TaskId) -> Option<Switch> {
        let prev = self.current;
        if next == prev {
            self.current_mut().status = TaskStatus::Running;
            return None;
        }
        let core = self.core;
        let (from, prev_table) = match self.tasks.get_mut(&prev) {
            Some(task) => (&mut task.context as *mut TaskContext, task.page_table),
            None => fatal(format_args!("core {}: switching from missing task", core)),
        };
        let Some(target) = self.tasks.get_mut(&next) else {
            fatal(format_args!("core {}: next task {:?} missing", core, next));
        };
        target.status = TaskStatus::Running;
        let bootstrap = target.bootstrap.take();
        let page_table = target.page_table.filter(|&root| Some(root) != prev_table);
        let to = &mut target.context as *mut TaskContext;

        self.current = next;
        self.remaining = self.quantum;
        log::trace!(target: "sched", "core {}: {:?} -> {:?}", core, prev, next);
        Some(Switch {
            from,
            to,
            bootstrap,
            page_table,
            prev,
            next,
        })
    }

    /// Requeue the running task and pick the next one, falling back to
    /// the idle task.
    pub fn schedule(&mut self) -> Option<Switch> {
        self.retire_current();
        let next = self.get_next_task().unwrap_or(self.idle);
        self.switch_from(next)
    }

    /// Account one timer tick. Returns `true` if the running task should
    /// be preempted.
    pub fn tick(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.current == self.idle {
            return !self.run_queue.is_empty();
        }
        self.remaining == 0
    }

    /// Arm a one-shot wake for `id` at `deadline` ticks.
    pub fn add_sleeper(&mut self, deadline: u64, id: TaskId) {
        self.sleepers.insert((deadline, id));
    }

    /// Remove and return every sleeper whose deadline has passed.
    pub fn expire_sleepers(&mut self, now: u64) -> Vec<TaskId> {
        let later = self.sleepers.split_off(&(now + 1, TaskId::from_raw(0)));
        let expired = core::mem::replace(&mut self.sleepers, later);
        expired.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of armed sleep timers.
    pub fn sleepers(&self) -> usize {
        self.sleepers.len()
    }

    /// Remove dead tasks other than the running one.
    pub fn reap(&mut self) -> Vec<Box<Task>> {
        let current = self.current;
        let dead: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(&id, t)| id != current && t.status == TaskStatus::Dead)
            .map(|(&id, _)| id)
            .collect();
        let reaped: Vec<Box<Task>> = dead.iter().filter_map(|id| self.tasks.remove(id)).collect();
        if !reaped.is_empty() {
            self.sleepers.retain(|(_, id)| !dead.contains(id));
            log::debug!(target: "sched", "core {}: reaped {} task(s)", self.core, reaped.len());
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeSet;

    fn scheduler() -> Scheduler {
        Scheduler::new(0, Task::adopt_current("idle", 0), 3)
    }

    #[test]
    fn round_robin_visits_every_ready_task() {
        let mut sched = scheduler();
        let ids: Vec<TaskId> = (0..4)
            .map(|_| sched.add(Task::kernel("worker", 0, 0x1000, 0)))
            .collect();
        let mut seen = BTreeSet::new();
        for _ in 0..ids.len() {
            let switch = sched.schedule();
            assert!(switch.is_some());
            seen.insert(sched.current_id());
        }
        assert_eq!(seen, ids.iter().copied().collect());
        // The fifth pick wraps around to the first worker.
        let _ = sched.schedule();
        assert_eq!(sched.current_id(), ids[0]);
    }

    #[test]
    fn idle_runs_only_when_queue_is_empty() {
        let mut sched = scheduler();
        let idle = sched.idle_id();
        assert_eq!(sched.len(), 1);
        assert!(!sched.is_empty(), "idle counts as a task");
        assert!(sched.schedule().is_none());
        assert_eq!(sched.current_id(), idle);

        let worker = sched.add(Task::kernel("worker", 0, 0x1000, 0));
        let switch = sched.schedule().unwrap();
        assert!(switch.is_first_run());
        assert_eq!((switch.prev, switch.next), (idle, worker));

        // Only one runnable task: it keeps the core.
        assert!(sched.schedule().is_none());
        assert_eq!(sched.current_id(), worker);
        assert_eq!(sched.task(idle).unwrap().status(), TaskStatus::Ready);
    }

    #[test]
    fn blocked_task_is_skipped_until_woken() {
        let mut sched = scheduler();
        let a = sched.add(Task::kernel("a", 0, 0x1000, 0));
        let b = sched.add(Task::kernel("b", 0, 0x1000, 0));
        let _ = sched.schedule();
        assert_eq!(sched.current_id(), a);

        sched.current_mut().status = TaskStatus::Waiting;
        let _ = sched.schedule();
        assert_eq!(sched.current_id(), b);
        let _ = sched.schedule();
        assert_eq!(sched.current_id(), b);

        assert!(sched.wake(a));
        assert!(!sched.wake(a));
        let _ = sched.schedule();
        assert_eq!(sched.current_id(), a);
    }

    #[test]
    fn quantum_expires_after_configured_ticks() {
        let mut sched = scheduler();
        sched.add(Task::kernel("a", 0, 0x1000, 0));
        assert!(sched.tick(), "idle yields as soon as work is queued");
        let _ = sched.schedule();
        assert!(!sched.tick());
        assert!(!sched.tick());
        assert!(sched.tick());
    }

    #[test]
    fn sleepers_fire_once_in_deadline_order() {
        let mut sched = scheduler();
        let a = TaskId::from_raw(100);
        let b = TaskId::from_raw(101);
        sched.add_sleeper(20, b);
        sched.add_sleeper(10, a);
        assert!(sched.expire_sleepers(9).is_empty());
        assert_eq!(sched.expire_sleepers(15), alloc::vec![a]);
        assert_eq!(sched.expire_sleepers(30), alloc::vec![b]);
        assert!(sched.expire_sleepers(30).is_empty());
    }

    #[test]
    fn dead_tasks_are_reaped_once_switched_away() {
        let mut sched = scheduler();
        let a = sched.add(Task::kernel("a", 0, 0x1000, 0));
        let _ = sched.schedule();
        sched.current_mut().status = TaskStatus::Dead;
        assert!(sched.reap().is_empty(), "running task is never reaped");
        let _ = sched.schedule();
        let reaped = sched.reap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id(), a);
        assert!(sched.task(a).is_none());
    }
}
