//! The kernel context object.
//!
//! [`Kernel`] owns every table the execution engine needs: per-core
//! schedulers, the vector table, the syscall table, the frame pool and the
//! process table. Bare metal keeps one instance in a global; hosted tests
//! build as many isolated instances as they like.
//!
//! Core-local state is only touched through [`Kernel::critical`], which
//! raises the core to `CRITICAL`, drains the remote-wake inbox, runs the
//! closure on the scheduler and performs any switch it asks for before
//! lowering the IPL again.

mod process;
mod tasks;
mod trap;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use kestrel_common::KernelError;
use kestrel_hal::{Cpu, Registers, Timer};
use spin::{Mutex, RwLock};

use crate::config::{
    KernelConfig, IPI_VECTOR, KILLED_EXIT_CODE, SYSCALL_VECTOR, TIMER_VECTOR, WAKE_INBOX_CAPACITY,
};
use crate::fatal;
use crate::fs::RamFs;
use crate::interrupts::{GenericIrq, Handler, InterruptTable, IrqError, PendingVectors};
use crate::ipl::{CoreLocal, Ipl, IplManager};
use crate::mm::{FramePool, PageMap, PhysMemory};
use crate::modules::BootModules;
use crate::process::{Process, ProcessId};
use crate::sched::{Scheduler, Switch, Task, TaskId, TaskShared, TaskStatus};
use crate::syscall::SyscallTable;

/// Hardware the kernel runs on.
pub struct Platform {
    /// Trap, context and interrupt-controller primitives.
    pub cpu: Arc<dyn Cpu>,
    /// Global time source, in scheduler ticks.
    pub timer: Arc<dyn Timer>,
    /// Physical memory handed to the frame allocator.
    pub memory: PhysMemory,
}

/// Per-core state.
pub struct Core {
    id: usize,
    ipl: IplManager,
    sched: CoreLocal<Scheduler>,
    idle: TaskId,
    inbox: ArrayQueue<TaskId>,
    inbox_overflow: AtomicBool,
    pending: PendingVectors,
    need_resched: AtomicBool,
    ticks: AtomicU64,
}

impl Core {
    fn new(id: usize, idle: Task, quantum: u32) -> Self {
        let idle_id = idle.id();
        Self {
            id,
            ipl: IplManager::new(id),
            sched: CoreLocal::new(id, Scheduler::new(id, idle, quantum)),
            idle: idle_id,
            inbox: ArrayQueue::new(WAKE_INBOX_CAPACITY),
            inbox_overflow: AtomicBool::new(false),
            pending: PendingVectors::default(),
            need_resched: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        }
    }

    /// Core number.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The core's priority register.
    pub fn ipl(&self) -> &IplManager {
        &self.ipl
    }

    /// Id of the core's idle task.
    pub fn idle(&self) -> TaskId {
        self.idle
    }

    /// Vectors deferred by the IPL.
    pub fn pending(&self) -> &PendingVectors {
        &self.pending
    }

    /// Timer interrupts taken on this core.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Returns `true` if a preemption is due on the next interrupt exit.
    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }
}

/// Kernel context.
pub struct Kernel {
    config: KernelConfig,
    cpu: Arc<dyn Cpu>,
    timer: Arc<dyn Timer>,
    cores: Vec<Core>,
    interrupts: InterruptTable,
    irq: GenericIrq,
    syscalls: RwLock<SyscallTable>,
    frames: Arc<FramePool>,
    kernel_map: PageMap,
    processes: Mutex<BTreeMap<ProcessId, Arc<Process>>>,
    directory: RwLock<BTreeMap<TaskId, Arc<TaskShared>>>,
    fs: RamFs,
    modules: BootModules,
    next_core: AtomicUsize,
    halted: AtomicBool,
}

impl Kernel {
    /// Bring up the kernel on `platform`.
    ///
    /// The calling context of each core becomes that core's idle task. The
    /// timer and inter-processor vectors get their handlers and priority
    /// classes, and the syscall vector is reserved.
    pub fn new(config: KernelConfig, platform: Platform) -> Result<Self, KernelError> {
        let frames = Arc::new(FramePool::new(platform.memory));
        let kernel_map = PageMap::new(frames.clone())?;

        let mut directory = BTreeMap::new();
        let cores: Vec<Core> = (0..config.cores.max(1))
            .map(|id| {
                let idle = Task::adopt_current(&format!("idle/{}", id), id);
                directory.insert(idle.id(), idle.shared().clone());
                Core::new(id, idle, config.quantum_ticks)
            })
            .collect();

        let interrupts = InterruptTable::new();
        interrupts.reserve(SYSCALL_VECTOR);
        interrupts.set_class(SYSCALL_VECTOR, Ipl::Normal);
        interrupts.set_handler(
            TIMER_VECTOR,
            Some(Handler::new(|ctx| ctx.kernel.timer_tick(ctx.core))),
        );
        interrupts.set_class(TIMER_VECTOR, Ipl::Timer);
        interrupts.set_handler(
            IPI_VECTOR,
            Some(Handler::new(|ctx| {
                ctx.kernel.core(ctx.core).need_resched.store(true, Ordering::Release);
            })),
        );
        interrupts.set_class(IPI_VECTOR, Ipl::InterCpu);

        log::info!(
            target: "sched",
            "kernel up: {} core(s), {} frames, quantum {} ticks",
            cores.len(),
            frames.frame_count(),
            config.quantum_ticks
        );

        Ok(Self {
            config,
            cpu: platform.cpu,
            timer: platform.timer,
            cores,
            interrupts,
            irq: GenericIrq::new(),
            syscalls: RwLock::new(SyscallTable::standard()),
            frames,
            kernel_map,
            processes: Mutex::new(BTreeMap::new()),
            directory: RwLock::new(directory),
            fs: RamFs::new(),
            modules: BootModules::new(),
            next_core: AtomicUsize::new(0),
            halted: AtomicBool::new(false),
        })
    }

    /// Run-time configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Architecture primitives.
    pub fn cpu(&self) -> &dyn Cpu {
        &*self.cpu
    }

    /// Current time in ticks.
    pub fn now(&self) -> u64 {
        self.timer.current_ticks()
    }

    /// Number of cores.
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Per-core state of `core`. Unknown cores are fatal.
    pub fn core(&self, core: usize) -> &Core {
        match self.cores.get(core) {
            Some(c) => c,
            None => fatal(format_args!("no such core {}", core)),
        }
    }

    /// The vector table.
    pub fn interrupts(&self) -> &InterruptTable {
        &self.interrupts
    }

    /// Shared handler chains layered over the vector table.
    pub fn irq(&self) -> &GenericIrq {
        &self.irq
    }

    /// Allocate a free vector for `handler`.
    pub fn alloc_vector(&self, handler: Handler) -> Result<u8, IrqError> {
        self.interrupts.alloc(handler).ok_or_else(|| {
            log::warn!(target: "irq", "vector allocation failed: table exhausted");
            IrqError::NoVector
        })
    }

    /// Replace the syscall table.
    pub fn install_syscalls(&self, table: SyscallTable) {
        *self.syscalls.write() = table;
    }

    pub(crate) fn syscall_table(&self) -> SyscallTable {
        *self.syscalls.read()
    }

    /// The physical frame pool.
    pub fn frames(&self) -> &Arc<FramePool> {
        &self.frames
    }

    /// Template whose upper half every address space shares.
    pub fn kernel_map(&self) -> &PageMap {
        &self.kernel_map
    }

    /// The boot filesystem.
    pub fn fs(&self) -> &RamFs {
        &self.fs
    }

    /// Boot modules.
    pub fn modules(&self) -> &BootModules {
        &self.modules
    }

    /// Returns `true` once `SHUTDOWN` ran.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        log::info!(target: "sched", "power off requested");
        self.cpu.power_off();
    }

    /// Shared record of any live or unreaped task.
    pub fn task_shared(&self, id: TaskId) -> Option<Arc<TaskShared>> {
        self.directory.read().get(&id).cloned()
    }

    /// Core for the next new task, round robin.
    pub fn pick_core(&self) -> usize {
        self.next_core.fetch_add(1, Ordering::Relaxed) % self.cores.len()
    }

    /// Run `f` on `core`'s scheduler at `CRITICAL`.
    ///
    /// Wakes queued by other cores are applied first. If `f` returns a
    /// switch it is performed before the IPL drops; deferred vectors that
    /// became unmasked are replayed afterwards.
    pub fn critical<R>(&self, core: usize, f: impl FnOnce(&mut Scheduler) -> (R, Option<Switch>)) -> R {
        let c = self.core(core);
        let Some(mut cs) = c.ipl.enter_critical() else {
            fatal(format_args!("core {}: critical section re-entered", core));
        };
        let (result, switch) = {
            let sched = c.sched.get(&mut cs);
            self.drain_wakes(c, sched);
            f(sched)
        };
        if let Some(switch) = switch {
            self.perform(c, switch);
        }
        drop(cs);
        self.replay_pending(core);
        result
    }

    fn perform(&self, core: &Core, switch: Switch) {
        let enabled = self.cpu.interrupts_enabled();
        self.cpu.disable_interrupts();
        if switch.is_first_run() {
            // A brand-new task has no critical section to unwind.
            core.ipl.lower(Ipl::Normal);
        }
        // SAFETY: we are on `core` at CRITICAL (or just handed it to a new
        // task with interrupts masked), and reaping only happens for tasks
        // that are not current, so both contexts stay alive.
        unsafe { switch.perform(&*self.cpu) };
        if enabled {
            self.cpu.enable_interrupts();
        }
    }

    /// Mark `id` runnable if it is blocked.
    ///
    /// The wake is recorded in the task's `wake_pending` flag before it is
    /// queued to the owning core, so a task that is about to block sees it
    /// and stays runnable. Returns `false` for unknown or dead tasks.
    pub fn wake(&self, id: TaskId) -> bool {
        let Some(shared) = self.task_shared(id) else {
            return false;
        };
        if shared.exit_code().is_some() {
            return false;
        }
        shared.wake_pending.store(true, Ordering::Release);
        self.queue_wake(&shared);
        true
    }

    fn queue_wake(&self, shared: &TaskShared) {
        let core = self.core(shared.core());
        if core.inbox.push(shared.id()).is_err() {
            core.inbox_overflow.store(true, Ordering::Release);
            log::debug!(target: "sched", "core {}: wake inbox full, falling back to scan", core.id);
        }
    }

    fn drain_wakes(&self, core: &Core, sched: &mut Scheduler) {
        while let Some(id) = core.inbox.pop() {
            self.apply_wake(sched, id);
        }
        if core.inbox_overflow.swap(false, Ordering::AcqRel) {
            let flagged: Vec<TaskId> = sched
                .tasks()
                .filter(|t| {
                    let shared = t.shared();
                    t.status() != TaskStatus::Dead
                        && (shared.wake_pending.load(Ordering::Acquire) || shared.kill_requested())
                })
                .map(|t| t.id())
                .collect();
            for id in flagged {
                self.apply_wake(sched, id);
            }
        }
    }

    fn apply_wake(&self, sched: &mut Scheduler, id: TaskId) {
        let current = sched.current_id();
        let Some(task) = sched.task(id) else {
            return;
        };
        let status = task.status();
        if task.shared().kill_requested() && id != current && status != TaskStatus::Dead {
            self.finish_task(sched, id, KILLED_EXIT_CODE);
            return;
        }
        if status == TaskStatus::Waiting && task.shared().wake_pending.load(Ordering::Acquire) {
            sched.wake(id);
        }
    }

    fn replay_pending(&self, core: usize) {
        let c = self.core(core);
        while let Some(vector) = c.pending.take_unmasked(&self.interrupts, c.ipl.current()) {
            log::trace!(target: "irq", "core {}: replaying vector {:#x}", core, vector);
            let mut scratch = Registers::default();
            let previous = c.ipl.raise(self.interrupts.class(vector));
            self.dispatch_vector(core, vector, &mut scratch);
            c.ipl.lower(previous);
        }
    }

    /// Mark a task dead, publish its exit code and wake its joiners.
    fn finish_task(&self, sched: &mut Scheduler, id: TaskId, code: i64) {
        let Some(task) = sched.task_mut(id) else {
            return;
        };
        if task.status == TaskStatus::Dead {
            return;
        }
        task.status = TaskStatus::Dead;
        task.sleep_deadline = None;
        let shared = task.shared.clone();
        let process = task.process.clone();

        let mut to_wake = shared.record_exit(code).unwrap_or_default();
        if let Some(process) = process {
            if let Some(waiters) = process.task_exited(code) {
                to_wake.extend(waiters);
                self.close_handles(&process);
            }
        }
        log::debug!(target: "sched", "task {} exited with {}", id.as_u64(), code);
        for waiter in to_wake {
            self.wake(waiter);
        }
    }
}
