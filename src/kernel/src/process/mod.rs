//! Processes: capability and memory-isolation boundaries.
//!
//! A [`Process`] owns one [`AddressSpace`], the ids of its tasks, a handle
//! table and its granted capabilities. It stays in the kernel's process
//! table as a zombie after its last task exits, until a `WAIT_PROCESS`
//! collects the exit code.

pub mod elf;
pub mod stack;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_common::{Capabilities, KernelError, Protection};
use spin::{Mutex, MutexGuard};

use crate::fs::FileHandle;
use crate::mm::{AddressSpace, Placement};
use crate::sched::TaskId;

pub use elf::{elf_load, ElfError, LoadedElf};

/// A unique identifier for a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ProcessId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Id as seen by userspace.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an id received from userspace.
    pub fn from_raw(raw: u64) -> Self {
        ProcessId(raw)
    }
}

/// An open object in a process's handle table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handle {
    /// An open file and the read position.
    File {
        /// Filesystem handle.
        file: FileHandle,
        /// Next byte to read.
        offset: usize,
    },
    /// An open directory listing and the next entry index.
    Dir {
        /// Entry names captured at open time.
        entries: Vec<String>,
        /// Next entry to return.
        cursor: usize,
    },
}

/// Per-process handle numbers.
#[derive(Debug, Default)]
pub struct HandleTable {
    next: u64,
    entries: BTreeMap<u64, Handle>,
}

impl HandleTable {
    /// Store `handle` and return its number.
    pub fn insert(&mut self, handle: Handle) -> u64 {
        self.next += 1;
        self.entries.insert(self.next, handle);
        self.next
    }

    /// Look up a handle.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut Handle> {
        self.entries.get_mut(&id)
    }

    /// Remove a handle.
    pub fn remove(&mut self, id: u64) -> Option<Handle> {
        self.entries.remove(&id)
    }

    /// Remove every handle.
    pub fn drain(&mut self) -> Vec<Handle> {
        core::mem::take(&mut self.entries).into_values().collect()
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is open.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registered disposition of one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalAction {
    /// User handler address, 0 for default.
    pub handler: u64,
    /// Raw flags.
    pub flags: u64,
}

#[derive(Debug, Default)]
struct Lifecycle {
    tasks: Vec<TaskId>,
    live: usize,
    exit_code: Option<i64>,
    waiters: BTreeSet<TaskId>,
}

/// An isolation boundary owning one address space and its tasks.
pub struct Process {
    id: ProcessId,
    name: String,
    parent: Option<ProcessId>,
    root: u64,
    space: Mutex<AddressSpace>,
    ceiling: Capabilities,
    granted: Mutex<Capabilities>,
    handles: Mutex<HandleTable>,
    lifecycle: Mutex<Lifecycle>,
    signals: Mutex<BTreeMap<u32, SignalAction>>,
}

impl Process {
    /// Wrap a prepared address space. `ceiling` bounds what
    /// `REQUEST_CAP` may grant.
    pub fn new(
        name: &str,
        parent: Option<ProcessId>,
        space: AddressSpace,
        ceiling: Capabilities,
    ) -> Self {
        Self {
            id: ProcessId::new(),
            name: String::from(name),
            parent,
            root: space.root(),
            space: Mutex::new(space),
            ceiling,
            granted: Mutex::new(Capabilities::empty()),
            handles: Mutex::new(HandleTable::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
            signals: Mutex::new(BTreeMap::new()),
        }
    }

    /// Process id.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creating process, if any.
    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    /// Physical root of the page tables.
    pub fn page_table_root(&self) -> u64 {
        self.root
    }

    /// Lock the address space.
    pub fn space(&self) -> MutexGuard<'_, AddressSpace> {
        self.space.lock()
    }

    /// Reserve and back user memory. See [`AddressSpace::allocate`].
    pub fn allocate(&self, placement: Placement, size: u64, prot: Protection) -> Result<u64, KernelError> {
        Ok(self.space.lock().allocate(placement, size, prot)?)
    }

    /// Release user memory. Safe to repeat.
    pub fn free(&self, base: u64, size: u64) -> Result<(), KernelError> {
        Ok(self.space.lock().free(base, size)?)
    }

    /// Capabilities granted so far.
    pub fn capabilities(&self) -> Capabilities {
        *self.granted.lock()
    }

    /// Upper bound of grantable capabilities.
    pub fn ceiling(&self) -> Capabilities {
        self.ceiling
    }

    /// Returns `true` if `cap` has been granted.
    pub fn has_capability(&self, cap: Capabilities) -> bool {
        self.granted.lock().contains(cap)
    }

    /// Grant `requested` if it lies within the ceiling. Returns the full
    /// granted set.
    pub fn request_capabilities(&self, requested: Capabilities) -> Result<Capabilities, KernelError> {
        if !self.ceiling.contains(requested) {
            return Err(KernelError::NoPermissions);
        }
        let mut granted = self.granted.lock();
        *granted |= requested;
        Ok(*granted)
    }

    /// Lock the handle table.
    pub fn handles(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock()
    }

    /// Record a new task.
    pub fn add_task(&self, task: TaskId) {
        let mut life = self.lifecycle.lock();
        life.tasks.push(task);
        life.live += 1;
    }

    /// Ids of every task ever created in the process.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.lifecycle.lock().tasks.clone()
    }

    /// Number of tasks not yet dead.
    pub fn live_tasks(&self) -> usize {
        self.lifecycle.lock().live
    }

    /// Account a task exit. When it was the last one, the process exit
    /// code becomes `code` and the waiters to wake are returned.
    pub(crate) fn task_exited(&self, code: i64) -> Option<BTreeSet<TaskId>> {
        let mut life = self.lifecycle.lock();
        life.live = life.live.saturating_sub(1);
        if life.live > 0 || life.exit_code.is_some() {
            return None;
        }
        life.exit_code = Some(code);
        log::debug!(target: "sched", "process {} ({}) exited with {}", self.id.0, self.name, code);
        Some(core::mem::take(&mut life.waiters))
    }

    /// Exit code once every task has exited.
    pub fn exit_code(&self) -> Option<i64> {
        self.lifecycle.lock().exit_code
    }

    /// Register `waiter` for the exit, or return the code if already gone.
    ///
    /// A restarted wait registers the same waiter again; it is kept once.
    pub(crate) fn join(&self, waiter: TaskId) -> Result<(), i64> {
        let mut life = self.lifecycle.lock();
        if let Some(code) = life.exit_code {
            return Err(code);
        }
        life.waiters.insert(waiter);
        Ok(())
    }

    /// Install a signal disposition, returning the previous one.
    pub fn set_signal_action(&self, signal: u32, action: SignalAction) -> SignalAction {
        self.signals
            .lock()
            .insert(signal, action)
            .unwrap_or_default()
    }

    /// Current disposition of `signal`.
    pub fn signal_action(&self, signal: u32) -> SignalAction {
        self.signals
            .lock()
            .get(&signal)
            .copied()
            .unwrap_or_default()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
