//! Process table: creation from ELF images, kill, exit collection.

use alloc::sync::Arc;

use kestrel_common::{KernelError, Protection};

use super::Kernel;
use crate::config::{USER_STACK_SIZE, USER_STACK_TOP};
use crate::fs::{self, FileSystem};
use crate::mm::{AddressSpace, Placement};
use crate::process::stack::build_initial_stack;
use crate::process::{elf_load, Handle, Process, ProcessId};
use crate::sched::TaskId;

impl Kernel {
    /// Create a process from an in-memory ELF image and start its main
    /// thread.
    ///
    /// The capability ceiling is inherited from `parent`, or taken from the
    /// configuration for processes the kernel starts itself. Any failure
    /// drops the half-built process, which releases its address space.
    pub fn create_process(
        &self,
        name: &str,
        image: &[u8],
        args: &[&str],
        parent: Option<&Arc<Process>>,
    ) -> Result<ProcessId, KernelError> {
        let ceiling = parent.map_or(self.config.root_capabilities, |p| p.ceiling());
        let space = AddressSpace::new(self.frames.clone(), Some(&self.kernel_map))?;
        let process = Arc::new(Process::new(name, parent.map(|p| p.id()), space, ceiling));

        let loaded = elf_load(&process, image)?;
        process.allocate(
            Placement::Exact(USER_STACK_TOP - USER_STACK_SIZE),
            USER_STACK_SIZE,
            Protection::READ | Protection::WRITE,
        )?;
        let sp = build_initial_stack(&process.space(), USER_STACK_TOP, args, &[], &loaded)?;

        let pid = process.id();
        self.processes.lock().insert(pid, process.clone());
        let core = self.pick_core();
        let tid = self.spawn_user_task(core, &process, loaded.entry, sp, 0);
        log::info!(
            target: "sched",
            "process {} ({}) started: entry {:#x}, main task {} on core {}",
            pid.as_u64(),
            name,
            loaded.entry,
            tid.as_u64(),
            core
        );
        Ok(pid)
    }

    /// Load `path` from the boot filesystem and start it.
    pub fn spawn_path(&self, path: &str, parent: Option<&Arc<Process>>) -> Result<ProcessId, KernelError> {
        let image = fs::read_all(&self.fs, path)?;
        self.create_process(path, &image, &[path], parent)
    }

    /// Look up a live or zombie process.
    pub fn process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes.lock().get(&pid).cloned()
    }

    /// Number of entries in the process table, zombies included.
    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Request termination of every task of `pid`.
    pub fn kill_process(&self, pid: ProcessId) -> Result<(), KernelError> {
        let process = self.process(pid).ok_or(KernelError::NotExists)?;
        if process.exit_code().is_some() {
            return Ok(());
        }
        for id in process.task_ids() {
            match self.kill_task(id) {
                Ok(()) | Err(KernelError::NotExists) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Register `waiter` for the exit of `pid`, or collect the exit code.
    ///
    /// Collecting removes the zombie from the process table along with its
    /// tasks' exit records.
    pub(crate) fn join_process(&self, pid: ProcessId, waiter: TaskId) -> Result<Option<i64>, KernelError> {
        let process = self.process(pid).ok_or(KernelError::NotExists)?;
        match process.join(waiter) {
            Ok(()) => Ok(None),
            Err(code) => {
                self.processes.lock().remove(&pid);
                let mut directory = self.directory.write();
                for id in process.task_ids() {
                    directory.remove(&id);
                }
                log::debug!(target: "sched", "process {} collected, code {}", pid.as_u64(), code);
                Ok(Some(code))
            }
        }
    }

    /// Register `waiter` for the exit of task `id`, or collect its code.
    ///
    /// A collected task leaves the directory, so a second join reports
    /// `NOT_EXISTS`.
    pub(crate) fn join_task(&self, id: TaskId, waiter: TaskId) -> Result<Option<i64>, KernelError> {
        if id == waiter {
            return Err(KernelError::InvalidArg);
        }
        let shared = self.task_shared(id).ok_or(KernelError::NotExists)?;
        match shared.join(waiter) {
            Ok(()) => Ok(None),
            Err(code) => {
                self.directory.write().remove(&id);
                Ok(Some(code))
            }
        }
    }

    /// Close everything a dead process left open.
    pub(super) fn close_handles(&self, process: &Process) {
        for handle in process.handles().drain() {
            if let Handle::File { file, .. } = handle {
                self.fs.close(file);
            }
        }
    }
}
