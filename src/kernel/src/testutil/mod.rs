//! Hosted test support.
//!
//! Builds isolated [`Kernel`] instances on [`HostCpu`] and [`ManualClock`],
//! hand-assembled ELF images, and syscall contexts that call handlers
//! directly.
//!
//! ```rust,ignore
//! let (kernel, cpu, clock) = kestrel_kernel::testutil::hosted_kernel();
//! let process = kestrel_kernel::testutil::user_process(&kernel);
//! ```

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use kestrel_common::{Capabilities, Protection};

use crate::arch::host::{HostCpu, ManualClock};
use crate::config::{KernelConfig, PAGE_SIZE};
use crate::mm::{PhysMemory, Placement};
use crate::process::{Process, ProcessId};
use crate::syscall::SyscallCtx;
use crate::{Kernel, Platform};

/// Linked base of [`minimal_elf`].
pub const MINIMAL_ELF_BASE: u64 = 0x40_0000;

/// A single-core kernel with every capability available to processes.
pub fn hosted_kernel() -> (Kernel, Arc<HostCpu>, Arc<ManualClock>) {
    hosted_kernel_with_config(KernelConfig::default())
}

/// A single-core kernel whose processes may hold at most `ceiling`.
pub fn hosted_kernel_with(ceiling: Capabilities) -> (Kernel, Arc<HostCpu>, Arc<ManualClock>) {
    hosted_kernel_with_config(KernelConfig {
        root_capabilities: ceiling,
        ..KernelConfig::default()
    })
}

/// A kernel built from `config` on recording hardware.
pub fn hosted_kernel_with_config(config: KernelConfig) -> (Kernel, Arc<HostCpu>, Arc<ManualClock>) {
    let cpu = Arc::new(HostCpu::new());
    let clock = Arc::new(ManualClock::new());
    let platform = Platform {
        cpu: cpu.clone(),
        timer: clock.clone(),
        memory: PhysMemory::hosted(config.phys_base, config.phys_size),
    };
    let kernel = Kernel::new(config, platform).expect("hosted kernel");
    (kernel, cpu, clock)
}

fn ctx_for(kernel: &Kernel, process: Option<Arc<Process>>) -> SyscallCtx<'_> {
    let task = kernel.current_task(0);
    SyscallCtx {
        kernel,
        core: 0,
        task,
        shared: kernel.task_shared(task).expect("current task is registered"),
        process,
        args: [0; 6],
    }
}

/// Syscall context for the task running on core 0, as a kernel thread.
pub fn kernel_ctx(kernel: &Kernel) -> SyscallCtx<'_> {
    ctx_for(kernel, None)
}

/// Syscall context for the task running on core 0, calling on behalf of
/// `process`.
pub fn user_ctx<'a>(kernel: &'a Kernel, process: &Arc<Process>) -> SyscallCtx<'a> {
    ctx_for(kernel, Some(process.clone()))
}

/// Create a process from [`minimal_elf`].
pub fn user_process(kernel: &Kernel) -> Arc<Process> {
    let pid: ProcessId = kernel
        .create_process("test", &minimal_elf(), &["test"], None)
        .expect("create test process");
    kernel.process(pid).expect("process registered")
}

/// Map a fresh read-write region in `process` holding `bytes` and return
/// its address.
pub fn put_user(process: &Process, bytes: &[u8]) -> u64 {
    let size = (bytes.len() as u64).max(1);
    let addr = process
        .allocate(Placement::Anywhere, size, Protection::READ | Protection::WRITE)
        .expect("map test buffer");
    process
        .space()
        .copy_to_user(addr, bytes)
        .expect("fill test buffer");
    addr
}

/// A valid `ET_EXEC` image: one read/execute page at
/// [`MINIMAL_ELF_BASE`] that spins on `int 0x80`.
pub fn minimal_elf() -> Vec<u8> {
    // int 0x80; jmp -4
    const CODE: [u8; 4] = [0xCD, 0x80, 0xEB, 0xFC];
    ElfBuilder::new(MINIMAL_ELF_BASE)
        .segment(MINIMAL_ELF_BASE, &CODE, PAGE_SIZE, 4 | 1)
        .build()
}

struct Segment {
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
    flags: u32,
}

/// Assembles little ELF64 x86_64 images for loader tests.
///
/// `LOAD` headers come first in the order added, followed by `PT_PHDR` if
/// requested. Segment data is placed at file offsets congruent to their
/// addresses modulo the page size.
pub struct ElfBuilder {
    entry: u64,
    dynamic: bool,
    phdr: Option<u64>,
    segments: Vec<Segment>,
}

const EHDR_LEN: usize = 64;
const PHDR_LEN: usize = 56;

impl ElfBuilder {
    /// Start an `ET_EXEC` image entered at `entry`.
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            dynamic: false,
            phdr: None,
            segments: Vec::new(),
        }
    }

    /// Add a `LOAD` segment.
    pub fn segment(mut self, vaddr: u64, data: &[u8], memsz: u64, flags: u32) -> Self {
        self.segments.push(Segment {
            vaddr,
            data: data.to_vec(),
            memsz,
            flags,
        });
        self
    }

    /// Mark the image `ET_DYN`.
    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// Emit a `PT_PHDR` header claiming the table lives at `vaddr`.
    pub fn phdr_at(mut self, vaddr: u64) -> Self {
        self.phdr = Some(vaddr);
        self
    }

    /// Serialize the image.
    pub fn build(self) -> Vec<u8> {
        let phnum = self.segments.len() + usize::from(self.phdr.is_some());
        let mut file = vec![0u8; EHDR_LEN + phnum * PHDR_LEN];

        file[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        file[4] = 2; // ELFCLASS64
        file[5] = 1; // little-endian
        file[6] = 1;
        put16(&mut file, 16, if self.dynamic { 3 } else { 2 });
        put16(&mut file, 18, 62);
        put32(&mut file, 20, 1);
        put64(&mut file, 24, self.entry);
        put64(&mut file, 32, EHDR_LEN as u64);
        put16(&mut file, 52, EHDR_LEN as u16);
        put16(&mut file, 54, PHDR_LEN as u16);
        put16(&mut file, 56, phnum as u16);

        let mut headers = Vec::with_capacity(phnum);
        for seg in &self.segments {
            let page = PAGE_SIZE as usize;
            let mut offset = file.len() - file.len() % page + (seg.vaddr % PAGE_SIZE) as usize;
            if offset < file.len() {
                offset += page;
            }
            file.resize(offset, 0);
            file.extend_from_slice(&seg.data);
            headers.push((1u32, seg.flags, offset as u64, seg.vaddr, seg.data.len() as u64, seg.memsz));
        }
        if let Some(vaddr) = self.phdr {
            let size = (phnum * PHDR_LEN) as u64;
            headers.push((6, 4, EHDR_LEN as u64, vaddr, size, size));
        }

        for (i, (kind, flags, offset, vaddr, filesz, memsz)) in headers.into_iter().enumerate() {
            let at = EHDR_LEN + i * PHDR_LEN;
            put32(&mut file, at, kind);
            put32(&mut file, at + 4, flags);
            put64(&mut file, at + 8, offset);
            put64(&mut file, at + 16, vaddr);
            put64(&mut file, at + 24, vaddr);
            put64(&mut file, at + 32, filesz);
            put64(&mut file, at + 40, memsz);
            put64(&mut file, at + 48, PAGE_SIZE);
        }
        file
    }
}

fn put16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
