//! ELF64 executable loader.
//!
//! Supports statically linked x86_64 little-endian images of type ET_EXEC
//! (loaded at their linked address) and ET_DYN (loaded at their linked
//! address when free, anywhere otherwise). No relocations are applied.

use alloc::vec::Vec;
use core::fmt;

use kestrel_common::{KernelError, Protection};

use super::Process;
use crate::config::{align_down, align_up, PAGE_SIZE};
use crate::mm::{AddressSpace, Placement};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PT_PHDR: u32 = 6;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// ELF64 file header (64 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct Elf64Header {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// ELF64 program header (56 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

const HEADER_SIZE: usize = core::mem::size_of::<Elf64Header>();
const PHDR_SIZE: usize = core::mem::size_of::<Elf64Phdr>();

/// Loader failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Malformed or unsupported image.
    Invalid,
    /// The address range could not be reserved or backed.
    NoMemory,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::Invalid => write!(f, "invalid ELF image"),
            ElfError::NoMemory => write!(f, "not enough memory for ELF image"),
        }
    }
}

impl From<ElfError> for KernelError {
    fn from(err: ElfError) -> Self {
        match err {
            ElfError::Invalid => KernelError::InvalidArg,
            ElfError::NoMemory => KernelError::NoMem,
        }
    }
}

/// Where a loaded image ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedElf {
    /// Entry point in the new address space.
    pub entry: u64,
    /// Lowest mapped address of the image.
    pub base: u64,
    /// Address of the program-header table, 0 if it is not mapped.
    pub phdr: u64,
    /// Number of program headers.
    pub phnum: u16,
    /// Size of one program header.
    pub phent: u16,
}

struct Image {
    header: Elf64Header,
    phdrs: Vec<Elf64Phdr>,
    base: u64,
    end: u64,
}

fn reject(reason: &str) -> ElfError {
    log::warn!(target: "elf", "rejected image: {}", reason);
    ElfError::Invalid
}

/// Validate `file` without touching any address space.
fn parse(file: &[u8]) -> Result<Image, ElfError> {
    if file.len() < HEADER_SIZE {
        return Err(reject("file smaller than header"));
    }
    // SAFETY: length checked above; the struct is packed so any alignment is fine.
    let header: Elf64Header = unsafe { core::ptr::read_unaligned(file.as_ptr() as *const Elf64Header) };

    if header.e_ident[0..4] != ELF_MAGIC {
        return Err(reject("bad magic"));
    }
    if header.e_ident[4] != ELFCLASS64 {
        return Err(reject("not a 64-bit image"));
    }
    if header.e_ident[5] != ELFDATA2LSB {
        return Err(reject("not little-endian"));
    }
    if header.e_machine != EM_X86_64 {
        return Err(reject("wrong machine"));
    }
    if header.e_type != ET_EXEC && header.e_type != ET_DYN {
        return Err(reject("not an executable"));
    }

    let phnum = u64::from(header.e_phnum);
    let phent = u64::from(header.e_phentsize);
    if phnum > 0 && phent < PHDR_SIZE as u64 {
        return Err(reject("program header entries too small"));
    }
    let table_end = header
        .e_phoff
        .checked_add(phnum * phent)
        .ok_or_else(|| reject("program header table overflows"))?;
    if table_end > file.len() as u64 {
        return Err(reject("program header table past end of file"));
    }

    let mut phdrs = Vec::with_capacity(phnum as usize);
    for i in 0..phnum {
        let at = (header.e_phoff + i * phent) as usize;
        // SAFETY: `at + PHDR_SIZE <= table_end <= file.len()`.
        let phdr: Elf64Phdr = unsafe { core::ptr::read_unaligned(file.as_ptr().add(at) as *const Elf64Phdr) };
        phdrs.push(phdr);
    }

    let mut base = u64::MAX;
    let mut end = 0u64;
    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        let file_end = phdr.p_offset.checked_add(phdr.p_filesz);
        if file_end.map_or(true, |e| e > file.len() as u64) {
            return Err(reject("segment data past end of file"));
        }
        if phdr.p_filesz > phdr.p_memsz {
            return Err(reject("segment file size exceeds memory size"));
        }
        let seg_end = phdr
            .p_vaddr
            .checked_add(phdr.p_memsz)
            .ok_or_else(|| reject("segment wraps the address space"))?;
        base = base.min(phdr.p_vaddr);
        end = end.max(seg_end);
    }
    if base >= end {
        return Err(reject("no loadable data"));
    }
    if !(base..end).contains(&{ header.e_entry }) {
        return Err(reject("entry point outside the loaded image"));
    }

    Ok(Image {
        header,
        phdrs,
        base,
        end,
    })
}

fn segment_protection(flags: u32) -> Protection {
    let mut prot = Protection::empty();
    if flags & (PF_R | PF_W | PF_X) != 0 {
        prot |= Protection::READ;
    }
    if flags & PF_W != 0 {
        prot |= Protection::WRITE;
    }
    if flags & PF_X != 0 {
        prot |= Protection::EXEC;
    }
    prot
}

fn populate(space: &mut AddressSpace, file: &[u8], image: &Image, bias: u64, at: u64, size: u64) -> Result<(), ElfError> {
    let page_base = align_down(image.base, PAGE_SIZE);
    let loads = || image.phdrs.iter().filter(|p| p.p_type == PT_LOAD);

    {
        let view = space.kernel_mapping(at, size);
        for phdr in loads() {
            if phdr.p_vaddr % PAGE_SIZE != phdr.p_offset % PAGE_SIZE {
                return Err(reject("segment misaligned with its file offset"));
            }
            let rel = phdr.p_vaddr - page_base;
            let start = phdr.p_offset as usize;
            let data = &file[start..start + phdr.p_filesz as usize];
            view.write_at(rel, data).map_err(|_| ElfError::Invalid)?;
            let bss = (phdr.p_memsz - phdr.p_filesz) as usize;
            view.zero(rel + phdr.p_filesz, bss)
                .map_err(|_| ElfError::Invalid)?;
        }
    }

    for phdr in loads().filter(|p| p.p_memsz > 0) {
        let start = align_down(phdr.p_vaddr + bias, PAGE_SIZE);
        let stop = align_up(phdr.p_vaddr + bias + phdr.p_memsz, PAGE_SIZE).ok_or(ElfError::Invalid)?;
        space
            .protect(start, stop - start, segment_protection(phdr.p_flags))
            .map_err(|_| ElfError::NoMemory)?;
    }
    Ok(())
}

/// Rebased entry point and program header addresses of a placed image.
fn locate(image: &Image, at: u64, bias: u64) -> Option<LoadedElf> {
    let phoff = image.header.e_phoff;
    let phdr = match image.phdrs.iter().find(|p| p.p_type == PT_PHDR) {
        Some(p) => Some(p.p_vaddr),
        None => image
            .phdrs
            .iter()
            .filter(|p| p.p_type == PT_LOAD)
            .find(|p| p.p_offset <= phoff && phoff - p.p_offset < p.p_filesz)
            .map(|p| p.p_vaddr + (phoff - p.p_offset)),
    };
    let phdr = match phdr {
        Some(addr) => addr.checked_add(bias)?,
        None => 0,
    };
    Some(LoadedElf {
        entry: image.header.e_entry.checked_add(bias)?,
        base: at,
        phdr,
        phnum: image.header.e_phnum,
        phent: image.header.e_phentsize,
    })
}

/// Load `file` into `process`'s address space.
///
/// Header problems are reported as [`ElfError::Invalid`] before anything is
/// reserved. Once the range is reserved, every failure releases it again.
pub fn elf_load(process: &Process, file: &[u8]) -> Result<LoadedElf, ElfError> {
    let image = parse(file)?;
    let page_base = align_down(image.base, PAGE_SIZE);
    let page_end = align_up(image.end, PAGE_SIZE).ok_or_else(|| reject("image ends past the address space"))?;
    let size = page_end - page_base;

    let placement = match image.header.e_type {
        ET_EXEC => Placement::Exact(page_base),
        _ if page_base == 0 => Placement::Anywhere,
        _ => Placement::Prefer(page_base),
    };

    let mut space = process.space();
    let at = space
        .allocate(placement, size, Protection::READ | Protection::WRITE)
        .map_err(|err| {
            log::warn!(target: "elf", "cannot reserve {:#x} bytes at {:#x}: {}", size, page_base, err);
            ElfError::NoMemory
        })?;
    let bias = at - page_base;

    if let Err(err) = populate(&mut space, file, &image, bias, at, size) {
        let _ = space.free(at, size);
        return Err(err);
    }

    let Some(loaded) = locate(&image, at, bias) else {
        let _ = space.free(at, size);
        return Err(reject("entry or header address overflows"));
    };
    log::debug!(
        target: "elf",
        "loaded process {} image at {:#x}, entry {:#x}",
        process.id().as_u64(),
        loaded.base,
        loaded.entry
    );
    Ok(loaded)
}
