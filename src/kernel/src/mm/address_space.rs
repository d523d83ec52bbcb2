//! User address spaces.
//!
//! An [`AddressSpace`] couples a [`PageMap`] with the list of reserved
//! regions. Regions never overlap. Every page of a region is backed by an
//! owned frame when it is allocated, so `free` and `Drop` return the memory.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_common::Protection;

use super::{CacheMode, FramePool, MapError, MapFlags, PageMap};
use crate::config::{
    align_down, align_up, HUGE_PAGE_SIZE, PAGE_SIZE, USER_ADDR_END, USER_ALLOC_BASE,
};

/// Where [`AddressSpace::allocate`] may place a new region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// First free range at or above the allocation base.
    Anywhere,
    /// The hint if it is free, otherwise like `Anywhere`.
    Prefer(u64),
    /// Exactly this address or fail.
    Exact(u64),
}

/// One reserved, backed range of user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First address.
    pub base: u64,
    /// Length in bytes, page aligned.
    pub size: u64,
    /// Current protection.
    pub prot: Protection,
}

impl Region {
    /// One past the last address.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }
}

/// A process's page tables plus region bookkeeping.
pub struct AddressSpace {
    map: PageMap,
    frames: Arc<FramePool>,
    regions: BTreeMap<u64, Region>,
}

impl AddressSpace {
    /// Create an empty address space, sharing the kernel half of `kernel`
    /// if given.
    pub fn new(frames: Arc<FramePool>, kernel: Option<&PageMap>) -> Result<Self, MapError> {
        let mut map = PageMap::new(frames.clone())?;
        if let Some(kernel) = kernel {
            map.share_kernel_half(kernel)?;
        }
        Ok(Self {
            map,
            frames,
            regions: BTreeMap::new(),
        })
    }

    /// Underlying page tables.
    pub fn page_map(&self) -> &PageMap {
        &self.map
    }

    /// Physical address of the root table.
    pub fn root(&self) -> u64 {
        self.map.root()
    }

    /// Reserved regions in address order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Region containing `addr`.
    pub fn region_at(&self, addr: u64) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| addr < r.end())
    }

    /// Returns `true` if `[base, base + size)` is user space and unreserved.
    pub fn is_free(&self, base: u64, size: u64) -> bool {
        let Some(end) = base.checked_add(size) else {
            return false;
        };
        if base < PAGE_SIZE || end > USER_ADDR_END {
            return false;
        }
        !self.regions.values().any(|r| r.base < end && base < r.end())
    }

    fn find_free(&self, size: u64) -> Option<u64> {
        let mut cursor = USER_ALLOC_BASE;
        for region in self.regions.values() {
            if region.end() <= cursor {
                continue;
            }
            if region.base >= cursor.checked_add(size)? {
                break;
            }
            cursor = align_up(region.end(), PAGE_SIZE)?;
        }
        (cursor.checked_add(size)? <= USER_ADDR_END).then_some(cursor)
    }

    /// Reserve and back `size` bytes, returning the base address.
    ///
    /// A failure part way through unmaps everything mapped so far.
    pub fn allocate(&mut self, placement: Placement, size: u64, prot: Protection) -> Result<u64, MapError> {
        let size = align_up(size, PAGE_SIZE).ok_or(MapError::InvalidRange)?;
        if size == 0 {
            return Err(MapError::InvalidRange);
        }
        let base = match placement {
            Placement::Exact(base) => {
                if base % PAGE_SIZE != 0 {
                    return Err(MapError::Misaligned);
                }
                if !self.is_free(base, size) {
                    return Err(MapError::AlreadyMapped);
                }
                base
            }
            Placement::Prefer(hint) if hint % PAGE_SIZE == 0 && self.is_free(hint, size) => hint,
            Placement::Prefer(_) | Placement::Anywhere => {
                self.find_free(size).ok_or(MapError::NoMemory)?
            }
        };

        if let Err(err) = self.back(base, size, prot) {
            self.unmap_range(base, base + size);
            log::debug!(target: "mm", "allocation of {:#x} bytes at {:#x} rolled back: {}", size, base, err);
            return Err(err);
        }
        self.regions.insert(base, Region { base, size, prot });
        log::trace!(target: "mm", "allocated [{:#x}, {:#x})", base, base + size);
        Ok(base)
    }

    fn back(&self, base: u64, size: u64, prot: Protection) -> Result<(), MapError> {
        let flags = MapFlags::from(prot) | MapFlags::USER | MapFlags::OWNED;
        let end = base + size;
        let mut addr = base;
        while addr < end {
            let huge = addr % HUGE_PAGE_SIZE == 0 && end - addr >= HUGE_PAGE_SIZE;
            if huge {
                if let Some(frame) = self.frames.alloc_huge() {
                    if let Err(err) = self.map.map_page(addr, frame, flags | MapFlags::HUGE) {
                        self.frames.free_huge(frame);
                        return Err(err);
                    }
                    addr += HUGE_PAGE_SIZE;
                    continue;
                }
            }
            let frame = self.frames.alloc_frame().ok_or(MapError::NoMemory)?;
            if let Err(err) = self.map.map_page(addr, frame, flags) {
                self.frames.free_frame(frame);
                return Err(err);
            }
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Unmap whatever is mapped in `[start, end)`, splitting huge pages
    /// that straddle either edge.
    fn unmap_range(&self, start: u64, end: u64) {
        let mut addr = start;
        while addr < end {
            let Some(mapping) = self.map.query(addr) else {
                addr += PAGE_SIZE;
                continue;
            };
            if mapping.size == HUGE_PAGE_SIZE {
                let huge = align_down(addr, HUGE_PAGE_SIZE);
                if huge < start || huge + HUGE_PAGE_SIZE > end {
                    if self.map.split_huge(addr).is_err() {
                        log::warn!(target: "mm", "cannot split huge page at {:#x}", huge);
                        addr = huge + HUGE_PAGE_SIZE;
                    }
                    continue;
                }
                let _ = self.map.unmap_page(huge);
                addr = huge + HUGE_PAGE_SIZE;
            } else {
                let _ = self.map.unmap_page(addr);
                addr += PAGE_SIZE;
            }
        }
    }

    /// Split regions so that `start` and `end` fall on region boundaries.
    fn carve(&mut self, start: u64, end: u64) {
        for cut in [start, end] {
            let Some(region) = self.region_at(cut).copied() else {
                continue;
            };
            if region.base == cut {
                continue;
            }
            self.regions.insert(
                region.base,
                Region {
                    size: cut - region.base,
                    ..region
                },
            );
            self.regions.insert(
                cut,
                Region {
                    base: cut,
                    size: region.end() - cut,
                    prot: region.prot,
                },
            );
        }
    }

    fn covered(&self, start: u64, end: u64) -> bool {
        let mut cursor = start;
        while cursor < end {
            match self.region_at(cursor) {
                Some(region) => cursor = region.end(),
                None => return false,
            }
        }
        true
    }

    /// Release `[base, base + size)`.
    ///
    /// Idempotent: ranges that are not reserved or not mapped are skipped.
    pub fn free(&mut self, base: u64, size: u64) -> Result<(), MapError> {
        if base % PAGE_SIZE != 0 {
            return Err(MapError::Misaligned);
        }
        let size = align_up(size, PAGE_SIZE).ok_or(MapError::InvalidRange)?;
        let end = base.checked_add(size).ok_or(MapError::InvalidRange)?;
        let overlapping: Vec<Region> = self
            .regions
            .values()
            .filter(|r| r.base < end && base < r.end())
            .copied()
            .collect();
        if overlapping.is_empty() {
            return Ok(());
        }
        self.carve(base, end);
        for region in overlapping {
            let start = region.base.max(base);
            let stop = region.end().min(end);
            self.unmap_range(start, stop);
        }
        let inside: Vec<u64> = self.regions.range(base..end).map(|(&b, _)| b).collect();
        for key in inside {
            self.regions.remove(&key);
        }
        log::trace!(target: "mm", "freed [{:#x}, {:#x})", base, end);
        Ok(())
    }

    /// Change the protection of a reserved range.
    pub fn protect(&mut self, base: u64, size: u64, prot: Protection) -> Result<(), MapError> {
        if base % PAGE_SIZE != 0 {
            return Err(MapError::Misaligned);
        }
        let size = align_up(size, PAGE_SIZE).ok_or(MapError::InvalidRange)?;
        let end = base.checked_add(size).ok_or(MapError::InvalidRange)?;
        if size == 0 || !self.covered(base, end) {
            return Err(MapError::NotMapped);
        }
        self.map.protect_range(
            base,
            size,
            MapFlags::from(prot) | MapFlags::USER | MapFlags::SPLIT,
            CacheMode::WriteBack,
        )?;
        self.carve(base, end);
        for region in self.regions.range_mut(base..end).map(|(_, r)| r) {
            region.prot = prot;
        }
        Ok(())
    }

    fn walk(
        &self,
        addr: u64,
        len: usize,
        required: MapFlags,
        mut f: impl FnMut(u64, usize, usize) -> Result<(), MapError>,
    ) -> Result<(), MapError> {
        let end = addr
            .checked_add(len as u64)
            .ok_or(MapError::BadAddress)?;
        let mut va = addr;
        let mut done = 0usize;
        while va < end {
            let mapping = self.map.query(va).ok_or(MapError::BadAddress)?;
            if !mapping.flags.contains(required) {
                return Err(MapError::BadAddress);
            }
            let page_end = align_down(va, mapping.size) + mapping.size;
            let chunk = (page_end.min(end) - va) as usize;
            let phys = mapping.phys + (va & (mapping.size - 1));
            f(phys, done, chunk)?;
            va += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    fn check_user(addr: u64, len: usize) -> Result<(), MapError> {
        match addr.checked_add(len as u64) {
            Some(end) if end <= USER_ADDR_END => Ok(()),
            _ => Err(MapError::BadAddress),
        }
    }

    /// Copy from user memory. Fails with `BadAddress` if any byte is not
    /// mapped user-readable.
    pub fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), MapError> {
        Self::check_user(addr, buf.len())?;
        self.walk(addr, buf.len(), MapFlags::USER | MapFlags::READ, |phys, at, len| {
            self.frames.read(phys, &mut buf[at..at + len])
        })
    }

    /// Copy into user memory. Every byte must be mapped user-writable.
    pub fn copy_to_user(&self, addr: u64, data: &[u8]) -> Result<(), MapError> {
        Self::check_user(addr, data.len())?;
        self.walk(addr, data.len(), MapFlags::USER | MapFlags::WRITE, |phys, at, len| {
            self.frames.write(phys, &data[at..at + len])
        })
    }

    /// Kernel view of `[base, base + size)` that ignores user permissions.
    pub fn kernel_mapping(&self, base: u64, size: u64) -> KernelMapping<'_> {
        KernelMapping {
            space: self,
            base,
            size,
        }
    }
}

/// Kernel-side window onto a range of an address space, used to
/// scatter-copy data into freshly allocated memory.
pub struct KernelMapping<'a> {
    space: &'a AddressSpace,
    base: u64,
    size: u64,
}

impl KernelMapping<'_> {
    /// First user address of the window.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Window length.
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Returns `true` for an empty window.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn bounds(&self, offset: u64, len: usize) -> Result<u64, MapError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(self.base + offset),
            _ => Err(MapError::InvalidRange),
        }
    }

    /// Copy `data` to `offset` within the window.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), MapError> {
        let va = self.bounds(offset, data.len())?;
        let frames = &self.space.frames;
        self.space
            .walk(va, data.len(), MapFlags::empty(), |phys, at, len| {
                frames.write(phys, &data[at..at + len])
            })
    }

    /// Zero `len` bytes at `offset`.
    pub fn zero(&self, offset: u64, len: usize) -> Result<(), MapError> {
        let va = self.bounds(offset, len)?;
        let frames = &self.space.frames;
        self.space
            .walk(va, len, MapFlags::empty(), |phys, _, chunk| frames.fill(phys, chunk, 0))
    }

    /// Copy out of the window.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), MapError> {
        let va = self.bounds(offset, buf.len())?;
        let frames = &self.space.frames;
        self.space
            .walk(va, buf.len(), MapFlags::empty(), |phys, at, len| {
                frames.read(phys, &mut buf[at..at + len])
            })
    }
}
