//! x86_64 four-level page tables.
//!
//! Tables are [`PageTable`]s in frames of a [`FramePool`]. Mapping,
//! unmapping, flag updates and lookups go through an [`OffsetPageTable`]
//! built over the pool's window, so the same code runs on bare metal and in
//! hosted tests. Splitting and merging huge pages edit the level-2 entry
//! directly. Only 4 KiB and 2 MiB leaves are produced.
//!
//! Two software bits are used in leaves. `OWNED` (bit 9) marks a frame that
//! belongs to the mapping and is freed with it. `NO_ACCESS` (bit 10) marks
//! a page mapped with no permissions: it stays present so the kernel can
//! still fill it, but it is never user accessible.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use kestrel_common::Protection;
use spin::Mutex;
use x86_64::structures::paging::mapper::{
    FlagUpdateError, MapToError, MappedFrame, TranslateResult, UnmapError,
};
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{
    Mapper, OffsetPageTable, Page, PageSize, PageTable, PageTableFlags, PhysFrame, Size2MiB,
    Size4KiB, Translate,
};
use x86_64::{PhysAddr, VirtAddr};

use super::{FramePool, MapError};
use crate::config::{align_down, HUGE_PAGE_SIZE, PAGE_SIZE};

const ENTRIES: usize = 512;
const KERNEL_HALF: usize = 256;

const OWNED: PageTableFlags = PageTableFlags::BIT_9;
const NO_ACCESS: PageTableFlags = PageTableFlags::BIT_10;

const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

/// Bits preserved when permissions of an existing leaf are rewritten.
const KEEP_ON_PROTECT: PageTableFlags = OWNED
    .union(PageTableFlags::ACCESSED)
    .union(PageTableFlags::DIRTY)
    .union(PageTableFlags::GLOBAL);

/// Bits the CPU sets on its own; ignored when comparing leaves.
const VOLATILE: PageTableFlags = PageTableFlags::ACCESSED.union(PageTableFlags::DIRTY);

bitflags! {
    /// Mapping request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Readable. A mapping without READ, WRITE or EXEC is a
        /// kernel-only page that user mode cannot touch.
        const READ = 1;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC = 1 << 2;
        /// Map a 2 MiB page.
        const HUGE = 1 << 3;
        /// Uncached.
        const NO_CACHE = 1 << 4;
        /// Permit breaking an existing huge page down.
        const SPLIT = 1 << 5;
        /// Permit coalescing small pages into a huge page.
        const MERGE = 1 << 6;
        /// Accessible from user mode.
        const USER = 1 << 7;
        /// The frame belongs to the mapping and is freed with it.
        const OWNED = 1 << 8;
    }
}

impl From<Protection> for MapFlags {
    fn from(prot: Protection) -> Self {
        let mut flags = MapFlags::empty();
        if prot.intersects(Protection::READ | Protection::WRITE | Protection::EXEC) {
            flags |= MapFlags::READ;
        }
        if prot.contains(Protection::WRITE) {
            flags |= MapFlags::WRITE;
        }
        if prot.contains(Protection::EXEC) {
            flags |= MapFlags::EXEC;
        }
        flags
    }
}

impl<S: PageSize> From<MapToError<S>> for MapError {
    fn from(err: MapToError<S>) -> Self {
        match err {
            MapToError::FrameAllocationFailed => MapError::NoMemory,
            MapToError::ParentEntryHugePage => MapError::HugeOverlap,
            MapToError::PageAlreadyMapped(_) => MapError::AlreadyMapped,
        }
    }
}

impl From<UnmapError> for MapError {
    fn from(err: UnmapError) -> Self {
        match err {
            UnmapError::ParentEntryHugePage => MapError::HugeOverlap,
            UnmapError::PageNotMapped => MapError::NotMapped,
            UnmapError::InvalidFrameAddress(_) => MapError::BadAddress,
        }
    }
}

impl From<FlagUpdateError> for MapError {
    fn from(err: FlagUpdateError) -> Self {
        match err {
            FlagUpdateError::PageNotMapped => MapError::NotMapped,
            FlagUpdateError::ParentEntryHugePage => MapError::HugeOverlap,
        }
    }
}

/// Memory type of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Normal cached memory.
    #[default]
    WriteBack,
    /// Write-through caching.
    WriteThrough,
    /// Caching disabled (device memory).
    Uncached,
}

/// A resolved leaf mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Physical address of the start of the page.
    pub phys: u64,
    /// Page size, 4 KiB or 2 MiB.
    pub size: u64,
    /// Permission and ownership flags.
    pub flags: MapFlags,
    /// Memory type.
    pub cache: CacheMode,
}

#[derive(Debug, Clone, Copy)]
struct Leaf {
    phys: PhysAddr,
    size: u64,
    flags: PageTableFlags,
}

impl Leaf {
    fn is_huge(&self) -> bool {
        self.size == HUGE_PAGE_SIZE
    }
}

/// `virt` as a canonical address; the x86_64 crate would silently
/// sign-extend addresses in the hole instead of rejecting them.
fn canonical(virt: u64) -> Result<VirtAddr, MapError> {
    match VirtAddr::try_new(virt) {
        Ok(addr) if addr.as_u64() == virt => Ok(addr),
        _ => Err(MapError::InvalidRange),
    }
}

fn leaf_bits(flags: MapFlags, cache: CacheMode) -> PageTableFlags {
    let accessible = flags.intersects(MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC);
    let mut bits = PageTableFlags::PRESENT;
    bits.set(PageTableFlags::WRITABLE, flags.contains(MapFlags::WRITE));
    bits.set(
        PageTableFlags::USER_ACCESSIBLE,
        accessible && flags.contains(MapFlags::USER),
    );
    bits.set(NO_ACCESS, !accessible);
    bits.set(OWNED, flags.contains(MapFlags::OWNED));
    bits.set(PageTableFlags::NO_EXECUTE, !flags.contains(MapFlags::EXEC));
    match cache {
        CacheMode::WriteBack => {}
        CacheMode::WriteThrough => bits |= PageTableFlags::WRITE_THROUGH,
        CacheMode::Uncached => bits |= PageTableFlags::NO_CACHE,
    }
    bits
}

fn decode(leaf: Leaf) -> Mapping {
    let bits = leaf.flags;
    let mut flags = MapFlags::empty();
    flags.set(MapFlags::READ, !bits.contains(NO_ACCESS));
    flags.set(MapFlags::WRITE, bits.contains(PageTableFlags::WRITABLE));
    flags.set(MapFlags::EXEC, !bits.contains(PageTableFlags::NO_EXECUTE));
    flags.set(MapFlags::USER, bits.contains(PageTableFlags::USER_ACCESSIBLE));
    flags.set(MapFlags::OWNED, bits.contains(OWNED));
    flags.set(MapFlags::HUGE, leaf.is_huge());
    let cache = if bits.contains(PageTableFlags::NO_CACHE) {
        CacheMode::Uncached
    } else if bits.contains(PageTableFlags::WRITE_THROUGH) {
        CacheMode::WriteThrough
    } else {
        CacheMode::WriteBack
    };
    flags.set(MapFlags::NO_CACHE, cache == CacheMode::Uncached);
    Mapping {
        phys: leaf.phys.as_u64(),
        size: leaf.size,
        flags,
        cache,
    }
}

/// One page-table hierarchy.
pub struct PageMap {
    root: PhysAddr,
    frames: Arc<FramePool>,
    /// Root entries from this index up are borrowed from the kernel map.
    shared_from: usize,
    /// Held for every table edit and walk.
    edit: Mutex<()>,
}

impl PageMap {
    /// Allocate an empty root table (`create_map`).
    pub fn new(frames: Arc<FramePool>) -> Result<Self, MapError> {
        let root = frames.alloc_frame().ok_or(MapError::NoMemory)?;
        Ok(Self {
            root: PhysAddr::new_truncate(root),
            frames,
            shared_from: ENTRIES,
            edit: Mutex::new(()),
        })
    }

    /// Physical address of the root table, as loaded into CR3.
    pub fn root(&self) -> u64 {
        self.root.as_u64()
    }

    /// Frame pool backing the tables.
    pub fn frames(&self) -> &Arc<FramePool> {
        &self.frames
    }

    /// The table stored in the frame at `phys`.
    ///
    /// # Safety
    ///
    /// `edit` must be held (or `self` exclusively borrowed), and no other
    /// live reference to the same table may be used while this one is.
    unsafe fn table(&self, phys: PhysAddr) -> Result<&mut PageTable, MapError> {
        let table = self.frames.memory().table(phys.as_u64())?;
        // SAFETY: table frames come from the pool and the caller serialises access.
        Ok(unsafe { &mut *table })
    }

    /// A mapper over this hierarchy.
    ///
    /// # Safety
    ///
    /// As for [`Self::table`], for the root table.
    unsafe fn mapper(&self) -> Result<OffsetPageTable<'_>, MapError> {
        // SAFETY: forwarded to the caller.
        let root = unsafe { self.table(self.root)? };
        // SAFETY: every table frame lies inside the pool window at `offset`.
        Ok(unsafe { OffsetPageTable::new(root, self.frames.memory().offset()) })
    }

    /// Table referenced by a present, non-huge entry.
    ///
    /// # Safety
    ///
    /// As for [`Self::table`].
    unsafe fn child(&self, entry: &PageTableEntry) -> Result<Option<&mut PageTable>, MapError> {
        let flags = entry.flags();
        if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE) {
            return Ok(None);
        }
        // SAFETY: forwarded to the caller.
        unsafe { self.table(entry.addr()) }.map(Some)
    }

    /// Level-2 entry covering `virt`, if the tables above it exist.
    ///
    /// # Safety
    ///
    /// As for [`Self::table`].
    unsafe fn l2_entry(&self, virt: VirtAddr) -> Result<Option<&mut PageTableEntry>, MapError> {
        // SAFETY: forwarded to the caller.
        unsafe {
            let l4 = self.table(self.root)?;
            let Some(l3) = self.child(&l4[virt.p4_index()])? else {
                return Ok(None);
            };
            let Some(l2) = self.child(&l3[virt.p3_index()])? else {
                return Ok(None);
            };
            Ok(Some(&mut l2[virt.p2_index()]))
        }
    }

    /// Leaf covering `virt`. Caller holds `edit`.
    fn leaf(&self, virt: VirtAddr) -> Result<Option<Leaf>, MapError> {
        // SAFETY: the caller holds `edit`; the mapper only reads.
        let mapper = unsafe { self.mapper()? };
        match mapper.translate(virt) {
            TranslateResult::Mapped { frame, flags, .. } => match frame {
                MappedFrame::Size4KiB(frame) => Ok(Some(Leaf {
                    phys: frame.start_address(),
                    size: PAGE_SIZE,
                    flags,
                })),
                MappedFrame::Size2MiB(frame) => Ok(Some(Leaf {
                    phys: frame.start_address(),
                    size: HUGE_PAGE_SIZE,
                    flags,
                })),
                MappedFrame::Size1GiB(_) => Err(MapError::HugeOverlap),
            },
            TranslateResult::NotMapped => Ok(None),
            TranslateResult::InvalidFrameAddress(_) => Err(MapError::BadAddress),
        }
    }

    fn release(&self, phys: PhysAddr, size: u64, flags: PageTableFlags) {
        if flags.contains(OWNED) {
            if size == HUGE_PAGE_SIZE {
                self.frames.free_huge(phys.as_u64());
            } else {
                self.frames.free_frame(phys.as_u64());
            }
        }
    }

    /// Replace the huge leaf `entry` covering `virt` with a table of 512
    /// small leaves carrying the same frames and flags.
    fn split_entry(&self, virt: VirtAddr, entry: &mut PageTableEntry) -> Result<(), MapError> {
        let l1_phys = self.frames.alloc_frame().ok_or(MapError::NoMemory)?;
        let l1_addr = PhysAddr::new_truncate(l1_phys);
        // SAFETY: a fresh frame nothing else references.
        let l1 = match unsafe { self.table(l1_addr) } {
            Ok(table) => table,
            Err(err) => {
                self.frames.free_frame(l1_phys);
                return Err(err);
            }
        };
        let base = entry.addr();
        let bits = entry.flags() - PageTableFlags::HUGE_PAGE;
        for (i, leaf) in l1.iter_mut().enumerate() {
            leaf.set_addr(base + i as u64 * PAGE_SIZE, bits);
        }
        entry.set_addr(l1_addr, TABLE_FLAGS);
        crate::arch::flush_range(virt.align_down(HUGE_PAGE_SIZE).as_u64(), HUGE_PAGE_SIZE);
        log::trace!(target: "mm", "split huge page at phys {:#x}", base.as_u64());
        Ok(())
    }

    /// Install or update the mapping of one page.
    ///
    /// A small page inside an existing huge page requires [`MapFlags::SPLIT`].
    pub fn map_page(&self, virt: u64, phys: u64, flags: MapFlags) -> Result<(), MapError> {
        let va = canonical(virt)?;
        let pa = PhysAddr::try_new(phys).map_err(|_| MapError::InvalidRange)?;
        let huge = flags.contains(MapFlags::HUGE);
        let size = if huge { HUGE_PAGE_SIZE } else { PAGE_SIZE };
        if virt % size != 0 || phys % size != 0 {
            return Err(MapError::Misaligned);
        }
        let cache = if flags.contains(MapFlags::NO_CACHE) {
            CacheMode::Uncached
        } else {
            CacheMode::WriteBack
        };
        let bits = leaf_bits(flags, cache);
        let _edit = self.edit.lock();
        if huge {
            self.map_huge(va, pa, bits)?;
        } else {
            self.map_small(va, pa, bits, flags.contains(MapFlags::SPLIT))?;
        }
        crate::arch::flush_page(virt);
        Ok(())
    }

    fn map_huge(&self, va: VirtAddr, pa: PhysAddr, bits: PageTableFlags) -> Result<(), MapError> {
        // SAFETY: `edit` is held; the entry is dropped before the mapper runs.
        if let Some(entry) = unsafe { self.l2_entry(va)? } {
            let old = entry.flags();
            if old.contains(PageTableFlags::PRESENT) {
                if old.contains(PageTableFlags::HUGE_PAGE) {
                    if entry.addr() != pa {
                        self.release(entry.addr(), HUGE_PAGE_SIZE, old);
                    }
                } else {
                    let table = entry.addr();
                    // SAFETY: as above.
                    let empty = unsafe { self.table(table)? }
                        .iter()
                        .all(|e| !e.flags().contains(PageTableFlags::PRESENT));
                    if !empty {
                        return Err(MapError::AlreadyMapped);
                    }
                    self.frames.free_frame(table.as_u64());
                }
                entry.set_unused();
            }
        }
        let page = Page::<Size2MiB>::from_start_address(va).map_err(|_| MapError::Misaligned)?;
        let frame = PhysFrame::<Size2MiB>::from_start_address(pa).map_err(|_| MapError::Misaligned)?;
        let mut frames = &*self.frames;
        // SAFETY: `edit` is held and the caller owns `frame`.
        unsafe {
            self.mapper()?.map_to_with_table_flags(
                page,
                frame,
                bits | PageTableFlags::HUGE_PAGE,
                TABLE_FLAGS,
                &mut frames,
            )?
        }
        .ignore();
        Ok(())
    }

    fn map_small(
        &self,
        va: VirtAddr,
        pa: PhysAddr,
        bits: PageTableFlags,
        split: bool,
    ) -> Result<(), MapError> {
        // SAFETY: `edit` is held; the entry is dropped before the mapper runs.
        if let Some(entry) = unsafe { self.l2_entry(va)? } {
            if entry.flags().contains(PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE) {
                if !split {
                    return Err(MapError::HugeOverlap);
                }
                self.split_entry(va, entry)?;
            }
        }
        let page = Page::<Size4KiB>::containing_address(va);
        if let Some(old) = self.leaf(va)? {
            // SAFETY: `edit` is held.
            let (_, flush) = unsafe { self.mapper()? }.unmap(page)?;
            flush.ignore();
            if old.phys != pa {
                self.release(old.phys, PAGE_SIZE, old.flags);
            }
        }
        let frame = PhysFrame::<Size4KiB>::containing_address(pa);
        let mut frames = &*self.frames;
        // SAFETY: `edit` is held and the caller owns `frame`.
        unsafe {
            self.mapper()?
                .map_to_with_table_flags(page, frame, bits, TABLE_FLAGS, &mut frames)?
        }
        .ignore();
        Ok(())
    }

    /// Remove the mapping containing `virt`, freeing an owned frame.
    ///
    /// Returns the size of the page removed. A huge page can only be
    /// removed through its aligned base address.
    pub fn unmap_page(&self, virt: u64) -> Result<u64, MapError> {
        let va = canonical(virt)?;
        let _edit = self.edit.lock();
        let leaf = self.leaf(va)?.ok_or(MapError::NotMapped)?;
        // SAFETY: `edit` is held.
        let mut mapper = unsafe { self.mapper()? };
        let start = if leaf.is_huge() {
            let page = Page::<Size2MiB>::from_start_address(va).map_err(|_| MapError::Misaligned)?;
            mapper.unmap(page)?.1.ignore();
            page.start_address()
        } else {
            let page = Page::<Size4KiB>::containing_address(va);
            mapper.unmap(page)?.1.ignore();
            page.start_address()
        };
        self.release(leaf.phys, leaf.size, leaf.flags);
        crate::arch::flush_page(start.as_u64());
        Ok(leaf.size)
    }

    /// Break the huge page containing `virt` into small pages. No-op for
    /// small or unmapped addresses.
    pub fn split_huge(&self, virt: u64) -> Result<(), MapError> {
        let va = canonical(virt)?;
        let _edit = self.edit.lock();
        self.split_at(va)
    }

    fn split_at(&self, va: VirtAddr) -> Result<(), MapError> {
        // SAFETY: `edit` is held by the caller.
        if let Some(entry) = unsafe { self.l2_entry(va)? } {
            if entry.flags().contains(PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE) {
                self.split_entry(va, entry)?;
            }
        }
        Ok(())
    }

    /// Physical address `virt` maps to.
    pub fn translate(&self, virt: u64) -> Option<u64> {
        let mapping = self.query(virt)?;
        Some(mapping.phys + (virt & (mapping.size - 1)))
    }

    /// Leaf mapping covering `virt`.
    pub fn query(&self, virt: u64) -> Option<Mapping> {
        let va = canonical(virt).ok()?;
        let _edit = self.edit.lock();
        self.leaf(va).ok()?.map(decode)
    }

    /// Apply `flags` and `cache` over `[base, base + size)`.
    ///
    /// `flags` fully describes the new permissions, user access included;
    /// ownership and the accessed/dirty bits of each leaf are kept. Every
    /// page in the range must be mapped. A huge page only partly inside the
    /// range is split when `flags` contains [`MapFlags::SPLIT`]; otherwise
    /// the call fails before anything is modified. With [`MapFlags::MERGE`],
    /// fully uniform 2 MiB windows are coalesced afterwards.
    pub fn protect_range(
        &self,
        base: u64,
        size: u64,
        flags: MapFlags,
        cache: CacheMode,
    ) -> Result<(), MapError> {
        if base % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(MapError::Misaligned);
        }
        let end = base.checked_add(size).ok_or(MapError::InvalidRange)?;
        if size == 0 {
            return Err(MapError::InvalidRange);
        }
        canonical(base)?;
        canonical(end - 1)?;
        let _edit = self.edit.lock();

        // Validate the whole range before touching anything.
        let mut partial = Vec::new();
        let mut addr = base;
        while addr < end {
            let leaf = self.leaf(canonical(addr)?)?.ok_or(MapError::NotMapped)?;
            if leaf.is_huge() {
                let start = align_down(addr, HUGE_PAGE_SIZE);
                let stop = start + HUGE_PAGE_SIZE;
                if start < base || stop > end {
                    if !flags.contains(MapFlags::SPLIT) {
                        return Err(MapError::HugeOverlap);
                    }
                    partial.push(start);
                }
                addr = stop;
            } else {
                addr += PAGE_SIZE;
            }
        }

        // Splitting keeps effective permissions, so a failure here leaves
        // the range semantically unchanged.
        for start in partial {
            self.split_at(canonical(start)?)?;
        }

        let perms = leaf_bits(flags, cache) - OWNED;
        let mut addr = base;
        while addr < end {
            let va = canonical(addr)?;
            let leaf = self.leaf(va)?.ok_or(MapError::NotMapped)?;
            let bits = (leaf.flags & KEEP_ON_PROTECT) | perms;
            // SAFETY: `edit` is held.
            let mut mapper = unsafe { self.mapper()? };
            if leaf.is_huge() {
                let page = Page::<Size2MiB>::containing_address(va);
                // SAFETY: only permission bits change; the frame stays.
                unsafe { mapper.update_flags(page, bits | PageTableFlags::HUGE_PAGE)? }.ignore();
                crate::arch::flush_range(page.start_address().as_u64(), HUGE_PAGE_SIZE);
                addr = page.start_address().as_u64() + HUGE_PAGE_SIZE;
            } else {
                let page = Page::<Size4KiB>::containing_address(va);
                // SAFETY: as above.
                unsafe { mapper.update_flags(page, bits)? }.ignore();
                crate::arch::flush_page(addr);
                addr += PAGE_SIZE;
            }
        }

        if flags.contains(MapFlags::MERGE) {
            let mut window = align_down(base, HUGE_PAGE_SIZE);
            while window < end {
                self.merge_at(canonical(window)?)?;
                window += HUGE_PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Coalesce the 512 small pages of the 2 MiB window at `virt` into one
    /// huge page if they are physically contiguous, aligned and carry the
    /// same flags. Returns whether a merge happened.
    pub fn merge_huge(&self, virt: u64) -> Result<bool, MapError> {
        if virt % HUGE_PAGE_SIZE != 0 {
            return Err(MapError::Misaligned);
        }
        let va = canonical(virt)?;
        let _edit = self.edit.lock();
        self.merge_at(va)
    }

    fn merge_at(&self, va: VirtAddr) -> Result<bool, MapError> {
        // SAFETY: `edit` is held by the caller.
        let Some(entry) = (unsafe { self.l2_entry(va)? }) else {
            return Ok(false);
        };
        // SAFETY: as above.
        let Some(l1) = (unsafe { self.child(entry)? }) else {
            return Ok(false);
        };
        let first = &l1[0];
        let first_bits = first.flags() - VOLATILE;
        let base = first.addr();
        if !first_bits.contains(PageTableFlags::PRESENT) || base.as_u64() % HUGE_PAGE_SIZE != 0 {
            return Ok(false);
        }
        let uniform = l1.iter().enumerate().all(|(i, leaf)| {
            leaf.addr() == base + i as u64 * PAGE_SIZE && leaf.flags() - VOLATILE == first_bits
        });
        if !uniform {
            return Ok(false);
        }
        let table = entry.addr();
        entry.set_addr(base, first_bits | PageTableFlags::HUGE_PAGE);
        self.frames.free_frame(table.as_u64());
        crate::arch::flush_range(va.as_u64(), HUGE_PAGE_SIZE);
        log::trace!(target: "mm", "merged {:#x} into a huge page", va.as_u64());
        Ok(true)
    }

    /// Borrow the kernel's upper-half root entries from `kernel`.
    pub fn share_kernel_half(&mut self, kernel: &PageMap) -> Result<(), MapError> {
        let _edit = kernel.edit.lock();
        // SAFETY: `self` is exclusively borrowed, `kernel`'s lock is held and
        // the two roots are different frames.
        let (src, dst) = unsafe { (kernel.table(kernel.root)?, self.table(self.root)?) };
        for index in KERNEL_HALF..ENTRIES {
            dst[index] = src[index].clone();
        }
        self.shared_from = KERNEL_HALF;
        Ok(())
    }

    fn free_table(&self, table: PhysAddr, level: u8, limit: usize) {
        // SAFETY: only called from `drop`.
        if let Ok(entries) = unsafe { self.table(table) } {
            for entry in entries.iter().take(limit) {
                let flags = entry.flags();
                if !flags.contains(PageTableFlags::PRESENT) {
                    continue;
                }
                match level {
                    1 => self.release(entry.addr(), PAGE_SIZE, flags),
                    2 if flags.contains(PageTableFlags::HUGE_PAGE) => {
                        self.release(entry.addr(), HUGE_PAGE_SIZE, flags)
                    }
                    _ => self.free_table(entry.addr(), level - 1, ENTRIES),
                }
            }
        }
        self.frames.free_frame(table.as_u64());
    }
}

impl Drop for PageMap {
    fn drop(&mut self) {
        self.free_table(self.root, 4, self.shared_from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::flush_count;
    use crate::mm::PhysMemory;

    fn frames() -> Arc<FramePool> {
        Arc::new(FramePool::new(PhysMemory::hosted(HUGE_PAGE_SIZE, 8 * HUGE_PAGE_SIZE)))
    }

    const RW: MapFlags = MapFlags::READ.union(MapFlags::WRITE);

    #[test]
    fn map_translate_unmap() {
        let frames = frames();
        let map = PageMap::new(frames.clone()).unwrap();
        let frame = frames.alloc_frame().unwrap();
        map.map_page(0x40_0000, frame, RW | MapFlags::USER | MapFlags::OWNED)
            .unwrap();
        assert_eq!(map.translate(0x40_0123), Some(frame + 0x123));
        let m = map.query(0x40_0000).unwrap();
        assert_eq!(m.size, PAGE_SIZE);
        assert!(m.flags.contains(MapFlags::READ | MapFlags::WRITE | MapFlags::USER));
        assert!(!m.flags.contains(MapFlags::EXEC));

        let free = frames.free_count();
        assert_eq!(map.unmap_page(0x40_0000), Ok(PAGE_SIZE));
        assert_eq!(frames.free_count(), free + 1, "owned frame released");
        assert_eq!(map.translate(0x40_0000), None);
        assert_eq!(map.unmap_page(0x40_0000), Err(MapError::NotMapped));
    }

    #[test]
    fn non_canonical_addresses_are_rejected() {
        let frames = frames();
        let map = PageMap::new(frames.clone()).unwrap();
        let frame = frames.alloc_frame().unwrap();
        assert_eq!(
            map.map_page(0x0000_8000_0000_0000, frame, RW),
            Err(MapError::InvalidRange)
        );
        assert_eq!(map.query(0x0000_8000_0000_0000), None);
    }

    #[test]
    fn huge_mappings_require_alignment() {
        let frames = frames();
        let map = PageMap::new(frames.clone()).unwrap();
        let huge = frames.alloc_huge().unwrap();
        assert_eq!(
            map.map_page(0x1000, huge, RW | MapFlags::HUGE),
            Err(MapError::Misaligned)
        );
        map.map_page(0x20_0000, huge, RW | MapFlags::HUGE).unwrap();
        assert_eq!(map.translate(0x20_1234), Some(huge + 0x1234));
        assert_eq!(map.unmap_page(0x20_1000), Err(MapError::Misaligned));
        assert_eq!(map.unmap_page(0x20_0000), Ok(HUGE_PAGE_SIZE));
    }

    #[test]
    fn small_map_inside_huge_needs_split() {
        let frames = frames();
        let map = PageMap::new(frames.clone()).unwrap();
        let huge = frames.alloc_huge().unwrap();
        map.map_page(0x20_0000, huge, RW | MapFlags::HUGE).unwrap();
        let frame = frames.alloc_frame().unwrap();
        assert_eq!(
            map.map_page(0x20_3000, frame, RW),
            Err(MapError::HugeOverlap)
        );
        map.map_page(0x20_3000, frame, RW | MapFlags::SPLIT).unwrap();
        assert_eq!(map.translate(0x20_3000), Some(frame));
        assert_eq!(map.translate(0x20_4000), Some(huge + 0x4000));
    }

    #[test]
    fn pages_without_permissions_are_kernel_only() {
        let frames = frames();
        let map = PageMap::new(frames.clone()).unwrap();
        let frame = frames.alloc_frame().unwrap();
        map.map_page(0x40_0000, frame, MapFlags::USER | MapFlags::OWNED)
            .unwrap();
        let none = map.query(0x40_0000).unwrap();
        assert!(!none.flags.intersects(MapFlags::READ | MapFlags::USER));
        assert!(none.flags.contains(MapFlags::OWNED));

        map.protect_range(0x40_0000, PAGE_SIZE, RW | MapFlags::USER, CacheMode::WriteBack)
            .unwrap();
        let rw = map.query(0x40_0000).unwrap();
        assert!(rw.flags.contains(RW | MapFlags::USER | MapFlags::OWNED));

        map.protect_range(0x40_0000, PAGE_SIZE, MapFlags::USER, CacheMode::WriteBack)
            .unwrap();
        let revoked = map.query(0x40_0000).unwrap();
        assert!(!revoked.flags.intersects(MapFlags::READ | MapFlags::USER));
    }

    #[test]
    fn protect_partial_huge_without_split_changes_nothing() {
        let frames = frames();
        let map = PageMap::new(frames.clone()).unwrap();
        let huge = frames.alloc_huge().unwrap();
        map.map_page(0x20_0000, huge, RW | MapFlags::HUGE | MapFlags::USER)
            .unwrap();
        let before = map.query(0x20_0000).unwrap();

        let result = map.protect_range(0x20_1000, 0x1000, MapFlags::READ, CacheMode::WriteBack);
        assert_eq!(result, Err(MapError::HugeOverlap));
        assert_eq!(map.query(0x20_0000), Some(before));
        assert_eq!(map.query(0x20_1000), Some(before));
    }

    #[test]
    fn protect_with_split_narrows_only_the_range() {
        let frames = frames();
        let map = PageMap::new(frames.clone()).unwrap();
        let huge = frames.alloc_huge().unwrap();
        map.map_page(0x20_0000, huge, RW | MapFlags::HUGE | MapFlags::USER)
            .unwrap();

        map.protect_range(
            0x20_1000,
            0x1000,
            MapFlags::READ | MapFlags::USER | MapFlags::SPLIT,
            CacheMode::WriteBack,
        )
        .unwrap();
        let inside = map.query(0x20_1000).unwrap();
        assert_eq!(inside.size, PAGE_SIZE);
        assert!(!inside.flags.contains(MapFlags::WRITE));
        assert!(inside.flags.contains(MapFlags::USER));
        assert!(map.query(0x20_2000).unwrap().flags.contains(MapFlags::WRITE));
    }

    #[test]
    fn merge_coalesces_a_split_owned_huge_page() {
        let frames = frames();
        let free = frames.free_count();
        {
            let map = PageMap::new(frames.clone()).unwrap();
            let huge = frames.alloc_huge().unwrap();
            let user = RW | MapFlags::USER;
            map.map_page(0x20_0000, huge, user | MapFlags::HUGE | MapFlags::OWNED)
                .unwrap();
            map.protect_range(
                0x20_5000,
                0x2000,
                MapFlags::READ | MapFlags::USER | MapFlags::SPLIT,
                CacheMode::WriteBack,
            )
            .unwrap();
            assert_eq!(map.query(0x20_0000).unwrap().size, PAGE_SIZE);
            assert_eq!(map.merge_huge(0x20_0000), Ok(false), "window is not uniform");

            map.protect_range(0x20_5000, 0x2000, user | MapFlags::MERGE, CacheMode::WriteBack)
                .unwrap();
            let merged = map.query(0x20_5000).unwrap();
            assert_eq!(merged.size, HUGE_PAGE_SIZE);
            assert_eq!(merged.phys, huge);
            assert!(merged.flags.contains(user | MapFlags::OWNED));
            assert_eq!(map.translate(0x20_6abc), Some(huge + 0x6abc));
        }
        assert_eq!(frames.free_count(), free);
    }

    #[test]
    fn live_translation_changes_are_flushed() {
        let frames = frames();
        let map = PageMap::new(frames.clone()).unwrap();
        let huge = frames.alloc_huge().unwrap();
        let base = 0x7F20_0000;
        let last = base + HUGE_PAGE_SIZE - PAGE_SIZE;
        map.map_page(base, huge, RW | MapFlags::HUGE).unwrap();

        let before = flush_count(last);
        map.protect_range(base, HUGE_PAGE_SIZE, MapFlags::READ, CacheMode::WriteBack)
            .unwrap();
        assert!(flush_count(last) > before, "huge protect");

        let before = flush_count(last);
        map.split_huge(base).unwrap();
        assert!(flush_count(last) > before, "split");

        let before = flush_count(last);
        assert_eq!(map.merge_huge(base), Ok(true));
        assert!(flush_count(last) > before, "merge");
    }

    #[test]
    fn protect_sets_cache_mode() {
        let frames = frames();
        let map = PageMap::new(frames.clone()).unwrap();
        let frame = frames.alloc_frame().unwrap();
        map.map_page(0x1000, frame, RW).unwrap();
        map.protect_range(0x1000, 0x1000, RW, CacheMode::Uncached)
            .unwrap();
        let m = map.query(0x1000).unwrap();
        assert_eq!(m.cache, CacheMode::Uncached);
        assert!(m.flags.contains(MapFlags::NO_CACHE));
        assert_eq!(
            map.protect_range(0x1000, 0x2000, RW, CacheMode::WriteBack),
            Err(MapError::NotMapped)
        );
    }

    #[test]
    fn drop_returns_every_frame() {
        let frames = frames();
        let free = frames.free_count();
        {
            let map = PageMap::new(frames.clone()).unwrap();
            for i in 0..4 {
                let frame = frames.alloc_frame().unwrap();
                map.map_page(0x1_0000_0000 + i * PAGE_SIZE, frame, RW | MapFlags::OWNED)
                    .unwrap();
            }
            let huge = frames.alloc_huge().unwrap();
            map.map_page(0x4000_0000, huge, RW | MapFlags::HUGE | MapFlags::OWNED)
                .unwrap();
        }
        assert_eq!(frames.free_count(), free);
    }

    #[test]
    fn kernel_half_is_shared_not_freed() {
        let frames = frames();
        let kernel = PageMap::new(frames.clone()).unwrap();
        let frame = frames.alloc_frame().unwrap();
        kernel
            .map_page(0xFFFF_8000_0000_0000, frame, RW)
            .unwrap();
        let free = frames.free_count();
        {
            let mut user = PageMap::new(frames.clone()).unwrap();
            user.share_kernel_half(&kernel).unwrap();
            assert_eq!(user.translate(0xFFFF_8000_0000_0000), Some(frame));
        }
        assert_eq!(frames.free_count(), free);
        assert_eq!(kernel.translate(0xFFFF_8000_0000_0000), Some(frame));
    }
}
