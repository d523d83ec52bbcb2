//! Physical memory window and frame allocator.
//!
//! [`PhysMemory`] gives the kernel byte access to a contiguous range of
//! physical addresses. On bare metal that is the bootloader's offset mapping
//! of all physical memory; on a hosted build it is a heap buffer standing in
//! for RAM, placed at a 2 MiB aligned base so huge pages behave as on real
//! hardware.
//!
//! [`FramePool`] hands out 4 KiB frames from that window with a bitmap and
//! serves as the table allocator of the `x86_64` crate's mappers.

use alloc::vec;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;

use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, PageTable, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use super::MapError;
use crate::config::{HUGE_PAGE_SIZE, PAGES_PER_HUGE, PAGE_SIZE};

/// Byte-addressable view of a physical address range.
pub struct PhysMemory {
    base: u64,
    size: u64,
    window: NonNull<u8>,
    owned: bool,
}

// SAFETY: the window is plain memory; callers synchronise on frame ownership.
unsafe impl Send for PhysMemory {}
// SAFETY: see above.
unsafe impl Sync for PhysMemory {}

impl PhysMemory {
    /// Allocate a zeroed, page-aligned heap buffer standing in for `size`
    /// bytes of RAM at physical address `base`.
    #[cfg(not(target_os = "none"))]
    pub fn hosted(base: u64, size: u64) -> Self {
        let layout = Self::hosted_layout(size);
        // SAFETY: the layout has a non-zero size.
        let window = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })
            .unwrap_or_else(|| alloc::alloc::handle_alloc_error(layout));
        Self {
            base,
            size: size.min(layout.size() as u64),
            window,
            owned: true,
        }
    }

    fn hosted_layout(size: u64) -> Layout {
        Layout::from_size_align((size as usize).max(PAGE_SIZE as usize), PAGE_SIZE as usize)
            .unwrap_or_else(|_| Layout::new::<PageTable>())
    }

    /// Use the bootloader mapping of physical memory at `offset`.
    ///
    /// # Safety
    ///
    /// `[base, base + size)` must be usable RAM mapped at `offset + phys`
    /// and not used by anything else.
    #[cfg(target_os = "none")]
    pub unsafe fn from_offset(base: u64, size: u64, offset: u64) -> Self {
        Self {
            base,
            size,
            window: NonNull::new((offset + base) as *mut u8).unwrap_or(NonNull::dangling()),
            owned: false,
        }
    }

    /// First physical address covered.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Bytes covered.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Virtual address at which physical address zero would appear, as
    /// expected by [`x86_64::structures::paging::OffsetPageTable`].
    pub fn offset(&self) -> VirtAddr {
        VirtAddr::new_truncate((self.window.as_ptr() as u64).wrapping_sub(self.base))
    }

    /// Page table stored in the frame at `phys`.
    pub fn table(&self, phys: u64) -> Result<*mut PageTable, MapError> {
        if phys % PAGE_SIZE != 0 {
            return Err(MapError::Misaligned);
        }
        Ok(self.span(phys, PAGE_SIZE as usize)?.cast::<PageTable>())
    }

    fn span(&self, phys: u64, len: usize) -> Result<*mut u8, MapError> {
        let offset = phys.checked_sub(self.base).ok_or(MapError::BadAddress)?;
        let end = offset
            .checked_add(len as u64)
            .ok_or(MapError::BadAddress)?;
        if end > self.size {
            return Err(MapError::BadAddress);
        }
        // SAFETY: offset + len lies within the window.
        Ok(unsafe { self.window.as_ptr().add(offset as usize) })
    }

    /// Copy bytes out of physical memory.
    pub fn read(&self, phys: u64, buf: &mut [u8]) -> Result<(), MapError> {
        let src = self.span(phys, buf.len())?;
        // SAFETY: `span` bounds-checked the source range.
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy bytes into physical memory.
    pub fn write(&self, phys: u64, data: &[u8]) -> Result<(), MapError> {
        let dst = self.span(phys, data.len())?;
        // SAFETY: `span` bounds-checked the destination range.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Fill `len` bytes with `byte`.
    pub fn fill(&self, phys: u64, len: usize, byte: u8) -> Result<(), MapError> {
        let dst = self.span(phys, len)?;
        // SAFETY: `span` bounds-checked the destination range.
        unsafe { core::ptr::write_bytes(dst, byte, len) };
        Ok(())
    }
}

impl Drop for PhysMemory {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: allocated in `hosted` with this layout.
            unsafe { alloc::alloc::dealloc(self.window.as_ptr(), Self::hosted_layout(self.size)) };
        }
    }
}

struct Bitmap {
    words: Vec<u64>,
    frames: usize,
    free: usize,
    hint: usize,
}

impl Bitmap {
    fn is_used(&self, frame: usize) -> bool {
        self.words[frame / 64] & (1 << (frame % 64)) != 0
    }

    fn set(&mut self, frame: usize, used: bool) {
        let mask = 1u64 << (frame % 64);
        if used {
            self.words[frame / 64] |= mask;
        } else {
            self.words[frame / 64] &= !mask;
        }
    }
}

/// Bitmap allocator over a [`PhysMemory`] window.
pub struct FramePool {
    memory: PhysMemory,
    bitmap: Mutex<Bitmap>,
}

impl FramePool {
    /// Manage every whole frame in `memory`.
    pub fn new(memory: PhysMemory) -> Self {
        let frames = (memory.size() / PAGE_SIZE) as usize;
        Self {
            memory,
            bitmap: Mutex::new(Bitmap {
                words: vec![0; frames.div_ceil(64)],
                frames,
                free: frames,
                hint: 0,
            }),
        }
    }

    /// Backing memory.
    pub fn memory(&self) -> &PhysMemory {
        &self.memory
    }

    fn frame_addr(&self, frame: usize) -> u64 {
        self.memory.base() + frame as u64 * PAGE_SIZE
    }

    fn frame_index(&self, phys: u64) -> Option<usize> {
        let offset = phys.checked_sub(self.memory.base())?;
        let index = (offset / PAGE_SIZE) as usize;
        (offset % PAGE_SIZE == 0 && offset < self.memory.size()).then_some(index)
    }

    /// Allocate one zeroed frame.
    pub fn alloc_frame(&self) -> Option<u64> {
        let frame = {
            let mut bitmap = self.bitmap.lock();
            let frames = bitmap.frames;
            let start = bitmap.hint;
            let frame = (start..frames)
                .chain(0..start)
                .find(|&f| !bitmap.is_used(f))?;
            bitmap.set(frame, true);
            bitmap.free -= 1;
            bitmap.hint = (frame + 1) % frames.max(1);
            frame
        };
        let phys = self.frame_addr(frame);
        self.memory.fill(phys, PAGE_SIZE as usize, 0).ok()?;
        Some(phys)
    }

    /// Allocate 512 contiguous zeroed frames aligned to a huge page.
    pub fn alloc_huge(&self) -> Option<u64> {
        let first = {
            let mut bitmap = self.bitmap.lock();
            let per = PAGES_PER_HUGE as usize;
            let base = self.memory.base();
            let skew = (base.next_multiple_of(HUGE_PAGE_SIZE) - base) / PAGE_SIZE;
            let mut first = skew as usize;
            let found = loop {
                if first + per > bitmap.frames {
                    break None;
                }
                if (first..first + per).all(|f| !bitmap.is_used(f)) {
                    break Some(first);
                }
                first += per;
            }?;
            for frame in found..found + per {
                bitmap.set(frame, true);
            }
            bitmap.free -= per;
            found
        };
        let phys = self.frame_addr(first);
        self.memory.fill(phys, HUGE_PAGE_SIZE as usize, 0).ok()?;
        Some(phys)
    }

    /// Return one frame.
    pub fn free_frame(&self, phys: u64) {
        self.free_frames(phys, 1);
    }

    /// Return the 512 frames of a huge page.
    pub fn free_huge(&self, phys: u64) {
        self.free_frames(phys, PAGES_PER_HUGE as usize);
    }

    fn free_frames(&self, phys: u64, count: usize) {
        let Some(first) = self.frame_index(phys) else {
            log::warn!(target: "mm", "free of foreign frame {:#x}", phys);
            return;
        };
        let mut bitmap = self.bitmap.lock();
        for frame in first..(first + count).min(bitmap.frames) {
            if bitmap.is_used(frame) {
                bitmap.set(frame, false);
                bitmap.free += 1;
            } else {
                log::warn!(target: "mm", "double free of frame {:#x}", self.frame_addr(frame));
            }
        }
    }

    /// Number of free frames.
    pub fn free_count(&self) -> usize {
        self.bitmap.lock().free
    }

    /// Total number of frames.
    pub fn frame_count(&self) -> usize {
        self.bitmap.lock().frames
    }

    /// See [`PhysMemory::read`].
    pub fn read(&self, phys: u64, buf: &mut [u8]) -> Result<(), MapError> {
        self.memory.read(phys, buf)
    }

    /// See [`PhysMemory::write`].
    pub fn write(&self, phys: u64, data: &[u8]) -> Result<(), MapError> {
        self.memory.write(phys, data)
    }

    /// See [`PhysMemory::fill`].
    pub fn fill(&self, phys: u64, len: usize, byte: u8) -> Result<(), MapError> {
        self.memory.fill(phys, len, byte)
    }
}

// SAFETY: every frame handed out is unused, zeroed and inside the window.
unsafe impl FrameAllocator<Size4KiB> for &FramePool {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let phys = self.alloc_frame()?;
        let frame = PhysAddr::try_new(phys)
            .ok()
            .and_then(|addr| PhysFrame::from_start_address(addr).ok());
        if frame.is_none() {
            self.free_frame(phys);
        }
        frame
    }
}
