//! Kernel heap allocation.

use linked_list_allocator::LockedHeap;

/// Heap size carved out of the first usable boot region.
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand `[start, start + size)` to the global allocator.
///
/// # Safety
///
/// The range must be mapped writable, unused by anything else, and this
/// must be called exactly once.
pub unsafe fn init_heap(start: u64, size: usize) {
    // SAFETY: forwarded from the caller.
    unsafe { ALLOCATOR.lock().init(start as *mut u8, size) };
    log::debug!(target: "boot", "heap at {:#x}, {} KiB", start, size / 1024);
}

/// Bytes currently free in the heap.
pub fn free_bytes() -> usize {
    ALLOCATOR.lock().free()
}
