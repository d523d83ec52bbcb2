//! Architecture-specific implementations.
//!
//! Bare metal gets the x86_64 layer. Every other build gets recording
//! stand-ins so the kernel core can run as an ordinary process.

use crate::config::PAGE_SIZE;

#[cfg(not(target_os = "none"))]
pub mod host;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

/// Invalidate this core's cached translation of the page containing `virt`.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn flush_page(virt: u64) {
    ::x86_64::instructions::tlb::flush(::x86_64::VirtAddr::new_truncate(virt));
}

/// Invalidate this core's cached translation of the page containing `virt`.
#[cfg(not(target_os = "none"))]
pub fn flush_page(virt: u64) {
    host::record_flush(virt);
}

/// [`flush_page`] over every 4 KiB page of `[start, start + len)`.
pub fn flush_range(start: u64, len: u64) {
    let mut page = start & !(PAGE_SIZE - 1);
    let end = start.saturating_add(len);
    while page < end {
        flush_page(page);
        page += PAGE_SIZE;
    }
}
