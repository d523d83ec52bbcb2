//! Global Descriptor Table and Task State Segment.
//!
//! Selector layout is fixed because the context-entry code builds `iretq`
//! frames from it: kernel code 0x08, kernel data 0x10, user data 0x1B,
//! user code 0x23, TSS 0x28.

use core::ptr::{addr_of, addr_of_mut};

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// IST slot used by the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Ring 3 code selector.
pub const USER_CODE: u64 = 0x23;
/// Ring 3 data selector.
pub const USER_DATA: u64 = 0x1B;

const DOUBLE_FAULT_STACK_SIZE: usize = 5 * 4096;

#[repr(align(16))]
struct Stack([u8; DOUBLE_FAULT_STACK_SIZE]);

static mut DOUBLE_FAULT_STACK: Stack = Stack([0; DOUBLE_FAULT_STACK_SIZE]);

// Written through `set_kernel_stack` on every switch; the GDT keeps a
// shared reference for the TSS descriptor.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        gdt.add_entry(Descriptor::user_data_segment());
        gdt.add_entry(Descriptor::user_code_segment());
        // SAFETY: TSS is only mutated through `set_kernel_stack`, with
        // interrupts masked, on the single core that loaded it.
        let tss = gdt.add_entry(Descriptor::tss_segment(unsafe { &*addr_of!(TSS) }));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss,
            },
        )
    };
}

/// Load the GDT and TSS and reload the segment registers.
pub fn init() {
    // SAFETY: runs once during boot, before the GDT (and therefore the
    // shared TSS reference) exists.
    unsafe {
        let stack_start = VirtAddr::from_ptr(addr_of!(DOUBLE_FAULT_STACK));
        (*addr_of_mut!(TSS)).interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            stack_start + DOUBLE_FAULT_STACK_SIZE as u64;
    }
    GDT.0.load();
    // SAFETY: the selectors come from the table just loaded.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        SS::set_reg(GDT.1.kernel_data);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
    log::debug!(target: "boot", "gdt loaded, tss at selector {:#x}", GDT.1.tss.0);
}

/// Point ring-0 entry from user mode at `top`.
pub fn set_kernel_stack(top: u64) {
    if top == 0 {
        return;
    }
    // SAFETY: see `TSS`; callers hold interrupts masked.
    unsafe {
        (*addr_of_mut!(TSS)).privilege_stack_table[0] = VirtAddr::new(top);
    }
}
