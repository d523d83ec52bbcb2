//! Interrupt Descriptor Table and the common trap path.
//!
//! Every vector enters through a small stub that pushes an error code (or
//! 0) and the vector number, then jumps to one shared routine that saves
//! the general-purpose registers and calls [`kestrel_trap_dispatch`].

use core::arch::global_asm;

use lazy_static::lazy_static;
use spin::Once;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use kestrel_hal::Registers;

use super::{gdt, pic, timer};
use crate::config::{SYSCALL_VECTOR, TIMER_VECTOR};
use crate::interrupts::Trap;
use crate::Kernel;

/// Saved state as laid out by the trap stubs.
#[repr(C)]
#[derive(Debug)]
struct TrapFrame {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rbp: u64,
    rdi: u64,
    rsi: u64,
    rdx: u64,
    rcx: u64,
    rbx: u64,
    rax: u64,
    vector: u64,
    error_code: u64,
    rip: u64,
    cs: u64,
    rflags: u64,
    rsp: u64,
    ss: u64,
}

impl TrapFrame {
    fn registers(&self) -> Registers {
        Registers {
            r15: self.r15,
            r14: self.r14,
            r13: self.r13,
            r12: self.r12,
            r11: self.r11,
            r10: self.r10,
            r9: self.r9,
            r8: self.r8,
            rbp: self.rbp,
            rdi: self.rdi,
            rsi: self.rsi,
            rdx: self.rdx,
            rcx: self.rcx,
            rbx: self.rbx,
            rax: self.rax,
            rip: self.rip,
            cs: self.cs,
            rflags: self.rflags,
            rsp: self.rsp,
            ss: self.ss,
        }
    }

    fn store(&mut self, regs: &Registers) {
        self.r15 = regs.r15;
        self.r14 = regs.r14;
        self.r13 = regs.r13;
        self.r12 = regs.r12;
        self.r11 = regs.r11;
        self.r10 = regs.r10;
        self.r9 = regs.r9;
        self.r8 = regs.r8;
        self.rbp = regs.rbp;
        self.rdi = regs.rdi;
        self.rsi = regs.rsi;
        self.rdx = regs.rdx;
        self.rcx = regs.rcx;
        self.rbx = regs.rbx;
        self.rax = regs.rax;
        self.rip = regs.rip;
        self.rflags = regs.rflags;
        self.rsp = regs.rsp;
    }
}

// Vectors for which the CPU pushes an error code.
const ERROR_CODE_VECTORS: [u8; 10] = [8, 10, 11, 12, 13, 14, 17, 21, 29, 30];

global_asm!(
    r#"
    .att_syntax
    .section .text
    .p2align 4
    .global kestrel_trap_stubs
kestrel_trap_stubs:
    .set kestrel_vec, 0
    .rept 256
    .p2align 4
    pushq $0
    pushq $kestrel_vec
    jmp kestrel_trap_common
    .set kestrel_vec, kestrel_vec + 1
    .endr

    .p2align 4
    .global kestrel_trap_stubs_err
kestrel_trap_stubs_err:
    .irp vec, 8, 10, 11, 12, 13, 14, 17, 21, 29, 30
    .p2align 4
    pushq $\vec
    jmp kestrel_trap_common
    .endr

kestrel_trap_common:
    pushq %rax
    pushq %rbx
    pushq %rcx
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %rbp
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15
    movq %rsp, %rdi
    cld
    call kestrel_trap_dispatch
    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rbp
    popq %rdi
    popq %rsi
    popq %rdx
    popq %rcx
    popq %rbx
    popq %rax
    addq $16, %rsp
    iretq
    "#
);

extern "C" {
    static kestrel_trap_stubs: u8;
    static kestrel_trap_stubs_err: u8;
}

const STUB_SIZE: u64 = 16;

fn stub_address(vector: u8) -> VirtAddr {
    // SAFETY: only the symbol addresses are taken.
    let (base, index) = match ERROR_CODE_VECTORS.iter().position(|&v| v == vector) {
        Some(i) => (unsafe { core::ptr::addr_of!(kestrel_trap_stubs_err) }, i as u64),
        None => (unsafe { core::ptr::addr_of!(kestrel_trap_stubs) }, u64::from(vector)),
    };
    VirtAddr::from_ptr(base) + index * STUB_SIZE
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        for vector in 0..=255u8 {
            if (vector as usize) < 32 && matches!(vector, 9 | 15 | 22..=27 | 31) {
                continue; // reserved
            }
            // SAFETY: every stub address points into the trap code above and
            // ends in the shared routine, which restores state and `iretq`s.
            let entry = unsafe {
                match vector {
                    8 => idt.double_fault.set_handler_addr(stub_address(8)),
                    v if v < 32 => idt[v as usize].set_handler_addr(stub_address(v)),
                    v => idt[v as usize].set_handler_addr(stub_address(v)),
                }
            };
            if vector == 8 {
                // SAFETY: the IST slot is set up by `gdt::init`.
                unsafe { entry.set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX) };
            }
            if vector == SYSCALL_VECTOR || vector == 3 {
                entry.set_privilege_level(PrivilegeLevel::Ring3);
            }
        }
        idt
    };
}

/// Load the IDT.
pub fn init() {
    IDT.load();
}

static KERNEL: Once<&'static Kernel> = Once::new();

/// Route traps into `kernel` from now on.
pub fn attach(kernel: &'static Kernel) {
    KERNEL.call_once(|| kernel);
}

#[no_mangle]
extern "C" fn kestrel_trap_dispatch(frame: &mut TrapFrame) {
    let vector = frame.vector as u8;
    if vector == TIMER_VECTOR {
        timer::tick();
    }
    let trap = Trap {
        vector,
        error_code: frame.error_code,
        fault_address: if vector == 14 { Cr2::read().as_u64() } else { 0 },
    };
    let Some(kernel) = KERNEL.get().copied() else {
        early_trap(trap, frame);
        return;
    };
    let mut regs = frame.registers();
    let from_kernel = !regs.from_user();
    kernel.handle_trap(0, trap, &mut regs);

    // A contained kernel fault cannot resume the faulting instruction.
    let contained_fault = from_kernel
        && vector < 32
        && vector != 3
        && kernel.interrupts().handler(vector).is_none();
    if contained_fault {
        kernel.abort_syscall(0);
    }
    frame.store(&regs);
}

fn early_trap(trap: Trap, frame: &TrapFrame) {
    if trap.vector >= 32 {
        pic::end_of_interrupt(trap.vector);
        return;
    }
    crate::fatal(format_args!(
        "trap {} before kernel init at {:#x} (error {:#x}, address {:#x})",
        trap.vector, frame.rip, trap.error_code, trap.fault_address
    ));
}
