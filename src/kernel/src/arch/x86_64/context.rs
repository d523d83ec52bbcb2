//! Context switching and the bare-metal [`Cpu`].
//!
//! A switch saves only the callee-saved registers, the stack pointer, a
//! resume address and the FXSAVE area: every switch happens inside a
//! normal function call, so the caller-saved registers are already dead.
//! The full user register file lives in the trap frame further up the
//! same kernel stack.

use core::arch::global_asm;

use kestrel_hal::{Bootstrap, Cpu, InterruptController, TaskContext};
use x86_64::instructions::{interrupts, port::Port};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use super::{gdt, pic};

// Offsets into `TaskContext`: regs.r15 0, r14 8, r13 16, r12 24, rbp 64,
// rbx 104, rip 120, rflags 136, rsp 144, fp 160, kernel_stack 688.
global_asm!(
    r#"
    .att_syntax
    .section .text

    .global kestrel_context_switch
kestrel_context_switch:
    movq %r15, 0(%rdi)
    movq %r14, 8(%rdi)
    movq %r13, 16(%rdi)
    movq %r12, 24(%rdi)
    movq %rbp, 64(%rdi)
    movq %rbx, 104(%rdi)
    leaq kestrel_context_resume(%rip), %rax
    movq %rax, 120(%rdi)
    pushfq
    popq %rax
    movq %rax, 136(%rdi)
    movq %rsp, 144(%rdi)
    fxsave64 160(%rdi)

    fxrstor64 160(%rsi)
    movq 0(%rsi), %r15
    movq 8(%rsi), %r14
    movq 16(%rsi), %r13
    movq 24(%rsi), %r12
    movq 64(%rsi), %rbp
    movq 104(%rsi), %rbx
    movq 144(%rsi), %rsp
    pushq 136(%rsi)
    popfq
    jmpq *120(%rsi)

kestrel_context_resume:
    ret

    .global kestrel_context_start
kestrel_context_start:
    movq %r15, 0(%rdi)
    movq %r14, 8(%rdi)
    movq %r13, 16(%rdi)
    movq %r12, 24(%rdi)
    movq %rbp, 64(%rdi)
    movq %rbx, 104(%rdi)
    leaq kestrel_context_resume(%rip), %rax
    movq %rax, 120(%rdi)
    pushfq
    popq %rax
    movq %rax, 136(%rdi)
    movq %rsp, 144(%rdi)
    fxsave64 160(%rdi)

    fxrstor64 160(%rsi)
    xorl %ebp, %ebp
    movq %r8, %rdi
    testq %r9, %r9
    jnz kestrel_context_start_user

    movq %rcx, %rsp
    sti
    pushq $0
    jmpq *%rdx

kestrel_context_start_user:
    movq 688(%rsi), %rsp
    pushq $0x1B
    pushq %rcx
    pushq $0x202
    pushq $0x23
    pushq %rdx
    swapgs
    iretq
    "#
);

extern "C" {
    fn kestrel_context_switch(from: *mut TaskContext, to: *const TaskContext);
    fn kestrel_context_start(
        from: *mut TaskContext,
        to: *const TaskContext,
        entry: u64,
        stack_top: u64,
        arg: u64,
        user: u64,
    );
}

const ACPI_SHUTDOWN_PORT: u16 = 0x604;
const ACPI_SHUTDOWN_VALUE: u16 = 0x2000;

/// The boot processor.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Cpu;

impl InterruptController for X86Cpu {
    fn end_of_interrupt(&self, vector: u8) {
        pic::end_of_interrupt(vector);
    }

    fn mask(&self, vector: u8) {
        pic::set_masked(vector, true);
    }

    fn unmask(&self, vector: u8) {
        pic::set_masked(vector, false);
    }
}

impl Cpu for X86Cpu {
    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn disable_interrupts(&self) {
        interrupts::disable();
    }

    fn enable_interrupts(&self) {
        interrupts::enable();
    }

    fn swap_segments(&self) {
        // SAFETY: only called on trap entry from and exit to user mode, so
        // the GS bases stay paired.
        unsafe { core::arch::asm!("swapgs", options(nostack, preserves_flags)) };
    }

    fn load_page_table(&self, root: u64) {
        let Ok(frame) = PhysFrame::from_start_address(PhysAddr::new(root)) else {
            log::error!(target: "sched", "unaligned page-table root {:#x}", root);
            return;
        };
        if Cr3::read().0 == frame {
            return;
        }
        // SAFETY: roots come from `PageMap`, which copies the kernel half.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    unsafe fn switch(&self, from: *mut TaskContext, to: *const TaskContext) {
        // SAFETY: the caller guarantees `to` is live.
        gdt::set_kernel_stack(unsafe { (*to).kernel_stack });
        // SAFETY: forwarded from the caller.
        unsafe { kestrel_context_switch(from, to) };
    }

    unsafe fn switch_from_init(
        &self,
        from: *mut TaskContext,
        to: *mut TaskContext,
        bootstrap: &Bootstrap,
    ) {
        // SAFETY: the caller guarantees `to` is live.
        gdt::set_kernel_stack(unsafe { (*to).kernel_stack });
        // SAFETY: forwarded from the caller; the bootstrap stack belongs to
        // the new task.
        unsafe {
            kestrel_context_start(
                from,
                to,
                bootstrap.entry,
                bootstrap.stack_top,
                bootstrap.arg,
                u64::from(bootstrap.user),
            )
        };
    }

    fn power_off(&self) {
        let mut port = Port::<u16>::new(ACPI_SHUTDOWN_PORT);
        // SAFETY: QEMU's ACPI PM1a control port; harmless elsewhere.
        unsafe { port.write(ACPI_SHUTDOWN_VALUE) };
        log::warn!(target: "boot", "power off did not take effect");
    }
}
