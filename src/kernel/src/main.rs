//! Kestrel kernel entry point.
//!
//! On bare metal this is the bootloader entry: it brings up the descriptor
//! tables, interrupt controller, timer and heap, builds the [`Kernel`] and
//! runs a few kernel threads that exercise the syscall path. On a hosted
//! target it runs the same boot against recording hardware and prints the
//! log to stdout.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

extern crate alloc;

#[cfg(target_os = "none")]
mod bare {
    use alloc::sync::Arc;
    use core::panic::PanicInfo;

    use bootloader::bootinfo::{BootInfo, MemoryRegionType};
    use bootloader::entry_point;
    use kestrel_common::syscall::Syscall;
    use kestrel_kernel::arch::x86_64::{self as arch, gdt, idt, pic, serial, timer};
    use kestrel_kernel::boot::{self, Status};
    use kestrel_kernel::config::{align_down, align_up, KernelConfig, HUGE_PAGE_SIZE, PAGE_SIZE};
    use kestrel_kernel::mm::PhysMemory;
    use kestrel_kernel::{allocator, fatal, serial_println, Kernel, Platform};
    use log::LevelFilter;
    use spin::Once;

    entry_point!(kernel_main);

    static KERNEL: Once<Kernel> = Once::new();
    static WORKERS: Once<[u64; 2]> = Once::new();

    /// Issue a system call through the trap gate.
    fn syscall(number: Syscall, a0: u64, a1: u64) -> u64 {
        let ret;
        // SAFETY: `int 0x80` enters the kernel's own dispatcher, which
        // restores every register except `rax`.
        unsafe {
            core::arch::asm!(
                "int 0x80",
                inlateout("rax") number as u64 => ret,
                in("rdi") a0,
                in("rsi") a1,
            );
        }
        ret
    }

    extern "C" fn worker(rounds: u64) -> ! {
        for round in 1..=rounds {
            log::info!(target: "demo", "worker tick {}/{}", round, rounds);
            syscall(Syscall::Sleep, 30 * rounds, 0);
        }
        syscall(Syscall::Exit, rounds, 0);
        fatal(format_args!("worker returned from EXIT"));
    }

    extern "C" fn reaper(_arg: u64) -> ! {
        let workers = WORKERS.get().copied().unwrap_or_default();
        for id in workers {
            let code = syscall(Syscall::WaitThread, id, 0) as i64;
            log::info!(target: "demo", "task {} finished with {}", id, code);
        }
        boot::log(Status::Ok, "demo complete, powering off");
        syscall(Syscall::Shutdown, 0, 0);
        arch::halt_loop();
    }

    /// Largest usable region as `(start, end)` physical addresses.
    fn largest_usable(boot_info: &BootInfo) -> Option<(u64, u64)> {
        boot_info
            .memory_map
            .iter()
            .filter(|r| r.region_type == MemoryRegionType::Usable)
            .map(|r| (r.range.start_addr(), r.range.end_addr()))
            .max_by_key(|(start, end)| end - start)
    }

    fn kernel_main(boot_info: &'static BootInfo) -> ! {
        serial::init_logger(LevelFilter::Info);
        boot::log(Status::Ok, "Serial port initialized");

        gdt::init();
        idt::init();
        pic::init();
        boot::log(Status::Ok, "GDT, IDT and PIC configured");

        let config = KernelConfig::default();
        timer::init(config.tick_ms);

        let offset = boot_info.physical_memory_offset;
        let Some((start, end)) = largest_usable(boot_info) else {
            fatal(format_args!("no usable memory in the boot map"));
        };
        let heap_start = align_up(start, PAGE_SIZE).unwrap_or(start);
        let heap_end = heap_start + allocator::HEAP_SIZE as u64;
        let phys_base = align_up(heap_end, HUGE_PAGE_SIZE).unwrap_or(end);
        let phys_end = align_down(end, PAGE_SIZE);
        if phys_base >= phys_end {
            fatal(format_args!(
                "usable region {:#x}..{:#x} too small for heap and frames",
                start, end
            ));
        }
        // SAFETY: the heap range is usable RAM reached through the
        // bootloader's physical-memory mapping and nothing else owns it.
        unsafe { allocator::init_heap(offset + heap_start, allocator::HEAP_SIZE) };
        boot::log(Status::Ok, "Kernel heap ready");

        let config = KernelConfig {
            phys_base,
            phys_size: phys_end - phys_base,
            ..config
        };
        // SAFETY: the frame window follows the heap inside the same usable
        // region and is handed to the frame pool alone.
        let memory = unsafe { PhysMemory::from_offset(phys_base, config.phys_size, offset) };
        let platform = Platform {
            cpu: Arc::new(arch::X86Cpu),
            timer: Arc::new(arch::PitClock),
            memory,
        };
        let kernel = match boot::check("Kernel context ready", Kernel::new(config, platform)) {
            Ok(kernel) => KERNEL.call_once(|| kernel),
            Err(err) => fatal(format_args!("kernel init failed: {}", err)),
        };
        idt::attach(kernel);
        boot::log_detail(&alloc::format!(
            "{} frames at {:#x}, heap {} KiB free",
            kernel.frames().frame_count(),
            phys_base,
            allocator::free_bytes() / 1024
        ));

        kernel.fs().add_file("/etc/motd", b"welcome to kestrel\n");
        let core = kernel.pick_core();
        let first = kernel.spawn_kernel_task(core, "worker/a", worker as usize as u64, 2);
        let second = kernel.spawn_kernel_task(core, "worker/b", worker as usize as u64, 3);
        WORKERS.call_once(|| [first.as_u64(), second.as_u64()]);
        kernel.spawn_kernel_task(core, "reaper", reaper as usize as u64, 0);
        boot::log(Status::Ok, "Boot complete");

        x86_64::instructions::interrupts::enable();
        loop {
            kernel.reschedule(0);
            if kernel.is_halted() {
                boot::log(Status::Info, "halted");
                arch::halt_loop();
            }
            arch::hlt();
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        serial_println!("KERNEL PANIC: {}", info);
        arch::halt_loop()
    }
}

#[cfg(not(target_os = "none"))]
mod hosted {
    use std::io::Write;
    use std::sync::Arc;

    use kestrel_common::syscall::Syscall;
    use kestrel_common::KernelError;
    use kestrel_hal::Registers;
    use kestrel_kernel::arch::host::{HostCpu, ManualClock};
    use kestrel_kernel::boot::{self, Status};
    use kestrel_kernel::config::{KernelConfig, SYSCALL_INSN_LEN, SYSCALL_VECTOR, TIMER_VECTOR};
    use kestrel_kernel::interrupts::Trap;
    use kestrel_kernel::mm::PhysMemory;
    use kestrel_kernel::{testutil, Kernel, Platform};
    use log::{Level, LevelFilter, Metadata, Record};

    struct StdoutLogger;

    static LOGGER: StdoutLogger = StdoutLogger;

    impl log::Log for StdoutLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::max_level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let tag = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN ",
                Level::Info => "INFO ",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "[{} {}] {}", tag, record.target(), record.args());
        }

        fn flush(&self) {
            let _ = std::io::stdout().flush();
        }
    }

    fn user_call(kernel: &Kernel, regs: &mut Registers, number: Syscall, args: [u64; 2]) -> i64 {
        regs.rax = number as u64;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rip = testutil::MINIMAL_ELF_BASE + SYSCALL_INSN_LEN;
        kernel.handle_trap(0, Trap::vector(SYSCALL_VECTOR), regs);
        regs.rax as i64
    }

    pub fn run() -> Result<(), KernelError> {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }

        let cpu = Arc::new(HostCpu::new());
        let clock = Arc::new(ManualClock::new());
        let config = KernelConfig::default();
        let platform = Platform {
            cpu: cpu.clone(),
            timer: clock.clone(),
            memory: PhysMemory::hosted(config.phys_base, config.phys_size),
        };
        let kernel = boot::check("Kernel context ready", Kernel::new(config, platform))?;

        kernel.fs().add_file("/bin/init", &testutil::minimal_elf());
        kernel.fs().add_file("/etc/motd", b"welcome to kestrel\n");
        let pid = boot::check("Started /bin/init", kernel.spawn_path("/bin/init", None))?;
        let init = kernel.process(pid).ok_or(KernelError::NotExists)?;

        // Let the timer hand the core to init.
        while kernel.current_task(0) == kernel.core(0).idle() {
            clock.advance(1);
            let mut scratch = Registers::default();
            kernel.handle_trap(0, Trap::vector(TIMER_VECTOR), &mut scratch);
        }
        boot::log_detail(&format!(
            "init running as task {} after {} tick(s)",
            kernel.current_task(0).as_u64(),
            kernel.now()
        ));

        let greeting = b"hello from init\n";
        let text = testutil::put_user(&init, greeting);
        let mut regs = Registers {
            cs: 0x23,
            ..Registers::default()
        };
        let written = user_call(&kernel, &mut regs, Syscall::Dprint, [text, greeting.len() as u64]);
        boot::log_detail(&format!("DPRINT returned {}", written));

        user_call(&kernel, &mut regs, Syscall::Exit, [0, 0]);
        boot::log(
            Status::Ok,
            &format!("init exited with {:?}", init.exit_code()),
        );

        // Back on the idle thread: power off as a kernel thread.
        let mut regs = Registers {
            cs: 0x08,
            ..Registers::default()
        };
        regs.rax = Syscall::Shutdown as u64;
        kernel.handle_trap(0, Trap::vector(SYSCALL_VECTOR), &mut regs);
        boot::log(
            if cpu.powered_off() { Status::Ok } else { Status::Fail },
            &format!("power off after {} context switch(es)", cpu.switch_count()),
        );
        Ok(())
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    if let Err(err) = hosted::run() {
        use kestrel_kernel::boot::{log, Status};
        log(Status::Fail, &format!("boot failed: {}", err));
        std::process::exit(1);
    }
}
