//! The kernel's syscall handlers, grouped by subsystem.

mod event;
mod io;
mod memory;
mod misc;
mod posix;
mod process;

use kestrel_common::syscall::{PosixSyscall, Syscall, POSIX_SYSCALL_BASE};

use super::{SyscallFn, SyscallTable};

/// Core table bindings. `DEVMSG` and `DEVENUM` stay unbound.
const CORE: &[(Syscall, SyscallFn)] = &[
    (Syscall::CreateProcess, process::create_process),
    (Syscall::KillProcess, process::kill_process),
    (Syscall::WaitProcess, process::wait_process),
    (Syscall::CreateThread, process::create_thread),
    (Syscall::KillThread, process::kill_thread),
    (Syscall::WaitThread, process::wait_thread),
    (Syscall::Exit, process::exit),
    (Syscall::Sleep, event::sleep),
    (Syscall::WaitForEvent, event::wait_for_event),
    (Syscall::PollEvent, event::poll_event),
    (Syscall::Dprint, misc::dprint),
    (Syscall::Shutdown, misc::shutdown),
    (Syscall::RequestCap, misc::request_cap),
    (Syscall::Mmap, memory::mmap),
    (Syscall::Munmap, memory::munmap),
    (Syscall::Close, io::close),
    (Syscall::Open, io::open),
    (Syscall::Read, io::read),
    (Syscall::Stat, io::stat),
    (Syscall::Opendir, io::opendir),
    (Syscall::Readdir, io::readdir),
    (Syscall::Closedir, io::closedir),
];

/// POSIX sub-table bindings. `SIGRESTORE` stays unbound.
const POSIX: &[(PosixSyscall, SyscallFn)] = &[
    (PosixSyscall::Mmap, posix::mmap),
    (PosixSyscall::Munmap, posix::munmap),
    (PosixSyscall::Mprotect, posix::mprotect),
    (PosixSyscall::Sigprocmask, posix::sigprocmask),
    (PosixSyscall::Sigaction, posix::sigaction),
    (PosixSyscall::Tgkill, posix::tgkill),
    (PosixSyscall::Kill, posix::kill),
];

/// Bind every handler into `table`.
pub fn bind_all(table: &mut SyscallTable) {
    for &(nr, handler) in CORE {
        table.bind(nr.number(), handler);
    }
    for &(nr, handler) in POSIX {
        table.bind(POSIX_SYSCALL_BASE + nr as u64, handler);
    }
}
