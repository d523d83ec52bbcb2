//! System call numbers.
//!
//! The core table is numbered from zero. The POSIX-compatibility subsystem
//! numbers its calls from [`POSIX_SYSCALL_BASE`] and is dispatched through
//! its own sub-table.

/// First number of the POSIX-compatibility sub-table.
pub const POSIX_SYSCALL_BASE: u64 = 0x1000;

/// Core syscall numbers (stable ABI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u64)]
pub enum Syscall {
    /// `CREATE_PROCESS(path_ptr, path_len) -> pid`
    CreateProcess = 0,
    /// `KILL_PROCESS(pid)`
    KillProcess = 1,
    /// `WAIT_PROCESS(pid) -> exit code`
    WaitProcess = 2,
    /// `CREATE_THREAD(entry, stack_top, arg) -> tid`
    CreateThread = 3,
    /// `KILL_THREAD(tid)`
    KillThread = 4,
    /// `WAIT_THREAD(tid) -> exit code`
    WaitThread = 5,
    /// `EXIT(code)`
    Exit = 6,
    /// `SLEEP(milliseconds)`
    Sleep = 7,
    /// `WAIT_FOR_EVENT(event_ptr)`
    WaitForEvent = 8,
    /// `POLL_EVENT(event_ptr) -> 1 if an event was copied, else 0`
    PollEvent = 9,
    /// `DPRINT(ptr, len)`
    Dprint = 10,
    /// `SHUTDOWN()`
    Shutdown = 11,
    /// `REQUEST_CAP(mask) -> granted mask`
    RequestCap = 12,
    /// `MMAP(hint, size, prot) -> addr`
    Mmap = 13,
    /// `MUNMAP(addr, size)`
    Munmap = 14,
    /// `CLOSE(handle)`
    Close = 15,
    /// `DEVMSG(...)`, driver message passing.
    Devmsg = 16,
    /// `DEVENUM(...)`, driver enumeration.
    Devenum = 17,
    /// `OPEN(path_ptr, path_len) -> handle`
    Open = 18,
    /// `READ(handle, buf_ptr, len) -> bytes read`
    Read = 19,
    /// `STAT(path_ptr, path_len, stat_ptr)`
    Stat = 20,
    /// `OPENDIR(path_ptr, path_len) -> handle`
    Opendir = 21,
    /// `READDIR(handle, buf_ptr, len) -> name length, 0 at end`
    Readdir = 22,
    /// `CLOSEDIR(handle)`
    Closedir = 23,
}

impl Syscall {
    /// Number of entries in the core table.
    pub const COUNT: usize = 24;

    /// Decode a raw syscall number from the core table.
    pub fn from_raw(raw: u64) -> Option<Self> {
        use Syscall::*;
        const TABLE: [Syscall; Syscall::COUNT] = [
            CreateProcess,
            KillProcess,
            WaitProcess,
            CreateThread,
            KillThread,
            WaitThread,
            Exit,
            Sleep,
            WaitForEvent,
            PollEvent,
            Dprint,
            Shutdown,
            RequestCap,
            Mmap,
            Munmap,
            Close,
            Devmsg,
            Devenum,
            Open,
            Read,
            Stat,
            Opendir,
            Readdir,
            Closedir,
        ];
        TABLE.get(usize::try_from(raw).ok()?).copied()
    }

    /// Raw number.
    pub fn number(self) -> u64 {
        self as u64
    }
}

/// POSIX-compatibility syscall numbers, relative to [`POSIX_SYSCALL_BASE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u64)]
pub enum PosixSyscall {
    /// `mmap(addr, len, prot, flags, fd, off)`
    Mmap = 0,
    /// `munmap(addr, len)`
    Munmap = 1,
    /// `mprotect(addr, len, prot)`
    Mprotect = 2,
    /// `sigprocmask(how, set, oldset_ptr)`
    Sigprocmask = 3,
    /// `sigaction(sig, handler, flags)`
    Sigaction = 4,
    /// `sigreturn()`
    Sigrestore = 5,
    /// `tgkill(pid, tid, sig)`
    Tgkill = 6,
    /// `kill(pid, sig)`
    Kill = 7,
}

impl PosixSyscall {
    /// Number of entries in the POSIX sub-table.
    pub const COUNT: usize = 8;

    /// Decode an absolute syscall number into a POSIX call.
    pub fn from_raw(raw: u64) -> Option<Self> {
        use PosixSyscall::*;
        const TABLE: [PosixSyscall; PosixSyscall::COUNT] = [
            Mmap,
            Munmap,
            Mprotect,
            Sigprocmask,
            Sigaction,
            Sigrestore,
            Tgkill,
            Kill,
        ];
        let index = raw.checked_sub(POSIX_SYSCALL_BASE)?;
        TABLE.get(usize::try_from(index).ok()?).copied()
    }

    /// Absolute syscall number.
    pub fn number(self) -> u64 {
        POSIX_SYSCALL_BASE + self as u64
    }
}
