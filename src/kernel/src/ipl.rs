//! Interrupt priority levels.
//!
//! Each core carries a single priority register. Raising it to a level stops
//! every interrupt class at or below that level from preempting the running
//! code on that core, which is how core-local kernel state is protected
//! without spinlocks on the hot path.
//!
//! Callers nest [`IplManager::raise`] and [`IplManager::lower`] in strict
//! LIFO order. The manager never lowers on `raise` and never raises on
//! `lower`, so an out-of-order `lower` is a no-op rather than a corruption.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU8, Ordering};

/// Priority levels, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Ipl {
    /// Ordinary task execution; everything may preempt.
    Normal = 0,
    /// Device interrupt handlers.
    Dev = 1,
    /// Timer interrupt handler.
    Timer = 2,
    /// Inter-processor interrupts.
    InterCpu = 3,
    /// Scheduler and handler-table manipulation; nothing preempts.
    Critical = 4,
}

impl Ipl {
    fn from_raw(raw: u8) -> Ipl {
        match raw {
            0 => Ipl::Normal,
            1 => Ipl::Dev,
            2 => Ipl::Timer,
            3 => Ipl::InterCpu,
            _ => Ipl::Critical,
        }
    }
}

/// Per-core interrupt priority register.
#[derive(Debug)]
pub struct IplManager {
    core: usize,
    level: AtomicU8,
}

impl IplManager {
    /// Create the register for `core`, starting at [`Ipl::Normal`].
    pub const fn new(core: usize) -> Self {
        Self {
            core,
            level: AtomicU8::new(Ipl::Normal as u8),
        }
    }

    /// The core this register belongs to.
    pub fn core(&self) -> usize {
        self.core
    }

    /// Current level.
    pub fn current(&self) -> Ipl {
        Ipl::from_raw(self.level.load(Ordering::Acquire))
    }

    /// Set the level to `max(current, level)` and return the previous level.
    pub fn raise(&self, level: Ipl) -> Ipl {
        Ipl::from_raw(self.level.fetch_max(level as u8, Ordering::AcqRel))
    }

    /// Restore `previous` if the current level is strictly higher.
    ///
    /// Returns `true` if the level changed.
    pub fn lower(&self, previous: Ipl) -> bool {
        self.level
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur > previous as u8).then_some(previous as u8)
            })
            .is_ok()
    }

    /// Raise to `level` for the lifetime of the returned guard.
    pub fn raise_guard(&self, level: Ipl) -> IplGuard<'_> {
        let previous = self.raise(level);
        IplGuard {
            ipl: self,
            previous,
            _not_send: PhantomData,
        }
    }

    /// Raise to [`Ipl::Critical`] and hand out the token that unlocks
    /// [`CoreLocal`] state.
    ///
    /// Returns `None` if the core is already at `CRITICAL`: the token for
    /// that section is held further up the stack.
    pub fn enter_critical(&self) -> Option<CriticalSection<'_>> {
        let previous = self.raise(Ipl::Critical);
        if previous == Ipl::Critical {
            return None;
        }
        Some(CriticalSection {
            ipl: self,
            previous,
            _not_send: PhantomData,
        })
    }
}

/// Restores the previous level when dropped.
#[must_use = "dropping an IplGuard immediately restores the previous level"]
pub struct IplGuard<'a> {
    ipl: &'a IplManager,
    previous: Ipl,
    _not_send: PhantomData<*mut ()>,
}

impl IplGuard<'_> {
    /// Level that will be restored.
    pub fn previous(&self) -> Ipl {
        self.previous
    }
}

impl Drop for IplGuard<'_> {
    fn drop(&mut self) {
        self.ipl.lower(self.previous);
    }
}

/// Proof that the owning core runs at [`Ipl::Critical`].
#[must_use = "dropping a CriticalSection immediately restores the previous level"]
pub struct CriticalSection<'a> {
    ipl: &'a IplManager,
    previous: Ipl,
    _not_send: PhantomData<*mut ()>,
}

impl CriticalSection<'_> {
    /// Core the section was entered on.
    pub fn core(&self) -> usize {
        self.ipl.core
    }

    /// Level restored on drop.
    pub fn previous(&self) -> Ipl {
        self.previous
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.ipl.lower(self.previous);
    }
}

/// State owned by one core and only reachable at [`Ipl::Critical`].
pub struct CoreLocal<T> {
    core: usize,
    value: UnsafeCell<T>,
}

// SAFETY: the value is only handed out through `get`, which requires the
// owning core's unique `CriticalSection` borrowed mutably. Other cores never
// obtain that token, so there is never more than one live reference.
unsafe impl<T: Send> Sync for CoreLocal<T> {}

impl<T> CoreLocal<T> {
    /// Wrap `value` as state of `core`.
    pub const fn new(core: usize, value: T) -> Self {
        Self {
            core,
            value: UnsafeCell::new(value),
        }
    }

    /// Borrow the state for as long as the critical section is borrowed.
    pub fn get<'a>(&'a self, cs: &'a mut CriticalSection<'_>) -> &'a mut T {
        debug_assert_eq!(cs.core(), self.core, "core-local state borrowed from another core");
        // SAFETY: see the `Sync` impl; `cs` is borrowed mutably for 'a.
        unsafe { &mut *self.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_never_lowers() {
        let ipl = IplManager::new(0);
        assert_eq!(ipl.raise(Ipl::Timer), Ipl::Normal);
        assert_eq!(ipl.raise(Ipl::Dev), Ipl::Timer);
        assert_eq!(ipl.current(), Ipl::Timer);
    }

    #[test]
    fn lower_is_noop_unless_strictly_below() {
        let ipl = IplManager::new(0);
        ipl.raise(Ipl::Dev);
        assert!(!ipl.lower(Ipl::Dev));
        assert!(!ipl.lower(Ipl::Timer));
        assert_eq!(ipl.current(), Ipl::Dev);
        assert!(ipl.lower(Ipl::Normal));
        assert_eq!(ipl.current(), Ipl::Normal);
    }

    #[test]
    fn nested_raises_observe_maximum() {
        let ipl = IplManager::new(0);
        let levels = [Ipl::Dev, Ipl::Normal, Ipl::InterCpu, Ipl::Timer, Ipl::Critical];
        let mut stack = alloc::vec::Vec::new();
        let mut max = Ipl::Normal;
        for level in levels {
            stack.push(ipl.raise(level));
            max = max.max(level);
            assert_eq!(ipl.current(), max);
        }
        while let Some(previous) = stack.pop() {
            ipl.lower(previous);
            assert_eq!(ipl.current(), previous);
        }
        assert_eq!(ipl.current(), Ipl::Normal);
    }

    #[test]
    fn guard_restores_on_drop() {
        let ipl = IplManager::new(0);
        {
            let guard = ipl.raise_guard(Ipl::Timer);
            assert_eq!(guard.previous(), Ipl::Normal);
            assert_eq!(ipl.current(), Ipl::Timer);
        }
        assert_eq!(ipl.current(), Ipl::Normal);
    }

    #[test]
    fn critical_section_is_not_reentrant() {
        let ipl = IplManager::new(0);
        let cs = ipl.enter_critical().expect("first entry succeeds");
        assert!(ipl.enter_critical().is_none());
        assert_eq!(ipl.current(), Ipl::Critical);
        drop(cs);
        assert_eq!(ipl.current(), Ipl::Normal);
        assert!(ipl.enter_critical().is_some());
    }

    #[test]
    fn core_local_requires_token() {
        let ipl = IplManager::new(3);
        let counter = CoreLocal::new(3, 0u32);
        let mut cs = ipl.enter_critical().unwrap();
        *counter.get(&mut cs) += 2;
        assert_eq!(*counter.get(&mut cs), 2);
        assert_eq!(cs.core(), 3);
    }
}
