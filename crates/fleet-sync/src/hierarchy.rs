//! Level-ordered spin lock.
//!
//! Every [`HierarchicalLock`] is acquired at a numeric level, and a thread may
//! only acquire a lock at a level strictly greater than every level it already
//! holds. Violations are reported as [`SyncError::InvalidHierarchy`] before the
//! lock's shared state is touched, which turns a potential deadlock into an
//! immediate, attributable error.

use crate::backoff::SpinWait;
use crate::error::SyncError;
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

thread_local! {
    /// Levels currently held by this thread, ascending.
    static HELD_LEVELS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Highest lock level held by the calling thread, or 0 when none is held.
pub fn current_level() -> u64 {
    HELD_LEVELS.with(|held| held.borrow().last().copied().unwrap_or(0))
}

fn check_level(level: u64) -> Result<u64, SyncError> {
    if level == 0 {
        return Err(SyncError::ReservedLevel);
    }
    let held = current_level();
    if level <= held {
        log::warn!(
            "Lock hierarchy violation: requested level {} while holding {}",
            level,
            held
        );
        return Err(SyncError::InvalidHierarchy {
            requested: level,
            held,
        });
    }
    Ok(held)
}

/// A spin lock that enforces a global acquisition order by level.
pub struct HierarchicalLock<T> {
    /// Level of the current holder, 0 when unlocked.
    state: AtomicU64,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `state`.
unsafe impl<T: Send> Send for HierarchicalLock<T> {}
unsafe impl<T: Send> Sync for HierarchicalLock<T> {}

impl<T> HierarchicalLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU64::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock at `level`, spinning until it is free.
    ///
    /// Fails without side effects if `level` is not above the caller's
    /// current level.
    pub fn lock(&self, level: u64) -> Result<HierarchyGuard<'_, T>, SyncError> {
        check_level(level)?;

        let mut wait = SpinWait::new();
        while self
            .state
            .compare_exchange_weak(0, level, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            wait.wait();
        }
        Ok(HierarchyGuard::register(self, level))
    }

    /// Single attempt at acquiring the lock. `Ok(None)` means it is held elsewhere.
    pub fn try_lock(&self, level: u64) -> Result<Option<HierarchyGuard<'_, T>>, SyncError> {
        check_level(level)?;

        match self
            .state
            .compare_exchange(0, level, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Ok(Some(HierarchyGuard::register(self, level))),
            Err(_) => Ok(None),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for HierarchicalLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for HierarchicalLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchicalLock")
            .field("held_at", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Proof of holding a [`HierarchicalLock`]. Unlocks on drop.
///
/// Not `Send`: the held level is recorded per thread and must be released on
/// the thread that acquired it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct HierarchyGuard<'a, T> {
    lock: &'a HierarchicalLock<T>,
    level: u64,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> HierarchyGuard<'a, T> {
    fn register(lock: &'a HierarchicalLock<T>, level: u64) -> Self {
        HELD_LEVELS.with(|held| held.borrow_mut().push(level));
        Self {
            lock,
            level,
            _not_send: PhantomData,
        }
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    /// Explicit unlock; equivalent to dropping the guard.
    pub fn unlock(self) {}
}

impl<T> Deref for HierarchyGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for HierarchyGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for HierarchyGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
        // Guards may be dropped out of order; remove this guard's own entry.
        let _ = HELD_LEVELS.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&level| level == self.level) {
                held.remove(pos);
            }
        });
    }
}

impl<T: fmt::Debug> fmt::Debug for HierarchyGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchyGuard")
            .field("level", &self.level)
            .field("data", &**self)
            .finish()
    }
}
