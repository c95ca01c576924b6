//! Read-copy-update cell.
//!
//! Readers grab a [`RcuReadGuard`] and see a consistent snapshot without ever
//! waiting on writers. Writers publish a replacement value, wait out a grace
//! period in which every reader that could still see the old value leaves, and
//! then free the old value.
//!
//! Grace periods use a version counter plus two reader counters indexed by the
//! version's parity. A reader registers in the slot for the version it
//! observed and re-checks the version afterwards; `synchronize` bumps the
//! version and waits for the previous slot to empty.

use crate::backoff::SpinWait;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

pub struct RcuCell<T> {
    value: AtomicPtr<T>,
    version: CachePadded<AtomicU64>,
    readers: [CachePadded<AtomicUsize>; 2],
    /// Serializes writers and grace periods.
    writer: Mutex<()>,
}

// SAFETY: readers obtain `&T` from multiple threads, writers move `T` across
// threads when freeing it.
unsafe impl<T: Send + Sync> Send for RcuCell<T> {}
unsafe impl<T: Send + Sync> Sync for RcuCell<T> {}

impl<T> RcuCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: AtomicPtr::new(Box::into_raw(Box::new(value))),
            version: CachePadded::new(AtomicU64::new(0)),
            readers: [
                CachePadded::new(AtomicUsize::new(0)),
                CachePadded::new(AtomicUsize::new(0)),
            ],
            writer: Mutex::new(()),
        }
    }

    /// Enters a read-side critical section.
    pub fn read(&self) -> RcuReadGuard<'_, T> {
        loop {
            let version = self.version.load(Ordering::SeqCst);
            let slot = (version & 1) as usize;
            self.readers[slot].fetch_add(1, Ordering::SeqCst);

            if self.version.load(Ordering::SeqCst) == version {
                let ptr = self.value.load(Ordering::SeqCst);
                return RcuReadGuard {
                    cell: self,
                    slot,
                    version,
                    // SAFETY: the pointer stays valid until a grace period that
                    // waits on our slot has completed.
                    value: unsafe { &*ptr },
                };
            }
            // A writer flipped the version under us; register again.
            self.readers[slot].fetch_sub(1, Ordering::Release);
        }
    }

    /// Current version. Advances once per completed grace period.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Blocks until every reader that entered before the call has left.
    ///
    /// Must not be called while the calling thread holds a read guard on
    /// this cell.
    pub fn synchronize(&self) {
        let _writer = self.writer.lock();
        self.synchronize_locked();
    }

    fn synchronize_locked(&self) {
        let previous = self.version.fetch_add(1, Ordering::SeqCst);
        let slot = (previous & 1) as usize;

        let mut wait = SpinWait::new();
        while self.readers[slot].load(Ordering::SeqCst) != 0 {
            wait.wait();
        }
    }

    /// Replaces the value and frees the old one after a grace period.
    pub fn publish(&self, value: T) {
        let _writer = self.writer.lock();
        self.replace_locked(value);
    }

    /// Copy-update: builds the replacement from the current value.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let _writer = self.writer.lock();
        // SAFETY: only writers free values and we hold the writer lock.
        let current = unsafe { &*self.value.load(Ordering::Acquire) };
        let next = f(current);
        self.replace_locked(next);
    }

    fn replace_locked(&self, value: T) {
        let new = Box::into_raw(Box::new(value));
        let old = self.value.swap(new, Ordering::SeqCst);
        self.synchronize_locked();
        // SAFETY: the grace period has elapsed, so no reader can still hold `old`.
        drop(unsafe { Box::from_raw(old) });
    }
}

impl<T: Default> Default for RcuCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for RcuCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcuCell")
            .field("version", &self.version())
            .field("value", &*self.read())
            .finish()
    }
}

impl<T> Drop for RcuCell<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` excludes readers; the pointer came from `Box::into_raw`.
        drop(unsafe { Box::from_raw(*self.value.get_mut()) });
    }
}

/// Read-side critical section. The referenced value stays alive until drop.
pub struct RcuReadGuard<'a, T> {
    cell: &'a RcuCell<T>,
    slot: usize,
    version: u64,
    value: &'a T,
}

impl<T> RcuReadGuard<'_, T> {
    /// Version observed when the guard was created.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl<T> Deref for RcuReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

impl<T> Drop for RcuReadGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.readers[self.slot].fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_publish_replaces_value() {
        let cell = RcuCell::new(vec![1, 2, 3]);
        assert_eq!(*cell.read(), vec![1, 2, 3]);
        cell.publish(vec![4]);
        assert_eq!(*cell.read(), vec![4]);
        cell.update(|v| v.iter().map(|x| x * 2).collect());
        assert_eq!(*cell.read(), vec![8]);
    }

    #[test]
    fn test_synchronize_advances_version() {
        let cell = RcuCell::new(0u8);
        let before = cell.version();
        cell.synchronize();
        assert!(cell.version() > before);
    }

    #[test]
    fn test_synchronize_waits_for_old_readers() {
        let cell = Arc::new(RcuCell::new(String::from("old")));
        let released = Arc::new(AtomicBool::new(false));

        let reader = {
            let cell = Arc::clone(&cell);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let guard = cell.read();
                thread::sleep(Duration::from_millis(50));
                assert_eq!(&*guard, "old");
                released.store(true, Ordering::SeqCst);
                drop(guard);
            })
        };

        // Give the reader time to enter its critical section.
        while cell.readers[0].load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        cell.publish(String::from("new"));
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(&*cell.read(), "new");
        reader.join().unwrap();
    }

    #[test]
    fn test_concurrent_readers_see_whole_values() {
        let cell = Arc::new(RcuCell::new(vec![0u64; 16]));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let snapshot = cell.read();
                        let first = snapshot[0];
                        assert!(snapshot.iter().all(|&x| x == first));
                    }
                })
            })
            .collect();

        for i in 1..200u64 {
            cell.publish(vec![i; 16]);
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(cell.read()[0], 199);
    }
}
