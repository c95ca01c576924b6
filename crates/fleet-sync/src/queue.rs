//! Unbounded multi-producer multi-consumer FIFO queue.
//!
//! This is a Michael–Scott queue: a singly linked list with a dummy head node,
//! where `head` and `tail` are advanced with compare-and-swap. Memory of
//! unlinked nodes is reclaimed through `crossbeam-epoch`, so a node is only
//! freed once no pinned thread can still be looking at it.
//!
//! On top of the classic algorithm the queue supports [`TaskQueue::drain`],
//! which detaches the entire contents in one atomic step. The list lives in a
//! heap-allocated `Chain`; draining swaps in a fresh chain and then *seals* the
//! old one by tagging the `next` pointer of its last node. A producer that
//! raced the swap and finds the seal retries against the fresh chain, so no
//! item is ever linked into a chain nobody will read again.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicIsize, Ordering};

/// Tag placed on the terminal `next` pointer of a retired chain.
const SEALED: usize = 1;

struct Node<T> {
    /// Uninitialized for the dummy node. Once a node becomes the dummy its
    /// value has been moved out by the pop that promoted it.
    data: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            data: MaybeUninit::uninit(),
            next: Atomic::null(),
        }
    }
}

struct Chain<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
}

impl<T> Chain<T> {
    fn new() -> Self {
        let chain = Self {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
        };
        // SAFETY: the chain is not shared yet.
        let guard = unsafe { epoch::unprotected() };
        let sentinel = Owned::new(Node::sentinel()).into_shared(guard);
        chain.head.store(sentinel, Ordering::Relaxed);
        chain.tail.store(sentinel, Ordering::Relaxed);
        chain
    }

    /// Links `node` after the current tail. Hands the node back if the chain
    /// has been sealed by a concurrent drain.
    fn try_link(&self, node: Owned<Node<T>>, guard: &Guard) -> Result<(), Owned<Node<T>>> {
        let new = node.into_shared(guard);
        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            // SAFETY: tail is never null and is protected by the guard.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            if !next.is_null() {
                // Tail is lagging; help it along.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                continue;
            }

            if next.tag() == SEALED {
                // SAFETY: `new` was never published.
                return Err(unsafe { new.into_owned() });
            }

            if tail_ref
                .next
                .compare_exchange(
                    Shared::null(),
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                )
                .is_ok()
            {
                let _ = self.tail.compare_exchange(
                    tail,
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                return Ok(());
            }
        }
    }

    fn try_pop(&self, guard: &Guard) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            // SAFETY: head is never null and is protected by the guard.
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, guard);
            // SAFETY: a non-null `next` is protected by the guard.
            let next_ref = unsafe { next.as_ref() }?;

            let tail = self.tail.load(Ordering::Relaxed, guard);
            if tail == head {
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
            }

            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                // SAFETY: only the winner of the head CAS reads the value out of
                // the new dummy, and the old dummy is unreachable from `head`.
                unsafe {
                    guard.defer_destroy(head);
                    return Some(next_ref.data.as_ptr().read());
                }
            }
        }
    }

    fn is_empty(&self, guard: &Guard) -> bool {
        let head = self.head.load(Ordering::Acquire, guard);
        // SAFETY: head is never null and is protected by the guard.
        unsafe { head.deref() }
            .next
            .load(Ordering::Acquire, guard)
            .is_null()
    }

    /// Marks the terminal `next` pointer so that no further node can be linked.
    fn seal(&self, guard: &Guard) {
        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            // SAFETY: tail is never null and is protected by the guard.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            if !next.is_null() {
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                continue;
            }

            if next.tag() == SEALED {
                return;
            }

            if tail_ref
                .next
                .compare_exchange(
                    Shared::null(),
                    Shared::null().with_tag(SEALED),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_ok()
            {
                return;
            }
        }
    }
}

/// Lock-free FIFO queue with an atomic bulk [`drain`](TaskQueue::drain).
///
/// # Thread Safety
///
/// Any number of threads may push, pop and drain concurrently. Every pushed
/// item is returned exactly once, by exactly one `pop` or `drain`.
///
/// # Performance
///
/// `push` and `pop` are lock-free. `len` is maintained with a separate counter
/// and is only a hint while other threads are mutating the queue.
pub struct TaskQueue<T> {
    chain: CachePadded<Atomic<Chain<T>>>,
    len: CachePadded<AtomicIsize>,
    _marker: PhantomData<T>,
}

// SAFETY: values are moved between threads but never shared; the list nodes are
// only reached through epoch-protected pointers.
unsafe impl<T: Send> Send for TaskQueue<T> {}
unsafe impl<T: Send> Sync for TaskQueue<T> {}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            chain: CachePadded::new(Atomic::new(Chain::new())),
            len: CachePadded::new(AtomicIsize::new(0)),
            _marker: PhantomData,
        }
    }

    /// Appends `item` at the back of the queue.
    pub fn push(&self, item: T) {
        let guard = &epoch::pin();
        let mut node = Owned::new(Node {
            data: MaybeUninit::new(item),
            next: Atomic::null(),
        });

        loop {
            let chain = self.chain.load(Ordering::Acquire, guard);
            // SAFETY: the current chain is never null and retired chains are
            // only destroyed after the epoch advances.
            let chain_ref = unsafe { chain.deref() };
            match chain_ref.try_link(node, guard) {
                Ok(()) => {
                    self.len.fetch_add(1, Ordering::Release);
                    return;
                }
                Err(returned) => node = returned,
            }
        }
    }

    /// Removes the item at the front of the queue.
    pub fn pop(&self) -> Option<T> {
        let guard = &epoch::pin();
        loop {
            let chain = self.chain.load(Ordering::Acquire, guard);
            // SAFETY: see `push`.
            let chain_ref = unsafe { chain.deref() };
            if let Some(item) = chain_ref.try_pop(guard) {
                self.len.fetch_sub(1, Ordering::Release);
                return Some(item);
            }
            // The chain may have been swapped out by a drain after we loaded it.
            if self.chain.load(Ordering::Acquire, guard) == chain {
                return None;
            }
        }
    }

    /// Atomically removes every queued item, in FIFO order.
    ///
    /// Items pushed concurrently with the drain either appear in the returned
    /// vector or remain in the queue, never both and never neither.
    pub fn drain(&self) -> Vec<T> {
        let guard = &epoch::pin();
        let old = self
            .chain
            .swap(Owned::new(Chain::new()), Ordering::AcqRel, guard);
        // SAFETY: the old chain stays allocated until we retire it below.
        let old_ref = unsafe { old.deref() };
        old_ref.seal(guard);

        let mut items = Vec::new();
        while let Some(item) = old_ref.try_pop(guard) {
            items.push(item);
        }
        self.len.fetch_sub(items.len() as isize, Ordering::Release);

        // SAFETY: the chain is sealed and empty, so its head no longer moves.
        // Threads still pinned on it keep both allocations alive.
        unsafe {
            let last = old_ref.head.load(Ordering::Acquire, guard);
            guard.defer_destroy(last);
            guard.defer_destroy(old);
        }
        items
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let chain = self.chain.load(Ordering::Acquire, guard);
        // SAFETY: see `push`.
        unsafe { chain.deref() }.is_empty(guard)
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for TaskQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can observe the queue.
        unsafe {
            let guard = epoch::unprotected();
            let chain = self.chain.load(Ordering::Relaxed, guard);
            let chain_ref = chain.deref();
            while chain_ref.try_pop(guard).is_some() {}
            drop(chain_ref.head.load(Ordering::Relaxed, guard).into_owned());
            drop(chain.into_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new();
        assert!(queue.is_empty());
        for i in 0..10 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 10);
        for i in 0..10 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_returns_everything_and_queue_stays_usable() {
        let queue = TaskQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.drain(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);

        queue.push(42);
        assert_eq!(queue.pop(), Some(42));
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_drop_releases_remaining_items() {
        let item = Arc::new(());
        {
            let queue = TaskQueue::new();
            for _ in 0..8 {
                queue.push(Arc::clone(&item));
            }
            let _ = queue.pop();
        }
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn test_concurrent_producers_single_consumer_exactly_once() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2_000;

        let queue = Arc::new(TaskQueue::new());
        let barrier = Arc::new(Barrier::new(PRODUCERS + 1));
        let done = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_PRODUCER {
                        queue.push(p * PER_PRODUCER + i);
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        barrier.wait();
        let mut seen = HashSet::new();
        while done.load(Ordering::SeqCst) < PRODUCERS {
            if let Some(item) = queue.pop() {
                assert!(seen.insert(item), "item {item} popped twice");
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }
        for item in queue.drain() {
            assert!(seen.insert(item), "item {item} drained after being popped");
        }

        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_racing_producers_loses_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1_000;

        let queue = Arc::new(TaskQueue::new());
        let barrier = Arc::new(Barrier::new(PRODUCERS + 1));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_PRODUCER {
                        queue.push(p * PER_PRODUCER + i);
                    }
                })
            })
            .collect();

        barrier.wait();
        let mut collected = Vec::new();
        for _ in 0..50 {
            collected.extend(queue.drain());
            thread::yield_now();
        }
        for producer in producers {
            producer.join().unwrap();
        }
        collected.extend(queue.drain());

        let unique: HashSet<_> = collected.iter().copied().collect();
        assert_eq!(collected.len(), PRODUCERS * PER_PRODUCER);
        assert_eq!(unique.len(), collected.len());
    }
}
