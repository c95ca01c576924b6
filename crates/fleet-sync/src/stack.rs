use crossbeam_epoch::{self as epoch, Atomic, Owned};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Node<T> {
    data: ManuallyDrop<T>,
    next: Atomic<Node<T>>,
}

/// Treiber stack: a lock-free LIFO for handoffs where ordering does not matter.
///
/// Reclamation goes through `crossbeam-epoch`, same as [`TaskQueue`](crate::TaskQueue).
pub struct TaskStack<T> {
    head: Atomic<Node<T>>,
    len: AtomicUsize,
}

// SAFETY: values are only ever moved in or out, never shared.
unsafe impl<T: Send> Send for TaskStack<T> {}
unsafe impl<T: Send> Sync for TaskStack<T> {}

impl<T> TaskStack<T> {
    pub fn new() -> Self {
        Self {
            head: Atomic::null(),
            len: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, item: T) {
        let guard = &epoch::pin();
        let mut node = Owned::new(Node {
            data: ManuallyDrop::new(item),
            next: Atomic::null(),
        });
        // Counted before linking so a racing `take_all` never underflows.
        self.len.fetch_add(1, Ordering::Relaxed);

        loop {
            let head = self.head.load(Ordering::Relaxed, guard);
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed, guard)
            {
                Ok(_) => break,
                Err(e) => node = e.new,
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            // SAFETY: head is protected by the guard.
            let head_ref = unsafe { head.as_ref() }?;
            let next = head_ref.next.load(Ordering::Relaxed, guard);

            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed, guard)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);
                // SAFETY: the CAS winner owns the node's value; the node itself is
                // freed once every pinned reader has moved on.
                unsafe {
                    guard.defer_destroy(head);
                    return Some(ManuallyDrop::into_inner(ptr::read(&head_ref.data)));
                }
            }
        }
    }

    /// Detaches the whole stack in one swap. Items come back most recent first.
    pub fn take_all(&self) -> Vec<T> {
        let guard = &epoch::pin();
        let mut current = self
            .head
            .swap(epoch::Shared::null(), Ordering::AcqRel, guard);

        let mut items = Vec::new();
        // SAFETY: the detached list is only reachable by us; racing pops that
        // loaded the old head fail their CAS and never read a value.
        unsafe {
            while let Some(node) = current.as_ref() {
                let next = node.next.load(Ordering::Acquire, guard);
                items.push(ManuallyDrop::into_inner(ptr::read(&node.data)));
                guard.defer_destroy(current);
                current = next;
            }
        }
        self.len.fetch_sub(items.len(), Ordering::Relaxed);
        items
    }

    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        self.head.load(Ordering::Acquire, guard).is_null()
    }

    /// Approximate number of items.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

impl<T> Default for TaskStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TaskStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStack")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for TaskStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lifo_order() {
        let stack = TaskStack::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_take_all_most_recent_first() {
        let stack = TaskStack::new();
        for i in 0..4 {
            stack.push(i);
        }
        assert_eq!(stack.take_all(), vec![3, 2, 1, 0]);
        assert!(stack.is_empty());
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn test_concurrent_push_pop_exactly_once() {
        let stack = Arc::new(TaskStack::new());
        let pushers: Vec<_> = (0..4)
            .map(|t| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    for i in 0..1_000 {
                        stack.push(t * 1_000 + i);
                    }
                })
            })
            .collect();

        let popper = {
            let stack = Arc::clone(&stack);
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..2_000 {
                    if let Some(item) = stack.pop() {
                        seen.push(item);
                    }
                }
                seen
            })
        };

        for pusher in pushers {
            pusher.join().unwrap();
        }
        let mut all = popper.join().unwrap();
        all.extend(stack.take_all());

        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 4_000);
        assert_eq!(unique.len(), 4_000);
    }
}
