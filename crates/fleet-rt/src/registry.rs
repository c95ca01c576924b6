use crate::config::CoreConfig;
use crate::task::{CoreId, Task, TaskId};
use fleet_sync::{RcuCell, TaskQueue};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a core.
///
/// `Created -> Running <-> Paused`, `Running -> Failed`, `Failed -> Running`
/// after a successful recovery, and any state `-> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoreState {
    Created = 0,
    Running = 1,
    Paused = 2,
    Failed = 3,
    Stopped = 4,
}

impl CoreState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CoreState::Created,
            1 => CoreState::Running,
            2 => CoreState::Paused,
            3 => CoreState::Failed,
            _ => CoreState::Stopped,
        }
    }
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub struct AtomicCoreState(AtomicU8);

impl AtomicCoreState {
    pub fn new(state: CoreState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> CoreState {
        CoreState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: CoreState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves `from -> to`; false if the state was something else.
    pub fn transition(&self, from: CoreState, to: CoreState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Condition-variable wake-up that cannot lose notifications.
///
/// Waiters evaluate their condition while holding the signal's mutex, and
/// notifiers take the same mutex before waking, so a notification sent
/// between the check and the wait is never missed.
#[derive(Debug, Default)]
pub struct WakeSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks until `ready()` holds or `timeout` passes without a
    /// notification. Returns the final value of `ready()`.
    pub fn wait_until<F>(&self, mut ready: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let mut generation = self.generation.lock();
        loop {
            if ready() {
                return true;
            }
            if self.cond.wait_for(&mut generation, timeout).timed_out() {
                return ready();
            }
        }
    }
}

/// State shared between a core's worker thread and the rest of the fleet.
#[derive(Debug)]
pub struct CoreSlot {
    pub config: CoreConfig,
    pub queue: TaskQueue<Task>,
    pub signal: WakeSignal,
    state: AtomicCoreState,
    stop_requested: AtomicBool,
    /// Bumped whenever a worker thread is abandoned, so a stale thread that
    /// eventually returns from a hung task exits instead of competing.
    generation: AtomicU64,
    active: Mutex<Option<TaskId>>,
    orphans: Mutex<Vec<Task>>,
    executed: AtomicU64,
}

impl CoreSlot {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            queue: TaskQueue::new(),
            signal: WakeSignal::new(),
            state: AtomicCoreState::new(CoreState::Created),
            stop_requested: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            orphans: Mutex::new(Vec::new()),
            executed: AtomicU64::new(0),
        }
    }

    pub fn core_id(&self) -> CoreId {
        self.config.core_id
    }

    pub fn state(&self) -> CoreState {
        self.state.load()
    }

    pub(crate) fn set_state(&self, state: CoreState) {
        self.state.store(state);
        self.signal.notify();
    }

    pub(crate) fn transition(&self, from: CoreState, to: CoreState) -> bool {
        let moved = self.state.transition(from, to);
        if moved {
            self.signal.notify();
        }
        moved
    }

    /// Queues a task and wakes the worker.
    pub fn push(&self, task: Task) {
        self.queue.push(task);
        self.signal.notify();
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self, stop: bool) {
        self.stop_requested.store(stop, Ordering::Release);
        self.signal.notify();
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn retire_generation(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.signal.notify();
        next
    }

    pub fn running_task(&self) -> Option<TaskId> {
        *self.active.lock()
    }

    pub(crate) fn set_running(&self, task: Option<TaskId>) {
        *self.active.lock() = task;
    }

    /// Clears the running marker unless the calling thread's `generation` was
    /// retired, in which case the marker belongs to its replacement.
    pub(crate) fn clear_running(&self, generation: u64) -> bool {
        let mut active = self.active.lock();
        if self.generation() != generation {
            return false;
        }
        *active = None;
        true
    }

    pub(crate) fn add_orphan(&self, task: Task) {
        self.orphans.lock().push(task);
    }

    /// Tasks abandoned by a crashed worker thread.
    pub fn take_orphans(&self) -> Vec<Task> {
        std::mem::take(&mut *self.orphans.lock())
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read-mostly directory of core slots.
///
/// Lookups on the submit path never block; membership changes publish a new
/// list and wait out concurrent readers.
#[derive(Debug, Default)]
pub struct Registry {
    slots: RcuCell<Vec<Arc<CoreSlot>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a slot. Returns false if the core id is already registered.
    pub fn register(&self, slot: Arc<CoreSlot>) -> bool {
        let id = slot.core_id();
        let mut added = false;
        self.slots.update(|slots| {
            let mut next = slots.clone();
            if !slots.iter().any(|s| s.core_id() == id) {
                next.push(Arc::clone(&slot));
                next.sort_by_key(|s| s.core_id());
                added = true;
            }
            next
        });
        added
    }

    pub fn get(&self, core: CoreId) -> Option<Arc<CoreSlot>> {
        self.slots
            .read()
            .iter()
            .find(|slot| slot.core_id() == core)
            .cloned()
    }

    /// All slots, ordered by core id.
    pub fn slots(&self) -> Vec<Arc<CoreSlot>> {
        self.slots.read().clone()
    }

    pub fn core_ids(&self) -> Vec<CoreId> {
        self.slots.read().iter().map(|s| s.core_id()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total queued tasks across all cores.
    pub fn queued_tasks(&self) -> usize {
        self.slots.read().iter().map(|s| s.queue.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_state_transitions() {
        let state = AtomicCoreState::new(CoreState::Created);
        assert!(!state.transition(CoreState::Running, CoreState::Paused));
        assert!(state.transition(CoreState::Created, CoreState::Running));
        assert!(state.transition(CoreState::Running, CoreState::Paused));
        assert_eq!(state.load(), CoreState::Paused);
    }

    #[test]
    fn test_wake_signal_delivers_notification() {
        let signal = Arc::new(WakeSignal::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let signal = Arc::clone(&signal);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                let started = Instant::now();
                let ready =
                    signal.wait_until(|| flag.load(Ordering::SeqCst), Duration::from_secs(10));
                (ready, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::SeqCst);
        signal.notify();

        let (ready, elapsed) = waiter.join().unwrap();
        assert!(ready);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_times_out() {
        let signal = WakeSignal::new();
        assert!(!signal.wait_until(|| false, Duration::from_millis(10)));
    }

    #[test]
    fn test_registry_rejects_duplicates_and_orders_by_id() {
        let registry = Registry::new();
        assert!(registry.register(Arc::new(CoreSlot::new(CoreConfig::new(2)))));
        assert!(registry.register(Arc::new(CoreSlot::new(CoreConfig::new(0)))));
        assert!(!registry.register(Arc::new(CoreSlot::new(CoreConfig::new(2)))));
        assert_eq!(registry.core_ids(), vec![0, 2]);
        assert!(registry.get(1).is_none());
        assert_eq!(registry.get(2).map(|s| s.core_id()), Some(2));
    }

    #[test]
    fn test_retired_thread_keeps_replacement_marker() {
        let slot = CoreSlot::new(CoreConfig::new(0));
        let stale = slot.generation();
        slot.set_running(Some(TaskId(1)));

        slot.retire_generation();
        let current = slot.generation();
        slot.set_running(Some(TaskId(2)));

        assert!(!slot.clear_running(stale));
        assert_eq!(slot.running_task(), Some(TaskId(2)));
        assert!(slot.clear_running(current));
        assert_eq!(slot.running_task(), None);
    }
}
