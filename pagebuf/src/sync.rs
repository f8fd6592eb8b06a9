//! Wait primitives whose ownership is not tied to a borrow.
//!
//! A buffer's lock may be acquired by one task and released by another (for example, when an
//! asynchronous write completes), so [Lock] parks its guard instead of handing it out.

use async_lock::{Mutex as AsyncMutex, MutexGuardArc};
use futures::channel::oneshot;
use std::sync::{Arc, Mutex};

/// A mutual exclusion lock that any task may release.
pub(crate) struct Lock {
    mutex: Arc<AsyncMutex<()>>,
    guard: Mutex<Option<MutexGuardArc<()>>>,
}

impl Lock {
    /// Create a new lock, optionally already held.
    pub fn new(held: bool) -> Self {
        let mutex = Arc::new(AsyncMutex::new(()));
        let guard = held.then(|| mutex.try_lock_arc()).flatten();
        Self {
            mutex,
            guard: Mutex::new(guard),
        }
    }

    fn park(&self, guard: MutexGuardArc<()>) {
        *self.guard.lock().unwrap() = Some(guard);
    }

    /// Acquire the lock if it is free.
    pub fn try_acquire(&self) -> bool {
        let Some(guard) = self.mutex.try_lock_arc() else {
            return false;
        };
        self.park(guard);
        true
    }

    /// Acquire the lock, waiting for the current owner to release it.
    pub async fn acquire(&self) {
        let guard = self.mutex.lock_arc().await;
        self.park(guard);
    }

    /// Release the lock, waking the next waiter (if any).
    ///
    /// Returns false if the lock was not held.
    pub fn release(&self) -> bool {
        let guard = self.guard.lock().unwrap().take();
        guard.is_some()
    }

    /// Returns whether the lock is currently held.
    pub fn is_held(&self) -> bool {
        self.guard.lock().unwrap().is_some()
    }
}

/// A resettable, level-triggered completion signal.
pub(crate) struct Event {
    state: Mutex<EventState>,
}

struct EventState {
    fired: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Event {
    /// Create a new event, optionally already fired.
    pub fn new(fired: bool) -> Self {
        Self {
            state: Mutex::new(EventState {
                fired,
                waiters: Vec::new(),
            }),
        }
    }

    /// Arm the event so that subsequent waits block until [Event::fire].
    pub fn reset(&self) {
        self.state.lock().unwrap().fired = false;
    }

    /// Fire the event, waking all current waiters.
    pub fn fire(&self) {
        let mut state = self.state.lock().unwrap();
        state.fired = true;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Returns whether the event has fired since the last reset.
    pub fn is_fired(&self) -> bool {
        self.state.lock().unwrap().fired
    }

    /// Wait for the event to fire.
    pub async fn wait(&self) {
        let receiver = {
            let mut state = self.state.lock().unwrap();
            if state.fired {
                return;
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push(sender);
            receiver
        };
        let _ = receiver.await;
    }
}

/// A set of tasks waiting for some condition to become true.
///
/// The condition is evaluated under the same lock that [Waiters::wake_all] takes, so a waiter
/// that registers concurrently with a state change never misses the wake-up.
pub(crate) struct Waiters {
    waiters: Mutex<Vec<oneshot::Sender<()>>>,
}

impl Waiters {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Register interest in a wake-up unless `ready` already holds.
    pub fn register(&self, ready: impl FnOnce() -> bool) -> Option<oneshot::Receiver<()>> {
        let mut waiters = self.waiters.lock().unwrap();
        if ready() {
            return None;
        }
        let (sender, receiver) = oneshot::channel();
        waiters.push(sender);
        Some(receiver)
    }

    /// Wake every registered waiter.
    pub fn wake_all(&self) -> usize {
        let mut waiters = self.waiters.lock().unwrap();
        let mut woken = 0;
        for waiter in waiters.drain(..) {
            if waiter.send(()).is_ok() {
                woken += 1;
            }
        }
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Clock, Runner, Spawner};
    use futures::FutureExt;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    #[test_traced]
    fn test_lock_try_acquire() {
        let lock = Lock::new(false);
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        assert!(lock.is_held());
        assert!(lock.release());
        assert!(!lock.is_held());
        assert!(!lock.release());

        let lock = Lock::new(true);
        assert!(lock.is_held());
        assert!(!lock.try_acquire());
    }

    #[test_traced]
    fn test_lock_exclusive_across_tasks() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let lock = Arc::new(Lock::new(true));
            let inside = Arc::new(AtomicUsize::new(0));
            let acquired = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for i in 0..3u64 {
                let lock = lock.clone();
                let inside = inside.clone();
                let acquired = acquired.clone();
                handles.push(context.clone().spawn(move |context| async move {
                    context.sleep(Duration::from_millis(10 * (i + 1))).await;
                    lock.acquire().await;
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    context.sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    acquired.fetch_add(1, Ordering::SeqCst);
                    lock.release();
                }));
            }

            // Every waiter queues up behind the lock held at creation
            context.sleep(Duration::from_millis(100)).await;
            assert_eq!(acquired.load(Ordering::SeqCst), 0);

            // Released by a task other than the ones waiting
            assert!(lock.release());
            for handle in handles {
                handle.await.unwrap();
            }
            assert_eq!(acquired.load(Ordering::SeqCst), 3);
            assert!(!lock.is_held());
        });
    }

    #[test_traced]
    fn test_lock_abandoned_waiter() {
        let lock = Lock::new(true);

        // Queue a waiter and abandon it before the lock is released
        let mut acquire = Box::pin(lock.acquire());
        assert!((&mut acquire).now_or_never().is_none());
        drop(acquire);

        // Releasing leaves the lock free
        assert!(lock.release());
        assert!(!lock.is_held());
        assert!(lock.try_acquire());
    }

    #[test_traced]
    fn test_lock_abandoned_after_release() {
        let lock = Lock::new(true);

        // Queue a waiter, release, then abandon the waiter without polling it again
        let mut acquire = Box::pin(lock.acquire());
        assert!((&mut acquire).now_or_never().is_none());
        assert!(lock.release());
        drop(acquire);

        // Nobody owns the lock
        assert!(!lock.is_held());
        assert!(lock.try_acquire());
    }

    #[test]
    fn test_lock_cancel_races_release() {
        for _ in 0..10_000 {
            let lock = Lock::new(true);
            let mut acquire = Box::pin(lock.acquire());
            assert!((&mut acquire).now_or_never().is_none());

            // Abandon the waiter on one thread while releasing on another
            thread::scope(|scope| {
                scope.spawn(move || drop(acquire));
                scope.spawn(|| assert!(lock.release()));
            });

            // Ownership is never stranded with the abandoned waiter
            assert!(!lock.is_held());
            assert!(lock.try_acquire());
            assert!(lock.release());
        }
    }

    #[test_traced]
    fn test_event() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let event = Arc::new(Event::new(true));
            event.wait().await;

            event.reset();
            assert!(!event.is_fired());
            let woken = Arc::new(AtomicUsize::new(0));
            let mut handles = Vec::new();
            for _ in 0..2 {
                let event = event.clone();
                let woken = woken.clone();
                handles.push(context.clone().spawn(move |_| async move {
                    event.wait().await;
                    woken.fetch_add(1, Ordering::SeqCst);
                }));
            }
            context.sleep(Duration::from_millis(10)).await;
            assert_eq!(woken.load(Ordering::SeqCst), 0);

            event.fire();
            for handle in handles {
                handle.await.unwrap();
            }
            assert_eq!(woken.load(Ordering::SeqCst), 2);
        });
    }

    #[test_traced]
    fn test_waiters() {
        let waiters = Waiters::new();
        assert!(waiters.register(|| true).is_none());
        let mut receiver = waiters.register(|| false).unwrap();
        assert_eq!(waiters.wake_all(), 1);
        assert_eq!(receiver.try_recv(), Ok(Some(())));
        assert_eq!(waiters.wake_all(), 0);

        // Dropped receivers are not counted as woken
        drop(waiters.register(|| false));
        assert_eq!(waiters.wake_all(), 0);
    }
}
