#![forbid(unsafe_code)]

//! Named counting locks that serialize command bodies.
//!
//! A [`ResourceLock`] admits up to `capacity` concurrent holders (default 1).
//! Holders are admitted strictly in the order their requests were
//! registered: a request that cannot be admitted immediately takes a ticket
//! and waits behind every earlier ticket, even if capacity frees up for a
//! moment while it waits.
//!
//! # Registration vs. admission
//!
//! [`ResourceLock::acquire`] registers its ticket *when called*, not when the
//! returned [`Acquire`] future is first polled. Callers that need a place in
//! the queue to be fixed synchronously (the command dispatcher does) can rely
//! on this.
//!
//! [`acquire_all`] registers tickets on several locks as one step: locks are
//! deduplicated, sorted by creation id, and registered under a process-wide
//! registration mutex. Two multi-lock registrations therefore never
//! interleave, so every lock sees them in the same relative order and two
//! such requests cannot wait on each other in a cycle.
//!
//! # Failure Modes
//!
//! - **Dropped waiter**: dropping an [`Acquire`] before it resolves withdraws
//!   its ticket; if it had already been admitted the unit is released.
//! - **Manual nesting**: a command body that calls `acquire` on a lock held by
//!   another waiting command can still deadlock. Declare every lock a body
//!   needs as a dependency instead.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::task::{Context, Poll};

use futures::future::{JoinAll, join_all};
use tokio::sync::oneshot;
use tracing::trace;

use crate::reactive::{Subscription, ValueCell};

/// Holders admitted at once unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 1;

/// Name of the process-wide lock returned by [`ResourceLock::application`].
pub const APPLICATION_LOCK_NAME: &str = "application";

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);
static REGISTRATION: Mutex<()> = Mutex::new(());

/// A named, FIFO-fair counting lock.
///
/// Cloning yields another handle to the same lock.
#[derive(Clone)]
pub struct ResourceLock {
    inner: Arc<LockInner>,
}

struct LockInner {
    id: u64,
    name: String,
    capacity: usize,
    state: Mutex<LockState>,
    locked: ValueCell<bool>,
}

struct LockState {
    holders: usize,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
}

struct Waiter {
    ticket: u64,
    admit: oneshot::Sender<()>,
}

impl ResourceLock {
    /// Exclusive lock (capacity 1).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_CAPACITY)
    }

    /// Lock admitting up to `capacity` holders. A capacity of 0 is treated as 1.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(LockInner {
                id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                capacity: capacity.max(1),
                state: Mutex::new(LockState {
                    holders: 0,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                }),
                locked: ValueCell::new(false),
            }),
        }
    }

    /// The shared process-wide lock used by commands that declare no
    /// dependencies of their own.
    #[must_use]
    pub fn application() -> Self {
        static APPLICATION: OnceLock<ResourceLock> = OnceLock::new();
        APPLICATION
            .get_or_init(|| ResourceLock::new(APPLICATION_LOCK_NAME))
            .clone()
    }

    /// Creation-order identifier, unique per process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Currently admitted holders.
    #[must_use]
    pub fn holders(&self) -> usize {
        self.state().holders
    }

    /// Registered tickets not yet admitted.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state().waiters.len()
    }

    /// `true` while the lock is at capacity.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state().holders >= self.inner.capacity
    }

    /// Observe transitions of [`is_locked`](Self::is_locked).
    pub fn subscribe_locked(
        &self,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.locked.subscribe(move |locked| callback(*locked))
    }

    /// Register a ticket now; the returned future resolves once admitted.
    pub fn acquire(&self) -> Acquire {
        self.register()
    }

    /// Admit immediately if capacity is free and nobody is queued.
    #[must_use]
    pub fn try_acquire(&self) -> Option<LockGuard> {
        let locked = {
            let mut state = self.state();
            if state.holders < self.inner.capacity && state.waiters.is_empty() {
                state.holders += 1;
                Some(state.holders >= self.inner.capacity)
            } else {
                None
            }
        };
        self.publish(locked?);
        Some(LockGuard { lock: self.clone() })
    }

    /// Both handles refer to the same lock.
    #[must_use]
    pub fn same_lock(&self, other: &ResourceLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self) -> Acquire {
        let (waiting, locked) = {
            let mut state = self.state();
            if state.holders < self.inner.capacity && state.waiters.is_empty() {
                state.holders += 1;
                (None, state.holders >= self.inner.capacity)
            } else {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                let (admit, admitted) = oneshot::channel();
                state.waiters.push_back(Waiter { ticket, admit });
                (
                    Some((ticket, admitted, state.waiters.len())),
                    state.holders >= self.inner.capacity,
                )
            }
        };

        match waiting {
            None => {
                trace!(target: "tandem.lock", lock = %self.inner.name, "admitted on registration");
                self.publish(locked);
                Acquire {
                    lock: self.clone(),
                    stage: Stage::Admitted,
                }
            }
            Some((ticket, admitted, position)) => {
                trace!(target: "tandem.lock", lock = %self.inner.name, ticket, position, "queued");
                Acquire {
                    lock: self.clone(),
                    stage: Stage::Waiting { ticket, admitted },
                }
            }
        }
    }

    fn release_one(&self) {
        let (handed_over, locked) = {
            let mut state = self.state();
            state.holders = state.holders.saturating_sub(1);
            let mut handed_over = 0usize;
            while state.holders < self.inner.capacity {
                let Some(waiter) = state.waiters.pop_front() else {
                    break;
                };
                if waiter.admit.send(()).is_ok() {
                    state.holders += 1;
                    handed_over += 1;
                }
            }
            (handed_over, state.holders >= self.inner.capacity)
        };
        trace!(target: "tandem.lock", lock = %self.inner.name, handed_over, "released");
        self.publish(locked);
    }

    fn withdraw(&self, ticket: u64, mut admitted: oneshot::Receiver<()>) {
        let queued = {
            let mut state = self.state();
            match state.waiters.iter().position(|w| w.ticket == ticket) {
                Some(index) => {
                    state.waiters.remove(index);
                    true
                }
                None => false,
            }
        };
        if queued {
            trace!(target: "tandem.lock", lock = %self.inner.name, ticket, "withdrawn");
        } else if admitted.try_recv().is_ok() {
            // Admitted but never polled; hand the unit back.
            self.release_one();
        }
    }

    /// Push occupancy to subscribers outside the state mutex, so they may
    /// call back into the lock.
    ///
    /// `locked` is taken under the state mutex by the caller. A concurrent
    /// publish may overwrite it with an older value, so the flag is re-read
    /// after the write and written again until it matches.
    fn publish(&self, mut locked: bool) {
        loop {
            self.inner.locked.set(locked);
            let current = self.is_locked();
            if current == locked {
                break;
            }
            locked = current;
        }
    }
}

impl PartialEq for ResourceLock {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ResourceLock {}

impl Hash for ResourceLock {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("ResourceLock")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("holders", &state.holders)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

/// Future returned by [`ResourceLock::acquire`].
#[must_use = "dropping an Acquire withdraws its ticket"]
pub struct Acquire {
    lock: ResourceLock,
    stage: Stage,
}

enum Stage {
    Admitted,
    Waiting {
        ticket: u64,
        admitted: oneshot::Receiver<()>,
    },
    Done,
}

impl Future for Acquire {
    type Output = LockGuard;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<LockGuard> {
        let this = &mut *self;
        loop {
            match &mut this.stage {
                Stage::Admitted => break,
                Stage::Waiting { admitted, .. } => match Pin::new(admitted).poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(())) => break,
                    // The sender only disappears via `withdraw`, which runs on
                    // drop; take a fresh ticket rather than report a phantom hold.
                    Poll::Ready(Err(_)) => {
                        let mut fresh = this.lock.register();
                        this.stage = std::mem::replace(&mut fresh.stage, Stage::Done);
                    }
                },
                Stage::Done => panic!("`Acquire` polled after completion"),
            }
        }
        this.stage = Stage::Done;
        Poll::Ready(LockGuard {
            lock: this.lock.clone(),
        })
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Admitted => self.lock.release_one(),
            Stage::Waiting { ticket, admitted } => self.lock.withdraw(ticket, admitted),
            Stage::Done => {}
        }
    }
}

impl fmt::Debug for Acquire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self.stage {
            Stage::Admitted => "admitted",
            Stage::Waiting { .. } => "waiting",
            Stage::Done => "done",
        };
        f.debug_struct("Acquire")
            .field("lock", &self.lock.name())
            .field("stage", &stage)
            .finish()
    }
}

/// One admitted unit of a [`ResourceLock`]. Released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    lock: ResourceLock,
}

impl LockGuard {
    #[must_use]
    pub fn lock(&self) -> &ResourceLock {
        &self.lock
    }

    /// Release now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release_one();
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockGuard").field(&self.lock.name()).finish()
    }
}

/// Register tickets on every distinct lock in `locks` atomically with respect
/// to other `acquire_all` calls. Resolves once all of them are admitted.
pub fn acquire_all(locks: &[ResourceLock]) -> JoinAll<Acquire> {
    let mut ordered: Vec<&ResourceLock> = locks.iter().collect();
    ordered.sort_by_key(|lock| lock.id());
    ordered.dedup_by_key(|lock| lock.id());

    let _registration = REGISTRATION.lock().unwrap_or_else(|e| e.into_inner());
    join_all(ordered.into_iter().map(ResourceLock::register))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn exclusive_by_default() {
        let lock = ResourceLock::new("doc");
        let first = lock.acquire().await;
        assert!(lock.is_locked());
        assert!(lock.try_acquire().is_none());

        drop(first);
        assert!(!lock.is_locked());
        assert!(lock.try_acquire().is_some());
    }

    #[tokio::test]
    async fn capacity_admits_several_holders() {
        let lock = ResourceLock::with_capacity("pool", 2);
        let a = lock.acquire().await;
        let b = lock.acquire().await;
        assert_eq!(lock.holders(), 2);
        assert!(lock.is_locked());
        drop((a, b));
        assert_eq!(lock.holders(), 0);
    }

    #[test]
    fn zero_capacity_means_one() {
        assert_eq!(ResourceLock::with_capacity("z", 0).capacity(), 1);
    }

    #[tokio::test]
    async fn waiters_admitted_in_registration_order() {
        let lock = ResourceLock::new("fifo");
        let held = lock.acquire().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..4 {
            let pending = lock.acquire();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _guard = pending.await;
                order.lock().unwrap().push(i);
                tokio::task::yield_now().await;
            }));
        }
        assert_eq!(lock.waiting(), 4);
        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn try_acquire_does_not_jump_the_queue() {
        let lock = ResourceLock::with_capacity("q", 1);
        let held = lock.acquire().await;
        let queued = lock.acquire();
        drop(held);
        // Capacity was handed straight to the queued ticket.
        assert!(lock.try_acquire().is_none());
        let _guard = queued.await;
    }

    #[tokio::test]
    async fn dropped_waiter_withdraws_ticket() {
        let lock = ResourceLock::new("w");
        let held = lock.acquire().await;
        let abandoned = lock.acquire();
        assert_eq!(lock.waiting(), 1);
        drop(abandoned);
        assert_eq!(lock.waiting(), 0);
        drop(held);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn dropping_admitted_unpolled_acquire_releases() {
        let lock = ResourceLock::new("r");
        let held = lock.acquire().await;
        let admitted_later = lock.acquire();
        drop(held);
        assert_eq!(lock.holders(), 1);
        drop(admitted_later);
        assert_eq!(lock.holders(), 0);
    }

    #[tokio::test]
    async fn locked_subscription_reports_transitions() {
        let lock = ResourceLock::new("obs");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = lock.subscribe_locked(move |locked| seen_clone.lock().unwrap().push(locked));

        let guard = lock.acquire().await;
        drop(guard);
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn acquire_all_dedupes_and_admits_everything() {
        let a = ResourceLock::new("a");
        let b = ResourceLock::new("b");
        let guards = acquire_all(&[b.clone(), a.clone(), b.clone()]).await;
        assert_eq!(guards.len(), 2);
        assert!(a.is_locked() && b.is_locked());
        drop(guards);
        assert!(!a.is_locked() && !b.is_locked());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn opposite_order_multi_lock_requests_do_not_deadlock() {
        let a = ResourceLock::new("a");
        let b = ResourceLock::new("b");
        let inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let locks = if i % 2 == 0 {
                vec![a.clone(), b.clone()]
            } else {
                vec![b.clone(), a.clone()]
            };
            let inside = Arc::clone(&inside);
            tasks.push(tokio::spawn(async move {
                let _guards = acquire_all(&locks).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(!a.is_locked() && !b.is_locked());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn locked_flag_settles_on_final_occupancy() {
        let lock = ResourceLock::with_capacity("pool", 2);
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let lock = lock.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..8 {
                    let guard = lock.acquire().await;
                    tokio::task::yield_now().await;
                    drop(guard);
                    if let Some(guard) = lock.try_acquire() {
                        guard.release();
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(lock.holders(), 0);
        assert!(!lock.is_locked());
        assert!(!lock.inner.locked.get());

        let first = lock.acquire().await;
        let second = lock.acquire().await;
        assert!(lock.inner.locked.get());
        drop((first, second));
        assert!(!lock.inner.locked.get());
    }

    #[test]
    fn application_lock_is_shared() {
        let one = ResourceLock::application();
        let two = ResourceLock::application();
        assert!(one.same_lock(&two));
        assert_eq!(one.name(), APPLICATION_LOCK_NAME);
    }

    #[test]
    fn identity_is_by_lock_not_name() {
        let a = ResourceLock::new("same");
        let b = ResourceLock::new("same");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.id() < b.id());
    }
}
