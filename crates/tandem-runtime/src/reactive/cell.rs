#![forbid(unsafe_code)]

//! Shared value cell with change notification and version tracking.
//!
//! # Design
//!
//! [`ValueCell<T>`] wraps a value in shared, reference-counted storage
//! (`Arc<Mutex<..>>`) so it can be read and updated from any task. Changes
//! are pushed to subscribers in registration order. Cells are invalidated
//! manually: [`ValueCell::set`] and [`ValueCell::update`] notify only when the
//! value differs, [`ValueCell::replace`] and [`ValueCell::invalidate`] always
//! notify.
//!
//! # Failure Modes
//!
//! - **Re-entrant access**: subscribers run after the cell's mutex is
//!   released, so they may freely read or write the same cell.
//! - **Subscriber leak**: callbacks live as long as their [`Subscription`]
//!   guard. Dead weak references are pruned lazily during notification.
//! - **Panicking subscriber**: the panic is caught and logged at `warn` on
//!   `tandem.cell`. The mutation stands and later subscribers still run.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{trace_span, warn};
use web_time::Instant;

type CallbackArc<T> = Arc<dyn Fn(&T) + Send + Sync>;
type CallbackWeak<T> = Weak<dyn Fn(&T) + Send + Sync>;

struct CellInner<T> {
    value: T,
    version: u64,
    /// Subscribers stored as weak references. Dead entries are pruned on notify.
    subscribers: Vec<CallbackWeak<T>>,
}

/// A shared, version-tracked value with change notification.
///
/// Cloning a `ValueCell` creates a new handle to the **same** state.
///
/// # Invariants
///
/// 1. `version` increments by exactly 1 on each notifying mutation.
/// 2. `set(v)` where `v == current` is a no-op.
/// 3. Subscribers are notified in registration order.
pub struct ValueCell<T> {
    inner: Arc<Mutex<CellInner<T>>>,
}

impl<T> Clone for ValueCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ValueCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ValueCell")
            .field("value", &inner.value)
            .field("version", &inner.version)
            .field("subscriber_count", &inner.subscribers.len())
            .finish()
    }
}

impl<T: Default + Clone + Send + Sync + 'static> Default for ValueCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + Send + Sync + 'static> ValueCell<T> {
    /// Create a cell holding `value` at version 0.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CellInner {
                value,
                version: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellInner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clone of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    /// Borrow the current value without cloning.
    ///
    /// `f` runs while the cell is locked; it must not touch the same cell.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock().value)
    }

    /// Store `value` and notify unconditionally.
    pub fn replace(&self, value: T) {
        {
            let mut inner = self.lock();
            inner.value = value;
            inner.version += 1;
        }
        self.notify();
    }

    /// Notify subscribers without changing the value.
    pub fn invalidate(&self) {
        self.lock().version += 1;
        self.notify();
    }

    /// Register `callback` for future changes. Dropping the returned guard
    /// unsubscribes.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let strong: CallbackArc<T> = Arc::new(callback);
        let weak = Arc::downgrade(&strong);
        self.lock().subscribers.push(weak);
        Subscription::from_guard(strong)
    }

    /// Current version. Increments on each notifying mutation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Registered subscribers, including dead ones not yet pruned.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn notify(&self) {
        // Collect live callbacks first so none run under the cell lock.
        let (callbacks, value): (Vec<CallbackArc<T>>, T) = {
            let mut inner = self.lock();
            inner.subscribers.retain(|w| w.strong_count() > 0);
            let callbacks = inner.subscribers.iter().filter_map(Weak::upgrade).collect();
            (callbacks, inner.value.clone())
        };

        if callbacks.is_empty() {
            return;
        }

        let started = Instant::now();
        let span = trace_span!(
            "cell.notify",
            subscribers = callbacks.len() as u64,
            duration_us = tracing::field::Empty
        );
        let _entered = span.enter();

        // A panicking subscriber is logged and skipped; the rest still run.
        for callback in &callbacks {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&value)));
            if let Err(payload) = result {
                warn!(
                    target: "tandem.cell",
                    panic = panic_payload(payload.as_ref()),
                    "subscriber panicked"
                );
            }
        }

        span.record("duration_us", started.elapsed().as_micros() as u64);
    }
}

fn panic_payload(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ValueCell<T> {
    /// Store `value`; bump the version and notify only if it changed.
    pub fn set(&self, value: T) {
        {
            let mut inner = self.lock();
            if inner.value == value {
                return;
            }
            inner.value = value;
            inner.version += 1;
        }
        self.notify();
    }

    /// Modify the value in place; notify only if it changed.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let changed = {
            let mut inner = self.lock();
            let old = inner.value.clone();
            f(&mut inner.value);
            if inner.value != old {
                inner.version += 1;
                true
            } else {
                false
            }
        };
        if changed {
            self.notify();
        }
    }
}

/// RAII guard for one or more subscriber callbacks.
///
/// Dropping it makes the callbacks unreachable: the strong references die and
/// the weak entries in the cells fail to upgrade on the next notification.
pub struct Subscription {
    _guard: Box<dyn Any + Send + Sync>,
}

impl Subscription {
    fn from_guard(guard: impl Any + Send + Sync) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }

    /// A guard that keeps nothing alive.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_guard(())
    }

    /// Bundle several guards into one.
    #[must_use]
    pub fn combine(subscriptions: Vec<Subscription>) -> Self {
        Self::from_guard(subscriptions)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
