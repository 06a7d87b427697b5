//! Reactive cells
//!
//! A [`Cell`] is a shared value with change notification. Watchers run
//! synchronously after each notifying write, once the value lock has been
//! released, so a handler may read any cell and write other cells.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::{CellId, Computed, SubscriptionId};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Watcher<T> {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    handler: Handler<T>,
}

impl<T> Clone for Watcher<T> {
    fn clone(&self) -> Self {
        Watcher {
            id: self.id,
            active: self.active.clone(),
            handler: self.handler.clone(),
        }
    }
}

struct CellInner<T> {
    id: CellId,
    value: RwLock<T>,
    /// Bumped on every notifying write
    version: AtomicU64,
    watchers: Mutex<Vec<Watcher<T>>>,
}

/// Shared reactive cell
pub struct Cell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Cell {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Cell {
            inner: Arc::new(CellInner {
                id: CellId::next(),
                value: RwLock::new(value),
                version: AtomicU64::new(0),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Borrow the current value without cloning.
    /// The closure must not write to this cell.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read())
    }

    /// Write unconditionally and notify, returning the previous value
    pub fn replace(&self, value: T) -> T {
        let old = {
            let mut guard = self.inner.value.write();
            let old = std::mem::replace(&mut *guard, value);
            self.inner.version.fetch_add(1, Ordering::AcqRel);
            old
        };
        self.notify();
        old
    }

    /// Mutate in place and notify
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        {
            let mut guard = self.inner.value.write();
            f(&mut guard);
            self.inner.version.fetch_add(1, Ordering::AcqRel);
        }
        self.notify();
    }

    /// Run `handler` on every subsequent change
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        let active = Arc::new(AtomicBool::new(true));
        self.inner.watchers.lock().push(Watcher {
            id,
            active: active.clone(),
            handler: Arc::new(handler),
        });

        let weak: Weak<CellInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(id, active, move |id| {
            if let Some(inner) = weak.upgrade() {
                inner.watchers.lock().retain(|w| w.id != id);
            }
        })
    }

    /// Run `handler` once with the current value, then on every change
    pub fn watch<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let current = self.get();
        handler(&current);
        self.subscribe(handler)
    }

    /// Derived cell depending on this cell only
    pub fn map<U, F>(&self, f: F) -> Computed<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let source = self.clone();
        Computed::new(vec![self.as_source()], move || source.with(|v| f(v)))
    }

    pub fn as_source(&self) -> Arc<dyn Source> {
        Arc::new(self.clone())
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.lock().len()
    }

    fn notify(&self) {
        let watchers: Vec<Watcher<T>> = self.inner.watchers.lock().clone();
        if watchers.is_empty() {
            return;
        }
        let snapshot = self.get();
        for watcher in watchers {
            // Unsubscribed by an earlier handler in this round
            if watcher.active.load(Ordering::Acquire) {
                (watcher.handler)(&snapshot);
            }
        }
    }
}

impl<T> Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Write and notify only if the value differs. Returns whether it changed.
    pub fn set(&self, value: T) -> bool {
        {
            let mut guard = self.inner.value.write();
            if *guard == value {
                return false;
            }
            *guard = value;
            self.inner.version.fetch_add(1, Ordering::AcqRel);
        }
        self.notify();
        true
    }
}

impl<T> Default for Cell<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Cell::new(T::default())
    }
}

impl<T> fmt::Debug for Cell<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.read())
            .field("version", &self.inner.version.load(Ordering::Acquire))
            .finish()
    }
}

/// Type-erased dependency for derived cells
pub trait Source: Send + Sync {
    fn id(&self) -> CellId;

    /// Monotonic change counter
    fn version(&self) -> u64;

    /// Run `on_change` whenever this source changes
    fn subscribe_changes(&self, on_change: Arc<dyn Fn() + Send + Sync>) -> Subscription;
}

impl<T> Source for Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> CellId {
        self.inner.id
    }

    fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    fn subscribe_changes(&self, on_change: Arc<dyn Fn() + Send + Sync>) -> Subscription {
        self.subscribe(move |_| on_change())
    }
}

type Release = Box<dyn FnOnce(SubscriptionId) + Send + Sync>;

/// Watcher registration guard. Dropping it detaches the handler.
#[must_use = "dropping a Subscription detaches its handler immediately"]
pub struct Subscription {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    release: Option<Release>,
}

impl Subscription {
    fn new<F>(id: SubscriptionId, active: Arc<AtomicBool>, release: F) -> Self
    where
        F: FnOnce(SubscriptionId) + Send + Sync + 'static,
    {
        Subscription {
            id,
            active,
            release: Some(Box::new(release)),
        }
    }

    /// Bundle several registrations into one guard
    pub fn combine(parts: Vec<Subscription>) -> Self {
        Subscription::new(
            SubscriptionId::next(),
            Arc::new(AtomicBool::new(true)),
            move |_| drop(parts),
        )
    }

    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the handler registered for the lifetime of the source
    pub fn detach(mut self) {
        // Combined guards own their parts inside the release closure
        if let Some(release) = self.release.take() {
            std::mem::forget(release);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            self.active.store(false, Ordering::Release);
            release(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
