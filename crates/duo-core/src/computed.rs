//! Derived cells
//!
//! A [`Computed`] caches the result of a pure function together with the
//! versions of its dependencies at evaluation time. Reads recompute
//! synchronously whenever any dependency version moved.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{CellId, Source, Subscription};

struct ComputedInner<T> {
    id: CellId,
    deps: Vec<Arc<dyn Source>>,
    compute: Box<dyn Fn() -> T + Send + Sync>,
    /// Dependency versions the cached value was computed from
    cache: Mutex<Option<(Vec<u64>, T)>>,
    recomputations: AtomicU64,
}

/// Read-only derived cell
pub struct Computed<T> {
    inner: Arc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Computed {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `compute` must only read the cells listed in `deps`
    pub fn new<F>(deps: Vec<Arc<dyn Source>>, compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Computed {
            inner: Arc::new(ComputedInner {
                id: CellId::next(),
                deps,
                compute: Box::new(compute),
                cache: Mutex::new(None),
                recomputations: AtomicU64::new(0),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    pub fn get(&self) -> T {
        let versions = self.dep_versions();
        if let Some((seen, value)) = self.inner.cache.lock().as_ref() {
            if *seen == versions {
                return value.clone();
            }
        }

        // Evaluated without the cache lock so nested derived reads are fine
        let value = (self.inner.compute)();
        self.inner.recomputations.fetch_add(1, Ordering::Relaxed);
        *self.inner.cache.lock() = Some((versions, value.clone()));
        value
    }

    /// Number of times the function has been evaluated
    pub fn recomputations(&self) -> u64 {
        self.inner.recomputations.load(Ordering::Relaxed)
    }

    pub fn dependency_count(&self) -> usize {
        self.inner.deps.len()
    }

    pub fn as_source(&self) -> Arc<dyn Source> {
        Arc::new(self.clone())
    }

    fn dep_versions(&self) -> Vec<u64> {
        self.inner.deps.iter().map(|d| d.version()).collect()
    }
}

impl<T> Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Run `handler` once with the current value, then whenever a
    /// dependency change alters the derived value
    pub fn watch<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let initial = self.get();
        handler(&initial);

        let last = Mutex::new(initial);
        let weak: Weak<ComputedInner<T>> = Arc::downgrade(&self.inner);
        let on_change: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let value = Computed { inner }.get();
            {
                let mut last = last.lock();
                if *last == value {
                    return;
                }
                *last = value.clone();
            }
            handler(&value);
        });

        let parts = self
            .inner
            .deps
            .iter()
            .map(|dep| dep.subscribe_changes(on_change.clone()))
            .collect();
        Subscription::combine(parts)
    }
}

impl<T> Source for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> CellId {
        self.inner.id
    }

    /// Sum of dependency versions; moves whenever any dependency moves
    fn version(&self) -> u64 {
        self.inner
            .deps
            .iter()
            .fold(0u64, |acc, d| acc.wrapping_add(d.version()))
    }

    fn subscribe_changes(&self, on_change: Arc<dyn Fn() + Send + Sync>) -> Subscription {
        let parts = self
            .inner
            .deps
            .iter()
            .map(|dep| dep.subscribe_changes(on_change.clone()))
            .collect();
        Subscription::combine(parts)
    }
}

impl<T> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.id)
            .field("deps", &self.inner.deps.len())
            .field("recomputations", &self.inner.recomputations.load(Ordering::Relaxed))
            .finish()
    }
}
