//! State merger
//!
//! Reconciles a caller-driven external cell (`None` = unset) with a
//! component-owned internal cell:
//! - external set → output is the external value
//! - external unset, never engaged → output is the internal value
//! - external unset after having been engaged → output is unset
//!
//! Whenever the external cell takes a value that differs from the internal
//! cell, the internal cell is overwritten at the next runtime flush.
//!
//! `T: PartialEq` must be a real equality. A comparison that never reports
//! equal turns every observation into an internal write.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use duo_core::{Cell, Computed, Runtime, Subscription};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{MergeMode, MergeSource};

/// Resolve the merged output from plain values
pub fn resolve<T: Clone>(external: Option<&T>, mode: MergeMode, internal: &T) -> Option<T> {
    match MergeSource::classify(external.is_some(), mode) {
        MergeSource::External => external.cloned(),
        MergeSource::Cleared => None,
        MergeSource::Internal => Some(internal.clone()),
    }
}

/// Synchronization state shared with the external watcher and queued tasks.
/// Both hold it weakly so nothing fires once the merger is dropped.
struct SyncState<T> {
    runtime: Runtime,
    internal: Cell<T>,
    controlled: Cell<bool>,
    /// Latest external value awaiting the next flush
    pending: Mutex<Option<T>>,
    writes: AtomicU64,
}

impl<T> SyncState<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn observe(self: &Arc<Self>, value: &Option<T>) {
        let Some(value) = value else {
            return;
        };

        if self.controlled.set(true) {
            debug!(internal = %self.internal.id(), "merged state entered controlled mode");
        }

        let schedule = {
            // Equality with the internal cell is decided at flush time
            let mut pending = self.pending.lock();
            let schedule = pending.is_none();
            *pending = Some(value.clone());
            schedule
        };

        if schedule {
            let weak: Weak<Self> = Arc::downgrade(self);
            self.runtime.defer(move || {
                if let Some(sync) = weak.upgrade() {
                    sync.apply();
                }
            });
            trace!(internal = %self.internal.id(), "internal sync queued");
        }
    }

    fn apply(&self) {
        let Some(value) = self.pending.lock().take() else {
            return;
        };
        if self.internal.set(value) {
            self.writes.fetch_add(1, Ordering::Relaxed);
            trace!(internal = %self.internal.id(), "internal sync applied");
        }
    }
}

/// Merged view over an external and an internal cell.
///
/// Dropping it releases the external subscription; a synchronization still
/// queued on the runtime becomes a no-op.
pub struct MergedState<T> {
    output: Computed<Option<T>>,
    controlled: Cell<bool>,
    external: Cell<Option<T>>,
    internal: Cell<T>,
    sync: Arc<SyncState<T>>,
    _subscription: Subscription,
}

/// Merge `external` over `internal`.
///
/// The current external value is observed once immediately, then on every
/// change. Output reads never wait for the deferred internal write.
/// The sync for the starting external value also waits for a flush.
pub fn merge<T>(runtime: &Runtime, external: &Cell<Option<T>>, internal: &Cell<T>) -> MergedState<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let controlled = Cell::new(false);
    let sync = Arc::new(SyncState {
        runtime: runtime.clone(),
        internal: internal.clone(),
        controlled: controlled.clone(),
        pending: Mutex::new(None),
        writes: AtomicU64::new(0),
    });

    sync.observe(&external.get());
    let weak = Arc::downgrade(&sync);
    let subscription = external.subscribe(move |value| {
        if let Some(sync) = weak.upgrade() {
            sync.observe(value);
        }
    });

    let output = {
        let (e, i, c) = (external.clone(), internal.clone(), controlled.clone());
        Computed::new(
            vec![e.as_source(), i.as_source(), c.as_source()],
            move || {
                let mode = MergeMode::from_flag(c.get());
                e.with(|ext| i.with(|int| resolve(ext.as_ref(), mode, int)))
            },
        )
    };

    MergedState {
        output,
        controlled,
        external: external.clone(),
        internal: internal.clone(),
        sync,
        _subscription: subscription,
    }
}

impl<T> MergedState<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Current merged value; `None` means unset
    pub fn get(&self) -> Option<T> {
        self.output.get()
    }

    /// Read-only derived cell backing this merger
    pub fn output(&self) -> Computed<Option<T>> {
        self.output.clone()
    }

    pub fn mode(&self) -> MergeMode {
        MergeMode::from_flag(self.controlled.get())
    }

    pub fn is_controlled(&self) -> bool {
        self.mode().is_active()
    }

    pub fn source(&self) -> MergeSource {
        let external_is_set = self.external.with(Option::is_some);
        MergeSource::classify(external_is_set, self.mode())
    }

    /// Run `handler` with the merged value now and on every change
    pub fn watch<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Option<T>) + Send + Sync + 'static,
    {
        self.output.watch(handler)
    }

    /// Internal-cell writes performed so far
    pub fn sync_writes(&self) -> u64 {
        self.sync.writes.load(Ordering::Relaxed)
    }

    /// True while a synchronization waits for the next flush
    pub fn has_pending_sync(&self) -> bool {
        self.sync.pending.lock().is_some()
    }

    pub fn external(&self) -> &Cell<Option<T>> {
        &self.external
    }

    pub fn internal(&self) -> &Cell<T> {
        &self.internal
    }

    pub fn runtime(&self) -> &Runtime {
        &self.sync.runtime
    }
}

impl<T> fmt::Debug for MergedState<T>
where
    T: Clone + PartialEq + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedState")
            .field("value", &self.get())
            .field("mode", &self.mode())
            .field("sync_writes", &self.sync_writes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup<T>(external: Option<T>, internal: T) -> (Runtime, Cell<Option<T>>, Cell<T>)
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        (Runtime::new(), Cell::new(external), Cell::new(internal))
    }

    #[test]
    fn test_never_controlled_returns_internal() {
        let (rt, external, internal) = setup(None, 1);
        let merged = merge(&rt, &external, &internal);

        assert_eq!(merged.get(), Some(1));
        assert_eq!(merged.mode(), MergeMode::Passive);
        assert_eq!(merged.source(), MergeSource::Internal);
        assert!(rt.is_idle());
    }

    #[test]
    fn test_internal_changes_pass_through_while_passive() {
        let (rt, external, internal) = setup(None, 1);
        let merged = merge(&rt, &external, &internal);

        internal.set(7);
        assert_eq!(merged.get(), Some(7));
    }

    #[test]
    fn test_initial_controlled_value() {
        let (rt, external, internal) = setup(Some(2), 1);
        let merged = merge(&rt, &external, &internal);

        assert_eq!(merged.get(), Some(2));
        assert!(merged.is_controlled());
        assert!(merged.has_pending_sync());

        rt.flush().unwrap();
        assert_eq!(internal.get(), 2);
        assert_eq!(merged.sync_writes(), 1);
    }

    #[test]
    fn test_sync_is_deferred_until_flush() {
        let (rt, external, internal) = setup(None, 1);
        let merged = merge(&rt, &external, &internal);
        assert_eq!(merged.get(), Some(1));

        external.set(Some(2));
        assert_eq!(merged.get(), Some(2));
        assert_eq!(internal.get(), 1);

        rt.flush().unwrap();
        assert_eq!(internal.get(), 2);
    }

    #[test]
    fn test_clear_after_controlled_returns_unset() {
        let (rt, external, internal) = setup(None, 1);
        let merged = merge(&rt, &external, &internal);
        assert_eq!(merged.get(), Some(1));

        external.set(Some(2));
        assert_eq!(merged.get(), Some(2));
        rt.flush().unwrap();
        assert_eq!(internal.get(), 2);

        external.set(None);
        assert_eq!(merged.get(), None);
        assert_eq!(merged.source(), MergeSource::Cleared);

        // Internal changes no longer leak through
        internal.set(9);
        assert_eq!(merged.get(), None);
    }

    #[test]
    fn test_initial_controlled_then_cleared() {
        let (rt, external, internal) = setup(Some("initial".to_string()), "default".to_string());
        let merged = merge(&rt, &external, &internal);
        assert_eq!(merged.get().as_deref(), Some("initial"));

        external.set(None);
        assert_eq!(merged.get(), None);
    }

    #[test]
    fn test_empty_string_is_a_value() {
        let (rt, external, internal) = setup(None, "default".to_string());
        let merged = merge(&rt, &external, &internal);
        assert_eq!(merged.get().as_deref(), Some("default"));

        external.set(Some(String::new()));
        assert_eq!(merged.get().as_deref(), Some(""));
        rt.flush().unwrap();
        assert_eq!(internal.get(), "");

        external.set(None);
        assert_eq!(merged.get(), None);
    }

    #[test]
    fn test_clear_before_flush_still_latches_and_syncs() {
        let (rt, external, internal) = setup(None, 1);
        let merged = merge(&rt, &external, &internal);

        external.set(Some(5));
        external.set(None);
        assert_eq!(merged.get(), None);

        rt.flush().unwrap();
        assert_eq!(internal.get(), 5);
        assert_eq!(merged.get(), None);
    }

    #[test]
    fn test_equal_value_needs_no_write() {
        let (rt, external, internal) = setup(None, 3);
        let merged = merge(&rt, &external, &internal);

        external.set(Some(3));
        assert!(merged.is_controlled());

        rt.flush().unwrap();
        assert_eq!(merged.sync_writes(), 0);
        assert_eq!(internal.get(), 3);
        assert!(!merged.has_pending_sync());
    }

    #[test]
    fn test_internal_write_after_matching_external_is_overridden() {
        let (rt, external, internal) = setup(None, 1);
        let merged = merge(&rt, &external, &internal);

        // External matches internal when observed, then internal drifts
        external.set(Some(1));
        internal.set(9);
        assert_eq!(merged.get(), Some(1));

        rt.flush().unwrap();
        assert_eq!(internal.get(), 1);
        assert_eq!(merged.get(), Some(1));
        assert_eq!(merged.sync_writes(), 1);
    }

    #[test]
    fn test_accessors_expose_merge_inputs() {
        let (rt, external, internal) = setup(Some(4), 0);
        let merged = merge(&rt, &external, &internal);

        assert_eq!(merged.external().id(), external.id());
        assert_eq!(merged.internal().id(), internal.id());
        assert_eq!(merged.output().dependency_count(), 3);

        assert_eq!(merged.runtime().pending(), 1);
        merged.runtime().flush().unwrap();
        assert!(rt.is_idle());
        assert_eq!(merged.internal().get(), 4);
    }

    #[test]
    fn test_resetting_same_external_value_is_idempotent() {
        let (rt, external, internal) = setup(None, 1);
        let merged = merge(&rt, &external, &internal);

        external.set(Some(2));
        rt.flush().unwrap();
        assert_eq!(merged.sync_writes(), 1);

        external.set(Some(2));
        external.replace(Some(2));
        rt.flush().unwrap();
        assert_eq!(merged.sync_writes(), 1);
        assert_eq!(internal.get(), 2);
    }

    #[test]
    fn test_transitions_before_flush_coalesce() {
        let (rt, external, internal) = setup(None, 0);
        let merged = merge(&rt, &external, &internal);

        external.set(Some(1));
        external.set(Some(2));
        external.set(Some(3));
        assert_eq!(rt.pending(), 1);

        rt.flush().unwrap();
        assert_eq!(internal.get(), 3);
        assert_eq!(merged.sync_writes(), 1);
    }

    #[test]
    fn test_flush_uses_latest_observation() {
        let (rt, external, internal) = setup(None, 1);
        let merged = merge(&rt, &external, &internal);

        // Queued for 2, then the external returns to the internal value
        external.set(Some(2));
        external.set(Some(1));
        rt.flush().unwrap();

        assert_eq!(internal.get(), 1);
        assert_eq!(merged.sync_writes(), 0);
    }

    #[test]
    fn test_pending_sync_overrides_internal_write() {
        let (rt, external, internal) = setup(None, 1);
        let _merged = merge(&rt, &external, &internal);

        external.set(Some(2));
        internal.set(9);
        rt.flush().unwrap();

        assert_eq!(internal.get(), 2);
    }

    #[test]
    fn test_drop_releases_subscription_and_cancels_sync() {
        let (rt, external, internal) = setup(None, 1);
        let merged = merge(&rt, &external, &internal);
        assert_eq!(external.watcher_count(), 1);

        external.set(Some(2));
        drop(merged);
        assert_eq!(external.watcher_count(), 0);

        // Task is still queued but must not touch the internal cell
        assert_eq!(rt.flush(), Ok(1));
        assert_eq!(internal.get(), 1);

        external.set(Some(3));
        assert!(rt.is_idle());
    }

    #[test]
    fn test_watch_merged_output() {
        let (rt, external, internal) = setup(None, 1);
        let merged = merge(&rt, &external, &internal);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let _sub = merged.watch(move |v| s.lock().push(*v));

        external.set(Some(2));
        rt.flush().unwrap();
        external.set(None);
        internal.set(4);

        assert_eq!(*seen.lock(), vec![Some(1), Some(2), None]);
    }

    #[test]
    fn test_output_is_memoized() {
        let (rt, external, internal) = setup(None, 1);
        let merged = merge(&rt, &external, &internal);
        let output = merged.output();

        assert_eq!(output.get(), Some(1));
        assert_eq!(output.get(), Some(1));
        assert_eq!(output.recomputations(), 1);
    }

    #[test]
    fn test_resolve_plain_values() {
        assert_eq!(resolve(Some(&2), MergeMode::Passive, &1), Some(2));
        assert_eq!(resolve(None, MergeMode::Passive, &1), Some(1));
        assert_eq!(resolve(None::<&i32>, MergeMode::Active, &1), None);
    }

    #[test]
    fn test_two_mergers_share_runtime() {
        let rt = Runtime::new();
        let (e1, i1) = (Cell::new(None), Cell::new(0u32));
        let (e2, i2) = (Cell::new(None), Cell::new(0u32));
        let m1 = merge(&rt, &e1, &i1);
        let m2 = merge(&rt, &e2, &i2);

        e1.set(Some(10));
        e2.set(Some(20));
        assert_eq!(rt.flush(), Ok(2));

        assert_eq!((i1.get(), i2.get()), (10, 20));
        assert_eq!((m1.get(), m2.get()), (Some(10), Some(20)));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Debug)]
        enum Op {
            External(Option<u8>),
            Internal(u8),
            Flush,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                proptest::option::of(0u8..4).prop_map(Op::External),
                (0u8..4).prop_map(Op::Internal),
                Just(Op::Flush),
            ]
        }

        /// Reference behavior of the merger over plain values
        #[derive(Debug)]
        struct Model {
            external: Option<u8>,
            internal: u8,
            mode: MergeMode,
            pending: Option<u8>,
            writes: u64,
        }

        impl Model {
            fn apply(&mut self, op: &Op) {
                match *op {
                    Op::External(value) => {
                        if value == self.external {
                            return;
                        }
                        self.external = value;
                        self.mode = self.mode.observe(value.is_some());
                        if value.is_some() {
                            self.pending = value;
                        }
                    }
                    Op::Internal(value) => self.internal = value,
                    Op::Flush => {
                        if let Some(v) = self.pending.take() {
                            if v != self.internal {
                                self.internal = v;
                                self.writes += 1;
                            }
                        }
                    }
                }
            }
        }

        proptest! {
            #[test]
            fn merged_state_matches_model(
                initial_external in proptest::option::of(0u8..4),
                initial_internal in 0u8..4,
                ops in proptest::collection::vec(op(), 0..40),
            ) {
                let rt = Runtime::new();
                let external = Cell::new(initial_external);
                let internal = Cell::new(initial_internal);
                let merged = merge(&rt, &external, &internal);

                let mut model = Model {
                    external: None,
                    internal: initial_internal,
                    mode: MergeMode::Passive,
                    pending: None,
                    writes: 0,
                };
                model.apply(&Op::External(initial_external));

                for op in &ops {
                    match *op {
                        Op::External(v) => { external.set(v); }
                        Op::Internal(v) => { internal.set(v); }
                        Op::Flush => { rt.flush().unwrap(); }
                    }
                    model.apply(op);

                    let expected = resolve(model.external.as_ref(), model.mode, &model.internal);
                    prop_assert_eq!(merged.get(), expected);
                    prop_assert_eq!(merged.mode(), model.mode);
                    prop_assert_eq!(internal.get(), model.internal);
                    prop_assert_eq!(merged.sync_writes(), model.writes);
                }
            }

            #[test]
            fn external_value_always_wins(v in any::<u8>(), i in any::<u8>()) {
                let rt = Runtime::new();
                let merged = merge(&rt, &Cell::new(Some(v)), &Cell::new(i));
                prop_assert_eq!(merged.get(), Some(v));
            }

            #[test]
            fn passive_passthrough(i in any::<i64>()) {
                let rt = Runtime::new();
                let merged = merge(&rt, &Cell::new(None), &Cell::new(i));
                prop_assert_eq!(merged.get(), Some(i));
                prop_assert!(rt.is_idle());
            }
        }
    }
}
