//! Computed Node Implementation
//!
//! A Computed is a derived cell whose value is produced by a pure function
//! of other cells, memoized until an input changes.
//!
//! # How Computed Nodes Work
//!
//! 1. On first access, the node runs its computation inside a fresh
//!    tracking context and caches the result.
//!
//! 2. Every evaluation re-captures the dependency set from scratch and
//!    resubscribes to exactly those cells. A cell read in a previous run
//!    but not in the latest one can no longer invalidate the node.
//!
//! 3. Invalidation is push-based and eager: when any tracked cell changes,
//!    the node flips dirty immediately and cascades the invalidation to its
//!    own dependents (so downstream effects get scheduled).
//!
//! 4. Recomputation is pull-based and lazy: a dirty node that nobody reads
//!    performs no work. Evaluation happens depth-first at the moment the
//!    node is read, after every invalidation of the triggering mutation has
//!    been applied. That is what keeps a diamond dependency from ever
//!    observing a mix of old and new inputs.
//!
//! # Panics in user code
//!
//! A panicking compute function leaves the node dirty and drops any cached
//! value, so no stale result is ever served. [`Computed::try_get`] surfaces
//! the failure as [`EngineError::ComputedPanicked`]; [`Computed::get`]
//! re-panics with the captured message.
//!
//! # Thread Safety
//!
//! The computation runs without holding the value lock, so a compute
//! function may freely read other cells and computed nodes. Two threads
//! racing to evaluate the same dirty node both run the (pure) computation
//! against the same committed inputs; the race is benign.

use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{panic_message, EngineError};
use crate::session::EffectOwner;

use super::context::TrackingContext;
use super::runtime::{CellKind, Reactive, Runtime};
use super::subscriber::{CellId, SubscriberId};

/// A memoized derived value that recomputes only when an input changed.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = Runtime::new();
/// let count = runtime.cell(2);
///
/// let count_for_double = count.clone();
/// let doubled = runtime.computed(move || count_for_double.get() * 2);
///
/// assert_eq!(doubled.get(), 4);
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// ```
pub struct Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<ComputedInner<T>>,
}

struct ComputedInner<T> {
    /// The id of this node's output cell, the one dependents subscribe to.
    cell_id: CellId,

    /// The id this node tracks its own reads under.
    subscriber_id: SubscriberId,

    /// The computation function.
    compute: Box<dyn Fn() -> T + Send + Sync>,

    /// The cached value (None if never computed or evaluation failed).
    cached: RwLock<Option<T>>,

    /// The message of the last failed evaluation, if any.
    last_error: RwLock<Option<String>>,

    /// True until the cached value reflects current inputs.
    dirty: AtomicBool,

    /// Bumped whenever recomputation produced a different value.
    version: AtomicU64,

    runtime: Runtime,
}

impl<T> Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a new computed node.
    ///
    /// The computation is not run immediately; it runs on first access.
    pub fn new<F>(runtime: &Runtime, compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let inner = Arc::new(ComputedInner {
            cell_id: CellId::new(),
            subscriber_id: SubscriberId::new(),
            compute: Box::new(compute),
            cached: RwLock::new(None),
            last_error: RwLock::new(None),
            dirty: AtomicBool::new(true),
            version: AtomicU64::new(0),
            runtime: runtime.clone(),
        });

        runtime.register_cell(inner.cell_id, CellKind::Computed);
        runtime.register_subscriber(inner.clone() as Arc<dyn Reactive>);

        Self { inner }
    }

    /// The id of this node's output cell.
    pub fn id(&self) -> CellId {
        self.inner.cell_id
    }

    /// The id this node tracks its own reads under.
    pub fn subscriber_id(&self) -> SubscriberId {
        self.inner.subscriber_id
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// # Panics
    ///
    /// Re-raises the panic message of a failing compute function. Use
    /// [`Computed::try_get`] where the caller wants to handle it.
    pub fn get(&self) -> T {
        match self.read(true) {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    /// Get the current value, recomputing if necessary.
    pub fn try_get(&self) -> Result<T, EngineError> {
        self.read(true)
    }

    /// Get the current value without registering a dependency on this node.
    pub fn get_untracked(&self) -> Result<T, EngineError> {
        self.read(false)
    }

    fn read(&self, track: bool) -> Result<T, EngineError> {
        if track && TrackingContext::is_active() {
            TrackingContext::track(self.inner.cell_id);
        }

        if !self.inner.dirty.load(Ordering::Acquire) {
            if let Some(value) = self.inner.cached.read().clone() {
                return Ok(value);
            }
        }

        self.inner.recompute()
    }

    /// True when the cached value no longer reflects current inputs.
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// The number of times recomputation produced a different value.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Check if the node has a cached value.
    pub fn has_value(&self) -> bool {
        self.inner.cached.read().is_some()
    }
}

impl<T> ComputedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Recompute the value inside a fresh tracking context and resubscribe
    /// to exactly the cells read this run.
    fn recompute(&self) -> Result<T, EngineError> {
        // Claim the dirty flag before running: an input change that lands
        // mid-computation re-marks the node, and the next read recomputes.
        self.dirty.store(false, Ordering::Release);

        let ctx = TrackingContext::enter(self.subscriber_id);
        let result = catch_unwind(AssertUnwindSafe(|| (self.compute)()));
        let reads = TrackingContext::captured_reads();
        drop(ctx);

        self.runtime.replace_dependencies(self.subscriber_id, reads);

        match result {
            Ok(value) => {
                let changed = {
                    let cached = self.cached.read();
                    cached.as_ref() != Some(&value)
                };
                *self.cached.write() = Some(value.clone());
                if changed {
                    self.version.fetch_add(1, Ordering::Release);
                }
                *self.last_error.write() = None;
                Ok(value)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(
                    subscriber = self.subscriber_id.raw(),
                    %message,
                    "computed evaluation panicked; node stays dirty"
                );
                self.dirty.store(true, Ordering::Release);
                *self.cached.write() = None;
                *self.last_error.write() = Some(message.clone());
                Err(EngineError::ComputedPanicked { message })
            }
        }
    }
}

impl<T> Reactive for ComputedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    fn mark_dirty(&self) {
        // Only the first invalidation since the last evaluation cascades;
        // an already-dirty node's dependents were told already.
        if !self.dirty.swap(true, Ordering::AcqRel) {
            self.runtime.propagate(self.cell_id);
        }
    }

    fn try_schedule(&self) -> bool {
        false
    }

    fn execute(&self) -> bool {
        false
    }

    fn is_eager(&self) -> bool {
        false
    }

    fn owner(&self) -> EffectOwner {
        EffectOwner::Global
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + PartialEq + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("cell_id", &self.inner.cell_id)
            .field("dirty", &self.is_dirty())
            .field("has_value", &self.has_value())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn computed_evaluates_on_first_access() {
        let runtime = Runtime::new();
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let computed = runtime.computed(move || {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
            42
        });

        // Not computed yet
        assert!(!computed.has_value());
        assert_eq!(call_count.load(Ordering::SeqCst), 0);

        // First access triggers computation
        assert_eq!(computed.get(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert!(computed.has_value());
    }

    #[test]
    fn computed_caches_until_input_changes() {
        let runtime = Runtime::new();
        let input = runtime.cell(3);
        let call_count = Arc::new(AtomicI32::new(0));

        let call_count_clone = call_count.clone();
        let input_clone = input.clone();
        let computed = runtime.computed(move || {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
            input_clone.get() * 2
        });

        assert_eq!(computed.get(), 6);
        assert_eq!(computed.get(), 6);
        assert_eq!(computed.get(), 6);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);

        input.set(5);
        assert!(computed.is_dirty());
        assert_eq!(computed.get(), 10);
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ignored_write_does_not_invalidate() {
        let runtime = Runtime::new();
        let input = runtime.cell(3);

        let input_clone = input.clone();
        let computed = runtime.computed(move || input_clone.get() + 1);
        assert_eq!(computed.get(), 4);

        input.set(3);
        assert!(!computed.is_dirty());
    }

    #[test]
    fn version_moves_only_when_output_changes() {
        let runtime = Runtime::new();
        let input = runtime.cell(1);

        // Output collapses odd/even to a parity flag.
        let input_clone = input.clone();
        let parity = runtime.computed(move || input_clone.get() % 2);

        assert_eq!(parity.get(), 1);
        assert_eq!(parity.version(), 1);

        input.set(3);
        assert_eq!(parity.get(), 1);
        // Recomputed, but the output did not change.
        assert_eq!(parity.version(), 1);

        input.set(4);
        assert_eq!(parity.get(), 0);
        assert_eq!(parity.version(), 2);
    }

    #[test]
    fn dependencies_recaptured_each_run() {
        let runtime = Runtime::new();
        let which = runtime.cell(false);
        let a = runtime.cell(1);
        let b = runtime.cell(10);

        let which_clone = which.clone();
        let a_clone = a.clone();
        let b_clone = b.clone();
        let picked = runtime.computed(move || {
            if which_clone.get() {
                b_clone.get()
            } else {
                a_clone.get()
            }
        });

        assert_eq!(picked.get(), 1);

        // Switch branches; the node now reads `b`, not `a`.
        which.set(true);
        assert_eq!(picked.get(), 10);

        // A write to the abandoned branch must not invalidate it.
        a.set(2);
        assert!(!picked.is_dirty());
        assert_eq!(picked.get(), 10);

        b.set(20);
        assert!(picked.is_dirty());
        assert_eq!(picked.get(), 20);
    }

    #[test]
    fn panicking_compute_stays_dirty_and_recovers() {
        let runtime = Runtime::new();
        let input = runtime.cell(0);

        let input_clone = input.clone();
        let fragile = runtime.computed(move || {
            let v = input_clone.get();
            if v == 0 {
                panic!("zero is not allowed");
            }
            100 / v
        });

        let err = fragile.try_get().unwrap_err();
        match err {
            EngineError::ComputedPanicked { message } => {
                assert!(message.contains("zero is not allowed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(fragile.is_dirty());
        assert!(!fragile.has_value());

        // A fixed input heals the node.
        input.set(4);
        assert_eq!(fragile.try_get().unwrap(), 25);
        assert!(!fragile.is_dirty());
    }

    #[test]
    fn computed_clone_shares_state() {
        let runtime = Runtime::new();
        let computed1 = runtime.computed(|| 42);

        assert_eq!(computed1.get(), 42);

        let computed2 = computed1.clone();
        assert_eq!(computed1.id(), computed2.id());
        assert!(computed2.has_value());
        assert_eq!(computed2.get(), 42);
    }
}
