//! Value Cell Implementation
//!
//! A Cell is the fundamental reactive primitive: a single mutable slot
//! holding a typed value plus its current version.
//!
//! # How Cells Work
//!
//! 1. When a cell is read within a tracking context (computed/effect), the
//!    read is recorded so the runtime can subscribe that computation to
//!    the cell.
//!
//! 2. When a cell's value changes, the version is bumped and all
//!    subscribers are notified through the runtime. Subscriber bodies are
//!    never run inline inside the write; they are queued on the scheduler
//!    and drained after the write commits, so a computation always sees a
//!    consistent world during its own run.
//!
//! 3. A write of a value equal to the current one is ignored: the version
//!    does not move and nobody is notified. Readers can therefore compare
//!    versions, never values, to detect staleness cheaply.
//!
//! # Thread Safety
//!
//! Cells are thread-safe: the value sits behind a `parking_lot::RwLock`
//! and the version is an atomic. A cell that is local to one session is
//! only ever touched by that session's thread, but nothing breaks if it
//! is shared.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::context::TrackingContext;
use super::runtime::{CellKind, Runtime};
use super::subscriber::CellId;

/// Outcome of a cell write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The value changed; the version was bumped and subscribers were
    /// scheduled.
    Applied,
    /// The new value equals the current one; the write was a no-op.
    StaleIgnored,
}

impl WriteOutcome {
    /// True when the write actually changed the cell.
    pub fn applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

/// A reactive cell holding a value of type T.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = Runtime::new();
/// let count = runtime.cell(0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (schedules subscribers)
/// count.set(5);
/// ```
pub struct Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<CellInner<T>>,
}

struct CellInner<T> {
    /// Unique identifier for this cell.
    id: CellId,

    /// The current value.
    value: RwLock<T>,

    /// Strictly increasing count of effective writes.
    version: AtomicU64,

    /// The runtime this cell notifies on change.
    runtime: Runtime,
}

impl<T> Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a new cell registered with the given runtime.
    ///
    /// Usually constructed through [`Runtime::cell`] or
    /// [`SessionHandle::cell`](crate::session::SessionHandle::cell).
    pub fn new(runtime: &Runtime, value: T) -> Self {
        let id = CellId::new();
        runtime.register_cell(id, CellKind::Plain);
        Self {
            inner: Arc::new(CellInner {
                id,
                value: RwLock::new(value),
                version: AtomicU64::new(0),
                runtime: runtime.clone(),
            }),
        }
    }

    /// Get the cell's unique ID.
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// If called within a tracking context, this also records the read so
    /// the current computation is subscribed to the cell.
    pub fn get(&self) -> T {
        if TrackingContext::is_active() {
            TrackingContext::track(self.inner.id);
        }
        self.inner.value.read().clone()
    }

    /// Get the current value without registering a dependency.
    pub fn get_untracked(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Set a new value and schedule subscribers.
    ///
    /// A write of an identical value is ignored: no version bump, no
    /// notification. Returns what happened.
    pub fn set(&self, value: T) -> WriteOutcome {
        {
            let mut guard = self.inner.value.write();
            if *guard == value {
                return WriteOutcome::StaleIgnored;
            }
            *guard = value;
        }

        self.inner.version.fetch_add(1, Ordering::Release);
        self.inner.runtime.cell_changed(self.inner.id);
        WriteOutcome::Applied
    }

    /// Update the value using a function of the current value.
    pub fn update<F>(&self, f: F) -> WriteOutcome
    where
        F: FnOnce(&T) -> T,
    {
        let new_value = {
            let guard = self.inner.value.read();
            f(&guard)
        };
        self.set(new_value)
    }

    /// The number of effective writes since creation.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// How many subscribers currently depend on this cell.
    pub fn subscriber_count(&self) -> usize {
        self.inner.runtime.subscriber_count(self.inner.id)
    }
}

impl<T> Clone for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("value", &self.get_untracked())
            .field("version", &self.version())
            .finish()
    }
}

impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        // Last handle gone: drop the runtime's bookkeeping for this cell.
        self.runtime.forget_cell(self.id);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
