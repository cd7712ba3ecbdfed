//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects cells, computed
//! nodes, effects, sessions, and shared registries. It owns the dependency
//! bookkeeping and turns cell changes into scheduled effect runs.
//!
//! # How It Works
//!
//! 1. Cells, computed nodes, and effects register with the runtime when
//!    created; subscribers are held as weak references so dropping every
//!    user handle is enough to retire one.
//!
//! 2. After a computed node or effect runs, the runtime swaps its recorded
//!    dependency set for the freshly captured one, subscribing it to
//!    exactly the cells it read and nothing else.
//!
//! 3. When a cell changes, the runtime walks its subscribers: computed
//!    nodes flip dirty and cascade the invalidation to their own
//!    dependents; effects are enqueued on the scheduler. Nothing runs
//!    inline inside the write.
//!
//! 4. Once the mutation has committed, the pending queue is drained as one
//!    batch (see [`crate::scheduler`]), unless a [`Runtime::batch`] block
//!    is still open on this thread, in which case draining waits for the
//!    outermost block to close.
//!
//! # Thread Safety
//!
//! Bookkeeping lives in concurrent maps. The discipline throughout this
//! module is to clone what a map lookup returns and drop the shard guard
//! before calling into anything that might re-enter the runtime.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::config::RuntimeConfig;
use crate::scheduler::{BatchObserver, Scheduler};
use crate::session::{EffectOwner, SessionHandle, SessionId, SessionState};
use crate::shared::{SharedPurge, SharedRegistry};

use super::cell::Cell;
use super::computed::Computed;
use super::context::TrackingContext;
use super::effect::Effect;
use super::subscriber::{CellId, SubscriberId};

/// What a cell id stands for, kept for notify-site dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// A plain mutable slot (session-local or unowned).
    Plain,
    /// The output of a computed node.
    Computed,
    /// An entry (or the shape) of a shared registry.
    SharedEntry,
}

/// A subscriber the runtime can notify when cells change.
///
/// Implemented by computed nodes (lazy: invalidate now, recompute on read)
/// and effects (eager: enqueue on the scheduler).
pub trait Reactive: Send + Sync {
    /// The id this subscriber tracks its reads under.
    fn subscriber_id(&self) -> SubscriberId;

    /// A tracked cell changed; invalidate any memoized value.
    fn mark_dirty(&self);

    /// Move to the Scheduled state if possible. Returns true exactly when
    /// the caller should enqueue the subscriber, at most once per batch.
    fn try_schedule(&self) -> bool;

    /// Undo a successful [`Reactive::try_schedule`] whose queue slot was
    /// dropped (cycle abort) without running.
    fn clear_scheduled(&self) {}

    /// Run the subscriber (effects only). Returns true if the body ran.
    fn execute(&self) -> bool;

    /// Eager subscribers are queued on the scheduler; lazy ones recompute
    /// on read.
    fn is_eager(&self) -> bool;

    /// Who owns this subscriber's lifetime.
    fn owner(&self) -> EffectOwner;
}

thread_local! {
    /// Open `Runtime::batch` blocks on this thread.
    static BATCH_DEPTH: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

struct BatchGuard;

impl BatchGuard {
    fn enter() -> Self {
        BATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        BATCH_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// The reactive runtime: one per process (or per test).
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,

    /// Live subscribers, held weakly so user handles control lifetime.
    subscribers: DashMap<SubscriberId, Weak<dyn Reactive>>,

    /// cell id -> subscribers that read it last run.
    cell_subs: DashMap<CellId, SmallVec<[SubscriberId; 4]>>,

    /// subscriber id -> cells it read last run.
    sub_cells: DashMap<SubscriberId, Vec<CellId>>,

    /// cell id -> what the cell stands for.
    cell_kinds: DashMap<CellId, CellKind>,

    /// Pending-effect queue and batch drain loop.
    scheduler: Scheduler,

    /// Connected sessions and the resources they own.
    sessions: Mutex<HashMap<SessionId, SessionState>>,

    /// Shared registries to purge when a session ends.
    shared_hooks: Mutex<Vec<Weak<dyn SharedPurge>>>,

    /// Render/transport collaborator, told what ran after each batch.
    observer: RwLock<Option<Arc<dyn BatchObserver>>>,
}

impl Runtime {
    /// Create a runtime with default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with the given configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                subscribers: DashMap::new(),
                cell_subs: DashMap::new(),
                sub_cells: DashMap::new(),
                cell_kinds: DashMap::new(),
                scheduler: Scheduler::new(),
                sessions: Mutex::new(HashMap::new()),
                shared_hooks: Mutex::new(Vec::new()),
                observer: RwLock::new(None),
            }),
        }
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Constructors for reactive values
    // ------------------------------------------------------------------

    /// Create a plain cell owned by no session.
    pub fn cell<T>(&self, value: T) -> Cell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        Cell::new(self, value)
    }

    /// Create a computed node.
    pub fn computed<T, F>(&self, compute: F) -> Computed<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Computed::new(self, compute)
    }

    /// Create a global effect (not owned by any session).
    ///
    /// The returned handle keeps the effect alive.
    pub fn effect<F>(&self, body: F) -> Effect
    where
        F: Fn() + Send + Sync + 'static,
    {
        Effect::new(self, EffectOwner::Global, body)
    }

    /// Create a shared registry visible to every session.
    pub fn registry<T>(&self) -> SharedRegistry<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        SharedRegistry::new(self)
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Group several mutations into one logical transaction.
    ///
    /// Effects affected by writes inside the closure run once, in a single
    /// batch drained when the outermost `batch` block on this thread
    /// closes.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let result = {
            let _guard = BatchGuard::enter();
            f()
        };
        self.maybe_flush();
        result
    }

    /// Register the collaborator that receives a report after each batch.
    pub fn set_batch_observer(&self, observer: Arc<dyn BatchObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    /// Number of effects currently waiting for a batch.
    pub fn pending_effects(&self) -> usize {
        self.inner.scheduler.pending()
    }

    // ------------------------------------------------------------------
    // Session lifecycle (consumed by the session-lifecycle collaborator)
    // ------------------------------------------------------------------

    /// A session connected: allocate its local namespace.
    ///
    /// Starting an id that is already live first tears the stale session
    /// down, so a disconnect/reconnect race resolves to the newest
    /// connection.
    pub fn session_start(&self, id: SessionId) -> SessionHandle {
        let stale = self.inner.sessions.lock().insert(id, SessionState::default());
        if let Some(state) = stale {
            tracing::debug!(session = id.raw(), "replacing stale session");
            self.teardown_session(id, state);
        }
        tracing::debug!(session = id.raw(), "session started");
        SessionHandle::new(self.clone(), id)
    }

    /// A session disconnected: dispose every effect it owns and purge its
    /// shared-registry contributions.
    pub fn session_end(&self, id: SessionId) {
        let state = self.inner.sessions.lock().remove(&id);
        match state {
            Some(state) => self.teardown_session(id, state),
            None => tracing::debug!(session = id.raw(), "session_end for unknown session"),
        }
    }

    /// Number of currently connected sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    fn teardown_session(&self, id: SessionId, state: SessionState) {
        let effect_count = state.effects.len();
        for effect in &state.effects {
            effect.dispose();
        }
        for cell_id in &state.cells {
            self.forget_cell(*cell_id);
        }

        // Purging may wake other sessions' effects watching the removed
        // entries; they join the flush below.
        let hooks: Vec<Arc<dyn SharedPurge>> = {
            let mut hooks = self.inner.shared_hooks.lock();
            hooks.retain(|weak| weak.strong_count() > 0);
            hooks.iter().filter_map(Weak::upgrade).collect()
        };
        for hook in hooks {
            hook.purge_session(id);
        }

        tracing::debug!(session = id.raw(), effects = effect_count, "session ended");
        self.maybe_flush();
    }

    /// Record an effect as owned by a session. If the session is already
    /// gone the effect is disposed on the spot.
    pub(crate) fn adopt_session_effect(&self, id: SessionId, effect: Effect) {
        let mut sessions = self.inner.sessions.lock();
        match sessions.get_mut(&id) {
            Some(state) => state.effects.push(effect),
            None => {
                drop(sessions);
                effect.dispose();
            }
        }
    }

    /// Record a local cell as owned by a session.
    pub(crate) fn adopt_session_cell(&self, id: SessionId, cell_id: CellId) {
        if let Some(state) = self.inner.sessions.lock().get_mut(&id) {
            state.cells.push(cell_id);
        }
    }

    // ------------------------------------------------------------------
    // Dependency bookkeeping
    // ------------------------------------------------------------------

    pub(crate) fn register_cell(&self, cell_id: CellId, kind: CellKind) {
        self.inner.cell_kinds.insert(cell_id, kind);
    }

    pub(crate) fn forget_cell(&self, cell_id: CellId) {
        self.inner.cell_kinds.remove(&cell_id);
        self.inner.cell_subs.remove(&cell_id);
    }

    pub(crate) fn register_subscriber(&self, subscriber: Arc<dyn Reactive>) {
        let id = subscriber.subscriber_id();
        self.inner.subscribers.insert(id, Arc::downgrade(&subscriber));
    }

    pub(crate) fn remove_subscriber(&self, id: SubscriberId) {
        self.inner.subscribers.remove(&id);
        if let Some((_, cells)) = self.inner.sub_cells.remove(&id) {
            for cell_id in cells {
                if let Some(mut subs) = self.inner.cell_subs.get_mut(&cell_id) {
                    subs.retain(|sub| *sub != id);
                }
            }
        }
    }

    /// Replace a subscriber's dependency set with the freshly captured one.
    ///
    /// Stale cells are unsubscribed so they can no longer wake the
    /// subscriber; new cells are subscribed exactly once.
    pub(crate) fn replace_dependencies(&self, id: SubscriberId, reads: Vec<CellId>) {
        let new: HashSet<CellId> = reads.into_iter().collect();
        let old: HashSet<CellId> = self
            .inner
            .sub_cells
            .insert(id, new.iter().copied().collect())
            .map(|cells| cells.into_iter().collect())
            .unwrap_or_default();

        for removed in old.difference(&new) {
            if let Some(mut subs) = self.inner.cell_subs.get_mut(removed) {
                subs.retain(|sub| *sub != id);
            }
        }
        for added in new.difference(&old) {
            let mut subs = self.inner.cell_subs.entry(*added).or_default();
            if !subs.contains(&id) {
                subs.push(id);
            }
        }
        tracing::trace!(subscriber = id.raw(), deps = new.len(), "dependencies swapped");
    }

    pub(crate) fn subscriber(&self, id: SubscriberId) -> Option<Arc<dyn Reactive>> {
        let weak = self.inner.subscribers.get(&id)?.value().clone();
        match weak.upgrade() {
            Some(subscriber) => Some(subscriber),
            None => {
                // Every user handle is gone; retire the entry.
                self.inner.subscribers.remove(&id);
                None
            }
        }
    }

    pub(crate) fn subscriber_count(&self, cell_id: CellId) -> usize {
        self.inner
            .cell_subs
            .get(&cell_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Change propagation
    // ------------------------------------------------------------------

    /// A cell committed a change: invalidate and enqueue its subscribers,
    /// then drain unless a batch block or an in-flight drain absorbs it.
    pub(crate) fn cell_changed(&self, cell_id: CellId) {
        self.propagate(cell_id);
        self.maybe_flush();
    }

    /// Invalidate and enqueue subscribers of a cell without draining.
    ///
    /// Computed subscribers cascade recursively to their own dependents;
    /// effects are enqueued at most once per batch.
    pub(crate) fn propagate(&self, cell_id: CellId) {
        let subs: SmallVec<[SubscriberId; 4]> = match self.inner.cell_subs.get(&cell_id) {
            Some(subs) => subs.clone(),
            None => return,
        };
        let kind = self
            .inner
            .cell_kinds
            .get(&cell_id)
            .map(|kind| *kind)
            .unwrap_or(CellKind::Plain);
        tracing::trace!(
            cell = cell_id.raw(),
            ?kind,
            subscribers = subs.len(),
            "cell changed"
        );

        for sub_id in subs {
            let Some(subscriber) = self.subscriber(sub_id) else {
                continue;
            };
            subscriber.mark_dirty();
            if subscriber.is_eager() && subscriber.try_schedule() {
                self.inner.scheduler.enqueue(sub_id);
            }
        }
    }

    /// Drain the pending queue unless a batch block is open on this thread.
    pub(crate) fn maybe_flush(&self) {
        let deferred = BATCH_DEPTH.with(|depth| depth.get() > 0);
        if !deferred {
            self.inner.scheduler.run_batch(self);
        }
    }

    pub(crate) fn observer(&self) -> Option<Arc<dyn BatchObserver>> {
        self.inner.observer.read().clone()
    }

    /// Register a shared registry for session purges.
    pub(crate) fn register_shared(&self, hook: Weak<dyn SharedPurge>) {
        self.inner.shared_hooks.lock().push(hook);
    }

    /// Get the current subscriber being tracked, if any.
    pub fn current_subscriber() -> Option<SubscriberId> {
        TrackingContext::current_subscriber()
    }

    /// Check if we're inside a tracking context on this thread.
    pub fn is_tracking() -> bool {
        TrackingContext::is_active()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("subscribers", &self.inner.subscribers.len())
            .field("cells", &self.inner.cell_kinds.len())
            .field("sessions", &self.session_count())
            .field("pending_effects", &self.pending_effects())
            .finish()
    }
}
