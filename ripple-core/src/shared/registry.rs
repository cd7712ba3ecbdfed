//! Shared Registry Implementation
//!
//! A keyed collection of cells visible to every session. A mutation by one
//! session is observed by all others' effects as a single atomic
//! transition.
//!
//! # Concurrency
//!
//! One mutex per registry instance guards *all* of its operations,
//! mutating and reading alike, for the duration of the operation plus the
//! subscriber-enqueue step. Readers therefore never observe a partially
//! applied multi-key change, and two racing mutations serialize. The lock
//! is released before the pending batch drains, so effect bodies (which
//! may read the registry again) never run under it.
//!
//! [`SharedRegistry::transaction`] extends the critical section over a
//! whole multi-key operation: verify, write several keys, and flip flags
//! as one linearizable step. Two simultaneous transactions cannot both get
//! past the same guard condition.
//!
//! # Dependency tracking
//!
//! Reading a present key registers a dependency on that entry's cell.
//! Reading an *absent* key registers a dependency on the registry's shape
//! cell, whose version bumps on every insert or removal, so a reader that
//! found nothing re-runs when the key appears. `snapshot`/`for_each`
//! depend on the shape and on every entry they visited.
//!
//! Entries preserve insertion order (the map doubles as an ordered list),
//! and absence is a normal result, never an error: a key may simply belong
//! to a session that already disconnected.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::reactive::{CellId, CellKind, Runtime, TrackingContext, WriteOutcome};
use crate::session::SessionId;

use super::SharedPurge;

struct Entry<T> {
    /// The cell identity dependents subscribe to.
    cell_id: CellId,
    /// Effective writes to this entry since insertion.
    version: u64,
    value: T,
    /// The session that created the entry, if it asked to own it.
    contributor: Option<SessionId>,
}

struct RegistryInner<T> {
    runtime: Runtime,
    /// Structural identity: bumped on insert/remove, depended on by
    /// absent-key reads and whole-registry reads.
    shape_id: CellId,
    shape_version: AtomicU64,
    entries: Mutex<IndexMap<String, Entry<T>>>,
}

/// A keyed collection of cells shared by every session.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = Runtime::new();
/// let scores: SharedRegistry<i64> = runtime.registry();
///
/// scores.put("alice", 10);
/// assert_eq!(scores.get("alice"), Some(10));
/// assert_eq!(scores.get("bob"), None);
/// ```
pub struct SharedRegistry<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<RegistryInner<T>>,
}

impl<T> SharedRegistry<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a registry registered with the given runtime.
    ///
    /// Usually constructed through [`Runtime::registry`].
    pub fn new(runtime: &Runtime) -> Self {
        let shape_id = CellId::new();
        runtime.register_cell(shape_id, CellKind::SharedEntry);

        let inner = Arc::new(RegistryInner {
            runtime: runtime.clone(),
            shape_id,
            shape_version: AtomicU64::new(0),
            entries: Mutex::new(IndexMap::new()),
        });
        let dyn_inner: Arc<dyn SharedPurge> = inner.clone();
        let hook: Weak<dyn SharedPurge> = Arc::downgrade(&dyn_inner);
        runtime.register_shared(hook);

        Self { inner }
    }

    /// Read a key. Absence is a normal result, not an error.
    ///
    /// Inside a tracking context the reader is subscribed to the entry (or
    /// to the registry shape when the key is absent, so it wakes when the
    /// key appears).
    pub fn get(&self, key: &str) -> Option<T> {
        let entries = self.inner.entries.lock();
        match entries.get(key) {
            Some(entry) => {
                if TrackingContext::is_active() {
                    TrackingContext::track(entry.cell_id);
                }
                Some(entry.value.clone())
            }
            None => {
                if TrackingContext::is_active() {
                    TrackingContext::track(self.inner.shape_id);
                }
                None
            }
        }
    }

    /// Read a key without registering a dependency.
    pub fn get_untracked(&self, key: &str) -> Option<T> {
        self.inner
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// Insert or overwrite a key. Identical values are ignored.
    pub fn put(&self, key: impl Into<String>, value: T) -> WriteOutcome {
        self.put_entry(key.into(), value, None)
    }

    /// Insert or overwrite a key, recording `session` as its contributor.
    ///
    /// Contributed entries are removed automatically when the session
    /// ends (a leaderboard row keyed by its session, say).
    pub fn put_owned(
        &self,
        session: SessionId,
        key: impl Into<String>,
        value: T,
    ) -> WriteOutcome {
        self.put_entry(key.into(), value, Some(session))
    }

    /// Insert only if the key is absent. Returns true when it inserted.
    pub fn put_if_absent(&self, key: impl Into<String>, value: T) -> bool {
        let key = key.into();
        {
            let mut entries = self.inner.entries.lock();
            if entries.contains_key(&key) {
                return false;
            }
            let cell_id = CellId::new();
            self.inner.runtime.register_cell(cell_id, CellKind::SharedEntry);
            entries.insert(
                key,
                Entry {
                    cell_id,
                    version: 1,
                    value,
                    contributor: None,
                },
            );
            self.inner.shape_version.fetch_add(1, Ordering::Release);
            self.inner.runtime.propagate(self.inner.shape_id);
        }
        self.inner.runtime.maybe_flush();
        true
    }

    /// Remove a key, waking the entry's subscribers and shape watchers.
    ///
    /// Returns the removed value; `None` when the key was already absent.
    pub fn remove(&self, key: &str) -> Option<T> {
        let removed_cell;
        let value;
        {
            let mut entries = self.inner.entries.lock();
            let entry = entries.shift_remove(key)?;
            removed_cell = entry.cell_id;
            value = entry.value;
            self.inner.shape_version.fetch_add(1, Ordering::Release);
            self.inner.runtime.propagate(removed_cell);
            self.inner.runtime.propagate(self.inner.shape_id);
        }
        self.inner.runtime.forget_cell(removed_cell);
        self.inner.runtime.maybe_flush();
        Some(value)
    }

    /// Whether the key is present. Tracks the registry shape.
    pub fn contains_key(&self, key: &str) -> bool {
        if TrackingContext::is_active() {
            TrackingContext::track(self.inner.shape_id);
        }
        self.inner.entries.lock().contains_key(key)
    }

    /// Number of entries. Tracks the registry shape.
    pub fn len(&self) -> usize {
        if TrackingContext::is_active() {
            TrackingContext::track(self.inner.shape_id);
        }
        self.inner.entries.lock().len()
    }

    /// True when the registry holds no entries. Tracks the registry shape.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out every entry in insertion order.
    ///
    /// Inside a tracking context the reader is subscribed to the shape and
    /// to every entry visited, so any later change re-runs it.
    pub fn snapshot(&self) -> Vec<(String, T)> {
        let entries = self.inner.entries.lock();
        if TrackingContext::is_active() {
            TrackingContext::track(self.inner.shape_id);
            for entry in entries.values() {
                TrackingContext::track(entry.cell_id);
            }
        }
        entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Visit every entry in insertion order without copying the map.
    ///
    /// The registry lock is held for the whole walk: the callback must not
    /// call back into this registry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &T),
    {
        let entries = self.inner.entries.lock();
        if TrackingContext::is_active() {
            TrackingContext::track(self.inner.shape_id);
            for entry in entries.values() {
                TrackingContext::track(entry.cell_id);
            }
        }
        for (key, entry) in entries.iter() {
            f(key, &entry.value);
        }
    }

    /// Run a multi-key mutation as one linearizable step.
    ///
    /// The registry lock is held from the first read in `f` to the last
    /// enqueue, so two racing transactions serialize and no reader sees a
    /// half-applied change. Affected subscribers run in one batch after
    /// the lock is released.
    ///
    /// Reads inside the transaction do not register dependencies; this is
    /// a mutation context, not a render pass.
    pub fn transaction<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut RegistryTxn<'_, T>) -> R,
    {
        let result;
        {
            let mut entries = self.inner.entries.lock();
            let mut txn = RegistryTxn {
                runtime: &self.inner.runtime,
                shape_id: self.inner.shape_id,
                shape_version: &self.inner.shape_version,
                entries: &mut *entries,
                touched: Vec::new(),
                removed: Vec::new(),
            };
            result = f(&mut txn);

            let RegistryTxn {
                touched, removed, ..
            } = txn;
            for cell_id in &touched {
                self.inner.runtime.propagate(*cell_id);
            }
            for cell_id in removed {
                self.inner.runtime.forget_cell(cell_id);
            }
        }
        self.inner.runtime.maybe_flush();
        result
    }

    /// Effective writes to an entry since insertion; a cheap staleness
    /// probe, untracked.
    pub fn entry_version(&self, key: &str) -> Option<u64> {
        self.inner.entries.lock().get(key).map(|entry| entry.version)
    }

    /// Inserts and removals since creation, untracked.
    pub fn shape_version(&self) -> u64 {
        self.inner.shape_version.load(Ordering::Acquire)
    }

    fn put_entry(&self, key: String, value: T, contributor: Option<SessionId>) -> WriteOutcome {
        {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    if entry.value == value {
                        return WriteOutcome::StaleIgnored;
                    }
                    entry.value = value;
                    entry.version += 1;
                    let cell_id = entry.cell_id;
                    self.inner.runtime.propagate(cell_id);
                }
                None => {
                    let cell_id = CellId::new();
                    self.inner.runtime.register_cell(cell_id, CellKind::SharedEntry);
                    entries.insert(
                        key,
                        Entry {
                            cell_id,
                            version: 1,
                            value,
                            contributor,
                        },
                    );
                    self.inner.shape_version.fetch_add(1, Ordering::Release);
                    self.inner.runtime.propagate(self.inner.shape_id);
                }
            }
        }
        self.inner.runtime.maybe_flush();
        WriteOutcome::Applied
    }
}

/// Mutation view handed to [`SharedRegistry::transaction`] closures.
///
/// Every operation happens under the registry lock; notifications are
/// collected and enqueued once, at commit.
pub struct RegistryTxn<'a, T> {
    runtime: &'a Runtime,
    shape_id: CellId,
    shape_version: &'a AtomicU64,
    entries: &'a mut IndexMap<String, Entry<T>>,
    touched: Vec<CellId>,
    removed: Vec<CellId>,
}

impl<T> RegistryTxn<'_, T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn touch(&mut self, cell_id: CellId) {
        if !self.touched.contains(&cell_id) {
            self.touched.push(cell_id);
        }
    }

    /// Read a key under the transaction lock.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or overwrite a key. Identical values are ignored.
    pub fn put(&mut self, key: impl Into<String>, value: T) -> WriteOutcome {
        self.put_with(key.into(), value, None)
    }

    /// Insert or overwrite a key, recording `session` as its contributor.
    pub fn put_owned(
        &mut self,
        session: SessionId,
        key: impl Into<String>,
        value: T,
    ) -> WriteOutcome {
        self.put_with(key.into(), value, Some(session))
    }

    /// Insert only if the key is absent. Returns true when it inserted.
    pub fn put_if_absent(&mut self, key: impl Into<String>, value: T) -> bool {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.insert_new(key, value, None);
        true
    }

    /// Remove a key. Returns the removed value, `None` when absent.
    pub fn remove(&mut self, key: &str) -> Option<T> {
        let entry = self.entries.shift_remove(key)?;
        self.shape_version.fetch_add(1, Ordering::Release);
        self.touch(entry.cell_id);
        self.touch(self.shape_id);
        self.removed.push(entry.cell_id);
        Some(entry.value)
    }

    fn put_with(&mut self, key: String, value: T, contributor: Option<SessionId>) -> WriteOutcome {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                if entry.value == value {
                    return WriteOutcome::StaleIgnored;
                }
                entry.value = value;
                entry.version += 1;
                let cell_id = entry.cell_id;
                self.touch(cell_id);
            }
            None => {
                self.insert_new(key, value, contributor);
            }
        }
        WriteOutcome::Applied
    }

    fn insert_new(&mut self, key: String, value: T, contributor: Option<SessionId>) {
        let cell_id = CellId::new();
        self.runtime.register_cell(cell_id, CellKind::SharedEntry);
        self.entries.insert(
            key,
            Entry {
                cell_id,
                version: 1,
                value,
                contributor,
            },
        );
        self.shape_version.fetch_add(1, Ordering::Release);
        let shape_id = self.shape_id;
        self.touch(shape_id);
    }
}

impl<T> SharedPurge for RegistryInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn purge_session(&self, session: SessionId) {
        let mut removed_cells = Vec::new();
        {
            let mut entries = self.entries.lock();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.contributor == Some(session))
                .map(|(key, _)| key.clone())
                .collect();
            if keys.is_empty() {
                return;
            }
            for key in &keys {
                if let Some(entry) = entries.shift_remove(key) {
                    removed_cells.push(entry.cell_id);
                }
            }
            self.shape_version.fetch_add(1, Ordering::Release);
            for cell_id in &removed_cells {
                self.runtime.propagate(*cell_id);
            }
            self.runtime.propagate(self.shape_id);
            tracing::debug!(
                session = session.raw(),
                removed = removed_cells.len(),
                "purged session contributions"
            );
        }
        for cell_id in removed_cells {
            self.runtime.forget_cell(cell_id);
        }
        // Flushing is the session teardown's job, so all purges land in
        // one batch.
    }
}

impl<T> Drop for RegistryInner<T> {
    fn drop(&mut self) {
        self.runtime.forget_cell(self.shape_id);
        for entry in self.entries.get_mut().values() {
            self.runtime.forget_cell(entry.cell_id);
        }
    }
}

impl<T> Clone for SharedRegistry<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for SharedRegistry<T>
where
    T: Clone + PartialEq + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegistry")
            .field("len", &self.inner.entries.lock().len())
            .field("shape_version", &self.shape_version())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
