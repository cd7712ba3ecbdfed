//! Session Lifecycle
//!
//! A session is one connected client: it owns local cells and effects, and
//! may contribute entries to shared registries. The engine learns about
//! connections through [`Runtime::session_start`] and
//! [`Runtime::session_end`] (the session-lifecycle collaborator calls
//! them); everything a session owns is torn down when it ends.
//!
//! Ending a session is a cancellation boundary: its effects are disposed
//! first, so even ones already sitting in the pending queue are skipped
//! rather than run against a torn-down session's resources.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::reactive::{Cell, CellId, Effect, Runtime};

/// Identifier of one connected session, assigned by the caller (usually
/// the connection layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a caller-assigned session number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Who owns an effect's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectOwner {
    /// Lives until its handle is dropped or it is disposed explicitly.
    Global,
    /// Torn down automatically when the session ends.
    Session(SessionId),
}

/// Resources a live session owns. Held by the runtime's session table.
#[derive(Default)]
pub(crate) struct SessionState {
    /// Owned effects, kept alive here until the session ends.
    pub(crate) effects: Vec<Effect>,
    /// Local cells allocated through the session handle.
    pub(crate) cells: Vec<CellId>,
}

/// Capability to allocate resources owned by one session.
///
/// Cheap to clone. Dropping the handle does *not* end the session; only
/// [`SessionHandle::end`] or [`Runtime::session_end`] does, so the
/// lifecycle stays in the connection layer's hands.
#[derive(Clone)]
pub struct SessionHandle {
    runtime: Runtime,
    id: SessionId,
}

impl SessionHandle {
    pub(crate) fn new(runtime: Runtime, id: SessionId) -> Self {
        Self { runtime, id }
    }

    /// This session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The runtime this session lives in.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Create a cell local to this session.
    ///
    /// Only this session's code reads or writes it; it needs no
    /// cross-session coordination and disappears with the session.
    pub fn cell<T>(&self, value: T) -> Cell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let cell = self.runtime.cell(value);
        self.runtime.adopt_session_cell(self.id, cell.id());
        cell
    }

    /// Create an effect owned by this session.
    ///
    /// The session keeps it alive; it is disposed when the session ends.
    /// If the session already ended, the effect is disposed immediately
    /// after its first run.
    pub fn effect<F>(&self, body: F) -> Effect
    where
        F: Fn() + Send + Sync + 'static,
    {
        let effect = Effect::new(&self.runtime, EffectOwner::Session(self.id), body);
        self.runtime.adopt_session_effect(self.id, effect.clone());
        effect
    }

    /// End this session, disposing everything it owns.
    pub fn end(self) {
        self.runtime.session_end(self.id);
    }
}

impl Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn session_effect_stops_at_session_end() {
        let runtime = Runtime::new();
        let shared = runtime.cell(0);
        let run_count = Arc::new(AtomicI32::new(0));

        let session = runtime.session_start(SessionId::new(1));
        let shared_clone = shared.clone();
        let run_count_clone = run_count.clone();
        let effect = session.effect(move || {
            shared_clone.get();
            run_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        shared.set(1);
        assert_eq!(run_count.load(Ordering::SeqCst), 2);

        runtime.session_end(SessionId::new(1));
        assert!(effect.is_disposed());

        shared.set(2);
        assert_eq!(run_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ending_one_session_leaves_others_running() {
        let runtime = Runtime::new();
        let shared = runtime.cell(0);

        let s1 = runtime.session_start(SessionId::new(1));
        let s2 = runtime.session_start(SessionId::new(2));

        let count1 = Arc::new(AtomicI32::new(0));
        let count2 = Arc::new(AtomicI32::new(0));

        let shared_clone = shared.clone();
        let count1_clone = count1.clone();
        let _e1 = s1.effect(move || {
            shared_clone.get();
            count1_clone.fetch_add(1, Ordering::SeqCst);
        });

        let shared_clone = shared.clone();
        let count2_clone = count2.clone();
        let _e2 = s2.effect(move || {
            shared_clone.get();
            count2_clone.fetch_add(1, Ordering::SeqCst);
        });

        s1.end();
        shared.set(7);

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 2);
        assert_eq!(runtime.session_count(), 1);
    }

    #[test]
    fn restarting_a_session_id_replaces_the_stale_session() {
        let runtime = Runtime::new();
        let id = SessionId::new(9);

        let first = runtime.session_start(id);
        let effect = first.effect(|| {});

        // Same id reconnects without a clean disconnect.
        let _second = runtime.session_start(id);

        assert!(effect.is_disposed());
        assert_eq!(runtime.session_count(), 1);
    }

    #[test]
    fn effect_created_after_session_end_is_disposed() {
        let runtime = Runtime::new();
        let session = runtime.session_start(SessionId::new(3));
        runtime.session_end(SessionId::new(3));

        let effect = session.effect(|| {});
        assert!(effect.is_disposed());
    }
}
