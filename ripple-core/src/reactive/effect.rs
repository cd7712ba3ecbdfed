//! Effect Implementation
//!
//! An Effect is a side-effecting subscriber that re-runs whenever any cell
//! it read during its last run changes. It owns no return value.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its body immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the effect is enqueued on the
//!    scheduler. Enqueueing is idempotent within a batch: an effect
//!    scheduled twice before the batch drains runs once.
//!
//! 3. Each run replaces the previous dependency set with the freshly
//!    captured one, so an effect that stops reading a cell stops being
//!    woken by it.
//!
//! # State machine
//!
//! ```text
//! Idle -> Scheduled -> Running -> Idle
//!   \________\____________\____-> Disposed (terminal)
//! ```
//!
//! Transitions are atomic compare-and-swaps, which is what makes
//! scheduling idempotent and disposal a cancellation boundary: a disposed
//! effect already sitting in the queue is skipped, not run.
//!
//! # Differences from Computed
//!
//! - Computed nodes return a value; effects do not.
//! - Computed nodes are lazy (evaluate on access); effects are eager
//!   (scheduled when deps change).
//! - A panicking effect body is caught and logged by its runner; it never
//!   takes the rest of the batch down with it.

use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::panic_message;
use crate::session::EffectOwner;

use super::context::TrackingContext;
use super::runtime::{Reactive, Runtime};
use super::subscriber::SubscriberId;

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const DISPOSED: u8 = 3;

/// Lifecycle state of an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectState {
    /// Not pending and not running.
    Idle,
    /// Enqueued for the current or next batch.
    Scheduled,
    /// Body currently executing.
    Running,
    /// Permanently torn down; never runs again.
    Disposed,
}

fn decode_state(raw: u8) -> EffectState {
    match raw {
        IDLE => EffectState::Idle,
        SCHEDULED => EffectState::Scheduled,
        RUNNING => EffectState::Running,
        _ => EffectState::Disposed,
    }
}

/// A side-effecting subscriber that re-runs when its dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = Runtime::new();
/// let count = runtime.cell(0);
///
/// let count_for_effect = count.clone();
/// let effect = runtime.effect(move || {
///     println!("count is {}", count_for_effect.get());
/// });
///
/// count.set(5); // body re-runs with the new value
/// # drop(effect);
/// ```
///
/// The returned handle (or the owning session) keeps the effect alive;
/// once every handle is dropped the runtime stops scheduling it.
pub struct Effect {
    inner: Arc<EffectInner>,
}

pub(crate) struct EffectInner {
    subscriber_id: SubscriberId,
    owner: EffectOwner,
    body: Box<dyn Fn() + Send + Sync>,
    state: AtomicU8,
    run_count: AtomicU64,
    runtime: Runtime,
}

impl Effect {
    /// Create a new effect and run it once to establish dependencies.
    pub(crate) fn new<F>(runtime: &Runtime, owner: EffectOwner, body: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let inner = Arc::new(EffectInner {
            subscriber_id: SubscriberId::new(),
            owner,
            body: Box::new(body),
            state: AtomicU8::new(IDLE),
            run_count: AtomicU64::new(0),
            runtime: runtime.clone(),
        });

        runtime.register_subscriber(inner.clone() as Arc<dyn Reactive>);

        // Run immediately to establish dependencies
        inner.execute();

        Self { inner }
    }

    /// Get the effect's subscriber ID.
    pub fn subscriber_id(&self) -> SubscriberId {
        self.inner.subscriber_id
    }

    /// Who owns this effect's lifetime.
    pub fn owner(&self) -> EffectOwner {
        self.inner.owner
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EffectState {
        decode_state(self.inner.state.load(Ordering::SeqCst))
    }

    /// Dispose of the effect.
    ///
    /// After disposal the effect never runs again, even if it is already
    /// enqueued, and it is deregistered from every cell it depended on.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == DISPOSED
    }

    /// Get the number of times the effect body has run.
    pub fn run_count(&self) -> u64 {
        self.inner.run_count.load(Ordering::SeqCst)
    }
}

impl EffectInner {
    /// Run the body inside a tracking context and swap in the freshly
    /// captured dependency set. Returns false when the effect was disposed
    /// before it could claim the run.
    pub(crate) fn execute(&self) -> bool {
        // Claim Running from whatever live state we were enqueued in.
        loop {
            let current = self.state.load(Ordering::SeqCst);
            if current == DISPOSED {
                return false;
            }
            if self
                .state
                .compare_exchange(current, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let ctx = TrackingContext::enter(self.subscriber_id);
        let result = catch_unwind(AssertUnwindSafe(|| (self.body)()));
        let reads = TrackingContext::captured_reads();
        drop(ctx);

        match result {
            Ok(()) => {
                self.runtime
                    .replace_dependencies(self.subscriber_id, reads);
            }
            Err(payload) => {
                // Keep the previous subscriptions so a later input change
                // gives the effect another chance to run cleanly.
                tracing::warn!(
                    subscriber = self.subscriber_id.raw(),
                    panic = %panic_message(payload.as_ref()),
                    "effect body panicked; batch continues"
                );
            }
        }

        self.run_count.fetch_add(1, Ordering::SeqCst);

        // Running -> Idle, unless we were re-scheduled or disposed mid-run.
        let _ = self
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::SeqCst, Ordering::SeqCst);
        true
    }

    pub(crate) fn dispose(&self) {
        let prev = self.state.swap(DISPOSED, Ordering::SeqCst);
        if prev != DISPOSED {
            self.runtime.remove_subscriber(self.subscriber_id);
            tracing::trace!(subscriber = self.subscriber_id.raw(), "effect disposed");
        }
    }
}

impl Reactive for EffectInner {
    fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    fn mark_dirty(&self) {
        // Effects carry no memoized value; scheduling is the whole story.
    }

    fn try_schedule(&self) -> bool {
        loop {
            match self.state.load(Ordering::SeqCst) {
                DISPOSED | SCHEDULED => return false,
                current => {
                    // Idle and Running both move to Scheduled: a dependency
                    // written mid-run means the body must run again.
                    if self
                        .state
                        .compare_exchange(current, SCHEDULED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return true;
                    }
                }
            }
        }
    }

    fn clear_scheduled(&self) {
        let _ = self
            .state
            .compare_exchange(SCHEDULED, IDLE, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn execute(&self) -> bool {
        EffectInner::execute(self)
    }

    fn is_eager(&self) -> bool {
        true
    }

    fn owner(&self) -> EffectOwner {
        self.owner
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("subscriber_id", &self.inner.subscriber_id)
            .field("owner", &self.inner.owner)
            .field("state", &self.state())
            .field("run_count", &self.run_count())
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
    fn effect_runs_on_creation() {
        let runtime = Runtime::new();
        let run_count = Arc::new(AtomicI32::new(0));
        let run_count_clone = run_count.clone();

        let _effect = runtime.effect(move || {
            run_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(run_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn effect_reruns_when_dependency_changes() {
        let runtime = Runtime::new();
        let cell = runtime.cell(0);
        let observed = Arc::new(AtomicI32::new(-1));

        let cell_clone = cell.clone();
        let observed_clone = observed.clone();
        let effect = runtime.effect(move || {
            observed_clone.store(cell_clone.get(), Ordering::SeqCst);
        });

        assert_eq!(observed.load(Ordering::SeqCst), 0);

        cell.set(42);
        assert_eq!(observed.load(Ordering::SeqCst), 42);
        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn ignored_write_does_not_rerun_effect() {
        let runtime = Runtime::new();
        let cell = runtime.cell(5);
        let run_count = Arc::new(AtomicI32::new(0));

        let cell_clone = cell.clone();
        let run_count_clone = run_count.clone();
        let _effect = runtime.effect(move || {
            cell_clone.get();
            run_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        cell.set(5);
        assert_eq!(run_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn effect_does_not_run_after_disposal() {
        let runtime = Runtime::new();
        let cell = runtime.cell(0);
        let run_count = Arc::new(AtomicI32::new(0));

        let cell_clone = cell.clone();
        let run_count_clone = run_count.clone();
        let effect = runtime.effect(move || {
            cell_clone.get();
            run_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(run_count.load(Ordering::SeqCst), 1);

        effect.dispose();
        assert!(effect.is_disposed());
        assert_eq!(effect.state(), EffectState::Disposed);

        cell.set(1);
        cell.set(2);
        assert_eq!(run_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn effect_stops_watching_abandoned_branch() {
        let runtime = Runtime::new();
        let which = runtime.cell(false);
        let a = runtime.cell(1);
        let b = runtime.cell(10);
        let run_count = Arc::new(AtomicI32::new(0));

        let which_clone = which.clone();
        let a_clone = a.clone();
        let b_clone = b.clone();
        let run_count_clone = run_count.clone();
        let _effect = runtime.effect(move || {
            if which_clone.get() {
                b_clone.get();
            } else {
                a_clone.get();
            }
            run_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(run_count.load(Ordering::SeqCst), 1);

        which.set(true);
        assert_eq!(run_count.load(Ordering::SeqCst), 2);

        // `a` is no longer read; writing it must not wake the effect.
        a.set(99);
        assert_eq!(run_count.load(Ordering::SeqCst), 2);

        b.set(11);
        assert_eq!(run_count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_effect_is_contained() {
        let runtime = Runtime::new();
        let cell = runtime.cell(0);

        let cell_clone = cell.clone();
        let effect = runtime.effect(move || {
            if cell_clone.get() == 1 {
                panic!("bad state");
            }
        });

        // The panic is caught; the write itself must not unwind.
        cell.set(1);
        assert_eq!(effect.run_count(), 2);

        // And the effect keeps its subscription, so it can recover.
        cell.set(2);
        assert_eq!(effect.run_count(), 3);
    }

    #[test]
    fn effect_clone_shares_state() {
        let runtime = Runtime::new();
        let effect1 = runtime.effect(|| {});
        let effect2 = effect1.clone();

        assert_eq!(effect1.subscriber_id(), effect2.subscriber_id());

        effect1.dispose();
        assert!(effect2.is_disposed());
    }
}
