//! Batch Scheduler
//!
//! The scheduler is the single point that decides, per mutation, which
//! effects must re-run and in what order. Multiple mutations inside one
//! logical transaction collapse into one effect pass.
//!
//! # Algorithm
//!
//! 1. Writes enqueue affected effects in FIFO order. Enqueueing is
//!    idempotent within a batch: an effect's state machine admits one
//!    pending slot at a time, so N writes to its inputs cost one run.
//!
//! 2. One thread at a time drains the queue. A thread that finds a drain
//!    already in flight just leaves its entries behind; they are picked up
//!    by the same batch. Writes issued *inside* effect bodies land in the
//!    same batch too, so cascades settle in a single pass.
//!
//! 3. The drain is bounded. A batch that keeps scheduling work past
//!    `max_batch_effects` is declared cyclic: the remaining queue entries
//!    are dropped (for that batch only), the error is logged, and the
//!    report says so. Later batches run normally.
//!
//! 4. After the drain completes (never mid-mutation), the registered
//!    [`BatchObserver`] receives a [`BatchReport`] listing each effect
//!    that ran, with its owner, so a transport layer knows which remote
//!    sessions need a refresh.
//!
//! Effect bodies run outside every engine lock, and each body is isolated:
//! a panicking subscriber is logged and the batch moves on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::EngineError;
use crate::reactive::{Runtime, SubscriberId};
use crate::session::EffectOwner;

/// One effect execution inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectRun {
    /// The effect that ran.
    pub effect: SubscriberId,
    /// Whose view the run belongs to.
    pub owner: EffectOwner,
}

/// What happened during one drain of the pending-effect queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// Every effect that ran, in execution (FIFO) order.
    pub effects: Vec<EffectRun>,
    /// Set when the batch hit the cycle bound and was cut short.
    pub cycle: Option<EngineError>,
}

impl BatchReport {
    /// True when nothing ran and nothing went wrong.
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty() && self.cycle.is_none()
    }
}

/// Render/transport collaborator: receives, per batch, the set of effects
/// that ran. Invoked at most once per effect per batch, never mid-mutation.
pub trait BatchObserver: Send + Sync {
    /// Called after a non-empty batch finishes draining.
    fn on_batch(&self, report: &BatchReport);
}

/// Pending-effect queue plus the one-drainer-at-a-time coordination flag.
pub(crate) struct Scheduler {
    queue: Mutex<VecDeque<SubscriberId>>,
    draining: AtomicBool,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Append an effect to the pending queue.
    ///
    /// The caller has already won the effect's Scheduled slot, so the
    /// queue never holds duplicates.
    pub(crate) fn enqueue(&self, id: SubscriberId) {
        self.queue.lock().push_back(id);
        tracing::trace!(subscriber = id.raw(), "effect enqueued");
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drain the queue as one batch.
    ///
    /// Returns immediately if another thread is already draining; the
    /// enqueued work joins that thread's batch.
    pub(crate) fn run_batch(&self, runtime: &Runtime) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }

            let report = self.drain(runtime);

            if !report.is_empty() {
                if report.effects.len() > runtime.config().warn_batch_effects {
                    tracing::warn!(effects = report.effects.len(), "unusually large batch");
                }
                tracing::debug!(effects = report.effects.len(), "batch complete");
                // Delivered with the drain flag still held: anything the
                // observer writes lands in the queue and opens the next
                // batch iteratively, on this thread, instead of recursing.
                if let Some(observer) = runtime.observer() {
                    observer.on_batch(&report);
                }
            }

            self.draining.store(false, Ordering::SeqCst);

            // An enqueue may have raced the flag reset; loop if anything
            // is left so no effect is stranded until the next write.
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn drain(&self, runtime: &Runtime) -> BatchReport {
        let limit = runtime.config().max_batch_effects;
        let mut report = BatchReport::default();

        loop {
            let next = self.queue.lock().pop_front();
            let Some(id) = next else {
                break;
            };

            if report.effects.len() == limit {
                report.cycle = Some(self.abort_cycle(runtime, id, limit));
                break;
            }

            let Some(subscriber) = runtime.subscriber(id) else {
                continue;
            };
            if !subscriber.is_eager() {
                continue;
            }
            // The body runs outside every queue lock; a write inside it
            // re-enters `enqueue` and extends this same batch.
            if subscriber.execute() {
                report.effects.push(EffectRun {
                    effect: id,
                    owner: subscriber.owner(),
                });
            }
        }

        report
    }

    /// The batch exceeded its bound: drop the popped entry and everything
    /// still queued, resetting their Scheduled slots so future writes can
    /// wake them again.
    fn abort_cycle(&self, runtime: &Runtime, popped: SubscriberId, limit: usize) -> EngineError {
        let mut dropped = 1;
        if let Some(subscriber) = runtime.subscriber(popped) {
            subscriber.clear_scheduled();
        }

        let remaining: Vec<SubscriberId> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        for id in remaining {
            if let Some(subscriber) = runtime.subscriber(id) {
                subscriber.clear_scheduled();
            }
            dropped += 1;
        }

        let err = EngineError::EffectCycleDetected { limit, dropped };
        tracing::error!(%err, "batch aborted");
        err
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicI32;
    use std::sync::Arc;

    struct Recorder {
        reports: PlMutex<Vec<BatchReport>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reports: PlMutex::new(Vec::new()),
            })
        }
    }

    impl BatchObserver for Recorder {
        fn on_batch(&self, report: &BatchReport) {
            self.reports.lock().push(report.clone());
        }
    }

    #[test]
    fn observer_sees_each_effect_once_per_batch() {
        let runtime = Runtime::new();
        let recorder = Recorder::new();
        runtime.set_batch_observer(recorder.clone());

        let a = runtime.cell(0);
        let b = runtime.cell(0);

        let a_clone = a.clone();
        let b_clone = b.clone();
        let effect = runtime.effect(move || {
            a_clone.get();
            b_clone.get();
        });

        runtime.batch(|| {
            a.set(1);
            b.set(1);
        });

        let reports = recorder.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].effects.len(), 1);
        assert_eq!(reports[0].effects[0].effect, effect.subscriber_id());
        assert!(reports[0].cycle.is_none());
    }

    #[test]
    fn effects_run_in_fifo_order() {
        let runtime = Runtime::new();
        let trigger = runtime.cell(0);
        let order = Arc::new(PlMutex::new(Vec::new()));

        let mut effects = Vec::new();
        for tag in 0..4 {
            let trigger_clone = trigger.clone();
            let order_clone = order.clone();
            effects.push(runtime.effect(move || {
                trigger_clone.get();
                order_clone.lock().push(tag);
            }));
        }
        order.lock().clear();

        trigger.set(1);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn cascading_write_joins_the_same_batch() {
        let runtime = Runtime::new();
        let recorder = Recorder::new();
        runtime.set_batch_observer(recorder.clone());

        let first = runtime.cell(0);
        let second = runtime.cell(0);
        let seen = Arc::new(AtomicI32::new(-1));

        let first_clone = first.clone();
        let second_writer = second.clone();
        let _forwarder = runtime.effect(move || {
            let v = first_clone.get();
            second_writer.set(v * 10);
        });

        let second_clone = second.clone();
        let seen_clone = seen.clone();
        let _reader = runtime.effect(move || {
            seen_clone.store(second_clone.get(), Ordering::SeqCst);
        });

        let baseline = recorder.reports.lock().len();
        first.set(3);

        assert_eq!(seen.load(Ordering::SeqCst), 30);
        // One mutation, one batch: the cascade did not open a second one.
        assert_eq!(recorder.reports.lock().len(), baseline + 1);
    }

    #[test]
    fn cyclic_effects_abort_the_batch_only() {
        let config = RuntimeConfig {
            max_batch_effects: 8,
            ..RuntimeConfig::default()
        };
        let runtime = Runtime::with_config(config);
        let recorder = Recorder::new();
        runtime.set_batch_observer(recorder.clone());

        let counter = runtime.cell(0_i64);

        // Reads and writes the same cell: never settles.
        let counter_clone = counter.clone();
        let _cyclic = runtime.effect(move || {
            let v = counter_clone.get();
            counter_clone.set(v + 1);
        });

        counter.set(100);

        {
            let reports = recorder.reports.lock();
            let last = reports.last().expect("a batch ran");
            match &last.cycle {
                Some(EngineError::EffectCycleDetected { limit, dropped }) => {
                    assert_eq!(*limit, 8);
                    assert!(*dropped >= 1);
                }
                other => panic!("expected cycle error, got {other:?}"),
            }
        }

        // The engine keeps serving after the aborted batch.
        let healthy = runtime.cell(0);
        let ran = Arc::new(AtomicI32::new(0));
        let healthy_clone = healthy.clone();
        let ran_clone = ran.clone();
        let _ok = runtime.effect(move || {
            healthy_clone.get();
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        healthy.set(1);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn report_serializes_for_transport() {
        let report = BatchReport {
            effects: vec![EffectRun {
                effect: SubscriberId::new(),
                owner: EffectOwner::Global,
            }],
            cycle: None,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("effects"));
    }
}
