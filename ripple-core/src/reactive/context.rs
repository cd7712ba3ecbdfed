//! Tracking Context
//!
//! The tracking context records which computation is currently running.
//! This enables automatic dependency tracking: when a cell is read, the
//! engine can register the current computation as a dependent.
//!
//! # Implementation
//!
//! We use a thread-local stack to track the currently executing computation.
//! When entering a tracking context (e.g., running a computed node or an
//! effect), we push an entry onto the stack. When the computation completes,
//! the RAII guard pops it, including on panic, so the stack can never be
//! left holding a dead computation.
//!
//! This design supports nested contexts (e.g., an effect that reads a
//! computed node, which reads further cells during its own evaluation).
//! Reads always attribute to the innermost context.

use std::cell::RefCell;

use super::subscriber::{CellId, SubscriberId};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the tracking context stack.
#[derive(Debug, Clone)]
struct ContextEntry {
    /// The subscriber ID of the current computation.
    subscriber_id: SubscriberId,
    /// Cell ids read during this computation, in read order.
    reads: Vec<CellId>,
}

/// Guard that pops the context when dropped.
///
/// This ensures the context stack is properly maintained even if
/// the computation panics.
pub struct TrackingContext {
    subscriber_id: SubscriberId,
}

impl TrackingContext {
    /// Enter a new tracking context for the given subscriber.
    ///
    /// While this context is active, any cell that is read on this thread
    /// is recorded as a dependency of the subscriber.
    ///
    /// The context is automatically exited when the returned guard is dropped.
    pub fn enter(subscriber_id: SubscriberId) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                subscriber_id,
                reads: Vec::new(),
            });
        });

        Self { subscriber_id }
    }

    /// Check if there is an active tracking context on this thread.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// Get the current subscriber ID, if any.
    pub fn current_subscriber() -> Option<SubscriberId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().map(|entry| entry.subscriber_id))
    }

    /// Record a read of the given cell.
    ///
    /// This is called by cells when they are read.
    pub fn track(cell_id: CellId) {
        CONTEXT_STACK.with(|stack| {
            if let Some(entry) = stack.borrow_mut().last_mut() {
                entry.reads.push(cell_id);
            }
        });
    }

    /// Get the cells read so far in the current context.
    ///
    /// Duplicates are preserved; the runtime dedups when it swaps a
    /// subscriber's dependency set.
    pub fn captured_reads() -> Vec<CellId> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|entry| entry.reads.clone())
                .unwrap_or_default()
        })
    }
}

impl Drop for TrackingContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Verify we're popping the right context.
            // This helps catch bugs where contexts are mismatched.
            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.subscriber_id, self.subscriber_id,
                    "TrackingContext mismatch: expected {:?}, got {:?}",
                    self.subscriber_id, entry.subscriber_id
                );
            }
        });
    }
}
