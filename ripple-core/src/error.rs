//! Engine error taxonomy.
//!
//! Only two conditions are errors at all. An absent shared-registry key is
//! a normal transient state (a session disconnecting, a row not yet
//! published) and is represented as `None`, never as an error. A panicking
//! effect body is isolated and logged by the scheduler; it fails only its
//! own view fragment.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the propagation engine.
///
/// Serializable so a [`BatchReport`](crate::scheduler::BatchReport) can
/// carry one across the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum EngineError {
    /// A batch ran more effect executions than the configured bound allows.
    ///
    /// Fatal to that batch only: the remaining queue entries are dropped
    /// and the process keeps serving later batches.
    #[error("effect batch exceeded {limit} runs; {dropped} pending effects dropped")]
    EffectCycleDetected {
        /// The configured execution bound that was exceeded.
        limit: usize,
        /// How many pending effects were discarded with the batch.
        dropped: usize,
    },

    /// A user-supplied compute function panicked during evaluation.
    ///
    /// The computed node stays dirty and no stale cached value is served.
    #[error("computed evaluation panicked: {message}")]
    ComputedPanicked {
        /// The panic payload, rendered as text.
        message: String,
    },
}

/// Render a panic payload as text for logging and error reporting.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_display_names_limit_and_dropped() {
        let err = EngineError::EffectCycleDetected {
            limit: 100,
            dropped: 3,
        };
        let text = err.to_string();
        assert!(text.contains("100"));
        assert!(text.contains("3"));
    }

    #[test]
    fn panic_message_downcasts_common_payloads() {
        let owned: Box<dyn std::any::Any + Send> = Box::new("static str".to_string());
        assert_eq!(panic_message(owned.as_ref()), "static str");

        let borrowed: Box<dyn std::any::Any + Send> = Box::new("literal");
        assert_eq!(panic_message(borrowed.as_ref()), "literal");

        let opaque: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(opaque.as_ref()), "unknown panic");
    }
}
