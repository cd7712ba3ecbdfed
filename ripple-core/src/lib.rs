//! Ripple Core
//!
//! This crate provides the reactive signal propagation engine behind the
//! Ripple session framework. It implements:
//!
//! - Reactive primitives (cells, computed nodes, effects)
//! - Automatic dependency tracking and batched change propagation
//! - Shared registries: keyed state visible to every connected session
//! - Session lifecycle plumbing (local namespaces, owned-effect teardown)
//!
//! State lives in process memory for the life of the application; there is
//! no persistence and no replication here. The transport that pushes a
//! refreshed view to a remote client, and the layer that renders values
//! into widgets, are collaborators behind two small contracts:
//! [`scheduler::BatchObserver`] (told what ran, once per batch) and the
//! session hooks [`Runtime::session_start`] / [`Runtime::session_end`].
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: core primitives and dependency tracking
//! - `scheduler`: the pending-effect queue and batch drain loop
//! - `shared`: cross-session registries with atomic multi-key mutation
//! - `session`: session identity, ownership, and teardown
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::{Runtime, SessionId};
//!
//! let runtime = Runtime::new();
//! let scores = runtime.registry::<i64>();
//!
//! // One session publishes...
//! let alice = runtime.session_start(SessionId::new(1));
//! scores.put_owned(alice.id(), "alice", 0);
//!
//! // ...another session watches.
//! let bob = runtime.session_start(SessionId::new(2));
//! let scores_for_bob = scores.clone();
//! let _view = bob.effect(move || {
//!     for (name, score) in scores_for_bob.snapshot() {
//!         println!("{name}: {score}");
//!     }
//! });
//!
//! scores.put("alice", 10); // bob's effect re-runs with the new row
//! ```

pub mod config;
pub mod error;
pub mod reactive;
pub mod scheduler;
pub mod session;
pub mod shared;

pub use config::RuntimeConfig;
pub use error::EngineError;
pub use reactive::{
    Cell, CellId, CellKind, Computed, Effect, EffectState, Runtime, SubscriberId, TrackingContext,
    WriteOutcome,
};
pub use scheduler::{BatchObserver, BatchReport, EffectRun};
pub use session::{EffectOwner, SessionHandle, SessionId};
pub use shared::{RegistryTxn, SharedRegistry};
