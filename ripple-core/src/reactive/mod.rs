//! Reactive Primitives
//!
//! This module implements the core reactive system: cells, computed nodes,
//! and effects. These primitives form the foundation of Ripple's
//! fine-grained propagation.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell is a versioned container for mutable state. When a cell is read
//! within a tracking context (a computed node or an effect), the read is
//! recorded so the computation is subscribed to the cell. When the value
//! changes, subscribers are invalidated and effects are scheduled.
//!
//! ## Computed nodes
//!
//! A Computed is a derived value that caches its result. It is invalidated
//! eagerly when an input changes but re-evaluates lazily, on the next
//! read. Computed nodes are useful for derived views that not every
//! subscriber needs on every change.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that re-runs whenever its
//! dependencies change. Effects synchronize reactive state with the
//! outside world, mostly by pushing a refreshed view fragment toward a
//! client.
//!
//! # Implementation Notes
//!
//! Dependency detection is automatic: reads are recorded against a
//! thread-local tracking context with an RAII guard that restores the
//! previous context on exit (this "transparent reactivity" approach is
//! the one used by SolidJS, Vue 3, and Leptos). Cross-session state lives
//! in [`crate::shared::SharedRegistry`], not in plain cells; the
//! concurrency discipline is visible in the type.

mod cell;
mod computed;
mod context;
mod effect;
mod runtime;
mod subscriber;

pub use cell::{Cell, WriteOutcome};
pub use computed::Computed;
pub use context::TrackingContext;
pub use effect::{Effect, EffectState};
pub use runtime::{CellKind, Reactive, Runtime};
pub use subscriber::{CellId, SubscriberId};
