//! Shared Cross-Session State
//!
//! Cells local to one session need no cross-session coordination; state
//! that every connected session observes lives in a [`SharedRegistry`]
//! instead. The registry is the longest-lived structure in the system:
//! entries survive until removed explicitly or until the session that
//! contributed them ends.

mod registry;

pub use registry::{RegistryTxn, SharedRegistry};

use crate::session::SessionId;

/// Purge hook the runtime calls when a session ends.
///
/// Implemented by every shared registry; entries contributed by the dead
/// session are removed as one atomic transition.
pub(crate) trait SharedPurge: Send + Sync {
    fn purge_session(&self, session: SessionId);
}
