//! Service layer: the snapshot store and the session manager.
//!
//! [`SnapshotStore`] keeps the mirrored collections current from the
//! gateway's change stream and emits applied changes through the
//! [`super::domain::EventBus`]. [`SessionManager`] tracks the signed-in
//! identity and its profile.

pub mod session_manager;
pub mod snapshot_store;

pub use session_manager::{AuthState, SessionManager, SessionPhase};
pub use snapshot_store::{LoadState, SnapshotStore, StoreOptions};
