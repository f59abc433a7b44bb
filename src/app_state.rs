//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::service::SnapshotStore;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The live snapshot and its applied-change bus.
    pub store: Arc<SnapshotStore>,
}

impl AppState {
    /// Wraps a store.
    #[must_use]
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self { store }
    }
}
