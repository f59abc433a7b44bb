//! # cnfl-sync
//!
//! Realtime snapshot store and session layer for the CNFL fantasy cricket
//! league.
//!
//! The store loads all ten league collections from the backend in one
//! batch, then keeps an in-memory [`Snapshot`](domain::Snapshot) current by
//! reconciling every row change the backend publishes. Readers get cheap,
//! consistent snapshots; writers go straight to the backend and see their
//! change arrive through the same stream as everyone else's. The session
//! manager tracks the signed-in user and resolves the profile row behind
//! each credential identity.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP, WebSocket)
//!     │
//!     ├── REST Handlers (api/)
//!     ├── WS Handler (ws/)
//!     │
//!     ├── SnapshotStore, SessionManager (service/)
//!     ├── Snapshot, ChangeEvent, EventBus (domain/)
//!     │
//!     └── DataGateway, AuthGateway (gateway/)
//!           ├── PostgreSQL + LISTEN/NOTIFY
//!           ├── GoTrue auth REST
//!           └── in-memory backend
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod service;
pub mod ws;
