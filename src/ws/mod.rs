//! WebSocket layer: connection handling, message routing, subscriptions.
//!
//! The endpoint at `/ws` lets clients follow applied changes per
//! collection and fetch collection contents on demand.

pub mod connection;
pub mod handler;
pub mod messages;
pub mod subscription;
