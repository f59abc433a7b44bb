//! Remote gateway contract: row CRUD, credentials, and change streams.
//!
//! The core only talks to a backend through [`DataGateway`] and
//! [`AuthGateway`]. Implementations:
//!
//! - [`memory::MemoryBackend`]: in-process backend for tests and local runs.
//! - [`postgres::PgGateway`]: PostgreSQL via `sqlx`, changes via `LISTEN`.
//! - [`gotrue::GoTrueAuth`]: Supabase-compatible auth REST API.

pub mod gotrue;
pub mod memory;
pub mod postgres;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};

use crate::domain::{Collection, OrderBy, RawChange, RecordId};
use crate::error::GatewayError;

pub use gotrue::GoTrueAuth;
pub use memory::MemoryBackend;
pub use postgres::PgGateway;

/// Capacity of the session notification channel.
const SESSION_CHANNEL_CAPACITY: usize = 64;

/// Row-level access to the hosted relational store.
///
/// Rows travel as JSON objects; typing happens in the store.
#[async_trait]
pub trait DataGateway: Send + Sync + fmt::Debug {
    /// Reads every row of a collection, optionally ordered.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] or [`GatewayError::Authorization`].
    async fn read_all(
        &self,
        collection: Collection,
        order: Option<OrderBy>,
    ) -> Result<Vec<Value>, GatewayError>;

    /// Reads at most one row; `None` when the collection is empty.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] or [`GatewayError::Authorization`].
    async fn read_single(&self, collection: Collection) -> Result<Option<Value>, GatewayError>;

    /// Reads one row by primary key.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] or [`GatewayError::Authorization`].
    async fn read_by_id(
        &self,
        collection: Collection,
        id: &RecordId,
    ) -> Result<Option<Value>, GatewayError>;

    /// Inserts a row and returns it as stored, with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Constraint`] on schema or key violations,
    /// [`GatewayError::Transport`] otherwise.
    async fn insert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError>;

    /// Inserts several rows atomically.
    ///
    /// # Errors
    ///
    /// As [`DataGateway::insert`]; no row is stored on failure.
    async fn insert_many(
        &self,
        collection: Collection,
        records: Vec<Value>,
    ) -> Result<Vec<Value>, GatewayError>;

    /// Applies a partial update and returns the updated row.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] if no row has `id`.
    async fn update(
        &self,
        collection: Collection,
        id: &RecordId,
        patch: Value,
    ) -> Result<Value, GatewayError>;

    /// Inserts or replaces the single row of a singleton collection.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Constraint`] or [`GatewayError::Transport`].
    async fn upsert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError>;

    /// Deletes a row.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] if no row has `id`.
    async fn delete(&self, collection: Collection, id: &RecordId) -> Result<(), GatewayError>;

    /// Subscribes to the change stream. Dropping the receiver unsubscribes.
    ///
    /// Changes are delivered in commit order, at most once.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the stream cannot be opened.
    async fn subscribe_changes(&self) -> Result<broadcast::Receiver<RawChange>, GatewayError>;
}

/// Credential and session operations of the hosted auth provider.
#[async_trait]
pub trait AuthGateway: Send + Sync + fmt::Debug {
    /// The session currently held, if any.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the session cannot be resolved.
    async fn current_session(&self) -> Result<Option<Session>, GatewayError>;

    /// Verifies credentials and opens a session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Authorization`] for bad credentials.
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, GatewayError>;

    /// Creates a credential identity.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Constraint`] if the email is taken.
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthIdentity, GatewayError>;

    /// Invalidates the current session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the provider cannot be reached;
    /// the local session is cleared regardless.
    async fn sign_out(&self) -> Result<(), GatewayError>;

    /// Changes the password of the signed-in identity.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Authorization`] without a session.
    async fn update_password(&self, new_password: &str) -> Result<(), GatewayError>;

    /// Exchanges the refresh token for a new session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Authorization`] without a session.
    async fn refresh_session(&self) -> Result<Session, GatewayError>;

    /// Subscribes to session notifications.
    fn session_changes(&self) -> broadcast::Receiver<SessionChange>;
}

/// Raw authentication identity, distinct from the application profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthIdentity {
    /// Identity id; the profile row shares it.
    pub id: RecordId,
    /// Email the identity was registered with.
    #[serde(default)]
    pub email: Option<String>,
}

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token for API calls.
    pub access_token: String,
    /// Token used to renew the session.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry of `access_token`.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Identity the session belongs to.
    pub user: AuthIdentity,
}

/// Kind of session notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEventKind {
    /// Session restored on startup.
    InitialSession,
    /// Credentials accepted.
    SignedIn,
    /// Session ended.
    SignedOut,
    /// Access token renewed.
    TokenRefreshed,
    /// Identity attributes (e.g. password) changed.
    UserUpdated,
    /// Password recovery link followed.
    PasswordRecovery,
}

impl SessionEventKind {
    /// Whether this notification ends the session manager's loading phase.
    #[must_use]
    pub const fn settles_loading(self) -> bool {
        matches!(
            self,
            Self::InitialSession | Self::SignedIn | Self::SignedOut | Self::UserUpdated
        )
    }
}

/// A session transition announced by an [`AuthGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    /// What happened.
    pub kind: SessionEventKind,
    /// Session after the transition.
    pub session: Option<Session>,
}

/// Current session plus the channel announcing its transitions.
///
/// Shared by the auth gateways so that every transition is stored and
/// broadcast in one place.
#[derive(Debug)]
pub(crate) struct SessionSlot {
    current: RwLock<Option<Session>>,
    changes: broadcast::Sender<SessionChange>,
}

impl SessionSlot {
    pub(crate) fn new() -> Self {
        let (changes, _) = broadcast::channel(SESSION_CHANNEL_CAPACITY);
        Self {
            current: RwLock::new(None),
            changes,
        }
    }

    pub(crate) async fn get(&self) -> Option<Session> {
        self.current.read().await.clone()
    }

    /// Stores `session` and announces the transition.
    pub(crate) async fn set(&self, kind: SessionEventKind, session: Option<Session>) {
        *self.current.write().await = session.clone();
        let _ = self.changes.send(SessionChange { kind, session });
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn only_four_kinds_settle_loading() {
        let settling: Vec<_> = [
            SessionEventKind::InitialSession,
            SessionEventKind::SignedIn,
            SessionEventKind::SignedOut,
            SessionEventKind::TokenRefreshed,
            SessionEventKind::UserUpdated,
            SessionEventKind::PasswordRecovery,
        ]
        .into_iter()
        .filter(|k| k.settles_loading())
        .collect();
        assert_eq!(settling.len(), 4);
        assert!(!SessionEventKind::TokenRefreshed.settles_loading());
    }

    #[tokio::test]
    async fn session_slot_stores_and_announces() {
        let slot = SessionSlot::new();
        let mut rx = slot.subscribe();
        let session = Session {
            access_token: "token".to_string(),
            refresh_token: None,
            expires_at: None,
            user: AuthIdentity {
                id: "u1".into(),
                email: Some("a@b.c".to_string()),
            },
        };
        slot.set(SessionEventKind::SignedIn, Some(session.clone())).await;

        assert_eq!(slot.get().await, Some(session));
        let Ok(change) = rx.recv().await else {
            panic!("expected a session change");
        };
        assert_eq!(change.kind, SessionEventKind::SignedIn);
    }
}
