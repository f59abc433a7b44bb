//! Session manager: tracks the signed-in identity and its profile row.
//!
//! The manager moves through `Uninitialized -> Loading ->
//! {Authenticated(profile), Anonymous}`. Every session notification from the
//! [`AuthGateway`] re-resolves the profile; only the settling kinds (see
//! [`crate::gateway::SessionEventKind::settles_loading`]) end the loading phase.
//! Operations return errors, but the identity itself is only ever written by
//! the notification path, by `logout`, and by profile refreshes.

use std::sync::{Arc, Weak};

use serde_json::Map;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

use crate::domain::{AppliedChange, ChangeKind, Collection, RecordId, Role, UserProfile};
use crate::error::{AuthError, GatewayError};
use crate::gateway::{AuthGateway, DataGateway, Session, SessionChange};

/// Observable session state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthState {
    /// Profile of the signed-in identity, if resolved.
    pub user: Option<UserProfile>,
    /// Whether a settling notification is still awaited.
    pub loading: bool,
    /// Whether [`SessionManager::start`] has run.
    pub started: bool,
}

/// Phase derived from an [`AuthState`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPhase {
    /// `start` has not been called.
    Uninitialized,
    /// The initial session is being resolved.
    Loading,
    /// Session and profile both exist.
    Authenticated(UserProfile),
    /// No session, or a session without a readable profile.
    Anonymous,
}

impl AuthState {
    /// The state-machine phase this state represents.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        if !self.started {
            return SessionPhase::Uninitialized;
        }
        if self.loading {
            return SessionPhase::Loading;
        }
        match &self.user {
            Some(user) => SessionPhase::Authenticated(user.clone()),
            None => SessionPhase::Anonymous,
        }
    }
}

/// Owner of the current authenticated identity.
#[derive(Debug)]
pub struct SessionManager {
    auth: Arc<dyn AuthGateway>,
    data: Arc<dyn DataGateway>,
    state: watch::Sender<AuthState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    /// Creates an uninitialized manager.
    #[must_use]
    pub fn new(auth: Arc<dyn AuthGateway>, data: Arc<dyn DataGateway>) -> Self {
        let (state, _) = watch::channel(AuthState::default());
        Self {
            auth,
            data,
            state,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Resolves the current session and profile, then follows session
    /// notifications.
    ///
    /// Resolution failures are treated as "no session".
    pub async fn start(self: &Arc<Self>) {
        let changes = self.auth.session_changes();
        self.state.send_modify(|state| {
            state.started = true;
            state.loading = true;
        });

        let session = match self.auth.current_session().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "could not resolve current session");
                None
            }
        };
        let user = self.resolve_profile(session.as_ref()).await;
        tracing::info!(authenticated = user.is_some(), "session resolved");
        self.state.send_modify(|state| {
            state.user = user;
            state.loading = false;
        });

        let handle = tokio::spawn(follow_sessions(Arc::downgrade(self), changes));
        self.tasks.lock().await.push(handle);
    }

    /// Re-resolves the profile for a session notification.
    pub async fn handle_session_change(&self, change: SessionChange) {
        let user = self.resolve_profile(change.session.as_ref()).await;
        tracing::debug!(kind = ?change.kind, authenticated = user.is_some(), "session changed");
        self.state.send_modify(|state| {
            state.user = user;
            if change.kind.settles_loading() {
                state.loading = false;
            }
        });
    }

    /// Signs in. The identity is filled in by the resulting notification.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Gateway`] carrying the provider's message.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        self.auth.sign_in(email, password).await?;
        Ok(())
    }

    /// Signs out and clears the local identity, whatever the provider says.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Gateway`] if the remote sign-out failed; the
    /// local identity is cleared anyway.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let remote = self.auth.sign_out().await;
        self.state.send_modify(|state| state.user = None);
        if let Err(e) = &remote {
            tracing::warn!(error = %e, "remote sign-out failed, local session cleared");
        }
        remote.map_err(AuthError::from)
    }

    /// Creates a credential identity, then its `PARTICIPANT` profile row.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Gateway`] if the credential step fails; nothing was
    ///   created.
    /// - [`AuthError::PartialRegistration`] if the identity exists but its
    ///   profile could not be saved.
    pub async fn register(
        &self,
        full_name: &str,
        email: &str,
        fb_link: Option<&str>,
        password: &str,
    ) -> Result<(), AuthError> {
        let identity = self.auth.sign_up(email, password).await?;
        let profile = UserProfile {
            id: identity.id.clone(),
            email: email.to_string(),
            full_name: full_name.to_string(),
            role: Role::Participant,
            fb_link: fb_link.map(str::to_string),
            extra: Map::new(),
        };

        let partial = |reason: GatewayError| AuthError::PartialRegistration {
            user_id: identity.id.clone(),
            reason,
        };
        let row = serde_json::to_value(&profile)
            .map_err(|e| partial(GatewayError::Constraint(e.to_string())))?;
        if let Err(reason) = self.data.insert(Collection::Users, row).await {
            tracing::error!(user_id = %identity.id, error = %reason, "profile insert failed after sign-up");
            return Err(partial(reason));
        }
        tracing::info!(user_id = %identity.id, "registered");
        Ok(())
    }

    /// Changes the signed-in identity's password.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Validation`] for an empty password without
    /// contacting the provider, [`AuthError::Gateway`] otherwise.
    pub async fn update_password(&self, new_password: &str) -> Result<(), AuthError> {
        if new_password.is_empty() {
            return Err(AuthError::Validation(
                "Password cannot be empty".to_string(),
            ));
        }
        self.auth.update_password(new_password).await?;
        Ok(())
    }

    /// Re-reads the current identity's profile row.
    pub async fn refresh_profile(&self) {
        let session = match self.auth.current_session().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "could not resolve session for profile refresh");
                return;
            }
        };
        let user = self.resolve_profile(session.as_ref()).await;
        self.state.send_modify(|state| state.user = user);
    }

    /// Refreshes the profile whenever an applied change touches the
    /// signed-in identity's profile row.
    pub async fn follow_profile_changes(
        self: &Arc<Self>,
        changes: broadcast::Receiver<AppliedChange>,
    ) {
        let handle = tokio::spawn(follow_profiles(Arc::downgrade(self), changes));
        self.tasks.lock().await.push(handle);
    }

    /// Stops following notifications.
    pub async fn shutdown(&self) {
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.state.borrow().phase()
    }

    /// The signed-in profile, if any.
    #[must_use]
    pub fn current_user(&self) -> Option<UserProfile> {
        self.state.borrow().user.clone()
    }

    /// A receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    fn is_current_user(&self, id: &RecordId) -> bool {
        self.state
            .borrow()
            .user
            .as_ref()
            .is_some_and(|user| &user.id == id)
    }

    async fn resolve_profile(&self, session: Option<&Session>) -> Option<UserProfile> {
        let session = session?;
        let id = &session.user.id;
        match self.data.read_by_id(Collection::Users, id).await {
            Ok(Some(row)) => match serde_json::from_value(row) {
                Ok(profile) => Some(profile),
                Err(e) => {
                    tracing::warn!(user_id = %id, error = %e, "profile row does not decode");
                    None
                }
            },
            Ok(None) => {
                tracing::warn!(user_id = %id, "session has no profile row");
                None
            }
            Err(e) => {
                tracing::warn!(user_id = %id, error = %e, "profile fetch failed");
                None
            }
        }
    }
}

async fn follow_sessions(manager: Weak<SessionManager>, mut changes: broadcast::Receiver<SessionChange>) {
    loop {
        match changes.recv().await {
            Ok(change) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_session_change(change).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "session notifications lagged, refreshing profile");
                if let Some(manager) = manager.upgrade() {
                    manager.refresh_profile().await;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn follow_profiles(manager: Weak<SessionManager>, mut changes: broadcast::Receiver<AppliedChange>) {
    loop {
        match changes.recv().await {
            Ok(change) => {
                if change.collection != Collection::Users {
                    continue;
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let touches_user = change
                    .id
                    .as_ref()
                    .is_some_and(|id| manager.is_current_user(id));
                if touches_user || (change.kind == ChangeKind::Insert && manager.current_user().is_none()) {
                    manager.refresh_profile().await;
                }
            }
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::gateway::{MemoryBackend, SessionEventKind};
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const WAIT: Duration = Duration::from_secs(5);

    fn manager_over(backend: &Arc<MemoryBackend>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::clone(backend) as Arc<dyn AuthGateway>,
            Arc::clone(backend) as Arc<dyn DataGateway>,
        ))
    }

    async fn wait_for(manager: &SessionManager, predicate: impl Fn(&AuthState) -> bool) {
        let mut rx = manager.subscribe();
        let reached = tokio::time::timeout(WAIT, rx.wait_for(|state| predicate(state))).await;
        assert!(matches!(reached, Ok(Ok(_))), "state not reached in time");
    }

    #[tokio::test]
    async fn phases_follow_the_state() {
        let mut state = AuthState::default();
        assert_eq!(state.phase(), SessionPhase::Uninitialized);
        state.started = true;
        state.loading = true;
        assert_eq!(state.phase(), SessionPhase::Loading);
        state.loading = false;
        assert_eq!(state.phase(), SessionPhase::Anonymous);
        state.user = Some(UserProfile::default());
        assert!(matches!(state.phase(), SessionPhase::Authenticated(_)));
    }

    #[tokio::test]
    async fn start_without_session_is_anonymous() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_over(&backend);
        manager.start().await;
        assert_eq!(manager.phase(), SessionPhase::Anonymous);
    }

    #[tokio::test]
    async fn start_with_session_and_profile_is_authenticated() {
        let backend = Arc::new(MemoryBackend::new());
        let identity = assert_ok!(backend.sign_up("a@cnfl.lk", "secret").await);
        backend
            .seed(
                Collection::Users,
                vec![json!({"id": identity.id, "email": "a@cnfl.lk", "full_name": "Angelo", "role": "ADMIN"})],
            )
            .await;
        assert_ok!(backend.sign_in("a@cnfl.lk", "secret").await);

        let manager = manager_over(&backend);
        manager.start().await;
        let SessionPhase::Authenticated(profile) = manager.phase() else {
            panic!("expected an authenticated session");
        };
        assert!(profile.is_admin());
    }

    #[tokio::test]
    async fn session_lookup_failure_counts_as_no_session() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_auth_offline(true);
        let manager = manager_over(&backend);
        manager.start().await;
        assert_eq!(manager.phase(), SessionPhase::Anonymous);
    }

    #[tokio::test]
    async fn register_then_login_authenticates() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_over(&backend);
        manager.start().await;

        assert_ok!(
            manager
                .register("Kamindu Mendis", "k@cnfl.lk", Some("fb.com/km"), "secret")
                .await
        );
        assert_ok!(manager.login("k@cnfl.lk", "secret").await);
        wait_for(&manager, |state| state.user.is_some()).await;

        let Some(user) = manager.current_user() else {
            panic!("expected a profile");
        };
        assert_eq!(user.role, Role::Participant);
        assert_eq!(user.fb_link.as_deref(), Some("fb.com/km"));
    }

    #[tokio::test]
    async fn failed_profile_insert_is_partial_registration() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_over(&backend);
        manager.start().await;

        backend.fail_collection(Collection::Users).await;
        let err = assert_err!(manager.register("Dunith", "d@cnfl.lk", None, "secret").await);
        assert!(matches!(err, AuthError::PartialRegistration { .. }));
        backend.restore_collection(Collection::Users).await;
        assert_eq!(backend.row_count(Collection::Users).await, 0);

        let mut rx = manager.subscribe();
        assert_ok!(manager.login("d@cnfl.lk", "secret").await);
        let changed = tokio::time::timeout(WAIT, rx.changed()).await;
        assert!(matches!(changed, Ok(Ok(()))));
        assert_eq!(manager.phase(), SessionPhase::Anonymous);
    }

    #[tokio::test]
    async fn credential_failure_surfaces_message() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_over(&backend);
        manager.start().await;

        let err = assert_err!(manager.login("nobody@cnfl.lk", "x").await);
        assert_eq!(err.to_string(), "Invalid login credentials");

        assert_ok!(backend.sign_up("taken@cnfl.lk", "x").await);
        let err = assert_err!(manager.register("T", "taken@cnfl.lk", None, "y").await);
        assert!(matches!(err, AuthError::Gateway(GatewayError::Constraint(_))));
    }

    #[tokio::test]
    async fn empty_password_is_rejected_locally() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_over(&backend);
        let calls = backend.auth_calls();

        let err = assert_err!(manager.update_password("").await);
        assert!(matches!(err, AuthError::Validation(_)));
        assert_eq!(backend.auth_calls(), calls);
    }

    #[tokio::test]
    async fn logout_clears_identity_even_when_remote_fails() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_over(&backend);
        manager.start().await;
        assert_ok!(manager.register("Asitha", "as@cnfl.lk", None, "secret").await);
        assert_ok!(manager.login("as@cnfl.lk", "secret").await);
        wait_for(&manager, |state| state.user.is_some()).await;

        backend.set_auth_offline(true);
        assert_err!(manager.logout().await);
        assert_eq!(manager.current_user(), None);
    }

    #[tokio::test]
    async fn token_refresh_does_not_settle_loading() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_over(&backend);
        manager.state.send_modify(|state| {
            state.started = true;
            state.loading = true;
        });

        manager
            .handle_session_change(SessionChange {
                kind: SessionEventKind::TokenRefreshed,
                session: None,
            })
            .await;
        assert_eq!(manager.phase(), SessionPhase::Loading);

        manager
            .handle_session_change(SessionChange {
                kind: SessionEventKind::SignedOut,
                session: None,
            })
            .await;
        assert_eq!(manager.phase(), SessionPhase::Anonymous);
    }

    #[tokio::test]
    async fn profile_row_changes_refresh_identity() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_over(&backend);
        manager.start().await;
        assert_ok!(manager.register("Maheesh", "m@cnfl.lk", None, "secret").await);
        assert_ok!(manager.login("m@cnfl.lk", "secret").await);
        wait_for(&manager, |state| state.user.is_some()).await;
        let Some(user) = manager.current_user() else {
            panic!("expected a profile");
        };

        let (tx, rx) = broadcast::channel(8);
        manager.follow_profile_changes(rx).await;
        assert_ok!(
            backend
                .update(Collection::Users, &user.id, json!({"full_name": "Maheesh Theekshana"}))
                .await
        );
        let sent = tx.send(AppliedChange {
            collection: Collection::Users,
            kind: ChangeKind::Update,
            id: Some(user.id.clone()),
            timestamp: chrono::Utc::now(),
        });
        assert!(sent.is_ok());

        wait_for(&manager, |state| {
            state
                .user
                .as_ref()
                .is_some_and(|u| u.full_name == "Maheesh Theekshana")
        })
        .await;
        manager.shutdown().await;
    }
}
