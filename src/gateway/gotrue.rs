//! Client for the Supabase auth (GoTrue) REST API.
//!
//! Every request carries the project's anon key in the `apikey` header;
//! user-scoped calls add the session's access token as a bearer token.
//! Session transitions are recorded in a [`SessionSlot`] and announced to
//! [`AuthGateway::session_changes`] subscribers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;

use super::{AuthGateway, AuthIdentity, Session, SessionChange, SessionEventKind, SessionSlot};
use crate::error::GatewayError;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Auth gateway backed by a GoTrue server.
#[derive(Debug)]
pub struct GoTrueAuth {
    client: Client,
    base_url: String,
    anon_key: String,
    session: SessionSlot,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthIdentity,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| {
                self.expires_in
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
            });
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Error body; GoTrue versions disagree on the field holding the message.
#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    msg: Option<String>,
    error_description: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

impl ErrorPayload {
    fn into_message(self, status: StatusCode) -> String {
        self.msg
            .or(self.error_description)
            .or(self.message)
            .or(self.error)
            .unwrap_or_else(|| status.to_string())
    }
}

impl GoTrueAuth {
    /// Creates a client for the project at `base_url` (e.g.
    /// `https://xyz.supabase.co`).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(transport)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            session: SessionSlot::new(),
        })
    }

    /// Adopts a previously persisted session and announces it as the
    /// initial session.
    pub async fn restore_session(&self, session: Option<Session>) {
        self.session
            .set(SessionEventKind::InitialSession, session)
            .await;
    }

    fn url(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = request
            .header("apikey", &self.anon_key)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let payload: ErrorPayload = response.json().await.unwrap_or_default();
        Err(status_error(status, payload.into_message(status)))
    }

    async fn token_grant(&self, grant: &str, body: serde_json::Value) -> Result<Session, GatewayError> {
        let request = self
            .client
            .post(self.url(&format!("token?grant_type={grant}")))
            .json(&body);
        let response = self.send(request).await.map_err(|err| match err {
            // A rejected grant is a credential failure whatever the status.
            GatewayError::Constraint(message) => GatewayError::Authorization(message),
            other => other,
        })?;
        let token: TokenResponse = response.json().await.map_err(transport)?;
        Ok(token.into_session())
    }

    async fn require_session(&self) -> Result<Session, GatewayError> {
        self.session
            .get()
            .await
            .ok_or_else(|| GatewayError::Authorization("Auth session missing!".to_string()))
    }
}

#[async_trait]
impl AuthGateway for GoTrueAuth {
    async fn current_session(&self) -> Result<Option<Session>, GatewayError> {
        let Some(session) = self.session.get().await else {
            return Ok(None);
        };
        let expired = session.expires_at.is_some_and(|at| at <= Utc::now());
        if expired && session.refresh_token.is_some() {
            return self.refresh_session().await.map(Some);
        }
        Ok(Some(session))
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, GatewayError> {
        let session = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        self.session
            .set(SessionEventKind::SignedIn, Some(session.clone()))
            .await;
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthIdentity, GatewayError> {
        let request = self
            .client
            .post(self.url("signup"))
            .json(&json!({ "email": email, "password": password }));
        let body: serde_json::Value = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(transport)?;

        // With email confirmation disabled the server answers with a session.
        if body.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(body)
                .map_err(|err| GatewayError::Transport(err.to_string()))?;
            let session = token.into_session();
            let identity = session.user.clone();
            self.session
                .set(SessionEventKind::SignedIn, Some(session))
                .await;
            return Ok(identity);
        }
        serde_json::from_value(body).map_err(|err| GatewayError::Transport(err.to_string()))
    }

    async fn sign_out(&self) -> Result<(), GatewayError> {
        let remote = match self.session.get().await {
            Some(session) => {
                let request = self
                    .client
                    .post(self.url("logout"))
                    .bearer_auth(&session.access_token);
                self.send(request).await.map(drop)
            }
            None => Ok(()),
        };
        self.session.set(SessionEventKind::SignedOut, None).await;
        remote
    }

    async fn update_password(&self, new_password: &str) -> Result<(), GatewayError> {
        let session = self.require_session().await?;
        let request = self
            .client
            .put(self.url("user"))
            .bearer_auth(&session.access_token)
            .json(&json!({ "password": new_password }));
        self.send(request).await?;
        self.session
            .set(SessionEventKind::UserUpdated, Some(session))
            .await;
        Ok(())
    }

    async fn refresh_session(&self) -> Result<Session, GatewayError> {
        let current = self.require_session().await?;
        let Some(refresh_token) = current.refresh_token else {
            return Err(GatewayError::Authorization(
                "Refresh token missing".to_string(),
            ));
        };
        let session = self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        self.session
            .set(SessionEventKind::TokenRefreshed, Some(session.clone()))
            .await;
        Ok(session)
    }

    fn session_changes(&self) -> broadcast::Receiver<SessionChange> {
        self.session.subscribe()
    }
}

fn transport(err: reqwest::Error) -> GatewayError {
    GatewayError::Transport(err.to_string())
}

fn status_error(status: StatusCode, message: String) -> GatewayError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Authorization(message),
        StatusCode::NOT_FOUND => GatewayError::NotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            GatewayError::Constraint(message)
        }
        _ => GatewayError::Transport(message),
    }
}
