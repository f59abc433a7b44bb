//! Error types for the gateway, session, store, and HTTP layers.
//!
//! [`GatewayError`] is the backend taxonomy every gateway maps into.
//! [`AuthError`] and [`StoreError`] wrap it for the session manager and
//! the snapshot store. [`ApiError`] maps onto HTTP status codes and a
//! structured JSON body.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{ChangeKind, Collection, RecordId};

/// Failure reported by a remote gateway.
///
/// `Display` yields the backend's message verbatim so it can be shown to
/// users unmodified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Network failure or backend unavailable.
    #[error("{0}")]
    Transport(String),

    /// Credential or permission failure.
    #[error("{0}")]
    Authorization(String),

    /// Row missing on read-by-id, update, or delete.
    #[error("{0}")]
    NotFound(String),

    /// Uniqueness, foreign key, or schema violation.
    #[error("{0}")]
    Constraint(String),
}

impl GatewayError {
    /// Short category name used in log fields.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Authorization(_) => "authorization",
            Self::NotFound(_) => "not_found",
            Self::Constraint(_) => "constraint",
        }
    }

    /// The backend's message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transport(m)
            | Self::Authorization(m)
            | Self::NotFound(m)
            | Self::Constraint(m) => m,
        }
    }
}

/// Failure of a session manager operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Input rejected locally, without contacting the gateway.
    #[error("{0}")]
    Validation(String),

    /// The gateway refused the operation; carries its message unmodified.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The credential identity exists but its profile row does not.
    #[error("account {user_id} was created but its profile could not be saved: {reason}")]
    PartialRegistration {
        /// Id of the identity that was created.
        user_id: RecordId,
        /// Why the profile insert failed.
        reason: GatewayError,
    },
}

/// Failure inside the snapshot store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A read in the initial load batch failed.
    #[error("initial load failed reading {collection}: {source}")]
    Load {
        /// Collection whose read failed.
        collection: Collection,
        /// Gateway failure.
        #[source]
        source: GatewayError,
    },

    /// The initial load did not finish in time.
    #[error("initial load timed out after {0:?}")]
    LoadTimeout(Duration),

    /// Subscribing to the change stream failed.
    #[error("change subscription failed: {0}")]
    Subscribe(#[source] GatewayError),

    /// A row did not match its collection's shape.
    #[error("failed to decode {collection} row: {source}")]
    Decode {
        /// Collection of the row.
        collection: Collection,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// A change event lacked the row its operation needs.
    #[error("{kind:?} change on {collection} carries no row")]
    MissingRecord {
        /// Collection of the change.
        collection: Collection,
        /// Operation kind.
        kind: ChangeKind,
    },

    /// A change event named a table the store does not mirror.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// `start` was called more than once.
    #[error("snapshot store already started")]
    AlreadyStarted,

    /// The store was shut down while the operation was in flight.
    #[error("snapshot store was shut down")]
    Closed,
}

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2001,
///     "message": "unknown collection: fixtures",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// HTTP-facing error of the snapshot mirror.
///
/// # Error Code Ranges
///
/// | Range     | Category  | HTTP Status               |
/// |-----------|-----------|---------------------------|
/// | 2000–2999 | Not Found | 404 Not Found             |
/// | 3000–3999 | Server    | 500 / 503                 |
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The path named no known collection.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// The snapshot has not been loaded (yet, or ever).
    #[error("snapshot not loaded: {0}")]
    NotLoaded(String),

    /// Serialization or other internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::UnknownCollection(_) => 2001,
            Self::Internal(_) => 3000,
            Self::NotLoaded(_) => 3001,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownCollection(_) => StatusCode::NOT_FOUND,
            Self::NotLoaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn gateway_message_is_verbatim() {
        let err = GatewayError::Authorization("Invalid login credentials".to_string());
        assert_eq!(err.to_string(), "Invalid login credentials");
        assert_eq!(err.message(), "Invalid login credentials");
        assert_eq!(err.category(), "authorization");
    }

    #[test]
    fn auth_error_passes_gateway_message_through() {
        let err = AuthError::from(GatewayError::Transport("connection reset".to_string()));
        assert_eq!(err.to_string(), "connection reset");
    }

    #[test]
    fn partial_registration_is_distinct() {
        let err = AuthError::PartialRegistration {
            user_id: "u1".into(),
            reason: GatewayError::Constraint("duplicate key".to_string()),
        };
        assert!(!matches!(err, AuthError::Gateway(_)));
        assert!(err.to_string().contains("u1"));
    }

    #[test]
    fn api_error_status_mapping() {
        assert_eq!(
            ApiError::UnknownCollection("x".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::NotLoaded("loading".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::Internal(String::new()).error_code(), 3000);
    }

    #[test]
    fn api_error_into_response_sets_status() {
        let response = ApiError::UnknownCollection("fixtures".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
