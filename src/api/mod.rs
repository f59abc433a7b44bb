//! REST API layer: route handlers, OpenAPI document, and router
//! composition.
//!
//! Resource endpoints are mounted under `/api/v1`; the OpenAPI document is
//! served at `/api-docs/openapi.json`.

pub mod handlers;

use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::app_state::AppState;
use crate::error::{ErrorBody, ErrorResponse};
use crate::service::LoadState;
use crate::ws::handler::ws_handler;

/// OpenAPI description of the REST surface.
#[derive(Debug, OpenApi)]
#[openapi(
    info(title = "cnfl-sync", description = "Live mirror of the CNFL league collections"),
    paths(
        handlers::system::health_handler,
        handlers::snapshot::snapshot_handler,
        handlers::snapshot::list_collections,
        handlers::snapshot::get_collection,
    ),
    components(schemas(
        handlers::system::HealthResponse,
        handlers::snapshot::CollectionSummary,
        LoadState,
        ErrorResponse,
        ErrorBody,
    )),
    tags(
        (name = "System", description = "Service health"),
        (name = "Snapshot", description = "Read access to the mirrored collections"),
    )
)]
pub struct ApiDoc;

/// Builds the complete API router with all REST endpoints.
pub fn build_router() -> Router<AppState> {
    Router::new()
        .nest("/api/v1", handlers::routes())
        .merge(handlers::system::routes())
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
}

/// Builds the full application: REST, WebSocket, and middleware.
pub fn build_app(state: AppState) -> Router {
    let router = Router::new()
        .merge(build_router())
        .route("/ws", get(ws_handler));

    #[cfg(feature = "swagger-ui")]
    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
            .url("/api-docs/openapi.json", ApiDoc::openapi()),
    );

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_every_path() {
        let doc = ApiDoc::openapi();
        for path in [
            "/health",
            "/api/v1/snapshot",
            "/api/v1/collections",
            "/api/v1/collections/{name}",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
