//! Snapshot endpoints: the whole snapshot and single collections.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::domain::Collection;
use crate::error::{ApiError, ErrorResponse};
use crate::service::{LoadState, SnapshotStore};

/// Row count of one collection.
#[derive(Debug, Serialize, ToSchema)]
pub struct CollectionSummary {
    /// Collection name as used in paths.
    pub collection: String,
    /// Rows currently held; always 1 for `site_settings`.
    pub rows: usize,
}

fn ensure_loaded(store: &SnapshotStore) -> Result<(), ApiError> {
    match store.load_state() {
        LoadState::Loaded => Ok(()),
        LoadState::NotLoaded => Err(ApiError::NotLoaded("load has not started".to_string())),
        LoadState::Loading => Err(ApiError::NotLoaded("load in progress".to_string())),
        LoadState::Failed(reason) => Err(ApiError::NotLoaded(reason)),
    }
}

/// `GET /api/v1/snapshot`: Every collection at one point in time.
#[utoipa::path(
    get,
    path = "/api/v1/snapshot",
    tag = "Snapshot",
    summary = "Get the full snapshot",
    description = "Returns all ten collections from one consistent snapshot.",
    responses(
        (status = 200, description = "Current snapshot", body = serde_json::Value),
        (status = 503, description = "Snapshot not loaded", body = ErrorResponse),
    )
)]
pub async fn snapshot_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    ensure_loaded(&state.store)?;
    Ok(Json(state.store.snapshot()))
}

/// `GET /api/v1/collections`: Row counts per collection.
#[utoipa::path(
    get,
    path = "/api/v1/collections",
    tag = "Snapshot",
    summary = "List collections",
    description = "Returns every mirrored collection with its current row count.",
    responses(
        (status = 200, description = "Collection summaries", body = Vec<CollectionSummary>),
        (status = 503, description = "Snapshot not loaded", body = ErrorResponse),
    )
)]
pub async fn list_collections(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    ensure_loaded(&state.store)?;
    let snapshot = state.store.snapshot();
    let summaries: Vec<CollectionSummary> = Collection::ALL
        .iter()
        .map(|collection| CollectionSummary {
            collection: collection.to_string(),
            rows: snapshot.len_of(*collection),
        })
        .collect();
    Ok(Json(summaries))
}

/// `GET /api/v1/collections/{name}`: Rows of one collection.
#[utoipa::path(
    get,
    path = "/api/v1/collections/{name}",
    tag = "Snapshot",
    summary = "Get one collection",
    description = "Returns the rows of one collection in its canonical order; `site_settings` returns the singleton object.",
    params(
        ("name" = String, Path, description = "Collection name, e.g. `players`"),
    ),
    responses(
        (status = 200, description = "Collection rows", body = serde_json::Value),
        (status = 404, description = "Unknown collection", body = ErrorResponse),
        (status = 503, description = "Snapshot not loaded", body = ErrorResponse),
    )
)]
pub async fn get_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let collection: Collection = name
        .parse()
        .map_err(|_| ApiError::UnknownCollection(name))?;
    ensure_loaded(&state.store)?;
    let rows = state.store.snapshot().collection_json(collection)?;
    Ok(Json(rows))
}

/// Snapshot routes, relative to `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/snapshot", get(snapshot_handler))
        .route("/collections", get(list_collections))
        .route("/collections/{name}", get(get_collection))
}
