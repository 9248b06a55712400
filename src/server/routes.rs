//! HTTP routes of the sync server.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use floratrack_core::sync::protocol::{
    ChangesQuery, ChangesResponse, ErrorBody, HealthResponse, PushRequest, PushResponse,
};
use floratrack_core::sync::{CHANGES_PATH, HEALTH_PATH, MUTATIONS_PATH};
use std::sync::Arc;

use super::auth::{auth_middleware, ApiKeyStore, AuthUser};
use super::store::{ServerStore, ServerStoreError};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub api_keys: Arc<ApiKeyStore>,
    pub store: Arc<ServerStore>,
}

impl AppState {
    pub fn new(api_keys: ApiKeyStore, store: ServerStore) -> Self {
        Self {
            api_keys: Arc::new(api_keys),
            store: Arc::new(store),
        }
    }
}

/// Error response with a JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.to_string(),
                message: message.into(),
            },
        }
    }
}

impl From<ServerStoreError> for ApiError {
    fn from(e: ServerStoreError) -> Self {
        match &e {
            ServerStoreError::CursorExpired(_) => {
                ApiError::new(StatusCode::GONE, "cursor_expired", e.to_string())
            }
            ServerStoreError::InvalidUserId(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid_user", e.to_string())
            }
            ServerStoreError::IoError(..) | ServerStoreError::ParseError(..) => {
                tracing::error!("Storage failure: {}", e);
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    "Server storage failure",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn changes(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesResponse>, ApiError> {
    let response = state.store.changes_since(&user.user_id, query.since)?;
    tracing::debug!(
        "Sent {} change(s) to {}",
        response.entities.len(),
        user.user_id
    );
    Ok(Json(response))
}

async fn mutations(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    let count = request.mutations.len();
    let results = state.store.apply_mutations(&user.user_id, request.mutations)?;
    tracing::info!("Applied {} mutation(s) for {}", count, user.user_id);
    Ok(Json(PushResponse { results }))
}

/// Builds the router with public and authenticated routes.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route(HEALTH_PATH, get(health));

    let protected_routes = Router::new()
        .route(CHANGES_PATH, get(changes))
        .route(MUTATIONS_PATH, post(mutations))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
