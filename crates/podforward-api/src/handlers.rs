use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use podforward_session::{SessionId, SessionView};
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::*;
use crate::AppState;

/// Start a port-forward from query parameters
///
/// This is the link the dashboard extension opens in the browser.
#[utoipa::path(
    get,
    path = "/api/v1/extensions/pod-forward/forward",
    params(ForwardQuery),
    responses(
        (status = 200, description = "Port-forward started", body = SessionView),
        (status = 400, description = "Missing or invalid parameters", body = ErrorResponse),
        (status = 429, description = "Session limit reached", body = ErrorResponse),
        (status = 502, description = "Tunnel could not be established", body = ErrorResponse),
        (status = 503, description = "No free local port", body = ErrorResponse)
    ),
    tag = "forwards"
)]
pub async fn forward(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ForwardQuery>, QueryRejection>,
) -> Result<Json<SessionView>, (StatusCode, Json<ErrorResponse>)> {
    let Query(query) = query.map_err(|rejection| {
        ErrorResponse::new(StatusCode::BAD_REQUEST, rejection.body_text(), "INVALID_REQUEST")
    })?;
    let (Some(namespace), Some(pod)) = (query.namespace, query.pod) else {
        return Err(ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            "namespace and pod are required",
            "INVALID_REQUEST",
        ));
    };

    start(&state, &namespace, &pod, query.port).await.map(Json)
}

/// Start a port-forward from a JSON body
#[utoipa::path(
    post,
    path = "/api/v1/extensions/pod-forward/forwards",
    request_body = StartForwardRequest,
    responses(
        (status = 201, description = "Port-forward started", body = SessionView),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 415, description = "Body is not JSON", body = ErrorResponse),
        (status = 422, description = "Body does not match the request schema", body = ErrorResponse),
        (status = 429, description = "Session limit reached", body = ErrorResponse),
        (status = 502, description = "Tunnel could not be established", body = ErrorResponse),
        (status = 503, description = "No free local port", body = ErrorResponse)
    ),
    tag = "forwards"
)]
pub async fn create_forward(
    State(state): State<Arc<AppState>>,
    request: Result<Json<StartForwardRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionView>), (StatusCode, Json<ErrorResponse>)> {
    let Json(request) = request.map_err(|rejection| {
        ErrorResponse::new(rejection.status(), rejection.body_text(), "INVALID_REQUEST")
    })?;
    let view = start(&state, &request.namespace, &request.pod, request.port).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn start(
    state: &AppState,
    namespace: &str,
    pod: &str,
    port: u32,
) -> Result<SessionView, (StatusCode, Json<ErrorResponse>)> {
    debug!("Forward requested: {}/{}:{}", namespace, pod, port);

    state
        .manager
        .start(namespace, pod, port)
        .await
        .map_err(session_error)
}

/// Stop a port-forward
#[utoipa::path(
    post,
    path = "/api/v1/extensions/pod-forward/stop/{id}",
    params(
        ("id" = String, Path, description = "Session ID")
    ),
    responses(
        (status = 200, description = "Port-forward stopped", body = StopResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 502, description = "Tunnel did not shut down cleanly", body = ErrorResponse)
    ),
    tag = "forwards"
)]
pub async fn stop_forward(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, (StatusCode, Json<ErrorResponse>)> {
    let id: SessionId = id.parse().map_err(session_error)?;
    state.manager.stop(&id).await.map_err(session_error)?;
    info!("Port-forward {} stopped via API", id);

    Ok(Json(StopResponse {
        status: "stopped".to_string(),
    }))
}

/// List all tracked port-forwards
#[utoipa::path(
    get,
    path = "/api/v1/extensions/pod-forward/status",
    responses(
        (status = 200, description = "Tracked port-forwards", body = ForwardList)
    ),
    tag = "forwards"
)]
pub async fn list_forwards(State(state): State<Arc<AppState>>) -> Json<ForwardList> {
    let active_forwards = state.manager.status_all();
    Json(ForwardList {
        total: active_forwards.len(),
        active_forwards,
    })
}

/// Get one port-forward
#[utoipa::path(
    get,
    path = "/api/v1/extensions/pod-forward/status/{id}",
    params(
        ("id" = String, Path, description = "Session ID")
    ),
    responses(
        (status = 200, description = "Port-forward status", body = SessionView),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    tag = "forwards"
)]
pub async fn get_forward(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, (StatusCode, Json<ErrorResponse>)> {
    let id: SessionId = id.parse().map_err(session_error)?;
    state.manager.status(&id).map(Json).map_err(session_error)
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_forwards: state.manager.registry().active_count(),
    })
}
