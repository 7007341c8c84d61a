use super::{response_error, ServerState};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pullmesh_core::{EventEnvelope, JoinRequest, JoinResponse, PullError};
use std::sync::Arc;

/// `POST /cluster/v1/join` — a peer asks to join the mesh through this node.
pub(crate) async fn cluster_join(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<JoinRequest>,
) -> Response {
    if request.address.trim().is_empty() {
        return response_error(StatusCode::BAD_REQUEST, "join address cannot be empty");
    }

    let members = state.mesh.handle_join(request.address.trim()).await;
    (StatusCode::OK, Json(JoinResponse { members })).into_response()
}

/// `POST /cluster/v1/events` — a peer delivers a broadcast event.
pub(crate) async fn cluster_event(
    State(state): State<Arc<ServerState>>,
    Json(envelope): Json<EventEnvelope>,
) -> Response {
    match state.mesh.handle_event(envelope).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(PullError::InvalidRequest(message)) => {
            response_error(StatusCode::BAD_REQUEST, message)
        }
        Err(error) => response_error(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}
