use super::{response_error, ServerState};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use pullmesh_core::{PullError, PullLayerOutcome, PullLayerRequest};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
pub(crate) struct PullQuery {
    /// Expected total byte length, base-10. Required.
    len: Option<String>,
    /// Any non-empty value means "serve me your local copy".
    relay: Option<String>,
    /// Origin URL, used only when no peer can relay.
    source: Option<String>,
}

/// `GET /*path` — the layer proxy endpoint. The path is the layer digest,
/// used verbatim as the cache key.
pub(crate) async fn get_layer(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    Query(query): Query<PullQuery>,
) -> Response {
    let length = match query.len.as_deref().map(str::parse::<u64>) {
        Some(Ok(length)) => length,
        _ => return response_error(StatusCode::BAD_REQUEST, "len query parameter is required"),
    };

    let request = PullLayerRequest {
        digest: format!("/{}", path),
        length,
        relay: query
            .relay
            .as_deref()
            .map(|value| !value.is_empty())
            .unwrap_or(false),
        source: query.source.clone().filter(|value| !value.is_empty()),
    };

    match state.pull_layer.run(request).await {
        Ok(PullLayerOutcome::Stream(chunks)) => stream_response(length, chunks),
        Ok(PullLayerOutcome::Empty) => Response::new(Body::empty()),
        Err(PullError::InvalidRequest(message)) => {
            response_error(StatusCode::BAD_REQUEST, message)
        }
        Err(PullError::Http(message)) => response_error(StatusCode::BAD_GATEWAY, message),
        Err(error) => response_error(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

/// Wraps a chunk channel into a streaming response. The expected length is
/// echoed as `Content-Length`; a failed transfer surfaces to the caller as
/// a body shorter than announced.
fn stream_response(length: u64, chunks: mpsc::Receiver<Bytes>) -> Response {
    let stream = futures::stream::unfold(chunks, |mut chunks| async move {
        chunks
            .recv()
            .await
            .map(|chunk| (Ok::<_, std::io::Error>(chunk), chunks))
    });

    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}
