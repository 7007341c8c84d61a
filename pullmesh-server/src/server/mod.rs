use crate::config::AgentConfig;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pullmesh_core::{
    consume_events, Cluster, DigestRegistry, HttpMesh, LayerCache, PullError, PullLayerOperation,
    Result,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;

mod cluster;
mod proxy;

use cluster::{cluster_event, cluster_join};
use proxy::get_layer;

pub(crate) struct ServerState {
    pub(crate) registry: Arc<DigestRegistry>,
    pub(crate) mesh: Arc<HttpMesh>,
    pub(crate) pull_layer: Arc<PullLayerOperation>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub async fn run_server(config: AgentConfig) -> Result<()> {
    let listener = TcpListener::bind(format!("{}:{}", config.bind_addr, config.port)).await?;
    let port = listener.local_addr()?.port();

    let state = bootstrap(&config, port).await?;
    tracing::info!(
        advertise = %state.mesh.advertise_addr(),
        "pullmesh agent listening on {}:{}",
        config.bind_addr,
        port
    );

    axum::serve(listener, router(state))
        .await
        .map_err(|error| PullError::Http(error.to_string()))?;
    Ok(())
}

/// Builds the node: registry, cache, mesh, event consumer, pull operation.
/// Joins the seed peer when one is configured; a failed join is fatal since
/// an agent that cannot join is useless.
async fn bootstrap(config: &AgentConfig, port: u16) -> Result<Arc<ServerState>> {
    let advertise = config.resolved_advertise_addr(port)?;
    let (mesh, events) = HttpMesh::new(advertise)?;
    let registry = Arc::new(DigestRegistry::new());
    let cache = Arc::new(LayerCache::new(config.data_dir.clone())?);

    // the consumer is the sole writer to the registry
    tokio::spawn(consume_events(registry.clone(), events));

    match &config.peer {
        Some(seed) => {
            let contacted = mesh.join(seed).await?;
            if contacted != 1 {
                return Err(PullError::Cluster(format!(
                    "joined {} seeds, expected exactly 1",
                    contacted
                )));
            }
        }
        None => {
            tracing::info!("no seed peer configured, starting standalone mesh");
        }
    }

    let pull_layer = Arc::new(PullLayerOperation::new(
        registry.clone(),
        mesh.clone(),
        cache,
    ));

    Ok(Arc::new(ServerState {
        registry,
        mesh,
        pull_layer,
    }))
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/cluster/v1/join", post(cluster_join))
        .route("/cluster/v1/events", post(cluster_event))
        .route("/*path", get(get_layer))
        .with_state(state)
}
