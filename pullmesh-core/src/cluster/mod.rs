//! Boundary to the cluster membership transport.
//!
//! The engine depends on the transport through the [`Cluster`] trait only:
//! join a seed, learn the local advertise address, and fire-and-forget
//! broadcast of user events. Inbound user events arrive on an mpsc channel
//! drained by the consumer in [`consumer`].

pub mod advertise;
pub mod consumer;
pub mod mesh;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// User event announcing that a node started pulling a layer.
pub const EVENT_START_LAYER: &str = "START_LAYER";
/// User event announcing that a node finished (or aborted) a layer pull.
pub const EVENT_END_LAYER: &str = "END_LAYER";

pub const STATUS_STARTED: i32 = 1;
pub const STATUS_ENDED: i32 = 0;

/// Payload of the layer transfer events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEvent {
    /// [`STATUS_STARTED`] or [`STATUS_ENDED`].
    pub status: i32,
    /// Layer digest, as carried in the request path.
    pub digest: String,
    /// Advertise address of the node the event is about.
    pub address: String,
}

/// A user event delivered by the membership transport.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub name: String,
    pub payload: Bytes,
}

/// Narrow contract against the membership transport.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Joins the cluster through the seed peer. Returns the number of seeds
    /// successfully contacted; anything other than `Ok(1)` is treated as
    /// fatal at startup.
    async fn join(&self, seed: &str) -> Result<usize>;

    /// The address this node is reachable at by its peers.
    fn advertise_addr(&self) -> &str;

    /// Fire-and-forget broadcast of a user event to the whole cluster,
    /// including the local node. Delivery failures are logged, never
    /// surfaced.
    async fn broadcast(&self, event: &str, payload: Bytes);
}

/// Broadcasts a STARTED event for `digest` on behalf of the local node.
pub async fn announce_start(cluster: &dyn Cluster, digest: &str) {
    announce(cluster, EVENT_START_LAYER, STATUS_STARTED, digest).await;
}

/// Broadcasts an ENDED event for `digest` on behalf of the local node.
pub async fn announce_end(cluster: &dyn Cluster, digest: &str) {
    announce(cluster, EVENT_END_LAYER, STATUS_ENDED, digest).await;
}

async fn announce(cluster: &dyn Cluster, event: &str, status: i32, digest: &str) {
    let payload = LayerEvent {
        status,
        digest: digest.to_string(),
        address: cluster.advertise_addr().to_string(),
    };
    match serde_json::to_vec(&payload) {
        Ok(encoded) => cluster.broadcast(event, Bytes::from(encoded)).await,
        Err(error) => {
            tracing::warn!(digest = %digest, error = %error, "failed to marshal layer event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_event_wire_format() {
        let event = LayerEvent {
            status: STATUS_STARTED,
            digest: "sha256:abc".to_string(),
            address: "10.0.0.1:5000".to_string(),
        };
        let encoded = serde_json::to_string(&event).unwrap();
        assert_eq!(
            encoded,
            r#"{"status":1,"digest":"sha256:abc","address":"10.0.0.1:5000"}"#
        );

        let decoded: LayerEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, event);
    }
}
