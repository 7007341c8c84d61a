//! HTTP mesh implementation of the [`Cluster`] boundary.
//!
//! Membership and event delivery ride on the internal HTTP surface every
//! node already exposes: a join handshake against a seed peer plus
//! fan-out POSTs for broadcasts. Inbound user events are handed to the
//! event consumer through an mpsc channel; membership events update the
//! peer set inside the mesh and are never surfaced to the consumer.

use crate::cluster::{Cluster, InboundEvent};
use crate::error::{PullError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Internal event propagating a freshly joined member between peers.
const EVENT_MEMBER_JOINED: &str = "MEMBER_JOINED";

const EVENT_CHANNEL_CAPACITY: usize = 64;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of `POST /cluster/v1/join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub address: String,
}

/// Response to a join: the member view of the contacted seed, itself
/// included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub members: Vec<String>,
}

/// Envelope carrying a user event between peers over
/// `POST /cluster/v1/events`. The payload bytes travel base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    pub payload: String,
}

impl EventEnvelope {
    fn new(event: &str, payload: &[u8]) -> Self {
        Self {
            event: event.to_string(),
            payload: BASE64.encode(payload),
        }
    }
}

/// Cluster transport built on the node's own HTTP listener.
pub struct HttpMesh {
    advertise: String,
    client: reqwest::Client,
    peers: Mutex<BTreeSet<String>>,
    events: mpsc::Sender<InboundEvent>,
}

impl HttpMesh {
    /// Creates the mesh and the inbound event channel its consumer drains.
    pub fn new(advertise: String) -> Result<(Arc<Self>, mpsc::Receiver<InboundEvent>)> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| {
                PullError::Internal(format!("failed to build mesh HTTP client: {}", error))
            })?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mesh = Arc::new(Self {
            advertise,
            client,
            peers: Mutex::new(BTreeSet::new()),
            events: tx,
        });
        Ok((mesh, rx))
    }

    /// The current member view: known peers plus the local node.
    pub fn members(&self) -> Vec<String> {
        let peers = self.peers.lock().expect("mesh peer set mutex poisoned");
        let mut members: Vec<String> = peers.iter().cloned().collect();
        members.push(self.advertise.clone());
        members
    }

    fn peer_snapshot(&self) -> Vec<String> {
        let peers = self.peers.lock().expect("mesh peer set mutex poisoned");
        peers.iter().cloned().collect()
    }

    fn add_peer(&self, address: &str) -> bool {
        let address = address.trim();
        if address.is_empty() || address == self.advertise {
            return false;
        }
        let mut peers = self.peers.lock().expect("mesh peer set mutex poisoned");
        peers.insert(address.to_string())
    }

    /// Handles an inbound join: records the joiner, tells the rest of the
    /// mesh about it in the background, and answers with the local member
    /// view.
    pub async fn handle_join(&self, joiner: &str) -> Vec<String> {
        if self.add_peer(joiner) {
            tracing::info!(peer = %joiner, "mesh peer joined");
            let envelope = EventEnvelope::new(EVENT_MEMBER_JOINED, joiner.as_bytes());
            let recipients = self
                .peer_snapshot()
                .into_iter()
                .filter(|peer| peer != joiner)
                .collect();
            self.spawn_fanout(recipients, envelope);
        }
        self.members()
    }

    /// Handles an event envelope delivered by a peer. Membership events stay
    /// inside the mesh; user events go to the consumer channel.
    pub async fn handle_event(&self, envelope: EventEnvelope) -> Result<()> {
        let payload = BASE64.decode(envelope.payload.as_bytes()).map_err(|error| {
            PullError::InvalidRequest(format!("invalid event payload encoding: {}", error))
        })?;

        if envelope.event == EVENT_MEMBER_JOINED {
            let address = String::from_utf8(payload).map_err(|error| {
                PullError::InvalidRequest(format!("invalid member address: {}", error))
            })?;
            if self.add_peer(&address) {
                tracing::info!(peer = %address, "learned mesh peer from join propagation");
            }
            return Ok(());
        }

        self.events
            .send(InboundEvent {
                name: envelope.event,
                payload: Bytes::from(payload),
            })
            .await
            .map_err(|_| PullError::Internal("event consumer is gone".to_string()))
    }

    /// Delivers `envelope` to `peers` from a detached task so a slow or
    /// unresponsive peer never holds up the caller.
    fn spawn_fanout(&self, peers: Vec<String>, envelope: EventEnvelope) {
        if peers.is_empty() {
            return;
        }
        let client = self.client.clone();
        tokio::spawn(async move {
            for peer in peers {
                if let Err(error) = post_event(&client, &peer, &envelope).await {
                    tracing::warn!(
                        peer = %peer,
                        event = %envelope.event,
                        error = %error,
                        "failed to deliver event to peer"
                    );
                }
            }
        });
    }
}

async fn post_event(client: &reqwest::Client, peer: &str, envelope: &EventEnvelope) -> Result<()> {
    let url = format!("http://{}/cluster/v1/events", peer);
    let response = client
        .post(&url)
        .json(envelope)
        .send()
        .await
        .map_err(|error| PullError::Http(error.to_string()))?;

    if !response.status().is_success() {
        return Err(PullError::Http(format!(
            "peer {} rejected event: status={}",
            peer,
            response.status()
        )));
    }
    Ok(())
}

#[async_trait]
impl Cluster for HttpMesh {
    async fn join(&self, seed: &str) -> Result<usize> {
        let url = format!("http://{}/cluster/v1/join", seed);
        let response = self
            .client
            .post(&url)
            .json(&JoinRequest {
                address: self.advertise.clone(),
            })
            .send()
            .await
            .map_err(|error| {
                PullError::Cluster(format!("failed to contact seed {}: {}", seed, error))
            })?;

        if !response.status().is_success() {
            return Err(PullError::Cluster(format!(
                "seed {} rejected join: status={}",
                seed,
                response.status()
            )));
        }

        let payload: JoinResponse = response
            .json()
            .await
            .map_err(|error| {
                PullError::Cluster(format!("invalid join response from {}: {}", seed, error))
            })?;

        for member in payload.members {
            self.add_peer(&member);
        }

        tracing::info!(seed = %seed, members = self.members().len(), "joined mesh through seed");
        Ok(1)
    }

    fn advertise_addr(&self) -> &str {
        &self.advertise
    }

    async fn broadcast(&self, event: &str, payload: Bytes) {
        // the local node is a member too: loop the event back into the
        // consumer before fanning out
        if self
            .events
            .send(InboundEvent {
                name: event.to_string(),
                payload: payload.clone(),
            })
            .await
            .is_err()
        {
            tracing::warn!(event = %event, "event consumer is gone, dropping local delivery");
        }

        self.spawn_fanout(self.peer_snapshot(), EventEnvelope::new(event, &payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_event_forwards_user_events_to_consumer() {
        let (mesh, mut events) = HttpMesh::new("10.0.0.1:5000".to_string()).unwrap();

        mesh.handle_event(EventEnvelope::new("START_LAYER", b"{\"status\":1}"))
            .await
            .unwrap();

        let delivered = events.recv().await.unwrap();
        assert_eq!(delivered.name, "START_LAYER");
        assert_eq!(&delivered.payload[..], b"{\"status\":1}");
    }

    #[tokio::test]
    async fn test_membership_events_update_peers_without_reaching_consumer() {
        let (mesh, mut events) = HttpMesh::new("10.0.0.1:5000".to_string()).unwrap();

        mesh.handle_event(EventEnvelope::new(EVENT_MEMBER_JOINED, b"10.0.0.2:5000"))
            .await
            .unwrap();

        let mut members = mesh.members();
        members.sort();
        assert_eq!(members, vec!["10.0.0.1:5000", "10.0.0.2:5000"]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_event_rejects_bad_payload_encoding() {
        let (mesh, _events) = HttpMesh::new("10.0.0.1:5000".to_string()).unwrap();

        let result = mesh
            .handle_event(EventEnvelope {
                event: "START_LAYER".to_string(),
                payload: "!!! not base64 !!!".to_string(),
            })
            .await;
        assert!(matches!(result, Err(PullError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_broadcast_returns_before_slow_peers_answer() {
        let (mesh, mut events) = HttpMesh::new("10.0.0.1:5000".to_string()).unwrap();

        // a peer that accepts connections but never answers a request
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        assert!(mesh.add_peer(&peer));

        let started = tokio::time::Instant::now();
        mesh.broadcast("START_LAYER", Bytes::from_static(b"{\"status\":1}"))
            .await;
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "broadcast blocked on an unresponsive peer for {:?}",
            started.elapsed()
        );

        // local delivery is still synchronous
        let delivered = events.recv().await.unwrap();
        assert_eq!(delivered.name, "START_LAYER");
    }

    #[tokio::test]
    async fn test_add_peer_ignores_self_and_empty() {
        let (mesh, _events) = HttpMesh::new("10.0.0.1:5000".to_string()).unwrap();

        assert!(!mesh.add_peer("10.0.0.1:5000"));
        assert!(!mesh.add_peer(""));
        assert!(mesh.add_peer("10.0.0.2:5000"));
        assert!(!mesh.add_peer("10.0.0.2:5000"));
        assert_eq!(mesh.members().len(), 2);
    }
}
