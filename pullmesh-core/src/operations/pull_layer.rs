//! Relay decision and streaming engine.
//!
//! For every layer request the engine picks one of four paths, in order:
//! serve the local cache (relay flag), stream through a peer that is
//! already fetching, become the authoritative fetcher against the origin,
//! or serve nothing. The authoritative path announces STARTED/ENDED events
//! to the cluster and writes the local cache file while forwarding the same
//! bytes to the caller.

use crate::cluster::{announce_end, announce_start, Cluster};
use crate::error::{PullError, Result};
use crate::registry::DigestRegistry;
use crate::storage::partial_reader::PartialFileReader;
use crate::storage::LayerCache;
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct PullLayerRequest {
    /// Layer digest: the request path, used verbatim as the cache key.
    pub digest: String,
    /// Expected total byte length of the layer.
    pub length: u64,
    /// Serve strictly from the local cache; set on requests relayed by
    /// peers that saw this node's STARTED event.
    pub relay: bool,
    /// Origin URL to fetch from when no peer can relay.
    pub source: Option<String>,
}

pub enum PullLayerOutcome {
    /// Body chunks; production continues in a background task and the
    /// channel closes when the transfer is done or aborted.
    Stream(mpsc::Receiver<Bytes>),
    /// No relay flag, no known peer, no source: nothing to serve.
    Empty,
}

pub struct PullLayerOperation {
    registry: Arc<DigestRegistry>,
    cluster: Arc<dyn Cluster>,
    cache: Arc<LayerCache>,
    client: reqwest::Client,
}

impl PullLayerOperation {
    pub fn new(
        registry: Arc<DigestRegistry>,
        cluster: Arc<dyn Cluster>,
        cache: Arc<LayerCache>,
    ) -> Self {
        Self {
            registry,
            cluster,
            cache,
            // transfers may be long-lived, so no total request timeout here
            client: reqwest::Client::new(),
        }
    }

    /// Runs the decision algorithm and starts the chosen transfer. Safe
    /// under unbounded concurrent invocation; concurrent authoritative
    /// fetches for the same digest are not deduplicated.
    pub async fn run(&self, request: PullLayerRequest) -> Result<PullLayerOutcome> {
        if request.relay {
            return self.serve_local(&request).await;
        }

        let nodes = self.registry.endpoints(&request.digest);
        if let Some(node) = pick_endpoint(&nodes) {
            let url = format!(
                "http://{}{}?relay=true&len={}",
                node, request.digest, request.length
            );
            return self.relay_through_peer(&request.digest, &url).await;
        }

        if let Some(source) = &request.source {
            return self.fetch_from_origin(&request.digest, source).await;
        }

        Ok(PullLayerOutcome::Empty)
    }

    /// Serves this node's own copy, possibly one a concurrent fetch is
    /// still writing.
    async fn serve_local(&self, request: &PullLayerRequest) -> Result<PullLayerOutcome> {
        tracing::info!(digest = %request.digest, "serving layer from local cache");
        let file = self.cache.open(&request.digest).await?;
        let reader = PartialFileReader::new(file, request.length);
        Ok(PullLayerOutcome::Stream(reader.stream()))
    }

    /// Streams a peer's copy through to the caller. This node is not the
    /// authoritative fetcher, so nothing is written locally and no events
    /// are broadcast.
    async fn relay_through_peer(&self, digest: &str, url: &str) -> Result<PullLayerOutcome> {
        tracing::info!(digest = %digest, url = %url, "relaying layer through peer");
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| PullError::Http(format!("relay request to {} failed: {}", url, error)))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(error) => {
                        tracing::warn!(error = %error, "relay stream interrupted");
                        return;
                    }
                }
            }
        });
        Ok(PullLayerOutcome::Stream(rx))
    }

    /// Becomes the authoritative fetcher: pulls from the origin, caching
    /// locally while forwarding to the caller, bracketed by STARTED/ENDED
    /// broadcasts. ENDED is sent on every exit path so the cluster releases
    /// this node's registry entry even after a failed transfer.
    async fn fetch_from_origin(&self, digest: &str, source: &str) -> Result<PullLayerOutcome> {
        let url = reqwest::Url::parse(source).map_err(|error| {
            PullError::InvalidRequest(format!("malformed source url '{}': {}", source, error))
        })?;

        tracing::info!(digest = %digest, source = %source, "fetching layer from origin");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| PullError::Http(format!("origin request failed: {}", error)))?;

        let file = self.cache.create(digest).await?;
        announce_start(self.cluster.as_ref(), digest).await;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cluster = Arc::clone(&self.cluster);
        let cache = Arc::clone(&self.cache);
        let digest = digest.to_string();
        tokio::spawn(async move {
            if let Err(error) = copy_to_cache_and_caller(response, file, tx).await {
                tracing::warn!(digest = %digest, error = %error, "origin fetch aborted, discarding partial layer");
                cache.remove(&digest).await;
            }
            announce_end(cluster.as_ref(), &digest).await;
        });
        Ok(PullLayerOutcome::Stream(rx))
    }
}

/// Uniformly random choice among the known downloaders, spreading relay
/// load with no preference for list order.
fn pick_endpoint(nodes: &[String]) -> Option<&String> {
    nodes.choose(&mut rand::thread_rng())
}

/// Drains the origin response through a fan-out to the cache file and the
/// response channel. Only an origin read error is fatal to the transfer.
async fn copy_to_cache_and_caller(
    mut response: reqwest::Response,
    file: File,
    chunks: mpsc::Sender<Bytes>,
) -> Result<()> {
    let mut sink = FanoutWriter::new(file, chunks);
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => sink.write(chunk).await,
            Ok(None) => break,
            Err(error) => {
                return Err(PullError::Http(format!("origin read failed: {}", error)));
            }
        }
    }
    sink.finish().await;
    Ok(())
}

/// Forwards each chunk to two sinks with independent failure handling: a
/// cache write error must not stop delivery to the caller, and a gone
/// caller must not stop the cache write.
struct FanoutWriter {
    file: File,
    chunks: mpsc::Sender<Bytes>,
    caller_gone: bool,
}

impl FanoutWriter {
    fn new(file: File, chunks: mpsc::Sender<Bytes>) -> Self {
        Self {
            file,
            chunks,
            caller_gone: false,
        }
    }

    async fn write(&mut self, chunk: Bytes) {
        if let Err(error) = self.file.write_all(&chunk).await {
            tracing::warn!(error = %error, "failed to write layer chunk to cache file");
        }

        if !self.caller_gone && self.chunks.send(chunk).await.is_err() {
            self.caller_gone = true;
            tracing::warn!("caller disconnected mid-transfer, continuing cache write");
        }
    }

    async fn finish(&mut self) {
        if let Err(error) = self.file.flush().await {
            tracing::warn!(error = %error, "failed to flush layer cache file");
        }
    }
}
