//! pullmesh-core: the coordination and streaming engine behind the pullmesh
//! proxy agent.
//!
//! Nodes announce which layers they are currently fetching; peers needing
//! the same layer relay through an in-progress downloader instead of
//! hitting the origin again. This crate holds the digest registry, the
//! cluster transport boundary, the layer cache with its read-after-write
//! partial reader, and the relay decision engine. The HTTP surface lives in
//! `pullmesh-server`.

pub mod cluster;
pub mod error;
pub mod operations;
pub mod registry;
pub mod storage;

pub use cluster::consumer::consume_events;
pub use cluster::mesh::{EventEnvelope, HttpMesh, JoinRequest, JoinResponse};
pub use cluster::{Cluster, InboundEvent, LayerEvent};
pub use error::{PullError, Result};
pub use operations::{PullLayerOperation, PullLayerOutcome, PullLayerRequest};
pub use registry::DigestRegistry;
pub use storage::partial_reader::PartialFileReader;
pub use storage::LayerCache;
