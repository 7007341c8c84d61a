pub mod pull_layer;

pub use pull_layer::{PullLayerOperation, PullLayerOutcome, PullLayerRequest};
