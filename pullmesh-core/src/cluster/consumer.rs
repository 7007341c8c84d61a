//! Event consumption loop: the sole writer to the digest registry.
//!
//! Runs as one long-lived task for the process lifetime and folds the
//! unordered inbound event stream into the registry. Malformed or unknown
//! events are logged and dropped; nothing delivered on the channel can stop
//! the loop.

use crate::cluster::{
    InboundEvent, LayerEvent, EVENT_END_LAYER, EVENT_START_LAYER, STATUS_ENDED, STATUS_STARTED,
};
use crate::registry::DigestRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Drains `events` until the channel closes, applying each layer event to
/// the registry.
pub async fn consume_events(
    registry: Arc<DigestRegistry>,
    mut events: mpsc::Receiver<InboundEvent>,
) {
    while let Some(event) = events.recv().await {
        apply_event(&registry, &event);
    }
    tracing::info!("cluster event channel closed, stopping consumer");
}

fn apply_event(registry: &DigestRegistry, event: &InboundEvent) {
    if event.name != EVENT_START_LAYER && event.name != EVENT_END_LAYER {
        return;
    }

    let layer: LayerEvent = match serde_json::from_slice(&event.payload) {
        Ok(layer) => layer,
        Err(error) => {
            tracing::warn!(event = %event.name, error = %error, "failed to decode layer event payload");
            return;
        }
    };

    match layer.status {
        STATUS_STARTED => {
            tracing::debug!(digest = %layer.digest, node = %layer.address, "layer pull started");
            registry.record_start(&layer.digest, &layer.address);
        }
        STATUS_ENDED => {
            tracing::debug!(digest = %layer.digest, node = %layer.address, "layer pull ended");
            registry.record_end(&layer.digest, &layer.address);
        }
        other => {
            tracing::warn!(status = other, digest = %layer.digest, "ignoring layer event with unknown status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn layer_event(name: &str, status: i32, digest: &str, address: &str) -> InboundEvent {
        let payload = serde_json::to_vec(&LayerEvent {
            status,
            digest: digest.to_string(),
            address: address.to_string(),
        })
        .unwrap();
        InboundEvent {
            name: name.to_string(),
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn test_started_and_ended_events_fold_into_registry() {
        let registry = DigestRegistry::new();

        apply_event(
            &registry,
            &layer_event(EVENT_START_LAYER, STATUS_STARTED, "sha256:abc", "10.0.0.1:5000"),
        );
        assert_eq!(registry.endpoints("sha256:abc"), vec!["10.0.0.1:5000"]);

        apply_event(
            &registry,
            &layer_event(EVENT_END_LAYER, STATUS_ENDED, "sha256:abc", "10.0.0.1:5000"),
        );
        assert!(registry.endpoints("sha256:abc").is_empty());
    }

    #[test]
    fn test_malformed_and_unknown_events_are_ignored() {
        let registry = DigestRegistry::new();

        apply_event(
            &registry,
            &InboundEvent {
                name: EVENT_START_LAYER.to_string(),
                payload: Bytes::from_static(b"not json"),
            },
        );
        apply_event(
            &registry,
            &layer_event("SOMETHING_ELSE", STATUS_STARTED, "sha256:abc", "10.0.0.1:5000"),
        );
        apply_event(
            &registry,
            &layer_event(EVENT_START_LAYER, 42, "sha256:abc", "10.0.0.1:5000"),
        );

        assert!(registry.endpoints("sha256:abc").is_empty());
    }

    #[tokio::test]
    async fn test_loop_survives_bad_events_and_stops_on_close() {
        let registry = Arc::new(DigestRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        let consumer = tokio::spawn(consume_events(registry.clone(), rx));

        tx.send(InboundEvent {
            name: EVENT_START_LAYER.to_string(),
            payload: Bytes::from_static(b"{broken"),
        })
        .await
        .unwrap();
        tx.send(layer_event(
            EVENT_START_LAYER,
            STATUS_STARTED,
            "sha256:abc",
            "10.0.0.1:5000",
        ))
        .await
        .unwrap();
        drop(tx);

        consumer.await.unwrap();
        assert_eq!(registry.endpoints("sha256:abc"), vec!["10.0.0.1:5000"]);
    }
}
