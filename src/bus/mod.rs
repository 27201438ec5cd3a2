//! Cross-instance fan-out bus
//!
//! One pub/sub topic per document, named `channel:{document_id}`. Every
//! realtime event (joins, leaves, CRDT deltas, awareness) is published
//! here and relayed by each subscribed instance to its local sockets.
//!
//! The bus guarantees at-least-once delivery to live subscribers and
//! nothing else: no persistence, no cross-topic ordering, per-topic
//! ordering best-effort only. The CRDT layer is commutative, so receivers
//! never depend on order.
//!
//! Originator suppression is the gateway's job, not the bus's: every
//! envelope carries the originating socket id and the gateway skips that
//! socket during local fan-out. Suppressing by principal would be wrong:
//! one principal on two devices must see each device's edits on the other.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{CacheStore, Subscription};

/// Topic prefix; the full topic is `channel:{document_id}`.
const TOPIC_PREFIX: &str = "channel:";

/// Bus errors
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Event types carried on a document topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    UserJoined,
    UserLeft,
    CrdtUpdate,
    AwarenessUpdate,
}

/// Message envelope published on a document topic.
///
/// `data` is the already-shaped payload delivered to clients verbatim;
/// `origin_socket_id` tags the socket whose inbound message caused the
/// publish so receivers can suppress the echo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub data: serde_json::Value,
    pub origin_socket_id: Uuid,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, data: serde_json::Value, origin_socket_id: Uuid) -> Self {
        Self {
            kind,
            data,
            origin_socket_id,
        }
    }
}

/// A live subscription to one document topic, yielding decoded envelopes.
pub struct TopicSubscription {
    document_id: String,
    inner: Subscription,
}

impl TopicSubscription {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Next envelope, or `None` once the subscription closes. Malformed
    /// payloads are logged and skipped; a bad publisher must not wedge the
    /// relay.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let payload = self.inner.recv().await?;
            match serde_json::from_str(&payload) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    log::warn!(
                        "discarding malformed envelope on {}: {}",
                        self.document_id,
                        e
                    );
                }
            }
        }
    }
}

/// Publish/subscribe access to document topics.
pub struct DocumentBus {
    store: Arc<dyn CacheStore>,
}

impl DocumentBus {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Topic name for a document.
    pub fn topic(document_id: &str) -> String {
        format!("{}{}", TOPIC_PREFIX, document_id)
    }

    /// Publish an envelope to everyone subscribed to the document's topic,
    /// this instance included.
    pub async fn publish(&self, document_id: &str, envelope: &Envelope) -> BusResult<()> {
        let payload =
            serde_json::to_string(envelope).map_err(crate::store::StoreError::from)?;
        self.store
            .publish(&Self::topic(document_id), &payload)
            .await?;
        Ok(())
    }

    /// Subscribe this instance to a document's topic. The caller owns the
    /// returned handle and is responsible for holding exactly one per
    /// document for as long as any local session exists.
    pub async fn subscribe(&self, document_id: &str) -> BusResult<TopicSubscription> {
        let inner = self.store.subscribe(&Self::topic(document_id)).await?;
        Ok(TopicSubscription {
            document_id: document_id.to_string(),
            inner,
        })
    }
}
