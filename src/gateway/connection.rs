//! Per-connection state
//!
//! Each accepted socket gets a [`ConnectionHandle`]: the authenticated
//! principal, the currently joined document, and a bounded outbound queue.
//! The handle is the only per-instance view of a connection; membership
//! truth lives in the presence registry.

use std::sync::atomic::{AtomicU64, Ordering};

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use super::protocol::{ServerFrame, UserInfo};

/// Outbound frames queued per socket before drops begin.
pub const OUTBOUND_BUFFER: usize = 64;

/// Identity asserted by the connection's bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: String,
    pub display_name: String,
}

impl Principal {
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            principal_id: self.principal_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// One live socket on this instance.
pub struct ConnectionHandle {
    pub socket_id: Uuid,
    pub principal: Principal,
    joined_document: RwLock<Option<String>>,
    outbound: mpsc::Sender<String>,
    dropped_frames: AtomicU64,
    close_signal: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(principal: Principal, outbound: mpsc::Sender<String>) -> Self {
        Self {
            socket_id: Uuid::new_v4(),
            principal,
            joined_document: RwLock::new(None),
            outbound,
            dropped_frames: AtomicU64::new(0),
            close_signal: Arc::new(Notify::new()),
        }
    }

    /// Ask the socket task to close this connection normally. Used by
    /// shutdown; safe to call more than once.
    pub fn request_close(&self) {
        self.close_signal.notify_one();
    }

    /// Resolves once a close has been requested.
    pub async fn close_requested(&self) {
        self.close_signal.notified().await;
    }

    /// The document this socket is joined to, if any.
    pub fn joined_document(&self) -> Option<String> {
        self.joined_document.read().clone()
    }

    pub fn set_joined_document(&self, document_id: Option<String>) {
        *self.joined_document.write() = document_id;
    }

    pub fn is_joined_to(&self, document_id: &str) -> bool {
        self.joined_document
            .read()
            .as_deref()
            .is_some_and(|d| d == document_id)
    }

    /// Queue a frame for the socket. A full queue drops the frame rather
    /// than blocking the relay; the connection stays open and the drop is
    /// counted.
    pub fn send(&self, frame: &ServerFrame) -> bool {
        self.send_raw(frame.to_json())
    }

    /// As [`ConnectionHandle::send`] but for pre-serialized text.
    pub fn send_raw(&self, text: String) -> bool {
        match self.outbound.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "dropping frame for slow socket {} ({} dropped so far)",
                    self.socket_id,
                    self.dropped_frames.load(Ordering::Relaxed)
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

/// Gateway-wide counters, exposed through the health endpoint.
#[derive(Default)]
pub struct TelemetryCounters {
    pub connections_accepted: AtomicU64,
    pub frames_relayed: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub limiter_rejections: AtomicU64,
}

/// Point-in-time snapshot of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub connections_accepted: u64,
    pub frames_relayed: u64,
    pub frames_dropped: u64,
    pub limiter_rejections: u64,
}

impl TelemetryCounters {
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            limiter_rejections: self.limiter_rejections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(buffer: usize) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        let principal = Principal {
            principal_id: "alice".to_string(),
            display_name: "Alice".to_string(),
        };
        (ConnectionHandle::new(principal, tx), rx)
    }

    #[tokio::test]
    async fn test_send_queues_frame() {
        let (conn, mut rx) = handle(4);

        assert!(conn.send(&ServerFrame::error("nope")));
        let text = rx.recv().await.unwrap();
        assert!(text.contains("\"type\":\"error\""));
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let (conn, _rx) = handle(1);

        assert!(conn.send_raw("one".to_string()));
        assert!(!conn.send_raw("two".to_string()));
        assert!(!conn.send_raw("three".to_string()));
        assert_eq!(conn.dropped_frames(), 2);
    }

    #[tokio::test]
    async fn test_joined_document_tracking() {
        let (conn, _rx) = handle(4);

        assert_eq!(conn.joined_document(), None);
        conn.set_joined_document(Some("d1".to_string()));
        assert!(conn.is_joined_to("d1"));
        assert!(!conn.is_joined_to("d2"));
        conn.set_joined_document(None);
        assert_eq!(conn.joined_document(), None);
    }
}
