//! Realtime gateway
//!
//! Owns every live socket on this instance and routes all realtime
//! traffic:
//!
//! - inbound frames run the connection state machine
//!   (`Authenticated -> Joined -> ...`), admitted through the rate limiter
//! - admitted messages are republished on the document's bus topic with the
//!   originating socket id stamped into the envelope
//! - a relay task per subscribed topic fans bus envelopes out to local
//!   sockets, suppressing the originator
//!
//! The gateway keeps exactly one bus subscription per document for as long
//! as any local session in that document exists, refcounted across joins
//! and leaves. Periodic duties (rate-limit GC, presence sweep) also run
//! from here.

mod connection;
mod protocol;

pub use connection::{
    ConnectionHandle, Principal, TelemetryCounters, TelemetrySnapshot, OUTBOUND_BUFFER,
};
pub use protocol::{ClientFrame, ProtocolError, ServerFrame, UserInfo};

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{DocumentBus, Envelope, EnvelopeKind};
use crate::presence::PresenceRegistry;
use crate::ratelimit::RateLimiter;

struct TopicState {
    local_sessions: usize,
    relay: JoinHandle<()>,
}

/// Per-instance realtime hub.
pub struct CollabGateway {
    presence: Arc<PresenceRegistry>,
    bus: Arc<DocumentBus>,
    limiter: Arc<RateLimiter>,
    /// Local socket index, reachability only. Never authoritative for
    /// membership; that is the presence registry.
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
    topics: tokio::sync::Mutex<HashMap<String, TopicState>>,
    maintenance: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    stats: TelemetryCounters,
    /// Self-handle for the relay and maintenance tasks. Weak, so a task
    /// never keeps a dropped gateway alive.
    me: Weak<CollabGateway>,
}

impl CollabGateway {
    pub fn new(
        presence: Arc<PresenceRegistry>,
        bus: Arc<DocumentBus>,
        limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            presence,
            bus,
            limiter,
            connections: DashMap::new(),
            topics: tokio::sync::Mutex::new(HashMap::new()),
            maintenance: parking_lot::Mutex::new(Vec::new()),
            stats: TelemetryCounters::default(),
            me: me.clone(),
        })
    }

    pub fn stats(&self) -> TelemetrySnapshot {
        self.stats.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Register an authenticated socket and greet it.
    pub fn register_connection(
        &self,
        principal: Principal,
        outbound: mpsc::Sender<String>,
    ) -> Arc<ConnectionHandle> {
        let conn = Arc::new(ConnectionHandle::new(principal, outbound));
        self.connections.insert(conn.socket_id, Arc::clone(&conn));
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        conn.send(&ServerFrame::Connected {
            message: "connected".to_string(),
        });
        log::info!(
            "socket {} connected for {}",
            conn.socket_id,
            conn.principal.principal_id
        );
        conn
    }

    /// Process one inbound text frame. Protocol and rate-limit problems
    /// answer with an `error` frame; nothing here severs the connection.
    pub async fn handle_frame(&self, conn: &Arc<ConnectionHandle>, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                conn.send(&ServerFrame::error(format!("protocol error: {}", e)));
                return;
            }
        };

        match frame {
            ClientFrame::JoinDocument { document_id } => {
                self.handle_join(conn, &document_id).await;
            }
            ClientFrame::LeaveDocument { document_id } => {
                if conn.is_joined_to(&document_id) {
                    self.leave_document(conn, &document_id).await;
                    conn.set_joined_document(None);
                } else {
                    conn.send(&ServerFrame::error(format!(
                        "not joined to document {}",
                        document_id
                    )));
                }
            }
            ClientFrame::CrdtUpdate {
                document_id,
                update,
            } => {
                self.handle_broadcast(
                    conn,
                    &document_id,
                    "crdt-update",
                    EnvelopeKind::CrdtUpdate,
                    update,
                )
                .await;
            }
            ClientFrame::AwarenessUpdate {
                document_id,
                update,
            } => {
                self.handle_broadcast(
                    conn,
                    &document_id,
                    "awareness-update",
                    EnvelopeKind::AwarenessUpdate,
                    update,
                )
                .await;
            }
        }
    }

    /// Socket closed: tear down presence and topic bookkeeping.
    pub async fn handle_disconnect(&self, conn: &Arc<ConnectionHandle>) {
        if let Some(document_id) = conn.joined_document() {
            self.leave_document(conn, &document_id).await;
        }
        self.connections.remove(&conn.socket_id);
        log::info!(
            "socket {} disconnected for {}",
            conn.socket_id,
            conn.principal.principal_id
        );
    }

    async fn handle_join(&self, conn: &Arc<ConnectionHandle>, document_id: &str) {
        // A re-join (same or different document) first runs the full leave
        // cleanup for the previous membership.
        if let Some(current) = conn.joined_document() {
            self.leave_document(conn, &current).await;
            conn.set_joined_document(None);
        }

        if let Err(e) = self
            .presence
            .add_session(
                document_id,
                &conn.principal.principal_id,
                &conn.principal.display_name,
                conn.socket_id,
                None,
            )
            .await
        {
            log::error!("presence write failed on join of {}: {}", document_id, e);
            conn.send(&ServerFrame::error("unable to join document right now"));
            return;
        }

        if let Err(e) = self.ensure_subscribed(document_id).await {
            log::error!("bus subscribe failed for {}: {}", document_id, e);
            let _ = self
                .presence
                .remove_session_owned(document_id, &conn.principal.principal_id, conn.socket_id)
                .await;
            conn.send(&ServerFrame::error("unable to join document right now"));
            return;
        }

        conn.set_joined_document(Some(document_id.to_string()));

        let envelope = Envelope::new(
            EnvelopeKind::UserJoined,
            serde_json::json!({ "user": conn.principal.user_info() }),
            conn.socket_id,
        );
        if let Err(e) = self.bus.publish(document_id, &envelope).await {
            log::warn!("user-joined publish failed for {}: {}", document_id, e);
        }

        // The joiner gets the full membership directly, not via the bus.
        let users = match self.presence.list_sessions(document_id).await {
            Ok(sessions) => sessions
                .into_iter()
                .map(|s| UserInfo {
                    principal_id: s.principal_id,
                    display_name: s.display_name,
                })
                .collect(),
            Err(e) => {
                log::warn!("session listing failed for {}: {}", document_id, e);
                Vec::new()
            }
        };
        conn.send(&ServerFrame::UsersInDocument { users });
    }

    async fn handle_broadcast(
        &self,
        conn: &Arc<ConnectionHandle>,
        document_id: &str,
        type_name: &str,
        kind: EnvelopeKind,
        update: String,
    ) {
        if !conn.is_joined_to(document_id) {
            conn.send(&ServerFrame::error(format!(
                "not joined to document {}",
                document_id
            )));
            return;
        }

        let decision = self
            .limiter
            .check_and_admit(&conn.principal.principal_id, type_name)
            .await;
        if !decision.admitted {
            self.stats.limiter_rejections.fetch_add(1, Ordering::Relaxed);
            conn.send(&ServerFrame::error(format!(
                "rate limit exceeded for {}, retry after {} ms",
                type_name,
                decision.reset_at - chrono::Utc::now().timestamp_millis()
            )));
            return;
        }

        if let Err(e) = self
            .presence
            .touch(document_id, &conn.principal.principal_id)
            .await
        {
            log::warn!("presence touch failed for {}: {}", document_id, e);
        }

        let envelope = Envelope::new(
            kind,
            serde_json::json!({ "documentId": document_id, "update": update }),
            conn.socket_id,
        );
        if let Err(e) = self.bus.publish(document_id, &envelope).await {
            log::warn!("{} publish failed for {}: {}", type_name, document_id, e);
        }
    }

    async fn leave_document(&self, conn: &Arc<ConnectionHandle>, document_id: &str) {
        let removed = match self
            .presence
            .remove_session_owned(document_id, &conn.principal.principal_id, conn.socket_id)
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                // The TTL sweep will finish the job.
                log::warn!("presence removal failed for {}: {}", document_id, e);
                false
            }
        };

        if removed {
            let envelope = Envelope::new(
                EnvelopeKind::UserLeft,
                serde_json::json!({ "user": conn.principal.user_info() }),
                conn.socket_id,
            );
            if let Err(e) = self.bus.publish(document_id, &envelope).await {
                log::warn!("user-left publish failed for {}: {}", document_id, e);
            }
        }

        self.release_topic(document_id).await;
    }

    /// Take or share this instance's subscription to a document topic.
    async fn ensure_subscribed(&self, document_id: &str) -> crate::bus::BusResult<()> {
        let mut topics = self.topics.lock().await;

        if let Some(state) = topics.get_mut(document_id) {
            state.local_sessions += 1;
            return Ok(());
        }

        let mut subscription = self.bus.subscribe(document_id).await?;
        let me = self.me.clone();
        let topic_doc = document_id.to_string();
        let relay = tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                let Some(gateway) = me.upgrade() else { break };
                gateway.relay_local(&topic_doc, &envelope);
            }
        });

        topics.insert(
            document_id.to_string(),
            TopicState {
                local_sessions: 1,
                relay,
            },
        );
        log::debug!("subscribed to topic for {}", document_id);
        Ok(())
    }

    /// Release one local session's share of a topic subscription; the last
    /// one out unsubscribes the instance.
    async fn release_topic(&self, document_id: &str) {
        let mut topics = self.topics.lock().await;
        let Some(state) = topics.get_mut(document_id) else {
            return;
        };

        state.local_sessions = state.local_sessions.saturating_sub(1);
        if state.local_sessions == 0 {
            if let Some(state) = topics.remove(document_id) {
                state.relay.abort();
            }
            log::debug!("unsubscribed from topic for {}", document_id);
        }
    }

    /// Fan an envelope out to local sockets joined to the document,
    /// skipping the originator.
    fn relay_local(&self, document_id: &str, envelope: &Envelope) {
        let text = serde_json::json!({
            "type": envelope.kind,
            "data": envelope.data,
        })
        .to_string();

        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.socket_id == envelope.origin_socket_id || !conn.is_joined_to(document_id) {
                continue;
            }
            if conn.send_raw(text.clone()) {
                self.stats.frames_relayed.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Start the periodic duties: rate-limit garbage collection and the
    /// presence stale sweep.
    pub fn start_maintenance(
        &self,
        limiter_gc_every: Duration,
        presence_sweep_every: Duration,
    ) {
        let me = self.me.clone();
        let gc = tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter_gc_every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(gateway) = me.upgrade() else { break };
                if let Err(e) = gateway.limiter.collect_garbage().await {
                    log::warn!("rate limiter gc failed: {}", e);
                }
            }
        });

        let me = self.me.clone();
        let sweep = tokio::spawn(async move {
            let mut interval = tokio::time::interval(presence_sweep_every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(gateway) = me.upgrade() else { break };
                if let Err(e) = gateway.presence.sweep_stale().await {
                    log::warn!("presence sweep failed: {}", e);
                }
            }
        });

        self.maintenance.lock().extend([gc, sweep]);
    }

    /// Stop relays and maintenance and drop every local socket's outbound
    /// queue, which closes the sockets with a normal closure.
    pub async fn shutdown(&self) {
        for handle in self.maintenance.lock().drain(..) {
            handle.abort();
        }

        let mut topics = self.topics.lock().await;
        for (_, state) in topics.drain() {
            state.relay.abort();
        }
        drop(topics);

        for entry in self.connections.iter() {
            entry.value().request_close();
        }
        self.connections.clear();
        log::info!("gateway shut down");
    }
}
