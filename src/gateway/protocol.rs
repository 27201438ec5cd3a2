//! Client-facing realtime protocol
//!
//! Every WebSocket frame is a JSON object `{"type": ..., "data": ...}`.
//! Inbound frames parse into [`ClientFrame`]; outbound frames serialize
//! from [`ServerFrame`]. CRDT and awareness updates carry an opaque base64
//! string that is forwarded byte-for-byte, never decoded.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol errors. These never tear down the connection; the gateway
/// answers with an `error` frame and keeps reading.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame not allowed in current state: {0}")]
    OutOfState(String),
}

/// Frames accepted from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    JoinDocument { document_id: String },

    #[serde(rename_all = "camelCase")]
    LeaveDocument { document_id: String },

    #[serde(rename_all = "camelCase")]
    CrdtUpdate { document_id: String, update: String },

    #[serde(rename_all = "camelCase")]
    AwarenessUpdate { document_id: String, update: String },
}

impl ClientFrame {
    /// Wire name of the frame type; also the rate-limit bucket key.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::JoinDocument { .. } => "join-document",
            Self::LeaveDocument { .. } => "leave-document",
            Self::CrdtUpdate { .. } => "crdt-update",
            Self::AwarenessUpdate { .. } => "awareness-update",
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Minimal public identity of a collaborator, as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub principal_id: String,
    pub display_name: String,
}

/// Frames emitted to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Connected { message: String },

    #[serde(rename_all = "camelCase")]
    UsersInDocument { users: Vec<UserInfo> },

    #[serde(rename_all = "camelCase")]
    UserJoined { user: UserInfo },

    #[serde(rename_all = "camelCase")]
    UserLeft { user: UserInfo },

    #[serde(rename_all = "camelCase")]
    CrdtUpdate { document_id: String, update: String },

    #[serde(rename_all = "camelCase")]
    AwarenessUpdate { document_id: String, update: String },

    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to the wire. Frame types are infallible to serialize; a
    /// failure would be a programming error, so it degrades to an error
    /// frame rather than panicking.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("failed to serialize server frame: {}", e);
            r#"{"type":"error","data":{"message":"internal serialization error"}}"#.to_string()
        })
    }
}
