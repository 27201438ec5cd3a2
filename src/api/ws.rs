//! WebSocket endpoint
//!
//! `GET /ws?token=...`, the realtime plane's front door. The token is
//! verified before the upgrade; a missing or invalid token refuses the
//! connection outright (no error frame, no upgrade). After the upgrade
//! the socket is driven by one task that feeds inbound frames to the
//! gateway and one writer task that drains the bounded outbound queue.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::responses::ApiError;
use crate::app::AppState;
use crate::gateway::{CollabGateway, Principal, ServerFrame, OUTBOUND_BUFFER};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Handshake for `/ws`.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token else {
        return ApiError::unauthorized("missing token query parameter").into_response();
    };

    let principal = match state.verifier.verify(&token) {
        Ok(principal) => principal,
        Err(e) => {
            log::info!("rejecting websocket handshake: {}", e);
            return ApiError::unauthorized(format!("invalid token: {}", e)).into_response();
        }
    };

    let gateway = Arc::clone(&state.gateway);
    ws.on_upgrade(move |socket| drive_socket(gateway, principal, socket))
}

/// Own one socket for its lifetime: reader loop here, writer task beside
/// it. Inbound ordering is preserved because frames are handled inline,
/// one at a time.
async fn drive_socket(gateway: Arc<CollabGateway>, principal: Principal, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let conn = gateway.register_connection(principal, tx);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        // Outbound queue closed: normal closure.
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = conn.close_requested() => break,
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        gateway.handle_frame(&conn, &text).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        conn.send(&ServerFrame::error("binary frames are not supported"));
                    }
                    // Axum answers pings itself.
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
        }
    }

    gateway.handle_disconnect(&conn).await;

    // Dropping the last outbound sender lets the writer drain what is
    // queued and close the socket normally.
    drop(conn);
    let _ = writer.await;
}
