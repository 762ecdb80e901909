//! WebSocket admission and transport adaptation.
//!
//! Sockets upgraded on `/server` run the registration control loop;
//! everything else runs a client session. The axum socket is adapted to
//! the core's `SignalStream`/`SignalWriter` traits here: reads decode the
//! JSON envelope, writes are serialized through a bounded channel so that
//! the inbox loop, the ICE callback and the coordinator can all write to
//! the same socket without interleaving frames.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use sfu_core::message::WireMessage;
use sfu_core::models::ClientId;
use sfu_core::peer::{ClientSession, ServerSession, SignalStream, SignalWriter};
use sfu_core::System;

use super::AppState;

/// Outbound frames buffered per socket before a slow client is cut off.
const OUTBOUND_BUFFER: usize = 256;

/// Signaling frames are small; SDP tops out well under this.
const MAX_FRAME_SIZE: usize = 64 * 1024;

pub async fn client_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_client_socket(socket, state.system))
}

pub async fn server_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_server_socket(socket, state.system))
}

async fn handle_client_socket(socket: WebSocket, system: Arc<System>) {
    let client_id = ClientId::generate();
    info!(client_id = %client_id, "client socket connected");

    let (mut stream, writer) = adapt_socket(socket);
    ClientSession::new(system, client_id.clone(), writer)
        .run(&mut stream)
        .await;

    info!(client_id = %client_id, "client socket closed");
}

async fn handle_server_socket(socket: WebSocket, system: Arc<System>) {
    let client_id = ClientId::generate();
    info!(client_id = %client_id, "server socket connected");

    let (mut stream, writer) = adapt_socket(socket);
    ServerSession::new(system, client_id.clone(), writer)
        .run(&mut stream)
        .await;

    info!(client_id = %client_id, "server socket closed");
}

/// Split a socket into the inbound frame stream and a serialized writer.
/// A pump task owns the sink half; writers enqueue encoded frames with
/// `try_send`, dropping the connection's buffer slot rather than blocking
/// a WebRTC callback.
fn adapt_socket(socket: WebSocket) -> (WsSignalStream, Arc<WsSignalWriter>) {
    let (mut sink, receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!(error = %e, "socket write failed, stopping writer pump");
                break;
            }
        }
    });

    (
        WsSignalStream { receiver },
        Arc::new(WsSignalWriter { tx }),
    )
}

struct WsSignalWriter {
    tx: mpsc::Sender<String>,
}

impl SignalWriter for WsSignalWriter {
    fn send(&self, frame: &WireMessage) -> Result<(), String> {
        let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                "outbound buffer full: client too slow".to_string()
            }
            mpsc::error::TrySendError::Closed(_) => "socket closed".to_string(),
        })
    }
}

struct WsSignalStream {
    receiver: SplitStream<WebSocket>,
}

#[async_trait]
impl SignalStream for WsSignalStream {
    async fn recv(&mut self) -> Option<Result<WireMessage, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(
                        serde_json::from_str(&text).map_err(|e| format!("malformed frame: {e}")),
                    );
                }
                Some(Ok(Message::Close(_))) => return None,
                Some(Err(e)) => return Some(Err(format!("websocket error: {e}"))),
                None => return None,
                // Binary, ping and pong frames are not part of the protocol.
                Some(Ok(_)) => {}
            }
        }
    }
}
