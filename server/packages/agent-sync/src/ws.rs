//! Host-facing WebSocket driver.
//!
//! One task per socket multiplexes inbound frames, outbound commands, the
//! keepalive ping and the read deadline. Decoded events are handed to the
//! host's worker in arrival order.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::time::Instant;

use crate::engine::{HostSession, SyncEngine};
use crate::protocol::{decode_event, encode_command};

pub async fn host_sync(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<SyncEngine>>,
    Path(host_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| drive_host_socket(socket, engine, host_id))
}

async fn drive_host_socket(socket: WebSocket, engine: Arc<SyncEngine>, host_id: String) {
    let HostSession {
        connection,
        mut outbound,
        inbound,
    } = engine.connect_host(&host_id);
    let (mut sender, mut receiver) = socket.split();

    let ping_interval = engine.config().ping_interval;
    let read_timeout = engine.config().read_timeout;
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let deadline = tokio::time::sleep(read_timeout);
    tokio::pin!(deadline);

    let reason = loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    connection.touch();
                    deadline.as_mut().reset(Instant::now() + read_timeout);
                    match decode_event(&text) {
                        Ok(event) => {
                            if inbound.send(event).await.is_err() {
                                break "worker stopped";
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                host_id = %host_id,
                                error = %err,
                                "discarding invalid frame"
                            );
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    connection.touch();
                    deadline.as_mut().reset(Instant::now() + read_timeout);
                    tracing::warn!(host_id = %host_id, "discarding binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break "closed by host",
                Some(Ok(_)) => {
                    connection.touch();
                    deadline.as_mut().reset(Instant::now() + read_timeout);
                }
                Some(Err(err)) => {
                    tracing::warn!(host_id = %host_id, error = %err, "socket read failed");
                    break "read error";
                }
            },
            command = outbound.recv() => match command {
                Some(command) => match encode_command(&command) {
                    Ok(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break "write error";
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            host_id = %host_id,
                            command = command.kind(),
                            error = %err,
                            "failed to encode command"
                        );
                    }
                },
                None => break "outbound closed",
            },
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break "write error";
                }
            }
            _ = &mut deadline => break "read timeout",
            _ = connection.closed() => break "released by registry",
        }
    };

    let _ = sender.send(Message::Close(None)).await;
    drop(inbound);
    tracing::info!(
        host_id = %host_id,
        connection_id = %connection.connection_id(),
        reason,
        "host socket closed"
    );
    engine.disconnect_host(&connection).await;
}
