// WebSocket endpoint: one task per connection, bridging the socket and the
// room's broadcast channel.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::rooms::Room;
use crate::RelayState;

pub(crate) async fn room_route(
    ws: WebSocketUpgrade,
    Path((party, room)): Path<(String, String)>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    let key = format!("{party}/{room}");
    ws.on_upgrade(move |socket| handle_socket(socket, state, key))
}

async fn handle_socket(mut socket: WebSocket, state: RelayState, key: String) {
    let (connection_id, room) = state.rooms.join(&key);
    let mut frames = room.subscribe();
    let mut announced = BTreeSet::new();
    info!(room = %key, connection_id, "connection opened");

    if let Err(error) = greet(&room, &mut socket).await {
        warn!(room = %key, connection_id, ?error, "failed to greet connection");
    } else {
        loop {
            tokio::select! {
                incoming = socket.recv() => {
                    let Some(Ok(message)) = incoming else {
                        break;
                    };
                    match message {
                        WsMessage::Binary(payload) => {
                            let processed = process(
                                &room,
                                connection_id,
                                payload.as_ref(),
                                &mut announced,
                                &mut socket,
                            )
                            .await;
                            if let Err(error) = processed {
                                warn!(
                                    room = %key,
                                    connection_id,
                                    ?error,
                                    "failed to process y-sync frame"
                                );
                                break;
                            }
                        }
                        WsMessage::Close(_) => break,
                        WsMessage::Ping(payload) => {
                            if socket.send(WsMessage::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        WsMessage::Pong(_) | WsMessage::Text(_) => {}
                    }
                }
                outbound = frames.recv() => {
                    match outbound {
                        Ok((sender, payload)) if sender != connection_id => {
                            if socket.send(WsMessage::Binary(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(room = %key, connection_id, skipped, "connection lagged");
                            if let Err(error) = resync(&room, &mut socket).await {
                                warn!(room = %key, connection_id, ?error, "failed to resync");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    match room.forget(&announced).await {
        Ok(Some(removal)) => room.broadcast(connection_id, removal),
        Ok(None) => {}
        Err(error) => warn!(room = %key, connection_id, ?error, "failed to drop departed presence"),
    }
    state.rooms.leave(&room);
    info!(room = %key, connection_id, "connection closed");
}

async fn greet(room: &Room, socket: &mut WebSocket) -> Result<()> {
    for frame in room.greeting().await? {
        socket.send(WsMessage::Binary(frame.into())).await.context("failed to send greeting")?;
    }
    Ok(())
}

/// Skipped frames may have carried document updates, so a lagged
/// connection gets the full room state again.
async fn resync(room: &Room, socket: &mut WebSocket) -> Result<()> {
    for frame in room.resync().await? {
        socket.send(WsMessage::Binary(frame.into())).await.context("failed to send resync")?;
    }
    Ok(())
}

async fn process(
    room: &Arc<Room>,
    connection_id: u64,
    payload: &[u8],
    announced: &mut BTreeSet<u64>,
    socket: &mut WebSocket,
) -> Result<()> {
    let outcome = room.process(payload, announced).await?;
    for reply in outcome.replies {
        socket.send(WsMessage::Binary(reply.into())).await.context("failed to send y-sync reply")?;
    }
    for frame in outcome.fanout {
        room.broadcast(connection_id, frame);
    }
    Ok(())
}
