// WebSocket transport: y-sync over a relay connection with automatic reconnect.

use std::sync::Arc;

use cowrite_common::{ConnectionStatus, RelayEndpoint};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::{protocol, ReconnectPolicy, StatusChannel, Transport, TransportError, TransportHandle};
use crate::engine::awareness::{AwarenessChannel, ChangeOrigin};
use crate::engine::doc::{ReplicatedDoc, UpdateSource};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    policy: ReconnectPolicy,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }
}

impl Transport for WsTransport {
    fn connect(
        &self,
        endpoint: &RelayEndpoint,
        doc: Arc<ReplicatedDoc>,
    ) -> Result<TransportHandle, TransportError> {
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let awareness = Arc::new(AwarenessChannel::new(&doc));
        let status = Arc::new(StatusChannel::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let doc_tx = outbound_tx.clone();
        let doc_subscription = doc.observe_updates(move |source, update| {
            if source == UpdateSource::Local {
                let _ = doc_tx.send(protocol::update(update));
            }
        })?;

        let presence_tx = outbound_tx;
        let presence = Arc::downgrade(&awareness);
        let presence_listener = awareness.on_change(move |change| {
            if change.origin != ChangeOrigin::Local {
                return;
            }
            let Some(awareness) = presence.upgrade() else {
                return;
            };
            match awareness.encode_clients(&change.changed_clients()) {
                Ok(update) => {
                    let _ = presence_tx.send(protocol::awareness(update));
                }
                Err(error) => warn!(%error, "failed to encode local presence"),
            }
        });

        let connection = Connection {
            url: endpoint.url().to_string(),
            doc,
            awareness: Arc::clone(&awareness),
            status: Arc::clone(&status),
            policy: self.policy,
        };
        runtime.spawn(connection.run(outbound_rx, shutdown_rx));

        let awareness_for_close = Arc::clone(&awareness);
        Ok(TransportHandle::new(status, awareness, move || {
            // Queues the presence removal before the socket task sees shutdown.
            awareness_for_close.clear_local();
            awareness_for_close.off_change(presence_listener);
            drop(doc_subscription);
            let _ = shutdown_tx.send(true);
        }))
    }
}

enum SocketEnd {
    Shutdown,
    Lost,
}

struct Connection {
    url: String,
    doc: Arc<ReplicatedDoc>,
    awareness: Arc<AwarenessChannel>,
    status: Arc<StatusChannel>,
    policy: ReconnectPolicy,
}

impl Connection {
    async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.status.set(ConnectionStatus::Connecting);
            // The handshake resends full state, so anything queued offline is redundant.
            while outbound.try_recv().is_ok() {}

            let attempt = tokio::select! {
                _ = shutdown.changed() => break,
                attempt = connect_async(self.url.as_str()) => attempt,
            };

            match attempt {
                Ok((socket, _)) => {
                    failures = 0;
                    info!(url = %self.url, "connected to relay");
                    self.status.set(ConnectionStatus::Connected);
                    let end = self.run_socket(socket, &mut outbound, &mut shutdown).await;
                    let dropped = self.awareness.remove_remote_states();
                    debug!(peers = dropped.len(), "cleared remote presence");
                    if matches!(end, SocketEnd::Shutdown) {
                        break;
                    }
                    warn!(url = %self.url, "relay connection lost");
                    self.status.set(ConnectionStatus::Disconnected);
                }
                Err(error) => {
                    failures = failures.saturating_add(1);
                    warn!(url = %self.url, %error, failures, "relay connection failed");
                    self.status.set(ConnectionStatus::Disconnected);
                }
            }

            let delay = self.policy.delay_for(failures.saturating_sub(1));
            debug!(?delay, "waiting before reconnect");
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(url = %self.url, "relay connection task finished");
    }

    async fn run_socket(
        &self,
        socket: RelaySocket,
        outbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SocketEnd {
        let (mut sink, mut stream) = socket.split();

        let mut opening = vec![protocol::sync_step1(&self.doc)];
        self.awareness.renew_local();
        match self.awareness.encode_local() {
            Ok(Some(update)) => opening.push(protocol::awareness(update)),
            Ok(None) => {}
            Err(error) => warn!(%error, "failed to encode presence for handshake"),
        }
        for frame in opening {
            if sink.send(WsMessage::Binary(frame.into())).await.is_err() {
                return SocketEnd::Lost;
            }
        }

        loop {
            // Shutdown first, so no frame reaches a document `stop` already destroyed.
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    while let Ok(frame) = outbound.try_recv() {
                        if sink.send(WsMessage::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.close().await;
                    return SocketEnd::Shutdown;
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        return SocketEnd::Shutdown;
                    };
                    if sink.send(WsMessage::Binary(frame.into())).await.is_err() {
                        return SocketEnd::Lost;
                    }
                }
                incoming = stream.next() => {
                    let Some(Ok(message)) = incoming else {
                        return SocketEnd::Lost;
                    };
                    match message {
                        WsMessage::Binary(payload) => {
                            let replies = protocol::handle_frame(
                                payload.as_ref(),
                                &self.doc,
                                &self.awareness,
                            )
                            .unwrap_or_else(|error| {
                                warn!(?error, "failed to process relay frame");
                                Vec::new()
                            });
                            for reply in replies {
                                if sink.send(WsMessage::Binary(reply.into())).await.is_err() {
                                    return SocketEnd::Lost;
                                }
                            }
                        }
                        WsMessage::Ping(payload) => {
                            if sink.send(WsMessage::Pong(payload)).await.is_err() {
                                return SocketEnd::Lost;
                            }
                        }
                        WsMessage::Close(_) => return SocketEnd::Lost,
                        _ => {}
                    }
                }
            }
        }
    }
}
