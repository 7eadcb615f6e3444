// Sync transport: keeps a replicated document and its awareness channel in
// step with every other connection to the same room.
//
// `Transport` is the seam: the WebSocket client talks to a real relay, the
// in-memory relay wires sessions together inside one process for tests.

pub mod memory;
pub mod protocol;
pub mod ws;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cowrite_common::{ConnectionStatus, EndpointError, RelayEndpoint};
use thiserror::Error;

use crate::engine::awareness::{AwarenessChannel, AwarenessError};
use crate::engine::doc::{DocError, ReplicatedDoc};
use crate::engine::listeners::{ListenerId, Listeners};

pub use memory::MemoryRelay;
pub use ws::WsTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Doc(#[from] DocError),

    #[error(transparent)]
    Awareness(#[from] AwarenessError),

    #[error("websocket transport needs a running tokio runtime")]
    NoRuntime,

    #[error("transport refused connection: {0}")]
    Refused(String),
}

pub trait Transport: Send + Sync + 'static {
    /// Start syncing `doc` with the room at `endpoint`. Must not block: the
    /// handle is returned right away with status `Connecting` and progresses
    /// on its own.
    fn connect(
        &self,
        endpoint: &RelayEndpoint,
        doc: Arc<ReplicatedDoc>,
    ) -> Result<TransportHandle, TransportError>;
}

impl<T: Transport> Transport for Arc<T> {
    fn connect(
        &self,
        endpoint: &RelayEndpoint,
        doc: Arc<ReplicatedDoc>,
    ) -> Result<TransportHandle, TransportError> {
        (**self).connect(endpoint, doc)
    }
}

/// Current connection status plus the listeners waiting on transitions.
pub struct StatusChannel {
    current: Mutex<ConnectionStatus>,
    socket_open: AtomicBool,
    listeners: Listeners<ConnectionStatus>,
}

impl StatusChannel {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(ConnectionStatus::Connecting),
            socket_open: AtomicBool::new(false),
            listeners: Listeners::new(),
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_socket_open(&self) -> bool {
        self.socket_open.load(Ordering::SeqCst)
    }

    /// Record a transition. Listeners only hear about actual changes.
    pub fn set(&self, status: ConnectionStatus) {
        self.socket_open.store(status.is_connected(), Ordering::SeqCst);
        let changed = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            self.listeners.emit(&status);
        }
    }

    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    pub fn off_change(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

type Closer = Box<dyn FnOnce() + Send>;

/// A live (or reconnecting) transport connection owned by one session.
pub struct TransportHandle {
    status: Arc<StatusChannel>,
    awareness: Arc<AwarenessChannel>,
    closer: Mutex<Option<Closer>>,
}

impl TransportHandle {
    /// `close` runs exactly once, on the first [`TransportHandle::disconnect`]
    /// or when the handle is dropped.
    pub fn new<F>(status: Arc<StatusChannel>, awareness: Arc<AwarenessChannel>, close: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { status, awareness, closer: Mutex::new(Some(Box::new(close))) }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.current()
    }

    /// True once the socket to the relay is open, even if no status
    /// listener has been notified yet.
    pub fn is_socket_connected(&self) -> bool {
        self.status.is_socket_open()
    }

    pub fn on_status<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.status.on_change(listener)
    }

    pub fn off_status(&self, id: ListenerId) -> bool {
        self.status.off_change(id)
    }

    pub fn awareness(&self) -> &Arc<AwarenessChannel> {
        &self.awareness
    }

    /// Close the connection and release transport resources. Idempotent.
    pub fn disconnect(&self) {
        let closer = self.closer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(close) = closer {
            close();
            self.status.set(ConnectionStatus::Disconnected);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closer.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Reconnection backoff: exponential from `base_delay`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(250), max_delay: Duration::from_secs(30) }
    }
}

impl ReconnectPolicy {
    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        let base_delay = Duration::from_millis(base_ms.max(1));
        Self { base_delay, max_delay: Duration::from_millis(max_ms).max(base_delay) }
    }

    /// Delay before the next attempt after `consecutive_failures` failures in a row.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.min(7);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}
