// Collaboration session manager.
//
// Owns one document, one transport and the awareness channel that comes with
// it. Exposes connection status, the roster and the ready flag to the editor,
// and hands out editor extensions once the transport exists.
//
// Startup order: document, transport, local `user` field, extensions, status
// listener, awareness listener, initial roster pass, then `ready`.
// Teardown order: listeners, throttle, transport, document.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use cowrite_common::{ConnectionStatus, Participant, ProfilePatch, RelayEndpoint, UserProfile};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::binding::{CursorBinding, DocumentBinding, EditorExtension, USER_FIELD};
use crate::engine::awareness::AwarenessChannel;
use crate::engine::doc::ReplicatedDoc;
use crate::engine::listeners::ListenerId;
use crate::engine::roster::Roster;
use crate::engine::throttle::{Throttle, ThrottleConfig};
use crate::transport::{Transport, TransportHandle, WsTransport};

/// What a session needs to start. Collaboration is enabled only when both
/// `room` and `host` are present and non-blank.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room: Option<String>,
    pub host: Option<String>,
    pub user: UserProfile,
}

impl SessionConfig {
    pub fn new(room: Option<String>, host: Option<String>, user: UserProfile) -> Self {
        Self { room, host, user }
    }

    pub fn is_enabled(&self) -> bool {
        non_blank(&self.room).is_some() && non_blank(&self.host).is_some()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

/// Starts sessions against one transport.
#[derive(Clone)]
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    throttle: ThrottleConfig,
}

impl SessionManager {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self { transport: Arc::new(transport), throttle: ThrottleConfig::default() }
    }

    /// Sessions over the WebSocket transport with default backoff.
    pub fn websocket() -> Self {
        Self::new(WsTransport::new())
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn start(&self, config: SessionConfig) -> CollabSession {
        let enabled = config.is_enabled();
        let session = CollabSession {
            inner: Arc::new(SessionInner {
                enabled,
                room: non_blank(&config.room).map(str::to_string),
                ready: watch::channel(false).0,
                status: watch::channel(ConnectionStatus::Connecting).0,
                roster: Roster::new(),
                extensions: Mutex::new(Vec::new()),
                active: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        };

        if !enabled {
            debug!("collaboration disabled: room or relay host missing");
            session.inner.status.send_replace(ConnectionStatus::Disconnected);
            session.inner.ready.send_replace(true);
            return session;
        }

        if let Err(error) = self.attach(&session.inner, &config) {
            warn!(%error, room = ?session.inner.room, "collaboration unavailable, editing locally");
            session.inner.status.send_replace(ConnectionStatus::Disconnected);
            session.inner.ready.send_replace(true);
        }
        session
    }

    /// Same as [`CollabSession::stop`].
    pub fn stop(&self, session: &CollabSession) {
        session.stop();
    }

    fn attach(&self, inner: &Arc<SessionInner>, config: &SessionConfig) -> anyhow::Result<()> {
        let host = non_blank(&config.host).unwrap_or_default();
        let room = non_blank(&config.room).unwrap_or_default();
        let endpoint = RelayEndpoint::new(host, room)?;

        let doc = Arc::new(ReplicatedDoc::new());
        let transport = match self.transport.connect(&endpoint, Arc::clone(&doc)) {
            Ok(transport) => transport,
            Err(error) => {
                doc.destroy();
                return Err(error.into());
            }
        };
        let awareness = Arc::clone(transport.awareness());

        if let Err(error) = awareness.set_local_field(USER_FIELD, &config.user) {
            warn!(%error, "failed to publish local profile");
        }

        *inner.extensions() = vec![
            EditorExtension::Document(DocumentBinding::new(Arc::clone(&doc))),
            EditorExtension::CursorPresence(CursorBinding::new(Arc::clone(&awareness))),
        ];

        let weak = Arc::downgrade(inner);
        let throttle = Throttle::new(self.throttle, move || {
            if let Some(inner) = weak.upgrade() {
                inner.refresh_roster();
            }
        });

        let weak: Weak<SessionInner> = Arc::downgrade(inner);
        let status_listener = transport.on_status(move |status| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            debug!(status = %status, room = ?inner.room, "transport status changed");
            inner.status.send_replace(*status);
            if status.is_connected() {
                inner.refresh_roster();
            }
        });

        let trigger = throttle.clone();
        let awareness_listener = awareness.on_change(move |_| trigger.trigger());

        *inner.active() = Some(ActiveSession {
            doc,
            transport,
            awareness,
            throttle: throttle.clone(),
            status_listener,
            awareness_listener,
        });

        throttle.trigger();
        let initial = inner
            .active()
            .as_ref()
            .map(|active| {
                if active.transport.is_socket_connected() {
                    ConnectionStatus::Connected
                } else {
                    active.transport.status()
                }
            })
            .unwrap_or(ConnectionStatus::Disconnected);
        inner.status.send_replace(initial);
        inner.ready.send_replace(true);
        info!(room = %endpoint.room(), url = %endpoint, "collaboration session started");
        Ok(())
    }
}

struct ActiveSession {
    doc: Arc<ReplicatedDoc>,
    transport: TransportHandle,
    awareness: Arc<AwarenessChannel>,
    throttle: Throttle,
    status_listener: ListenerId,
    awareness_listener: ListenerId,
}

struct SessionInner {
    enabled: bool,
    room: Option<String>,
    ready: watch::Sender<bool>,
    status: watch::Sender<ConnectionStatus>,
    roster: Roster,
    extensions: Mutex<Vec<EditorExtension>>,
    active: Mutex<Option<ActiveSession>>,
    stopped: AtomicBool,
}

impl SessionInner {
    fn active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn extensions(&self) -> MutexGuard<'_, Vec<EditorExtension>> {
        self.extensions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn awareness(&self) -> Option<Arc<AwarenessChannel>> {
        self.active().as_ref().map(|active| Arc::clone(&active.awareness))
    }

    fn refresh_roster(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Some(awareness) = self.awareness() {
            if self.roster.reconcile(&awareness.snapshot()) {
                debug!(participants = self.roster.current().len(), "roster changed");
            }
        }
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let active = self.active().take();
        let Some(active) = active else {
            return;
        };
        active.awareness.off_change(active.awareness_listener);
        active.transport.off_status(active.status_listener);
        active.throttle.cancel();
        self.extensions().clear();
        active.transport.disconnect();
        active.doc.destroy();
        self.status.send_replace(ConnectionStatus::Disconnected);
        info!(room = ?self.room, "collaboration session stopped");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a started session. Clones share the session; it is stopped by
/// [`CollabSession::stop`] or when the last clone is dropped.
#[derive(Clone)]
pub struct CollabSession {
    inner: Arc<SessionInner>,
}

impl CollabSession {
    /// Fixed at start.
    pub fn enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn room(&self) -> Option<&str> {
        self.inner.room.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub fn ready(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status().is_connected()
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.inner.roster.current()
    }

    pub fn subscribe_roster(&self) -> watch::Receiver<Vec<Participant>> {
        self.inner.roster.subscribe()
    }

    /// Number of roster recomputations so far, published or not.
    pub fn roster_recomputations(&self) -> u64 {
        self.inner.roster.recomputations()
    }

    /// Extensions for the host editor. Empty until the session is ready and
    /// after it stops; always empty for a disabled session.
    pub fn extensions(&self) -> Vec<EditorExtension> {
        if !self.is_ready() {
            return Vec::new();
        }
        self.inner.extensions().clone()
    }

    pub fn document(&self) -> Option<Arc<ReplicatedDoc>> {
        self.inner.active().as_ref().map(|active| Arc::clone(&active.doc))
    }

    pub fn awareness(&self) -> Option<Arc<AwarenessChannel>> {
        self.inner.awareness()
    }

    /// Merge `patch` into the published profile. Does nothing for a disabled
    /// or stopped session, or before a profile was published.
    pub fn update_local_user(&self, patch: &ProfilePatch) {
        if !self.inner.enabled || self.is_stopped() || patch.is_empty() {
            return;
        }
        let Some(awareness) = self.inner.awareness() else {
            return;
        };
        let Some(current) = awareness.local_field::<UserProfile>(USER_FIELD) else {
            return;
        };
        if let Err(error) = awareness.set_local_field(USER_FIELD, &current.merged(patch)) {
            warn!(%error, "failed to update local profile");
        }
    }

    /// Tear down transport then document. Safe to call repeatedly.
    pub fn stop(&self) {
        self.inner.shutdown();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}
