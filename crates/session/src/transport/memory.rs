// In-process relay: connects sessions in the same process without sockets.
//
// Used by the test suites and by editors that want a local-only room. Peers in
// the same room exchange document updates and presence synchronously. The
// relay can be taken offline to exercise reconnect paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use cowrite_common::{ConnectionStatus, RelayEndpoint};
use tracing::{debug, warn};
use yrs::Subscription;

use super::{StatusChannel, Transport, TransportError, TransportHandle};
use crate::engine::awareness::{AwarenessChange, AwarenessChannel, ChangeOrigin};
use crate::engine::doc::{ReplicatedDoc, UpdateSource};
use crate::engine::listeners::ListenerId;

#[derive(Clone)]
pub struct MemoryRelay {
    state: Arc<RelayState>,
}

struct RelayState {
    rooms: Mutex<HashMap<String, Vec<Arc<Peer>>>>,
    online: AtomicBool,
    auto_link: bool,
    next_peer: AtomicU64,
}

struct Peer {
    serial: u64,
    room: String,
    doc: Arc<ReplicatedDoc>,
    awareness: Arc<AwarenessChannel>,
    status: Arc<StatusChannel>,
    linked: AtomicBool,
    hooks: Mutex<Option<PeerHooks>>,
}

struct PeerHooks {
    _doc: Subscription,
    presence: ListenerId,
}

impl MemoryRelay {
    /// Connections link up as soon as they are made (while the relay is online).
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Connections stay `Connecting` until [`MemoryRelay::link_pending`] is called.
    pub fn manual() -> Self {
        Self::build(false)
    }

    fn build(auto_link: bool) -> Self {
        Self {
            state: Arc::new(RelayState {
                rooms: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                auto_link,
                next_peer: AtomicU64::new(1),
            }),
        }
    }

    /// Link every waiting connection. Returns how many were linked.
    pub fn link_pending(&self) -> usize {
        if !self.state.online.load(Ordering::SeqCst) {
            return 0;
        }
        let waiting: Vec<Arc<Peer>> =
            self.state.all_peers().into_iter().filter(|peer| !peer.is_linked()).collect();
        for peer in &waiting {
            self.state.link(peer);
        }
        waiting.len()
    }

    /// Simulate the relay going away (`false`) or coming back (`true`).
    pub fn set_online(&self, online: bool) {
        let was_online = self.state.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }
        let peers = self.state.all_peers();
        if online {
            for peer in &peers {
                peer.status.set(ConnectionStatus::Connecting);
            }
            if self.state.auto_link {
                for peer in &peers {
                    self.state.link(peer);
                }
            }
        } else {
            for peer in &peers {
                self.state.unlink(peer);
            }
        }
        debug!(online, peers = peers.len(), "memory relay availability changed");
    }

    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    pub fn peer_count(&self, room: &str) -> usize {
        self.state.rooms().get(room).map_or(0, Vec::len)
    }

    pub fn linked_count(&self, room: &str) -> usize {
        let rooms = self.state.rooms();
        rooms.get(room).map_or(0, |peers| peers.iter().filter(|p| p.is_linked()).count())
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryRelay {
    fn connect(
        &self,
        endpoint: &RelayEndpoint,
        doc: Arc<ReplicatedDoc>,
    ) -> Result<TransportHandle, TransportError> {
        let awareness = Arc::new(AwarenessChannel::new(&doc));
        let status = Arc::new(StatusChannel::new());
        let peer = Arc::new(Peer {
            serial: self.state.next_peer.fetch_add(1, Ordering::Relaxed),
            room: endpoint.room().to_string(),
            doc: Arc::clone(&doc),
            awareness: Arc::clone(&awareness),
            status: Arc::clone(&status),
            linked: AtomicBool::new(false),
            hooks: Mutex::new(None),
        });

        let relay = Arc::downgrade(&self.state);
        let source = Arc::downgrade(&peer);
        let doc_subscription = doc.observe_updates(move |origin, update| {
            if origin != UpdateSource::Local {
                return;
            }
            if let (Some(relay), Some(peer)) = (relay.upgrade(), source.upgrade()) {
                relay.forward_update(&peer, update);
            }
        })?;

        let relay = Arc::downgrade(&self.state);
        let source = Arc::downgrade(&peer);
        let presence = awareness.on_change(move |change| {
            if change.origin != ChangeOrigin::Local {
                return;
            }
            if let (Some(relay), Some(peer)) = (relay.upgrade(), source.upgrade()) {
                relay.forward_presence(&peer, change);
            }
        });
        *peer.hooks.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(PeerHooks { _doc: doc_subscription, presence });

        self.state.rooms().entry(peer.room.clone()).or_default().push(Arc::clone(&peer));
        debug!(room = %peer.room, peer = peer.serial, "memory peer joined");

        if self.state.auto_link && self.state.online.load(Ordering::SeqCst) {
            self.state.link(&peer);
        }

        let relay: Weak<RelayState> = Arc::downgrade(&self.state);
        Ok(TransportHandle::new(status, awareness, move || {
            if let Some(relay) = relay.upgrade() {
                relay.leave(&peer);
            }
        }))
    }
}

impl Peer {
    fn is_linked(&self) -> bool {
        self.linked.load(Ordering::SeqCst)
    }
}

impl RelayState {
    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<Peer>>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.rooms().values().flatten().cloned().collect()
    }

    /// Linked peers in `peer`'s room, excluding `peer`. Collected under the
    /// lock and returned so callers apply updates without holding it.
    fn linked_neighbours(&self, peer: &Peer) -> Vec<Arc<Peer>> {
        self.rooms()
            .get(&peer.room)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|other| other.serial != peer.serial && other.is_linked())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn link(&self, peer: &Arc<Peer>) {
        if peer.linked.swap(true, Ordering::SeqCst) {
            return;
        }
        peer.awareness.renew_local();
        for other in self.linked_neighbours(peer) {
            exchange_state(peer, &other);
            exchange_state(&other, peer);
        }
        peer.status.set(ConnectionStatus::Connected);
    }

    fn unlink(&self, peer: &Arc<Peer>) {
        if !peer.linked.swap(false, Ordering::SeqCst) {
            return;
        }
        let client_id = peer.awareness.client_id();
        for other in self.linked_neighbours(peer) {
            other.awareness.remove_states(&[client_id]);
        }
        peer.awareness.remove_remote_states();
        peer.status.set(ConnectionStatus::Disconnected);
    }

    fn leave(&self, peer: &Arc<Peer>) {
        self.unlink(peer);
        let hooks = peer.hooks.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(hooks) = hooks {
            peer.awareness.off_change(hooks.presence);
        }
        peer.awareness.clear_local();

        let mut rooms = self.rooms();
        if let Some(peers) = rooms.get_mut(&peer.room) {
            peers.retain(|other| other.serial != peer.serial);
            if peers.is_empty() {
                rooms.remove(&peer.room);
            }
        }
        debug!(room = %peer.room, peer = peer.serial, "memory peer left");
    }

    fn forward_update(&self, peer: &Peer, update: &[u8]) {
        if !peer.is_linked() {
            return;
        }
        for other in self.linked_neighbours(peer) {
            if let Err(error) = other.doc.apply_update(update) {
                warn!(%error, room = %peer.room, "memory relay failed to deliver update");
            }
        }
    }

    fn forward_presence(&self, peer: &Peer, change: &AwarenessChange) {
        if !peer.is_linked() {
            return;
        }
        let neighbours = self.linked_neighbours(peer);
        if neighbours.is_empty() {
            return;
        }
        let update = match peer.awareness.encode_clients(&change.changed_clients()) {
            Ok(update) => update,
            Err(error) => {
                warn!(%error, "memory relay failed to encode presence");
                return;
            }
        };
        for other in neighbours {
            if let Err(error) = other.awareness.apply_remote_update(update.clone()) {
                warn!(%error, "memory relay failed to deliver presence");
            }
        }
    }
}

/// Bring `to` up to date with everything `from` knows.
fn exchange_state(from: &Peer, to: &Peer) {
    let diff = from.doc.diff_since(&to.doc.state_vector());
    if let Err(error) = to.doc.apply_update(&diff) {
        warn!(%error, "memory relay failed to sync document");
    }
    match from.awareness.encode_local() {
        Ok(Some(update)) => {
            if let Err(error) = to.awareness.apply_remote_update(update) {
                warn!(%error, "memory relay failed to sync presence");
            }
        }
        Ok(None) => {}
        Err(error) => warn!(%error, "memory relay failed to encode presence"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::doc::DEFAULT_FIELD;
    use cowrite_common::UserProfile;

    fn endpoint(room: &str) -> RelayEndpoint {
        RelayEndpoint::new("memory.local", room).unwrap()
    }

    fn join(
        relay: &MemoryRelay,
        room: &str,
        client_id: u64,
    ) -> (Arc<ReplicatedDoc>, TransportHandle) {
        let doc = Arc::new(ReplicatedDoc::with_client_id(client_id));
        let handle = relay.connect(&endpoint(room), Arc::clone(&doc)).unwrap();
        (doc, handle)
    }

    #[test]
    fn peers_in_a_room_share_edits_and_presence() {
        let relay = MemoryRelay::new();
        let (ava_doc, ava) = join(&relay, "doc-1", 1);
        ava_doc.insert_text(DEFAULT_FIELD, 0, "before ben").unwrap();
        ava.awareness().set_local_field("user", &UserProfile::new("Ava", "#60a5fa")).unwrap();

        let (ben_doc, ben) = join(&relay, "doc-1", 2);
        assert_eq!(ben.status(), ConnectionStatus::Connected);
        assert_eq!(ben_doc.get_text_string(DEFAULT_FIELD), "before ben");
        assert!(ben.awareness().snapshot().contains_key(&1));

        ben_doc.insert_text(DEFAULT_FIELD, 0, ">").unwrap();
        assert_eq!(ava_doc.get_text_string(DEFAULT_FIELD), ">before ben");
    }

    #[test]
    fn rooms_are_isolated() {
        let relay = MemoryRelay::new();
        let (a_doc, _a) = join(&relay, "one", 1);
        let (b_doc, _b) = join(&relay, "two", 2);
        a_doc.insert_text(DEFAULT_FIELD, 0, "private").unwrap();
        assert_eq!(b_doc.get_text_string(DEFAULT_FIELD), "");
    }

    #[test]
    fn manual_relay_waits_for_link() {
        let relay = MemoryRelay::manual();
        let (_doc, handle) = join(&relay, "r", 1);
        assert_eq!(handle.status(), ConnectionStatus::Connecting);
        assert_eq!(relay.link_pending(), 1);
        assert_eq!(handle.status(), ConnectionStatus::Connected);
        assert_eq!(relay.link_pending(), 0);
    }

    #[test]
    fn going_offline_drops_remote_presence() {
        let relay = MemoryRelay::new();
        let (_a_doc, ava) = join(&relay, "r", 1);
        let (_b_doc, ben) = join(&relay, "r", 2);
        ben.awareness().set_local_field("user", &UserProfile::new("Ben", "#34d399")).unwrap();
        assert!(ava.awareness().snapshot().contains_key(&2));

        relay.set_online(false);
        assert_eq!(ava.status(), ConnectionStatus::Disconnected);
        assert!(!ava.awareness().snapshot().contains_key(&2));

        relay.set_online(true);
        assert_eq!(ava.status(), ConnectionStatus::Connected);
        assert!(ava.awareness().snapshot().contains_key(&2));
    }

    #[test]
    fn disconnect_removes_peer_and_its_presence() {
        let relay = MemoryRelay::new();
        let (_a_doc, ava) = join(&relay, "r", 1);
        let (_b_doc, ben) = join(&relay, "r", 2);
        ben.awareness().set_local_field("user", &UserProfile::new("Ben", "#34d399")).unwrap();

        ben.disconnect();
        assert_eq!(relay.peer_count("r"), 1);
        assert!(!ava.awareness().snapshot().contains_key(&2));
        assert_eq!(ben.status(), ConnectionStatus::Disconnected);

        ava.disconnect();
        assert_eq!(relay.peer_count("r"), 0);
    }
}
