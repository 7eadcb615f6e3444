// Room registry: one in-memory document + awareness per room, shared by
// every connection to that room and dropped when the last one leaves.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info};
use yrs::encoding::read::Cursor;
use yrs::sync::{Awareness, DefaultProtocol, Message, MessageReader, Protocol, SyncMessage};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, Update};

pub const FRAME_BUFFER_SIZE: usize = 256;

/// A frame to fan out, tagged with the connection it came from.
pub type RoomFrame = (u64, Vec<u8>);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RoomSummary {
    pub room: String,
    pub connections: usize,
    pub opened_at: DateTime<Utc>,
}

/// What one inbound frame produced: replies for the sender and frames for
/// everyone else in the room.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub replies: Vec<Vec<u8>>,
    pub fanout: Vec<Vec<u8>>,
}

pub struct Room {
    name: String,
    awareness: AsyncMutex<Awareness>,
    frames: broadcast::Sender<RoomFrame>,
    connections: AtomicUsize,
    opened_at: DateTime<Utc>,
}

impl Room {
    fn new(name: &str, frame_buffer: usize) -> Self {
        let (frames, _) = broadcast::channel(frame_buffer);
        Self {
            name: name.to_string(),
            awareness: AsyncMutex::new(Awareness::new(Doc::new())),
            frames,
            connections: AtomicUsize::new(0),
            opened_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomFrame> {
        self.frames.subscribe()
    }

    /// Send `frame` to every other connection. Nobody listening is fine.
    pub fn broadcast(&self, from: u64, frame: Vec<u8>) {
        let _ = self.frames.send((from, frame));
    }

    pub async fn text(&self, field: &str) -> String {
        let awareness = self.awareness.lock().await;
        let txn = awareness.doc().transact();
        txn.get_text(field).map(|text| text.get_string(&txn)).unwrap_or_default()
    }

    /// Frames for a fresh connection: our state vector, then the current
    /// presence snapshot when anyone is present.
    pub async fn greeting(&self) -> Result<Vec<Vec<u8>>> {
        let awareness = self.awareness.lock().await;
        let state_vector = awareness.doc().transact().state_vector();
        let mut frames = vec![Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()];
        if !live_clients(&awareness).is_empty() {
            let snapshot = awareness.update().context("failed to encode awareness snapshot")?;
            frames.push(Message::Awareness(snapshot).encode_v1());
        }
        Ok(frames)
    }

    /// Full state for a connection that fell behind the broadcast channel:
    /// the whole document as SyncStep2 plus the presence snapshot.
    pub async fn resync(&self) -> Result<Vec<Vec<u8>>> {
        let awareness = self.awareness.lock().await;
        let state = awareness.doc().transact().encode_diff_v1(&StateVector::default());
        let mut frames = vec![Message::Sync(SyncMessage::SyncStep2(state)).encode_v1()];
        if !live_clients(&awareness).is_empty() {
            let snapshot = awareness.update().context("failed to encode awareness snapshot")?;
            frames.push(Message::Awareness(snapshot).encode_v1());
        }
        Ok(frames)
    }

    /// Apply one binary frame from a connection. `announced` collects the
    /// awareness client ids that connection currently speaks for.
    pub async fn process(
        &self,
        payload: &[u8],
        announced: &mut BTreeSet<u64>,
    ) -> Result<FrameOutcome> {
        let protocol = DefaultProtocol;
        let mut outcome = FrameOutcome::default();
        let awareness = self.awareness.lock().await;
        let mut decoder = DecoderV1::new(Cursor::new(payload));
        let mut reader = MessageReader::new(&mut decoder);

        while let Some(next_message) = reader.next() {
            let message = next_message.context("failed to decode y-sync message")?;
            match message {
                Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                    if let Some(reply) = protocol
                        .handle_sync_step1(&awareness, state_vector)
                        .context("failed to process sync step 1")?
                    {
                        outcome.replies.push(reply.encode_v1());
                    }
                    let ours = awareness.doc().transact().state_vector();
                    outcome.replies.push(Message::Sync(SyncMessage::SyncStep1(ours)).encode_v1());
                }
                Message::Sync(SyncMessage::SyncStep2(update))
                | Message::Sync(SyncMessage::Update(update)) => {
                    let decoded = Update::decode_v1(&update).context("failed to decode update")?;
                    protocol
                        .handle_update(&awareness, decoded)
                        .context("failed to apply document update")?;
                    outcome.fanout.push(Message::Sync(SyncMessage::Update(update)).encode_v1());
                }
                Message::Awareness(update) => {
                    let Some(summary) = awareness
                        .apply_update_summary(update)
                        .context("failed to apply awareness update")?
                    else {
                        continue;
                    };
                    announced.extend(summary.added.iter().chain(&summary.updated).copied());
                    for client_id in &summary.removed {
                        announced.remove(client_id);
                    }
                    let changed = summary.all_changes();
                    if changed.is_empty() {
                        continue;
                    }
                    let relayed = awareness
                        .update_with_clients(changed)
                        .context("failed to encode awareness change")?;
                    outcome.fanout.push(Message::Awareness(relayed).encode_v1());
                }
                Message::AwarenessQuery => {
                    let full = awareness.update().context("failed to answer awareness query")?;
                    outcome.replies.push(Message::Awareness(full).encode_v1());
                }
                other => {
                    debug!(room = %self.name, ?other, "ignoring unsupported y-sync message");
                }
            }
        }

        Ok(outcome)
    }

    /// Drop the presence entries a closing connection announced and return
    /// the removal frame for the rest of the room.
    pub async fn forget(&self, announced: &BTreeSet<u64>) -> Result<Option<Vec<u8>>> {
        let awareness = self.awareness.lock().await;
        let live = live_clients(&awareness);
        let removed: Vec<u64> = announced.iter().copied().filter(|id| live.contains(id)).collect();
        if removed.is_empty() {
            return Ok(None);
        }
        for client_id in &removed {
            awareness.remove_state(*client_id);
        }
        debug!(room = %self.name, count = removed.len(), "removed departed presence entries");
        let update = awareness
            .update_with_clients(removed)
            .context("failed to encode presence removal")?;
        Ok(Some(Message::Awareness(update).encode_v1()))
    }
}

fn live_clients(awareness: &Awareness) -> BTreeSet<u64> {
    awareness
        .iter()
        .filter(|(_, state)| state.data.is_some())
        .map(|(client_id, _)| client_id)
        .collect()
}

#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<HashMap<String, Arc<Room>>>>,
    next_connection: Arc<AtomicU64>,
    frame_buffer: usize,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::with_frame_buffer(FRAME_BUFFER_SIZE)
    }
}

impl RoomRegistry {
    /// Rooms whose broadcast channel holds `frame_buffer` frames per
    /// connection before a slow one lags.
    pub fn with_frame_buffer(frame_buffer: usize) -> Self {
        Self {
            rooms: Arc::default(),
            next_connection: Arc::default(),
            frame_buffer: frame_buffer.max(1),
        }
    }

    /// Register a connection, creating the room on first use.
    pub fn join(&self, name: &str) -> (u64, Arc<Room>) {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        let mut rooms = self.lock();
        let room = rooms.entry(name.to_string()).or_insert_with(|| {
            info!(room = %name, "room opened");
            Arc::new(Room::new(name, self.frame_buffer))
        });
        room.connections.fetch_add(1, Ordering::SeqCst);
        (connection_id, Arc::clone(room))
    }

    /// Unregister a connection; the room goes away with its last one.
    pub fn leave(&self, room: &Arc<Room>) {
        let mut rooms = self.lock();
        if room.connections.fetch_sub(1, Ordering::SeqCst) > 1 {
            return;
        }
        let current = rooms.get(&room.name).is_some_and(|entry| Arc::ptr_eq(entry, room));
        if current {
            rooms.remove(&room.name);
            info!(room = %room.name, "room closed");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.lock().get(name).cloned()
    }

    pub fn list(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .lock()
            .values()
            .map(|room| RoomSummary {
                room: room.name.clone(),
                connections: room.connections(),
                opened_at: room.opened_at,
            })
            .collect();
        rooms.sort_by(|a, b| a.room.cmp(&b.room));
        rooms
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
