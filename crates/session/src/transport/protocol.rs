// Client side of the y-sync wire protocol.

use anyhow::{Context, Result};
use yrs::encoding::read::Cursor;
use yrs::sync::{AwarenessUpdate, Message, MessageReader, SyncMessage};
use yrs::updates::decoder::DecoderV1;
use yrs::updates::encoder::Encode;

use crate::engine::awareness::AwarenessChannel;
use crate::engine::doc::ReplicatedDoc;

/// Handshake opener: our state vector, so the relay can send what we miss.
pub fn sync_step1(doc: &ReplicatedDoc) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(doc.state_vector())).encode_v1()
}

pub fn update(update: &[u8]) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update.to_vec())).encode_v1()
}

pub fn awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

/// Apply one binary frame from the relay and return the frames to send back.
pub fn handle_frame(
    payload: &[u8],
    doc: &ReplicatedDoc,
    awareness: &AwarenessChannel,
) -> Result<Vec<Vec<u8>>> {
    let mut replies = Vec::new();
    let mut decoder = DecoderV1::new(Cursor::new(payload));
    let mut reader = MessageReader::new(&mut decoder);

    while let Some(next_message) = reader.next() {
        let message = next_message.context("failed to decode y-sync message")?;
        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                let diff = doc.diff_since(&state_vector);
                replies.push(Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1());
            }
            Message::Sync(SyncMessage::SyncStep2(update))
            | Message::Sync(SyncMessage::Update(update)) => {
                doc.apply_update(&update).context("failed to apply remote document update")?;
            }
            Message::Awareness(update) => {
                awareness
                    .apply_remote_update(update)
                    .context("failed to apply remote awareness update")?;
            }
            Message::AwarenessQuery => {
                let full = awareness.encode_full().context("failed to answer awareness query")?;
                replies.push(Message::Awareness(full).encode_v1());
            }
            other => {
                tracing::debug!(?other, "ignoring unsupported y-sync message");
            }
        }
    }

    Ok(replies)
}
