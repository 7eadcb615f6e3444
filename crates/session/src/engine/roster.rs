// Roster: the derived list of participants, rebuilt from awareness snapshots.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use cowrite_common::{CursorRange, Participant, UserProfile};
use serde_json::Value;
use tokio::sync::watch;

/// Build the participant list from an awareness snapshot.
///
/// Entries without a well-formed `user` object are left out; a malformed
/// `cursor` is dropped rather than excluding the entry. Ordered by id.
pub fn participants(snapshot: &BTreeMap<u64, Value>) -> Vec<Participant> {
    snapshot.iter().filter_map(|(id, state)| participant(*id, state)).collect()
}

fn participant(id: u64, state: &Value) -> Option<Participant> {
    let profile: UserProfile = serde_json::from_value(state.get("user")?.clone()).ok()?;
    let cursor = state
        .get("cursor")
        .and_then(|cursor| serde_json::from_value::<CursorRange>(cursor.clone()).ok());
    Some(Participant { id, profile, cursor })
}

/// Observable participant list. Subscribers are only woken when the
/// serialized contents actually change.
pub struct Roster {
    sender: watch::Sender<Vec<Participant>>,
    recomputations: AtomicU64,
}

impl Roster {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Vec::new());
        Self { sender, recomputations: AtomicU64::new(0) }
    }

    /// Recompute from `snapshot`. Returns true if the published list changed.
    pub fn reconcile(&self, snapshot: &BTreeMap<u64, Value>) -> bool {
        self.recomputations.fetch_add(1, Ordering::SeqCst);
        self.publish(participants(snapshot))
    }

    pub fn clear(&self) -> bool {
        self.publish(Vec::new())
    }

    pub fn current(&self) -> Vec<Participant> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Participant>> {
        self.sender.subscribe()
    }

    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::SeqCst)
    }

    fn publish(&self, next: Vec<Participant>) -> bool {
        self.sender.send_if_modified(|current| {
            if differs(current, &next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

fn differs(current: &[Participant], next: &[Participant]) -> bool {
    match (serde_json::to_string(current), serde_json::to_string(next)) {
        (Ok(current), Ok(next)) => current != next,
        _ => current != next,
    }
}
