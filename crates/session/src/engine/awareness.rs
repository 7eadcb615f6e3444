// Awareness channel: ephemeral per-connection presence on top of yrs awareness.
//
// Every connection owns one entry keyed by its client id. The local entry is a
// JSON object whose fields (`user`, `cursor`, ...) are written independently.
// Change notifications are delivered through our own listener registry with
// an explicit local/remote origin.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use yrs::sync::{Awareness, AwarenessUpdate};

use super::doc::ReplicatedDoc;
use super::listeners::{ListenerId, Listeners};

#[derive(Debug, Error)]
pub enum AwarenessError {
    #[error("failed to encode presence field `{field}`: {reason}")]
    Encode { field: String, reason: String },

    #[error("failed to apply awareness update: {0}")]
    Apply(String),

    #[error("failed to encode awareness update: {0}")]
    Update(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Which entries changed in one awareness mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
    pub origin: ChangeOrigin,
}

impl AwarenessChange {
    fn local(added: Vec<u64>, updated: Vec<u64>, removed: Vec<u64>) -> Self {
        Self { added, updated, removed, origin: ChangeOrigin::Local }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn changed_clients(&self) -> Vec<u64> {
        self.added.iter().chain(&self.updated).chain(&self.removed).copied().collect()
    }
}

pub struct AwarenessChannel {
    awareness: Mutex<Awareness>,
    client_id: u64,
    listeners: Listeners<AwarenessChange>,
}

impl AwarenessChannel {
    pub fn new(doc: &ReplicatedDoc) -> Self {
        let awareness = Awareness::new(doc.inner().clone());
        let client_id = awareness.client_id();
        Self { awareness: Mutex::new(awareness), client_id, listeners: Listeners::new() }
    }

    /// Connection identifier of the local entry (the document's client id).
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Write one field of the local entry, keeping every other field.
    pub fn set_local_field<T: Serialize + ?Sized>(
        &self,
        field: &str,
        value: &T,
    ) -> Result<(), AwarenessError> {
        let value = serde_json::to_value(value).map_err(|error| AwarenessError::Encode {
            field: field.to_string(),
            reason: error.to_string(),
        })?;
        let mut fields = Map::new();
        fields.insert(field.to_string(), value);
        self.set_local(fields)
    }

    /// Merge `fields` into the local entry.
    pub fn set_local(&self, fields: Map<String, Value>) -> Result<(), AwarenessError> {
        let change = {
            let awareness = self.lock();
            let previous = local_entry(&awareness, self.client_id);
            let existed = previous.is_some();
            let mut merged = previous.unwrap_or_default();
            merged.extend(fields);
            awareness.set_local_state(&Value::Object(merged)).map_err(|error| {
                AwarenessError::Encode { field: "<local>".to_string(), reason: error.to_string() }
            })?;
            if existed {
                AwarenessChange::local(Vec::new(), vec![self.client_id], Vec::new())
            } else {
                AwarenessChange::local(vec![self.client_id], Vec::new(), Vec::new())
            }
        };
        self.listeners.emit(&change);
        Ok(())
    }

    /// Read one field of the local entry, if present and of the expected shape.
    pub fn local_field<T: DeserializeOwned>(&self, field: &str) -> Option<T> {
        let entry = local_entry(&self.lock(), self.client_id)?;
        serde_json::from_value(entry.get(field)?.clone()).ok()
    }

    pub fn local_state(&self) -> Option<Map<String, Value>> {
        local_entry(&self.lock(), self.client_id)
    }

    /// Re-publish the local entry under a fresh clock, so peers that dropped
    /// it while disconnected accept it again. Listeners are not notified.
    pub fn renew_local(&self) -> bool {
        let awareness = self.lock();
        match local_entry(&awareness, self.client_id) {
            Some(fields) => awareness.set_local_state(&Value::Object(fields)).is_ok(),
            None => false,
        }
    }

    /// Drop the local entry so peers see this connection leave.
    pub fn clear_local(&self) {
        let had_state = {
            let awareness = self.lock();
            let had_state = local_entry(&awareness, self.client_id).is_some();
            if had_state {
                awareness.clean_local_state();
            }
            had_state
        };
        if had_state {
            let removed = vec![self.client_id];
            self.listeners.emit(&AwarenessChange::local(Vec::new(), Vec::new(), removed));
        }
    }

    /// Every entry that currently carries state, keyed by connection id.
    /// Entries whose payload is not valid JSON are skipped.
    pub fn snapshot(&self) -> BTreeMap<u64, Value> {
        let awareness = self.lock();
        awareness
            .iter()
            .filter_map(|(client_id, state)| {
                let raw = state.data?;
                let value = serde_json::from_str(raw.as_ref()).ok()?;
                Some((client_id, value))
            })
            .collect()
    }

    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    pub fn off_change(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Merge an update received from the relay. Returns the change, if any
    /// entry was actually added, updated, or removed.
    pub fn apply_remote_update(
        &self,
        update: AwarenessUpdate,
    ) -> Result<Option<AwarenessChange>, AwarenessError> {
        let summary = self
            .lock()
            .apply_update_summary(update)
            .map_err(|error| AwarenessError::Apply(error.to_string()))?;
        let Some(summary) = summary else {
            return Ok(None);
        };
        let change = AwarenessChange {
            added: summary.added,
            updated: summary.updated,
            removed: summary.removed,
            origin: ChangeOrigin::Remote,
        };
        if change.is_empty() {
            return Ok(None);
        }
        self.listeners.emit(&change);
        Ok(Some(change))
    }

    /// Forget the given peers, e.g. when the relay reports they left.
    pub fn remove_states(&self, client_ids: &[u64]) -> Vec<u64> {
        let removed: Vec<u64> = {
            let awareness = self.lock();
            let present = live_clients(&awareness);
            let removed: Vec<u64> = client_ids
                .iter()
                .copied()
                .filter(|client_id| *client_id != self.client_id && present.contains(client_id))
                .collect();
            for client_id in &removed {
                awareness.remove_state(*client_id);
            }
            removed
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "removed remote awareness entries");
            self.listeners.emit(&AwarenessChange {
                added: Vec::new(),
                updated: Vec::new(),
                removed: removed.clone(),
                origin: ChangeOrigin::Remote,
            });
        }
        removed
    }

    /// Forget every peer. Used when the connection to the relay is lost.
    pub fn remove_remote_states(&self) -> Vec<u64> {
        let remote: Vec<u64> = live_clients(&self.lock())
            .into_iter()
            .filter(|client_id| *client_id != self.client_id)
            .collect();
        self.remove_states(&remote)
    }

    /// Encode every known entry, for answering an awareness query.
    pub fn encode_full(&self) -> Result<AwarenessUpdate, AwarenessError> {
        self.lock().update().map_err(|error| AwarenessError::Update(error.to_string()))
    }

    pub fn encode_clients(&self, client_ids: &[u64]) -> Result<AwarenessUpdate, AwarenessError> {
        self.lock()
            .update_with_clients(client_ids.to_vec())
            .map_err(|error| AwarenessError::Update(error.to_string()))
    }

    /// Encode only the local entry, or `None` if it was never set.
    pub fn encode_local(&self) -> Result<Option<AwarenessUpdate>, AwarenessError> {
        let awareness = self.lock();
        let known = awareness.iter().any(|(client_id, _)| client_id == self.client_id);
        if !known {
            return Ok(None);
        }
        awareness
            .update_with_clients([self.client_id])
            .map(Some)
            .map_err(|error| AwarenessError::Update(error.to_string()))
    }

    fn lock(&self) -> MutexGuard<'_, Awareness> {
        self.awareness.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn live_clients(awareness: &Awareness) -> Vec<u64> {
    awareness
        .iter()
        .filter(|(_, state)| state.data.is_some())
        .map(|(client_id, _)| client_id)
        .collect()
}

fn local_entry(awareness: &Awareness, client_id: u64) -> Option<Map<String, Value>> {
    awareness.iter().find(|(id, _)| *id == client_id).and_then(|(_, state)| {
        let raw = state.data?;
        match serde_json::from_str(raw.as_ref()).ok()? {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    })
}
