// Replicated document store: a yrs document plus the bookkeeping the session
// needs around it (origin tagging, local-update observation, teardown).

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Subscription, Text, TextRef, Transact, Update};

/// Transaction origin for updates received from the relay. Observers use it to
/// tell remote edits apart so they are never echoed back.
pub const REMOTE_ORIGIN: &str = "cowrite-remote";

/// Shared text field editors bind to unless told otherwise.
pub const DEFAULT_FIELD: &str = "default";

#[derive(Debug, Error)]
pub enum DocError {
    #[error("document has been destroyed")]
    Destroyed,

    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("failed to apply update: {0}")]
    Apply(String),

    #[error("failed to register update observer: {0}")]
    Observe(String),

    #[error("edit of {len} at {index} is outside text of length {text_len}")]
    OutOfRange { index: u32, len: u32, text_len: u32 },
}

/// Where an observed update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Edit made through this replica.
    Local,
    /// Update merged from a peer via [`ReplicatedDoc::apply_update`].
    Remote,
}

pub struct ReplicatedDoc {
    doc: Doc,
    destroyed: AtomicBool,
}

impl ReplicatedDoc {
    pub fn new() -> Self {
        Self { doc: Doc::new(), destroyed: AtomicBool::new(false) }
    }

    /// Fixed client id, for deterministic tests.
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options), destroyed: AtomicBool::new(false) }
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Merge a v1 update from a peer. Idempotent: re-applying a known update is a no-op.
    pub fn apply_update(&self, data: &[u8]) -> Result<(), DocError> {
        self.ensure_live()?;
        let update = Update::decode_v1(data)
            .map_err(|error| DocError::Decode { what: "update", reason: error.to_string() })?;
        self.doc
            .transact_mut_with(REMOTE_ORIGIN)
            .apply_update(update)
            .map_err(|error| DocError::Apply(error.to_string()))
    }

    /// Full document state as a single v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `remote_sv` is missing.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|error| DocError::Decode { what: "state vector", reason: error.to_string() })?;
        Ok(self.diff_since(&sv))
    }

    pub fn diff_since(&self, sv: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(sv)
    }

    pub fn text(&self, field: &str) -> TextRef {
        self.doc.get_or_insert_text(field)
    }

    pub fn get_text_string(&self, field: &str) -> String {
        let text = self.text(field);
        text.get_string(&self.doc.transact())
    }

    pub fn text_len(&self, field: &str) -> u32 {
        let text = self.text(field);
        text.len(&self.doc.transact())
    }

    pub fn insert_text(&self, field: &str, index: u32, content: &str) -> Result<(), DocError> {
        self.ensure_live()?;
        let text = self.text(field);
        let mut txn = self.doc.transact_mut();
        check_range(index, 0, text.len(&txn))?;
        text.insert(&mut txn, index, content);
        Ok(())
    }

    pub fn remove_text(&self, field: &str, index: u32, len: u32) -> Result<(), DocError> {
        self.ensure_live()?;
        let text = self.text(field);
        let mut txn = self.doc.transact_mut();
        check_range(index, len, text.len(&txn))?;
        if len > 0 {
            text.remove_range(&mut txn, index, len);
        }
        Ok(())
    }

    /// Delete `len` characters at `index` and insert `content` in one transaction.
    pub fn replace_text(
        &self,
        field: &str,
        index: u32,
        len: u32,
        content: &str,
    ) -> Result<(), DocError> {
        self.ensure_live()?;
        let text = self.text(field);
        let mut txn = self.doc.transact_mut();
        check_range(index, len, text.len(&txn))?;
        if len > 0 {
            text.remove_range(&mut txn, index, len);
        }
        if !content.is_empty() {
            text.insert(&mut txn, index, content);
        }
        Ok(())
    }

    /// Observe every committed update. The callback runs inside the committing
    /// transaction and must not open another transaction on this document.
    /// Dropping the returned subscription unregisters the observer.
    pub fn observe_updates<F>(&self, callback: F) -> Result<Subscription, DocError>
    where
        F: Fn(UpdateSource, &[u8]) + Send + Sync + 'static,
    {
        self.ensure_live()?;
        self.doc
            .observe_update_v1(move |txn, event| {
                let source = match txn.origin() {
                    Some(origin) if origin.as_ref() == REMOTE_ORIGIN.as_bytes() => {
                        UpdateSource::Remote
                    }
                    _ => UpdateSource::Local,
                };
                callback(source, &event.update);
            })
            .map_err(|error| DocError::Observe(error.to_string()))
    }

    /// Release the replica. Later edits and merges fail with [`DocError::Destroyed`].
    /// Returns false when the document was already destroyed.
    pub fn destroy(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &Doc {
        &self.doc
    }

    fn ensure_live(&self) -> Result<(), DocError> {
        if self.is_destroyed() {
            Err(DocError::Destroyed)
        } else {
            Ok(())
        }
    }
}

/// Edits are checked inside their own transaction, so a range made stale by a
/// concurrent remote delete is rejected instead of reaching yrs.
fn check_range(index: u32, len: u32, text_len: u32) -> Result<(), DocError> {
    match index.checked_add(len) {
        Some(end) if end <= text_len => Ok(()),
        _ => Err(DocError::OutOfRange { index, len, text_len }),
    }
}

impl Default for ReplicatedDoc {
    fn default() -> Self {
        Self::new()
    }
}
