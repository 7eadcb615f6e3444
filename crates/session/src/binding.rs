// Editor bindings handed out by a ready session.

use std::sync::Arc;

use cowrite_common::{CursorRange, UserProfile};
use serde_json::Value;
use yrs::Subscription;

use crate::engine::awareness::{AwarenessChannel, AwarenessError};
use crate::engine::doc::{DocError, ReplicatedDoc, UpdateSource, DEFAULT_FIELD};

/// Awareness field carrying the local caret/selection.
pub const CURSOR_FIELD: &str = "cursor";
/// Awareness field carrying the local profile.
pub const USER_FIELD: &str = "user";

#[derive(Clone)]
pub enum EditorExtension {
    /// Binds editor content to a text field of the replicated document.
    Document(DocumentBinding),
    /// Renders remote carets and publishes the local one.
    CursorPresence(CursorBinding),
}

impl EditorExtension {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Document(_) => "collaboration",
            Self::CursorPresence(_) => "collaboration-cursor",
        }
    }
}

#[derive(Clone)]
pub struct DocumentBinding {
    doc: Arc<ReplicatedDoc>,
    field: String,
}

impl DocumentBinding {
    pub fn new(doc: Arc<ReplicatedDoc>) -> Self {
        Self { doc, field: DEFAULT_FIELD.to_string() }
    }

    pub fn with_field(doc: Arc<ReplicatedDoc>, field: impl Into<String>) -> Self {
        Self { doc, field: field.into() }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn text(&self) -> String {
        self.doc.get_text_string(&self.field)
    }

    pub fn len(&self) -> u32 {
        self.doc.text_len(&self.field)
    }

    pub fn insert(&self, index: u32, content: &str) -> Result<(), DocError> {
        self.doc.insert_text(&self.field, index, content)
    }

    pub fn delete(&self, index: u32, len: u32) -> Result<(), DocError> {
        self.doc.remove_text(&self.field, index, len)
    }

    pub fn replace(&self, index: u32, len: u32, content: &str) -> Result<(), DocError> {
        self.doc.replace_text(&self.field, index, len, content)
    }

    /// Notified after every committed change. Read the text from outside the
    /// callback; it runs while the document is still locked.
    pub fn observe<F>(&self, callback: F) -> Result<Subscription, DocError>
    where
        F: Fn(UpdateSource) + Send + Sync + 'static,
    {
        self.doc.observe_updates(move |source, _| callback(source))
    }

    pub fn document(&self) -> &Arc<ReplicatedDoc> {
        &self.doc
    }
}

/// A peer's caret as the editor should draw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCursor {
    pub client_id: u64,
    pub name: String,
    pub color: String,
    pub range: CursorRange,
}

#[derive(Clone)]
pub struct CursorBinding {
    awareness: Arc<AwarenessChannel>,
}

impl CursorBinding {
    pub fn new(awareness: Arc<AwarenessChannel>) -> Self {
        Self { awareness }
    }

    /// Profile currently published for this connection.
    pub fn user(&self) -> Option<UserProfile> {
        self.awareness.local_field(USER_FIELD)
    }

    pub fn set_cursor(&self, range: CursorRange) -> Result<(), AwarenessError> {
        self.awareness.set_local_field(CURSOR_FIELD, &range)
    }

    pub fn clear_cursor(&self) -> Result<(), AwarenessError> {
        self.awareness.set_local_field(CURSOR_FIELD, &Value::Null)
    }

    pub fn local_cursor(&self) -> Option<CursorRange> {
        self.awareness.local_field(CURSOR_FIELD)
    }

    /// Carets of every other connection that published both a profile and a cursor.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        let local = self.awareness.client_id();
        self.awareness
            .snapshot()
            .into_iter()
            .filter(|(client_id, _)| *client_id != local)
            .filter_map(|(client_id, state)| {
                let user: UserProfile =
                    serde_json::from_value(state.get(USER_FIELD)?.clone()).ok()?;
                let range: CursorRange =
                    serde_json::from_value(state.get(CURSOR_FIELD)?.clone()).ok()?;
                Some(RemoteCursor { client_id, name: user.name, color: user.color, range })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_binding_edits_default_field() {
        let doc = Arc::new(ReplicatedDoc::with_client_id(1));
        let binding = DocumentBinding::new(Arc::clone(&doc));
        binding.insert(0, "hello").unwrap();
        binding.replace(0, 1, "J").unwrap();
        binding.delete(4, 1).unwrap();

        assert_eq!(binding.field(), DEFAULT_FIELD);
        assert_eq!(doc.get_text_string(DEFAULT_FIELD), "Jell");
        assert_eq!(binding.len(), 4);
    }

    #[test]
    fn stale_edit_after_remote_delete_returns_error() {
        let doc = Arc::new(ReplicatedDoc::with_client_id(1));
        let binding = DocumentBinding::new(Arc::clone(&doc));
        binding.insert(0, "hello").unwrap();

        let peer = ReplicatedDoc::with_client_id(2);
        peer.apply_update(&doc.encode_state()).unwrap();
        peer.remove_text(DEFAULT_FIELD, 0, 5).unwrap();
        doc.apply_update(&peer.encode_diff(&doc.encode_state_vector()).unwrap()).unwrap();

        assert!(matches!(binding.delete(3, 1), Err(DocError::OutOfRange { .. })));
        assert!(matches!(binding.replace(3, 1, "y"), Err(DocError::OutOfRange { .. })));
        assert_eq!(binding.text(), "");
        binding.insert(0, "again").unwrap();
        assert_eq!(binding.text(), "again");
    }

    #[test]
    fn remote_cursors_skip_local_and_cursorless_peers() {
        let ava_doc = ReplicatedDoc::with_client_id(1);
        let ava = Arc::new(AwarenessChannel::new(&ava_doc));
        ava.set_local_field(USER_FIELD, &UserProfile::new("Ava", "#60a5fa")).unwrap();
        let binding = CursorBinding::new(Arc::clone(&ava));
        binding.set_cursor(CursorRange::caret(3)).unwrap();

        for (id, cursor) in [(2, Some(CursorRange { anchor: 1, head: 4 })), (3, None)] {
            let doc = ReplicatedDoc::with_client_id(id);
            let peer = AwarenessChannel::new(&doc);
            peer.set_local_field(USER_FIELD, &UserProfile::new("Ben", "#34d399")).unwrap();
            if let Some(cursor) = cursor {
                peer.set_local_field(CURSOR_FIELD, &cursor).unwrap();
            }
            ava.apply_remote_update(peer.encode_local().unwrap().unwrap()).unwrap();
        }

        let cursors = binding.remote_cursors();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].client_id, 2);
        assert_eq!(cursors[0].range, CursorRange { anchor: 1, head: 4 });
        assert_eq!(binding.local_cursor(), Some(CursorRange::caret(3)));

        binding.clear_cursor().unwrap();
        assert_eq!(binding.local_cursor(), None);
        assert_eq!(binding.user().map(|user| user.name).as_deref(), Some("Ava"));
    }
}
