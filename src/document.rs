//! Editor-facing document seam.
//!
//! The mesh never parses or renders text; it hands (index, text) edit
//! primitives and whole-document snapshots across this trait. Indices
//! are character offsets; out-of-range edits clamp rather than panic,
//! since concurrent unreconciled edits can legitimately shift them.

use std::sync::{Arc, Mutex};

/// What the mesh needs from the editing surface.
pub trait DocumentHost: Send + Sync + 'static {
    /// Full current document text (serves newcomer bootstraps).
    fn snapshot(&self) -> String;

    /// Atomic whole-document replace (applies a bootstrap snapshot).
    fn replace(&mut self, text: String);

    /// A remote peer inserted `text` at character `index`.
    fn insert(&mut self, index: usize, text: &str);

    /// A remote peer deleted `len` characters at `index`.
    fn delete(&mut self, index: usize, len: usize);
}

/// String-backed host for headless embeddings and tests. Clones share
/// the same document.
#[derive(Debug, Clone, Default)]
pub struct SharedDocument {
    text: Arc<Mutex<String>>,
}

impl SharedDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: Arc::new(Mutex::new(text.into())),
        }
    }

    pub fn text(&self) -> String {
        self.text.lock().expect("document lock poisoned").clone()
    }
}

fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

impl DocumentHost for SharedDocument {
    fn snapshot(&self) -> String {
        self.text()
    }

    fn replace(&mut self, text: String) {
        *self.text.lock().expect("document lock poisoned") = text;
    }

    fn insert(&mut self, index: usize, inserted: &str) {
        let mut text = self.text.lock().expect("document lock poisoned");
        let at = byte_offset(&text, index);
        text.insert_str(at, inserted);
    }

    fn delete(&mut self, index: usize, len: usize) {
        let mut text = self.text.lock().expect("document lock poisoned");
        let start = byte_offset(&text, index);
        let end = byte_offset(&text, index.saturating_add(len));
        text.drain(start..end);
    }
}
