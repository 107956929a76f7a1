//! Replicated document engine.
//!
//! The session treats the engine as an opaque CRDT: it applies delta blobs
//! in any order, serializes its full state, and reports every mutation as an
//! [`EngineUpdate`] tagged with its [`Origin`]. The relay only ever
//! rebroadcasts `Origin::Local` updates, which is what keeps applied remote
//! deltas from bouncing around the channel forever.
//!
//! [`TextEngine`] is the `yrs` implementation: the document body is a single
//! shared text, one paragraph per line.

use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::content::DocumentContent;

/// Shared text holding the document body.
const ROOT: &str = "content";

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Produced by this client (typing, seeding).
    Local,
    /// Applied from the wire (deltas, bootstrap state).
    Remote,
}

/// A delta emitted by the engine after a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineUpdate {
    pub delta: Vec<u8>,
    pub origin: Origin,
}

/// Interface the session needs from a CRDT engine.
pub trait ReplicatedDocument {
    /// Apply a delta (or full state) produced by any peer.
    fn apply_delta(&mut self, delta: &[u8], origin: Origin) -> Result<(), EngineError>;

    /// Serialize the complete current state as one delta.
    fn encode_state(&self) -> Vec<u8>;

    /// Drain updates emitted since the last call, in emission order.
    fn take_updates(&mut self) -> Vec<EngineUpdate>;

    /// Current content in storage form.
    fn content(&self) -> DocumentContent;

    /// Whether the document has no content at all.
    fn is_empty(&self) -> bool;

    /// Insert starter content into an empty document as a local mutation.
    ///
    /// Returns `false` (and does nothing) when the document is not empty.
    fn seed(&mut self, content: &DocumentContent) -> bool;
}

/// `yrs`-backed text engine.
pub struct TextEngine {
    doc: Doc,
    text: TextRef,
    pending: Vec<EngineUpdate>,
}

impl Default for TextEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TextEngine {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create with a fixed engine-level client id (deterministic tests).
    pub fn with_client_id(id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(id))
    }

    fn from_doc(doc: Doc) -> Self {
        let text = doc.get_or_insert_text(ROOT);
        Self {
            doc,
            text,
            pending: Vec::new(),
        }
    }

    /// Current body as flat text.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Insert `chunk` at byte offset `index`.
    pub fn insert_text(&mut self, index: u32, chunk: &str) -> Result<(), EngineError> {
        self.check_offset(index)?;
        if chunk.is_empty() {
            return Ok(());
        }
        let delta = {
            let mut txn = self.doc.transact_mut();
            self.text.insert(&mut txn, index, chunk);
            txn.encode_update_v1()
        };
        self.emit(delta, Origin::Local);
        Ok(())
    }

    /// Append at the end of the body.
    pub fn push_text(&mut self, chunk: &str) -> Result<(), EngineError> {
        let len = self.len();
        self.insert_text(len, chunk)
    }

    /// Remove `len` bytes starting at `index`.
    pub fn delete_text(&mut self, index: u32, len: u32) -> Result<(), EngineError> {
        let end = index.checked_add(len).ok_or(EngineError::OutOfBounds { index, len })?;
        self.check_offset(index)?;
        self.check_offset(end)?;
        if len == 0 {
            return Ok(());
        }
        let delta = {
            let mut txn = self.doc.transact_mut();
            self.text.remove_range(&mut txn, index, len);
            txn.encode_update_v1()
        };
        self.emit(delta, Origin::Local);
        Ok(())
    }

    /// Body length in bytes.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    /// State vector, for convergence checks.
    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    fn check_offset(&self, index: u32) -> Result<(), EngineError> {
        let body = self.text();
        let at = index as usize;
        if at > body.len() || !body.is_char_boundary(at) {
            return Err(EngineError::OutOfBounds {
                index,
                len: body.len() as u32,
            });
        }
        Ok(())
    }

    fn emit(&mut self, delta: Vec<u8>, origin: Origin) {
        self.pending.push(EngineUpdate { delta, origin });
    }
}

impl ReplicatedDocument for TextEngine {
    fn apply_delta(&mut self, delta: &[u8], origin: Origin) -> Result<(), EngineError> {
        let update = Update::decode_v1(delta).map_err(|e| EngineError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| EngineError::Apply(e.to_string()))?;
        }
        self.emit(delta.to_vec(), origin);
        Ok(())
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn take_updates(&mut self) -> Vec<EngineUpdate> {
        std::mem::take(&mut self.pending)
    }

    fn content(&self) -> DocumentContent {
        DocumentContent::from_text(&self.text())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn seed(&mut self, content: &DocumentContent) -> bool {
        if !self.is_empty() {
            return false;
        }
        let body = content.to_text();
        if body.is_empty() {
            // The starter paragraph is the empty body itself.
            return true;
        }
        self.insert_text(0, &body).is_ok()
    }
}

/// Engine errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("undecodable delta: {0}")]
    Decode(String),
    #[error("delta could not be applied: {0}")]
    Apply(String),
    #[error("offset {index} out of bounds (length {len})")]
    OutOfBounds { index: u32, len: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_all(engines: &mut [TextEngine], deltas: &[Vec<u8>]) {
        for engine in engines.iter_mut() {
            for d in deltas {
                engine.apply_delta(d, Origin::Remote).unwrap();
            }
        }
    }

    #[test]
    fn test_local_edit_emits_local_update() {
        let mut e = TextEngine::new();
        e.insert_text(0, "hello").unwrap();

        let updates = e.take_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].origin, Origin::Local);
        assert!(e.take_updates().is_empty());
        assert_eq!(e.text(), "hello");
    }

    #[test]
    fn test_remote_apply_emits_remote_update() {
        let mut a = TextEngine::new();
        a.insert_text(0, "hi").unwrap();
        let delta = a.take_updates().remove(0).delta;

        let mut b = TextEngine::new();
        b.apply_delta(&delta, Origin::Remote).unwrap();
        let updates = b.take_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].origin, Origin::Remote);
        assert_eq!(b.text(), "hi");
    }

    #[test]
    fn test_corrupt_delta_is_an_error() {
        let mut e = TextEngine::new();
        assert!(matches!(
            e.apply_delta(&[0x05, 0x01], Origin::Remote),
            Err(EngineError::Decode(_))
        ));
        assert!(e.take_updates().is_empty());
        assert!(e.is_empty());
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let mut e = TextEngine::new();
        e.insert_text(0, "abc").unwrap();
        assert!(matches!(e.insert_text(10, "x"), Err(EngineError::OutOfBounds { .. })));
        assert!(matches!(e.delete_text(2, 5), Err(EngineError::OutOfBounds { .. })));
        assert_eq!(e.text(), "abc");
    }

    #[test]
    fn test_non_char_boundary_rejected() {
        let mut e = TextEngine::new();
        e.insert_text(0, "é").unwrap();
        assert!(e.insert_text(1, "x").is_err());
    }

    #[test]
    fn test_delete() {
        let mut e = TextEngine::new();
        e.insert_text(0, "hello world").unwrap();
        e.delete_text(5, 6).unwrap();
        assert_eq!(e.text(), "hello");
        assert_eq!(e.take_updates().len(), 2);
    }

    #[test]
    fn test_full_state_bootstraps_fresh_engine() {
        let mut a = TextEngine::new();
        a.insert_text(0, "line one\nline two").unwrap();

        let mut b = TextEngine::new();
        b.apply_delta(&a.encode_state(), Origin::Remote).unwrap();
        assert_eq!(b.text(), a.text());
        assert_eq!(b.content(), a.content());
        assert_eq!(b.content().blocks().len(), 2);
    }

    #[test]
    fn test_duplicate_state_is_idempotent() {
        let mut a = TextEngine::new();
        a.insert_text(0, "same").unwrap();
        let state = a.encode_state();

        let mut b = TextEngine::new();
        b.apply_delta(&state, Origin::Remote).unwrap();
        b.apply_delta(&state, Origin::Remote).unwrap();
        assert_eq!(b.text(), "same");
        assert_eq!(b.state_vector(), a.state_vector());
    }

    #[test]
    fn test_concurrent_edits_converge_in_any_order() {
        let mut a = TextEngine::with_client_id(1);
        let mut b = TextEngine::with_client_id(2);
        let mut c = TextEngine::with_client_id(3);

        a.insert_text(0, "alpha ").unwrap();
        b.insert_text(0, "bravo ").unwrap();
        c.insert_text(0, "charlie ").unwrap();
        a.push_text("tail").unwrap();

        let da: Vec<_> = a.take_updates().into_iter().map(|u| u.delta).collect();
        let db: Vec<_> = b.take_updates().into_iter().map(|u| u.delta).collect();
        let dc: Vec<_> = c.take_updates().into_iter().map(|u| u.delta).collect();

        // Each engine receives the others' deltas in a different order.
        let mut forward = da.clone();
        forward.extend(db.iter().cloned());
        forward.extend(dc.iter().cloned());
        let mut reversed = forward.clone();
        reversed.reverse();

        let mut fresh = [TextEngine::new(), TextEngine::new()];
        sync_all(&mut fresh[..1], &forward);
        sync_all(&mut fresh[1..], &reversed);
        sync_all(std::slice::from_mut(&mut a), &reversed);
        sync_all(std::slice::from_mut(&mut b), &forward);
        sync_all(std::slice::from_mut(&mut c), &reversed);

        let expected = a.text();
        assert_eq!(b.text(), expected);
        assert_eq!(c.text(), expected);
        assert_eq!(fresh[0].text(), expected);
        assert_eq!(fresh[1].text(), expected);
        assert_eq!(b.state_vector(), a.state_vector());
        assert_eq!(fresh[1].state_vector(), a.state_vector());
        assert!(expected.contains("tail"));
    }

    #[test]
    fn test_seed_only_into_empty_document() {
        let mut e = TextEngine::new();
        assert!(e.seed(&DocumentContent::from_text("hello")));
        assert_eq!(e.text(), "hello");
        assert_eq!(e.take_updates()[0].origin, Origin::Local);

        assert!(!e.seed(&DocumentContent::from_text("again")));
        assert_eq!(e.text(), "hello");
    }

    #[test]
    fn test_seed_starter_paragraph_emits_nothing() {
        let mut e = TextEngine::new();
        assert!(e.seed(&DocumentContent::empty()));
        assert!(e.take_updates().is_empty());
        assert_eq!(e.content(), DocumentContent::empty());
    }
}
