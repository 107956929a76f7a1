//! Persistence Bridge: converged content → durable storage.
//!
//! ```text
//! ContentChange ──► on_content_change ──► Debouncer (≈100ms, coalescing)
//!   │ Remote origin      ⇒ skip                    │ expired
//!   │ selection only     ⇒ skip                    ▼
//!   │ persistence off    ⇒ skip               SaveJob ──spawn_blocking──► DocumentStorage::update
//!                                                                           │
//!                               record_outcome ◄── SaveOutcome ◄────────────┘
//! ```
//!
//! Each write is a whole-document overwrite keyed by document id. Failures
//! are logged and not retried; the next local change schedules another
//! overwrite.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::content::DocumentContent;
use crate::debounce::Debouncer;
use crate::engine::Origin;
use crate::storage::{DocumentStorage, StorageError};

/// What a content notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The document tree changed.
    Structural,
    /// Only the cursor or selection moved.
    SelectionOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentChange {
    pub origin: Origin,
    pub kind: ChangeKind,
}

impl ContentChange {
    pub fn local_edit() -> Self {
        Self {
            origin: Origin::Local,
            kind: ChangeKind::Structural,
        }
    }

    pub fn remote_edit() -> Self {
        Self {
            origin: Origin::Remote,
            kind: ChangeKind::Structural,
        }
    }

    pub fn selection() -> Self {
        Self {
            origin: Origin::Local,
            kind: ChangeKind::SelectionOnly,
        }
    }
}

/// One pending overwrite, ready to run on the blocking pool.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveJob {
    pub document_id: String,
    pub content: DocumentContent,
}

impl SaveJob {
    pub fn execute(self, storage: &dyn DocumentStorage) -> SaveOutcome {
        let updated_at = Utc::now();
        let result = storage
            .update(&self.document_id, &self.content.to_json(), updated_at)
            .map(|()| updated_at);
        SaveOutcome {
            document_id: self.document_id,
            result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub document_id: String,
    pub result: Result<DateTime<Utc>, StorageError>,
}

impl SaveOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub scheduled: u64,
    pub coalesced: u64,
    pub skipped_remote: u64,
    pub skipped_selection: u64,
    pub writes_issued: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
}

pub struct PersistenceBridge {
    document_id: Option<String>,
    enabled: bool,
    debouncer: Debouncer<DocumentContent>,
    stats: PersistenceStats,
    last_saved: Option<DateTime<Utc>>,
}

impl PersistenceBridge {
    pub fn new(document_id: Option<String>, enabled: bool, delay: Duration) -> Self {
        Self {
            document_id,
            enabled,
            debouncer: Debouncer::new(delay),
            stats: PersistenceStats::default(),
            last_saved: None,
        }
    }

    /// Saving needs both the switch and a document identity.
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.document_id.is_some()
    }

    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    /// React to a content notification. `content` is only evaluated when a
    /// save is actually scheduled.
    ///
    /// Returns `true` if a save was (re)armed.
    pub fn on_content_change(
        &mut self,
        change: ContentChange,
        content: impl FnOnce() -> DocumentContent,
        now: Instant,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if change.origin != Origin::Local {
            self.stats.skipped_remote += 1;
            return false;
        }
        if change.kind == ChangeKind::SelectionOnly {
            self.stats.skipped_selection += 1;
            return false;
        }
        self.schedule_save(content(), now)
    }

    /// Arm or re-arm the save timer with the latest content.
    pub fn schedule_save(&mut self, content: DocumentContent, now: Instant) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if self.debouncer.arm(content, now) {
            self.stats.coalesced += 1;
        }
        self.stats.scheduled += 1;
        true
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    pub fn has_pending(&self) -> bool {
        self.debouncer.is_armed()
    }

    /// Take the job if the debounce window has closed.
    pub fn poll_due(&mut self, now: Instant) -> Option<SaveJob> {
        let content = self.debouncer.poll_expired(now)?;
        self.job(content)
    }

    /// Take the pending job immediately.
    pub fn flush(&mut self) -> Option<SaveJob> {
        let content = self.debouncer.flush()?;
        self.job(content)
    }

    /// Drop the pending job. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.debouncer.cancel().is_some()
    }

    /// Report the result of a finished job.
    pub fn record_outcome(&mut self, outcome: &SaveOutcome) {
        match &outcome.result {
            Ok(at) => {
                self.stats.writes_ok += 1;
                self.last_saved = Some(*at);
                log::debug!("Saved {} at {}", outcome.document_id, at.to_rfc3339());
            }
            Err(e) => {
                self.stats.writes_failed += 1;
                log::error!("Failed to save {}: {e}", outcome.document_id);
            }
        }
    }

    pub fn last_saved(&self) -> Option<DateTime<Utc>> {
        self.last_saved
    }

    pub fn stats(&self) -> PersistenceStats {
        self.stats
    }

    fn job(&mut self, content: DocumentContent) -> Option<SaveJob> {
        let document_id = self.document_id.clone()?;
        self.stats.writes_issued += 1;
        Some(SaveJob {
            document_id,
            content,
        })
    }
}

/// Where initial content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Storage,
    /// Persistence off, no document id, no record, or a read failure.
    Starter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDocument {
    pub content: DocumentContent,
    pub title: Option<String>,
    pub source: LoadSource,
}

impl LoadedDocument {
    pub fn starter() -> Self {
        Self {
            content: DocumentContent::empty(),
            title: None,
            source: LoadSource::Starter,
        }
    }
}

/// Read the document's stored content. Never fails: every problem falls
/// back to the starter document.
pub fn load_initial_content(
    storage: Option<&dyn DocumentStorage>,
    document_id: Option<&str>,
    enabled: bool,
) -> LoadedDocument {
    let (storage, id) = match (storage, document_id) {
        (Some(storage), Some(id)) if enabled => (storage, id),
        _ => return LoadedDocument::starter(),
    };

    match storage.get(id) {
        Ok(Some(doc)) => {
            log::info!("Loaded document {id} ({})", doc.title);
            LoadedDocument {
                content: DocumentContent::from_stored(Some(&doc.content)),
                title: Some(doc.title),
                source: LoadSource::Storage,
            }
        }
        Ok(None) => {
            log::warn!("Document {id} not found, using starter document");
            LoadedDocument::starter()
        }
        Err(e) => {
            log::error!("Failed to load document {id}: {e}");
            LoadedDocument::starter()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    const DELAY: Duration = Duration::from_millis(100);

    fn bridge() -> PersistenceBridge {
        PersistenceBridge::new(Some("doc-1".into()), true, DELAY)
    }

    fn storage() -> MemoryStorage {
        MemoryStorage::new().with_document("doc-1", "Doc", json!([]))
    }

    #[test]
    fn test_ten_changes_one_write() {
        let store = storage();
        let mut b = bridge();
        let t0 = Instant::now();

        for i in 0..10u64 {
            let now = t0 + Duration::from_millis(i * 5);
            assert!(b.on_content_change(
                ContentChange::local_edit(),
                || DocumentContent::from_text(&format!("v{i}")),
                now,
            ));
        }
        assert!(b.poll_due(t0 + DELAY).is_none());

        let job = b.poll_due(t0 + Duration::from_millis(45) + DELAY).unwrap();
        assert_eq!(job.content, DocumentContent::from_text("v9"));
        let outcome = job.execute(&store);
        b.record_outcome(&outcome);

        assert!(b.poll_due(t0 + DELAY * 10).is_none());
        assert_eq!(store.write_count(), 1);
        assert_eq!(
            DocumentContent::from_stored(Some(&store.get("doc-1").unwrap().unwrap().content)),
            DocumentContent::from_text("v9")
        );
        assert_eq!(b.stats().coalesced, 9);
        assert_eq!(b.stats().writes_ok, 1);
        assert!(b.last_saved().is_some());
    }

    #[test]
    fn test_selection_only_never_saves() {
        let mut b = bridge();
        let t0 = Instant::now();
        let mut evaluated = false;
        assert!(!b.on_content_change(
            ContentChange::selection(),
            || {
                evaluated = true;
                DocumentContent::empty()
            },
            t0,
        ));
        assert!(!evaluated);
        assert!(!b.has_pending());
        assert!(b.poll_due(t0 + DELAY * 2).is_none());
        assert_eq!(b.stats().skipped_selection, 1);
    }

    #[test]
    fn test_remote_change_never_saves() {
        let mut b = bridge();
        assert!(!b.on_content_change(ContentChange::remote_edit(), DocumentContent::empty, Instant::now()));
        assert!(!b.has_pending());
        assert_eq!(b.stats().skipped_remote, 1);
    }

    #[test]
    fn test_disabled_bridge() {
        let t0 = Instant::now();
        let mut off = PersistenceBridge::new(Some("doc-1".into()), false, DELAY);
        assert!(!off.on_content_change(ContentChange::local_edit(), DocumentContent::empty, t0));

        let mut anonymous = PersistenceBridge::new(None, true, DELAY);
        assert!(!anonymous.is_enabled());
        assert!(!anonymous.schedule_save(DocumentContent::empty(), t0));
        assert!(anonymous.flush().is_none());
    }

    #[test]
    fn test_flush_and_cancel() {
        let mut b = bridge();
        let t0 = Instant::now();
        b.schedule_save(DocumentContent::from_text("a"), t0);
        assert!(b.cancel());
        assert!(b.flush().is_none());

        b.schedule_save(DocumentContent::from_text("b"), t0);
        let job = b.flush().unwrap();
        assert_eq!(job.document_id, "doc-1");
        assert!(!b.has_pending());
    }

    #[test]
    fn test_failed_write_is_recorded_not_retried() {
        let store = storage();
        store.set_fail_writes(true);
        let mut b = bridge();
        let t0 = Instant::now();
        b.schedule_save(DocumentContent::from_text("lost"), t0);
        let outcome = b.poll_due(t0 + DELAY).unwrap().execute(&store);
        assert!(!outcome.is_ok());
        b.record_outcome(&outcome);
        assert_eq!(b.stats().writes_failed, 1);
        assert!(!b.has_pending());
        assert!(b.last_saved().is_none());

        // The next edit tries again.
        store.set_fail_writes(false);
        b.schedule_save(DocumentContent::from_text("kept"), t0 + DELAY);
        let outcome = b.flush().unwrap().execute(&store);
        b.record_outcome(&outcome);
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_load_parsed_and_string_content() {
        let parsed = json!([{ "type": "paragraph", "children": [{ "text": "hello" }] }]);
        let store = MemoryStorage::new()
            .with_document("a", "A", parsed.clone())
            .with_document("b", "B", json!(parsed.to_string()));

        for id in ["a", "b"] {
            let loaded = load_initial_content(Some(&store as &dyn DocumentStorage), Some(id), true);
            assert_eq!(loaded.source, LoadSource::Storage);
            assert_eq!(loaded.content, DocumentContent::from_text("hello"));
        }
    }

    #[test]
    fn test_load_fallbacks() {
        let store = MemoryStorage::new().with_document("bad", "Bad", json!("{not json"));

        let cases = [
            load_initial_content(Some(&store as &dyn DocumentStorage), Some("bad"), true),
            load_initial_content(Some(&store as &dyn DocumentStorage), Some("missing"), true),
            load_initial_content(Some(&store as &dyn DocumentStorage), Some("bad"), false),
            load_initial_content(Some(&store as &dyn DocumentStorage), None, true),
            load_initial_content(None, Some("bad"), true),
        ];
        for loaded in cases {
            assert_eq!(loaded.content, DocumentContent::empty());
        }

        store.set_fail_reads(true);
        let loaded = load_initial_content(Some(&store as &dyn DocumentStorage), Some("bad"), true);
        assert_eq!(loaded.source, LoadSource::Starter);
    }
}
