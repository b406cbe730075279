//! ActionLog — keyed current-intent log of pending mutations.
//!
//! At most one entry exists per record id at any time; new actions against an
//! id replace prior actions. The log is a current-intent map, not a history.

use indexmap::IndexMap;

use crate::types::{LogEntry, RecordPatch, RelationshipRecord};

// ============================================================================
// ActionLog
// ============================================================================

/// Pending mutations against one relationship collection, keyed by record id.
///
/// Iteration order is id insertion order, stable across replacement of an
/// existing id's entry. That stability is what keeps locally-inserted records
/// at fixed positions across repeated merges.
#[derive(Debug, Clone, Default)]
pub struct ActionLog {
    entries: IndexMap<String, LogEntry>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Raw map contract
    // -----------------------------------------------------------------------

    /// Set the entry for an id, replacing any prior entry. Replacing does not
    /// move the id's position in iteration order.
    pub fn set(&mut self, id: impl Into<String>, entry: LogEntry) {
        self.entries.insert(id.into(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&LogEntry> {
        self.entries.get(id)
    }

    /// Remove the entry for an id, preserving the order of remaining entries.
    pub fn remove(&mut self, id: &str) -> Option<LogEntry> {
        self.entries.shift_remove(id)
    }

    /// Entries in stable insertion order.
    pub fn values(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.values()
    }

    /// `(id, entry)` pairs in stable insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &LogEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry. Called after a successful commit.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // -----------------------------------------------------------------------
    // Intent-level helpers
    // -----------------------------------------------------------------------

    /// Record a locally-created record. The payload becomes the record's
    /// authoritative content until commit.
    pub fn record_insert(&mut self, record: RelationshipRecord) {
        self.set(record.id.clone(), LogEntry::Insert(record));
    }

    /// Record a field-level change.
    ///
    /// Against an existing `Insert` the patch folds into the insert payload
    /// (the record is still purely local, so the intent stays "insert").
    /// Against an existing `Update` the patches merge, newer fields winning.
    /// Against a `Delete` the update replaces it (editing un-deletes).
    pub fn record_update(&mut self, patch: RecordPatch) {
        let id = patch.id.clone();
        let entry = match self.entries.get(&id) {
            Some(LogEntry::Insert(record)) => {
                let mut record = record.clone();
                patch.apply_to(&mut record);
                LogEntry::Insert(record)
            }
            Some(LogEntry::Update(prior)) => LogEntry::Update(prior.overlaid_with(&patch)),
            Some(LogEntry::Delete) | None => LogEntry::Update(patch),
        };
        self.set(id, entry);
    }

    /// Record a pending removal.
    ///
    /// If the current entry is an `Insert`, the record was created and
    /// destroyed within one uncommitted session, so the entry is removed
    /// entirely and the server never sees either action.
    pub fn record_delete(&mut self, id: &str) {
        match self.entries.get(id) {
            Some(LogEntry::Insert(_)) => {
                self.remove(id);
            }
            _ => {
                self.set(id.to_string(), LogEntry::Delete);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
