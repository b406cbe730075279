use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Join-table row describing a typed relationship between two entities.
/// `data` is denormalized read-only display data about the related entity,
/// kept so the read path can render without a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: String,
    pub parent_id: String,
    pub related_id: String,
    /// Relationship semantics, e.g. "owner" or "emergency-contact".
    pub kind: String,
    pub data: Value,
}

impl RelationshipRecord {
    pub fn new(
        id: impl Into<String>,
        parent_id: impl Into<String>,
        related_id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            related_id: related_id.into(),
            kind: kind.into(),
            data: Value::Object(serde_json::Map::new()),
        }
    }
}

/// One party's point-in-time view of a relationship collection.
pub type Snapshot = Vec<RelationshipRecord>;

/// Field-level partial change to an existing record. `None` means leave
/// unchanged; `data` when present is overlaid key-by-key onto the record's
/// data object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub id: String,
    pub kind: Option<String>,
    pub related_id: Option<String>,
    pub data: Option<Value>,
}

impl RecordPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            related_id: None,
            data: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_related_id(mut self, related_id: impl Into<String>) -> Self {
        self.related_id = Some(related_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Overlay this patch's present fields onto `record` in place.
    pub fn apply_to(&self, record: &mut RelationshipRecord) {
        if let Some(kind) = &self.kind {
            record.kind = kind.clone();
        }
        if let Some(related_id) = &self.related_id {
            record.related_id = related_id.clone();
        }
        if let Some(data) = &self.data {
            overlay_data(&mut record.data, data);
        }
    }

    /// Combine two patches for the same id; `newer`'s fields win, data
    /// objects merge key-by-key.
    pub fn overlaid_with(&self, newer: &RecordPatch) -> RecordPatch {
        let data = match (&self.data, &newer.data) {
            (Some(older), Some(newest)) => {
                let mut merged = older.clone();
                overlay_data(&mut merged, newest);
                Some(merged)
            }
            (older, newest) => newest.clone().or_else(|| older.clone()),
        };
        RecordPatch {
            id: self.id.clone(),
            kind: newer.kind.clone().or_else(|| self.kind.clone()),
            related_id: newer.related_id.clone().or_else(|| self.related_id.clone()),
            data,
        }
    }
}

/// Shallow key-by-key overlay of one data object onto another. Non-object
/// targets are replaced wholesale.
pub(crate) fn overlay_data(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                target_map.insert(k.clone(), v.clone());
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Pending mutation against one relationship record. The log keys entries by
/// record id, so `Delete` carries no payload of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "snake_case")]
pub enum LogEntry {
    /// Record exists only locally; the payload is its authoritative content.
    Insert(RelationshipRecord),
    Update(RecordPatch),
    Delete,
}

impl LogEntry {
    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Insert(_))
    }

    pub fn is_update(&self) -> bool {
        matches!(self, Self::Update(_))
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete)
    }
}

/// Per-table batches produced by splitting an action log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitBatches {
    pub inserts: Vec<RelationshipRecord>,
    pub updates: Vec<RecordPatch>,
    pub deletes: Vec<String>,
}

impl SplitBatches {
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Insert-or-update payload for the parent entity's own row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentDiff {
    pub id: String,
    /// Scalar fields to write, as a JSON object.
    pub fields: Value,
}

/// Parent entity row as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRecord {
    pub id: String,
    pub data: Value,
}

/// Freshly-read committed state returned by a successful apply. Becomes the
/// caller's new server snapshot baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedState {
    pub parent: ParentRecord,
    pub collections: HashMap<String, Snapshot>,
}

// ============================================================================
// Tests
// ============================================================================
