//! Edit session state for one parent entity and its relationship collections.
//!
//! An `EditSession` owns, per registered collection, the last known server
//! snapshot, the pending action log, and the derived local snapshot. Every
//! staged mutation and every accepted fetch re-derives the local snapshot
//! through the merge, so readers always observe server state with local
//! intent overlaid.
//!
//! Fetch results are fenced: `begin_fetch` hands out a ticket stamped with
//! the session generation and a monotonically increasing initiation sequence,
//! and a result is accepted only if its generation still matches and its
//! sequence is newer than the last applied one. Ordering is by initiation,
//! not completion, so a slow stale response can never clobber a fresher one.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::SessionError;
use crate::log::ActionLog;
use crate::merge::merge;
use crate::schema::{record_patch_shape, relationship_record_shape, validate_shape, Shape};
use crate::types::{
    CommittedState, ParentDiff, RecordPatch, RelationshipRecord, Snapshot,
};

// ============================================================================
// FetchTicket
// ============================================================================

/// Fencing token for one in-flight fetch. Captured before the fetch is
/// issued; checked when its result arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub(crate) generation: u64,
    pub(crate) seq: u64,
}

// ============================================================================
// EditSession
// ============================================================================

/// Per-collection state held by the session.
#[derive(Debug)]
struct CollectionState {
    record_shape: Shape,
    patch_shape: Shape,
    server: Snapshot,
    local: Snapshot,
    log: ActionLog,
    /// Initiation sequence of the last fetch whose result was accepted.
    applied_seq: u64,
}

impl CollectionState {
    fn new(kinds: &[&str]) -> Self {
        Self {
            record_shape: relationship_record_shape(kinds),
            patch_shape: record_patch_shape(kinds),
            server: Vec::new(),
            local: Vec::new(),
            log: ActionLog::new(),
            applied_seq: 0,
        }
    }

    fn rederive(&mut self) {
        self.local = merge(&self.server, &self.local, &self.log);
    }
}

#[derive(Debug)]
struct SessionInner {
    generation: u64,
    next_seq: u64,
    parent_fields: Map<String, Value>,
    collections: HashMap<String, CollectionState>,
    closed: bool,
}

/// Editing context for a single parent entity.
///
/// Interior mutability keeps the session shareable behind an `Arc` between
/// the UI edit path and the async pagination loader.
#[derive(Debug)]
pub struct EditSession {
    parent_id: String,
    inner: Mutex<SessionInner>,
}

impl EditSession {
    pub fn new(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            inner: Mutex::new(SessionInner {
                generation: 0,
                next_seq: 0,
                parent_fields: Map::new(),
                collections: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    /// Register a relationship collection and the `kind` values it allows.
    /// Registering an already-known collection resets its state.
    pub fn register_collection(&self, name: impl Into<String>, kinds: &[&str]) {
        let mut inner = self.inner.lock();
        inner
            .collections
            .insert(name.into(), CollectionState::new(kinds));
    }

    // -----------------------------------------------------------------------
    // Parent fields
    // -----------------------------------------------------------------------

    /// Stage a scalar field change on the parent entity itself.
    pub fn set_parent_field(
        &self,
        field: impl Into<String>,
        value: Value,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        inner.parent_fields.insert(field.into(), value);
        Ok(())
    }

    /// Pending parent field changes as an upsert payload.
    pub fn parent_diff(&self) -> ParentDiff {
        let inner = self.inner.lock();
        ParentDiff {
            id: self.parent_id.clone(),
            fields: Value::Object(inner.parent_fields.clone()),
        }
    }

    // -----------------------------------------------------------------------
    // Staged mutations
    // -----------------------------------------------------------------------

    /// Stage a new relationship record. The payload is validated against the
    /// collection's record shape before it touches the log.
    pub fn stage_insert(
        &self,
        collection: &str,
        record: RelationshipRecord,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        let state = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| SessionError::UnknownCollection(collection.to_string()))?;

        validate_shape(&state.record_shape, &record_payload(&record))?;

        state.log.record_insert(record);
        state.rederive();
        Ok(())
    }

    /// Stage a field-level change to an existing record.
    pub fn stage_update(&self, collection: &str, patch: RecordPatch) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        let state = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| SessionError::UnknownCollection(collection.to_string()))?;

        validate_shape(&state.patch_shape, &patch_payload(&patch))?;

        state.log.record_update(patch);
        state.rederive();
        Ok(())
    }

    /// Stage removal of a record.
    pub fn stage_delete(&self, collection: &str, id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        let state = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| SessionError::UnknownCollection(collection.to_string()))?;

        state.log.record_delete(id);
        state.rederive();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// The derived local view: server state with pending intent overlaid.
    pub fn local_snapshot(&self, collection: &str) -> Result<Snapshot, SessionError> {
        let inner = self.inner.lock();
        inner
            .collections
            .get(collection)
            .map(|s| s.local.clone())
            .ok_or_else(|| SessionError::UnknownCollection(collection.to_string()))
    }

    /// The last accepted server snapshot, without local intent.
    pub fn server_snapshot(&self, collection: &str) -> Result<Snapshot, SessionError> {
        let inner = self.inner.lock();
        inner
            .collections
            .get(collection)
            .map(|s| s.server.clone())
            .ok_or_else(|| SessionError::UnknownCollection(collection.to_string()))
    }

    /// Copies of every collection's pending log, keyed by collection name.
    /// This is the payload handed to the batch applier.
    pub fn child_logs(&self) -> HashMap<String, ActionLog> {
        let inner = self.inner.lock();
        inner
            .collections
            .iter()
            .map(|(name, state)| (name.clone(), state.log.clone()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Fetch fencing
    // -----------------------------------------------------------------------

    /// Stamp a ticket for a fetch that is about to be issued. Must be called
    /// before the fetch starts so tickets order by initiation.
    pub fn begin_fetch(&self) -> FetchTicket {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        FetchTicket {
            generation: inner.generation,
            seq: inner.next_seq,
        }
    }

    /// Replace a collection's server snapshot with a freshly fetched one.
    ///
    /// Returns `Ok(false)` without touching state when the ticket lost the
    /// fence: the session was closed or invalidated since the fetch began,
    /// or a fetch initiated later has already landed.
    pub fn apply_refetch(
        &self,
        collection: &str,
        ticket: FetchTicket,
        records: Snapshot,
    ) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock();
        if !fence_admits(&inner, collection, ticket)? {
            return Ok(false);
        }
        let state = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| SessionError::UnknownCollection(collection.to_string()))?;
        state.server = records;
        state.applied_seq = ticket.seq;
        state.rederive();
        Ok(true)
    }

    /// Append one fetched page to a collection's server snapshot.
    ///
    /// Same fencing as `apply_refetch`. Records whose id is already present
    /// server-side are skipped so the snapshot never holds duplicate ids.
    pub fn append_page(
        &self,
        collection: &str,
        ticket: FetchTicket,
        records: Vec<RelationshipRecord>,
    ) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock();
        if !fence_admits(&inner, collection, ticket)? {
            return Ok(false);
        }
        let state = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| SessionError::UnknownCollection(collection.to_string()))?;
        for record in records {
            if state.server.iter().any(|r| r.id == record.id) {
                tracing::debug!(collection, id = %record.id, "skipping duplicate page record");
                continue;
            }
            state.server.push(record);
        }
        state.applied_seq = ticket.seq;
        state.rederive();
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Commit and lifecycle
    // -----------------------------------------------------------------------

    /// Adopt the committed state returned by a successful apply.
    ///
    /// Every registered collection takes the committed snapshot as its new
    /// server baseline, drops its log, and re-derives. Pending parent fields
    /// are cleared. Collections absent from the committed state baseline to
    /// empty.
    pub fn commit_success(&self, committed: &CommittedState) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        for (name, state) in inner.collections.iter_mut() {
            state.server = committed.collections.get(name).cloned().unwrap_or_default();
            state.log.clear();
            state.applied_seq = seq;
            state.rederive();
        }
        inner.parent_fields.clear();
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Bump the generation, orphaning every outstanding fetch ticket. Called
    /// when the session's context changes underneath in-flight fetches.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        tracing::debug!(
            parent_id = %self.parent_id,
            generation = inner.generation,
            "session invalidated"
        );
    }

    /// Close the session. All further staging and fetch application fails
    /// with `SessionError::Closed`; late fetch results are dropped.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Shared fence check for fetch results. `Ok(false)` means "silently drop".
fn fence_admits(
    inner: &SessionInner,
    collection: &str,
    ticket: FetchTicket,
) -> Result<bool, SessionError> {
    if inner.closed {
        tracing::warn!(collection, "dropping fetch result: session closed");
        return Ok(false);
    }
    if ticket.generation != inner.generation {
        tracing::warn!(
            collection,
            ticket_generation = ticket.generation,
            session_generation = inner.generation,
            "dropping fetch result: generation mismatch"
        );
        return Ok(false);
    }
    let state = inner
        .collections
        .get(collection)
        .ok_or_else(|| SessionError::UnknownCollection(collection.to_string()))?;
    if ticket.seq <= state.applied_seq {
        tracing::warn!(
            collection,
            ticket_seq = ticket.seq,
            applied_seq = state.applied_seq,
            "dropping fetch result: superseded by a newer fetch"
        );
        return Ok(false);
    }
    Ok(true)
}

fn record_payload(record: &RelationshipRecord) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(record.id.clone()));
    map.insert(
        "parent_id".to_string(),
        Value::String(record.parent_id.clone()),
    );
    map.insert(
        "related_id".to_string(),
        Value::String(record.related_id.clone()),
    );
    map.insert("kind".to_string(), Value::String(record.kind.clone()));
    map.insert("data".to_string(), record.data.clone());
    Value::Object(map)
}

fn patch_payload(patch: &RecordPatch) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(patch.id.clone()));
    if let Some(kind) = &patch.kind {
        map.insert("kind".to_string(), Value::String(kind.clone()));
    }
    if let Some(related_id) = &patch.related_id {
        map.insert(
            "related_id".to_string(),
            Value::String(related_id.clone()),
        );
    }
    if let Some(data) = &patch.data {
        map.insert("data".to_string(), data.clone());
    }
    Value::Object(map)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParentRecord;
    use serde_json::json;

    fn session() -> EditSession {
        let s = EditSession::new("dog-1");
        s.register_collection("dog_clients", &["owner", "fosterer"]);
        s
    }

    fn record(id: &str, related: &str, kind: &str) -> RelationshipRecord {
        RelationshipRecord::new(id, "dog-1", related, kind)
    }

    // --- staging ---

    #[test]
    fn stage_insert_appears_in_local_snapshot() {
        let s = session();
        s.stage_insert("dog_clients", record("rel-1", "client-1", "owner"))
            .unwrap();

        let local = s.local_snapshot("dog_clients").unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].id, "rel-1");
        assert!(s.server_snapshot("dog_clients").unwrap().is_empty());
    }

    #[test]
    fn stage_insert_rejects_unknown_kind() {
        let s = session();
        let err = s
            .stage_insert("dog_clients", record("rel-1", "client-1", "groomer"))
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert!(s.local_snapshot("dog_clients").unwrap().is_empty());
    }

    #[test]
    fn stage_update_rejects_unknown_kind() {
        let s = session();
        let err = s
            .stage_update(
                "dog_clients",
                RecordPatch::new("rel-1").with_kind("groomer"),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[test]
    fn stage_against_unknown_collection_fails() {
        let s = session();
        let err = s
            .stage_insert("bookings", record("rel-1", "client-1", "owner"))
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownCollection(_)));
    }

    #[test]
    fn stage_delete_suppresses_server_row() {
        let s = session();
        let ticket = s.begin_fetch();
        s.apply_refetch(
            "dog_clients",
            ticket,
            vec![record("rel-1", "client-1", "owner")],
        )
        .unwrap();

        s.stage_delete("dog_clients", "rel-1").unwrap();
        assert!(s.local_snapshot("dog_clients").unwrap().is_empty());
        assert_eq!(s.server_snapshot("dog_clients").unwrap().len(), 1);
    }

    #[test]
    fn staging_on_closed_session_fails() {
        let s = session();
        s.close();
        let err = s
            .stage_insert("dog_clients", record("rel-1", "client-1", "owner"))
            .unwrap_err();
        assert!(matches!(err, SessionError::Closed));
        assert!(matches!(
            s.set_parent_field("name", json!("Rex")).unwrap_err(),
            SessionError::Closed
        ));
    }

    // --- parent fields ---

    #[test]
    fn parent_diff_collects_staged_fields() {
        let s = session();
        s.set_parent_field("name", json!("Rex")).unwrap();
        s.set_parent_field("weight", json!(18)).unwrap();

        let diff = s.parent_diff();
        assert_eq!(diff.id, "dog-1");
        assert_eq!(diff.fields, json!({"name": "Rex", "weight": 18}));
    }

    // --- fetch fencing ---

    #[test]
    fn refetch_replaces_server_snapshot() {
        let s = session();
        let t1 = s.begin_fetch();
        s.apply_refetch(
            "dog_clients",
            t1,
            vec![record("rel-1", "client-1", "owner")],
        )
        .unwrap();

        let t2 = s.begin_fetch();
        let accepted = s
            .apply_refetch(
                "dog_clients",
                t2,
                vec![record("rel-2", "client-2", "fosterer")],
            )
            .unwrap();
        assert!(accepted);

        let server = s.server_snapshot("dog_clients").unwrap();
        assert_eq!(server.len(), 1);
        assert_eq!(server[0].id, "rel-2");
    }

    #[test]
    fn stale_fetch_result_is_dropped() {
        let s = session();
        let older = s.begin_fetch();
        let newer = s.begin_fetch();

        // The later-initiated fetch lands first.
        s.apply_refetch(
            "dog_clients",
            newer,
            vec![record("rel-2", "client-2", "owner")],
        )
        .unwrap();

        // The earlier-initiated one arrives late and must lose.
        let accepted = s
            .apply_refetch(
                "dog_clients",
                older,
                vec![record("rel-1", "client-1", "owner")],
            )
            .unwrap();
        assert!(!accepted);
        assert_eq!(s.server_snapshot("dog_clients").unwrap()[0].id, "rel-2");
    }

    #[test]
    fn invalidate_orphans_outstanding_tickets() {
        let s = session();
        let ticket = s.begin_fetch();
        s.invalidate();

        let accepted = s
            .apply_refetch(
                "dog_clients",
                ticket,
                vec![record("rel-1", "client-1", "owner")],
            )
            .unwrap();
        assert!(!accepted);
        assert!(s.server_snapshot("dog_clients").unwrap().is_empty());
    }

    #[test]
    fn closed_session_drops_fetch_results_silently() {
        let s = session();
        let ticket = s.begin_fetch();
        s.close();

        let accepted = s
            .apply_refetch(
                "dog_clients",
                ticket,
                vec![record("rel-1", "client-1", "owner")],
            )
            .unwrap();
        assert!(!accepted);
    }

    #[test]
    fn refetch_preserves_pending_intent() {
        let s = session();
        s.stage_insert("dog_clients", record("rel-local", "client-9", "owner"))
            .unwrap();

        let ticket = s.begin_fetch();
        s.apply_refetch(
            "dog_clients",
            ticket,
            vec![record("rel-1", "client-1", "owner")],
        )
        .unwrap();

        let local = s.local_snapshot("dog_clients").unwrap();
        let ids: Vec<&str> = local.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["rel-1", "rel-local"]);
    }

    // --- pagination ---

    #[test]
    fn append_page_extends_server_snapshot() {
        let s = session();
        let t1 = s.begin_fetch();
        s.append_page(
            "dog_clients",
            t1,
            vec![record("rel-1", "client-1", "owner")],
        )
        .unwrap();
        let t2 = s.begin_fetch();
        s.append_page(
            "dog_clients",
            t2,
            vec![record("rel-2", "client-2", "fosterer")],
        )
        .unwrap();

        let server = s.server_snapshot("dog_clients").unwrap();
        let ids: Vec<&str> = server.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["rel-1", "rel-2"]);
    }

    #[test]
    fn append_page_skips_duplicate_ids() {
        let s = session();
        let t1 = s.begin_fetch();
        s.append_page(
            "dog_clients",
            t1,
            vec![record("rel-1", "client-1", "owner")],
        )
        .unwrap();
        let t2 = s.begin_fetch();
        s.append_page(
            "dog_clients",
            t2,
            vec![
                record("rel-1", "client-1", "owner"),
                record("rel-2", "client-2", "owner"),
            ],
        )
        .unwrap();

        assert_eq!(s.server_snapshot("dog_clients").unwrap().len(), 2);
    }

    #[test]
    fn append_page_merges_pending_insert_on_top() {
        let s = session();
        s.stage_insert("dog_clients", record("rel-new", "client-3", "owner"))
            .unwrap();

        let ticket = s.begin_fetch();
        s.append_page(
            "dog_clients",
            ticket,
            vec![record("rel-1", "client-1", "owner")],
        )
        .unwrap();

        let local = s.local_snapshot("dog_clients").unwrap();
        assert_eq!(local.len(), 2);
        assert_eq!(local.last().map(|r| r.id.as_str()), Some("rel-new"));
    }

    // --- commit ---

    #[test]
    fn commit_success_adopts_committed_state_and_clears_logs() {
        let s = session();
        s.set_parent_field("name", json!("Rex")).unwrap();
        s.stage_insert("dog_clients", record("rel-1", "client-1", "owner"))
            .unwrap();

        let committed = CommittedState {
            parent: ParentRecord {
                id: "dog-1".to_string(),
                data: json!({"name": "Rex"}),
            },
            collections: HashMap::from([(
                "dog_clients".to_string(),
                vec![record("rel-1", "client-1", "owner")],
            )]),
        };
        s.commit_success(&committed).unwrap();

        let server = s.server_snapshot("dog_clients").unwrap();
        assert_eq!(server.len(), 1);
        let local = s.local_snapshot("dog_clients").unwrap();
        assert_eq!(local, server, "no pending intent should remain");
        assert!(s.child_logs().get("dog_clients").unwrap().is_empty());
        assert_eq!(s.parent_diff().fields, json!({}));
    }

    #[test]
    fn commit_success_outruns_in_flight_fetches() {
        let s = session();
        let stale = s.begin_fetch();
        s.commit_success(&CommittedState {
            parent: ParentRecord {
                id: "dog-1".to_string(),
                data: json!({}),
            },
            collections: HashMap::new(),
        })
        .unwrap();

        // A fetch begun before the commit must not overwrite the committed
        // baseline.
        let accepted = s
            .apply_refetch(
                "dog_clients",
                stale,
                vec![record("rel-old", "client-1", "owner")],
            )
            .unwrap();
        assert!(!accepted);
    }

    #[test]
    fn child_logs_snapshots_every_collection() {
        let s = session();
        s.register_collection("dog_vets", &["primary", "specialist"]);
        s.stage_insert("dog_clients", record("rel-1", "client-1", "owner"))
            .unwrap();

        let logs = s.child_logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs.get("dog_clients").unwrap().len(), 1);
        assert!(logs.get("dog_vets").unwrap().is_empty());
    }
}
