//! Transactional application of action logs to the backing store.
//!
//! `TransactionalBatchApplier` takes the parent's field diff plus one action
//! log per child collection and writes everything inside a single store
//! transaction: parent upsert, then inserts, updates, and deletes per
//! collection in descriptor order, then per-collection side effects, then a
//! read back of the committed rows. Any failure rolls the whole batch back
//! and surfaces as one [`ApplyFailure`] naming the step and collection that
//! broke, so the caller's logs remain valid for resubmission.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{ApplyFailure, ApplyStep, StoreError};
use crate::log::{split, ActionLog};
use crate::notify::{ChangeEmitter, CollectionChanged};
use crate::store::{StoreHandle, StoredRow};
use crate::types::{
    overlay_data, CommittedState, ParentDiff, ParentRecord, RecordPatch, RelationshipRecord,
    Snapshot,
};

// ============================================================================
// Descriptors
// ============================================================================

/// Ambient parameters for one apply call.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    pub tenant: String,
}

impl ApplyContext {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
        }
    }
}

/// Store-level side effect run after a collection's rows are written, inside
/// the same transaction. Receives the store, the apply context, and the
/// parent id. An `Err` rolls back the entire batch.
pub type AfterWriteHook<S> =
    Arc<dyn Fn(&S, &ApplyContext, &str) -> Result<(), StoreError> + Send + Sync>;

/// How one child collection maps onto the store.
pub struct CollectionDescriptor<S> {
    /// Collection name as the session and events know it.
    pub name: String,
    /// Store table holding the collection's rows.
    pub table: String,
    /// Row field carrying the parent entity's id.
    pub parent_fk: String,
    /// Row field carrying the related entity's id.
    pub related_fk: String,
    pub after_write: Option<AfterWriteHook<S>>,
}

impl<S> CollectionDescriptor<S> {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        parent_fk: impl Into<String>,
        related_fk: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            parent_fk: parent_fk.into(),
            related_fk: related_fk.into(),
            after_write: None,
        }
    }

    pub fn with_after_write(mut self, hook: AfterWriteHook<S>) -> Self {
        self.after_write = Some(hook);
        self
    }
}

impl<S> fmt::Debug for CollectionDescriptor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionDescriptor")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("parent_fk", &self.parent_fk)
            .field("related_fk", &self.related_fk)
            .field("after_write", &self.after_write.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

// ============================================================================
// TransactionalBatchApplier
// ============================================================================

/// Applies a parent diff plus child action logs atomically.
pub struct TransactionalBatchApplier<S: StoreHandle> {
    store: Arc<S>,
    parent_table: String,
    descriptors: Vec<CollectionDescriptor<S>>,
    emitter: Arc<ChangeEmitter>,
}

impl<S: StoreHandle> TransactionalBatchApplier<S> {
    pub fn new(
        store: Arc<S>,
        parent_table: impl Into<String>,
        descriptors: Vec<CollectionDescriptor<S>>,
    ) -> Self {
        Self {
            store,
            parent_table: parent_table.into(),
            descriptors,
            emitter: Arc::new(ChangeEmitter::new()),
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<ChangeEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn emitter(&self) -> &Arc<ChangeEmitter> {
        &self.emitter
    }

    /// Apply the batch inside one transaction.
    ///
    /// On success the store holds every write, the committed rows are read
    /// back as the caller's new baseline, and one [`CollectionChanged`] fires
    /// per collection that had a non-empty log. On failure everything is
    /// rolled back and no event fires.
    pub fn apply(
        &self,
        ctx: &ApplyContext,
        parent_diff: &ParentDiff,
        child_logs: &HashMap<String, ActionLog>,
    ) -> Result<CommittedState, ApplyFailure> {
        // Where the transaction body was when it failed; read back after the
        // closure to label the failure.
        let position: RefCell<(ApplyStep, Option<String>)> =
            RefCell::new((ApplyStep::ParentUpsert, None));

        let result = self.store.with_transaction(|st| {
            self.apply_in_tx(st, ctx, parent_diff, child_logs, &position)
        });

        match result {
            Ok(committed) => {
                for d in &self.descriptors {
                    let touched = child_logs.get(&d.name).is_some_and(|log| !log.is_empty());
                    if touched {
                        self.emitter.emit(&CollectionChanged {
                            parent_id: parent_diff.id.clone(),
                            collection: d.name.clone(),
                        });
                    }
                }
                tracing::debug!(parent_id = %parent_diff.id, "batch apply committed");
                Ok(committed)
            }
            Err(source) => {
                let (step, collection) = position.into_inner();
                let failure = ApplyFailure {
                    parent_id: parent_diff.id.clone(),
                    collection,
                    step,
                    source,
                };
                tracing::warn!(%failure, "batch apply rolled back");
                Err(failure)
            }
        }
    }

    fn apply_in_tx(
        &self,
        st: &S,
        ctx: &ApplyContext,
        parent_diff: &ParentDiff,
        child_logs: &HashMap<String, ActionLog>,
        position: &RefCell<(ApplyStep, Option<String>)>,
    ) -> Result<CommittedState, StoreError> {
        *position.borrow_mut() = (ApplyStep::ParentUpsert, None);
        self.upsert_parent(st, ctx, parent_diff)?;

        for d in &self.descriptors {
            let Some(log) = child_logs.get(&d.name) else {
                continue;
            };
            if log.is_empty() {
                continue;
            }
            let batches = split(log);

            *position.borrow_mut() = (ApplyStep::Inserts, Some(d.name.clone()));
            for record in &batches.inserts {
                let row = StoredRow::new(record.id.clone(), record_fields(d, record));
                st.insert(&ctx.tenant, &d.table, &row)?;
            }

            *position.borrow_mut() = (ApplyStep::Updates, Some(d.name.clone()));
            for patch in &batches.updates {
                self.update_row(st, ctx, d, patch)?;
            }

            *position.borrow_mut() = (ApplyStep::Deletes, Some(d.name.clone()));
            for id in &batches.deletes {
                // A row already removed by another actor is not an error;
                // the delete intent is satisfied either way.
                st.delete(&ctx.tenant, &d.table, id)?;
            }

            if let Some(hook) = &d.after_write {
                *position.borrow_mut() = (ApplyStep::SideEffect, Some(d.name.clone()));
                hook(st, ctx, &parent_diff.id)?;
            }
        }

        *position.borrow_mut() = (ApplyStep::ReadBack, None);
        self.read_back(st, ctx, &parent_diff.id)
    }

    fn upsert_parent(
        &self,
        st: &S,
        ctx: &ApplyContext,
        parent_diff: &ParentDiff,
    ) -> Result<(), StoreError> {
        match st.get(&ctx.tenant, &self.parent_table, &parent_diff.id)? {
            Some(existing) => {
                let mut fields = existing.fields;
                overlay_data(&mut fields, &parent_diff.fields);
                st.update(&ctx.tenant, &self.parent_table, &parent_diff.id, &fields)
            }
            None => {
                let row = StoredRow::new(parent_diff.id.clone(), parent_diff.fields.clone());
                st.insert(&ctx.tenant, &self.parent_table, &row)
            }
        }
    }

    fn update_row(
        &self,
        st: &S,
        ctx: &ApplyContext,
        d: &CollectionDescriptor<S>,
        patch: &RecordPatch,
    ) -> Result<(), StoreError> {
        let row = st
            .get(&ctx.tenant, &d.table, &patch.id)?
            .ok_or_else(|| StoreError::NotFound {
                table: d.table.clone(),
                id: patch.id.clone(),
            })?;
        let mut record = row_record(d, &row)?;
        patch.apply_to(&mut record);
        st.update(&ctx.tenant, &d.table, &patch.id, &record_fields(d, &record))
    }

    fn read_back(
        &self,
        st: &S,
        ctx: &ApplyContext,
        parent_id: &str,
    ) -> Result<CommittedState, StoreError> {
        let parent_row = st
            .get(&ctx.tenant, &self.parent_table, parent_id)?
            .ok_or_else(|| StoreError::NotFound {
                table: self.parent_table.clone(),
                id: parent_id.to_string(),
            })?;
        let parent = ParentRecord {
            id: parent_row.id,
            data: parent_row.fields,
        };

        let mut collections = HashMap::with_capacity(self.descriptors.len());
        for d in &self.descriptors {
            let rows = st.select_by(&ctx.tenant, &d.table, &d.parent_fk, parent_id)?;
            let mut snapshot: Snapshot = Vec::with_capacity(rows.len());
            for row in &rows {
                snapshot.push(row_record(d, row)?);
            }
            collections.insert(d.name.clone(), snapshot);
        }

        Ok(CommittedState {
            parent,
            collections,
        })
    }

    /// Delete the parent row and cascade over every child collection, in one
    /// transaction. Fires one event per collection after commit.
    pub fn delete_parent(&self, ctx: &ApplyContext, parent_id: &str) -> Result<(), ApplyFailure> {
        let position: RefCell<(ApplyStep, Option<String>)> =
            RefCell::new((ApplyStep::CascadeDelete, None));

        let result = self.store.with_transaction(|st| {
            for d in &self.descriptors {
                *position.borrow_mut() = (ApplyStep::CascadeDelete, Some(d.name.clone()));
                let removed = st.delete_by(&ctx.tenant, &d.table, &d.parent_fk, parent_id)?;
                tracing::debug!(collection = %d.name, removed, "cascade delete");
            }
            *position.borrow_mut() = (ApplyStep::CascadeDelete, None);
            st.delete(&ctx.tenant, &self.parent_table, parent_id)?;
            Ok(())
        });

        match result {
            Ok(()) => {
                for d in &self.descriptors {
                    self.emitter.emit(&CollectionChanged {
                        parent_id: parent_id.to_string(),
                        collection: d.name.clone(),
                    });
                }
                Ok(())
            }
            Err(source) => {
                let (step, collection) = position.into_inner();
                Err(ApplyFailure {
                    parent_id: parent_id.to_string(),
                    collection,
                    step,
                    source,
                })
            }
        }
    }
}

// ============================================================================
// Row mapping
// ============================================================================

/// Serialize a typed record into the store row shape, keyed by the
/// descriptor's foreign-key field names.
fn record_fields<S>(d: &CollectionDescriptor<S>, record: &RelationshipRecord) -> Value {
    let mut map = Map::new();
    map.insert(
        d.parent_fk.clone(),
        Value::String(record.parent_id.clone()),
    );
    map.insert(
        d.related_fk.clone(),
        Value::String(record.related_id.clone()),
    );
    map.insert("kind".to_string(), Value::String(record.kind.clone()));
    map.insert("data".to_string(), record.data.clone());
    Value::Object(map)
}

/// Deserialize a store row back into a typed record.
fn row_record<S>(
    d: &CollectionDescriptor<S>,
    row: &StoredRow,
) -> Result<RelationshipRecord, StoreError> {
    let fields = row.fields.as_object().ok_or_else(|| corruption(d, row))?;
    let parent_id = fields
        .get(&d.parent_fk)
        .and_then(Value::as_str)
        .ok_or_else(|| corruption(d, row))?;
    let related_id = fields
        .get(&d.related_fk)
        .and_then(Value::as_str)
        .ok_or_else(|| corruption(d, row))?;
    let kind = fields
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| corruption(d, row))?;

    Ok(RelationshipRecord {
        id: row.id.clone(),
        parent_id: parent_id.to_string(),
        related_id: related_id.to_string(),
        kind: kind.to_string(),
        data: fields
            .get("data")
            .cloned()
            .unwrap_or(Value::Object(Map::new())),
    })
}

fn corruption<S>(d: &CollectionDescriptor<S>, row: &StoredRow) -> StoreError {
    StoreError::Corruption {
        table: d.table.clone(),
        id: row.id.clone(),
        source: "relationship row is missing a required field".into(),
    }
}
