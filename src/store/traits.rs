//! Store boundary used by the batch applier.
//!
//! `StoreHandle` is the narrow transactional I/O contract the applier is
//! generic over. Every operation is scoped by a caller-supplied tenant id;
//! the store treats it as an opaque required filter, not a security boundary.

use serde_json::Value;

use crate::error::StoreError;

/// A persisted row: stable id plus a JSON object of fields.
///
/// Both parent records and relationship rows are stored in this shape; the
/// applier serializes its typed records into `fields` at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: String,
    pub fields: Value,
}

impl StoredRow {
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Transactional row I/O against named tables.
///
/// Implementors must be `Send + Sync` so a single store can serve concurrent
/// request-scoped applies; multi-row atomicity comes from `with_transaction`,
/// which must support nesting (an inner transaction joins the outer one and
/// rolls back only its own writes on failure).
pub trait StoreHandle: Send + Sync {
    /// Fetch a single row by id. Returns `None` if the row does not exist.
    fn get(&self, tenant: &str, table: &str, id: &str) -> Result<Option<StoredRow>, StoreError>;

    /// Fetch every row whose `field` equals `value`, in stable insertion
    /// order. Used for foreign-key lookups such as "all relationship rows of
    /// parent X".
    fn select_by(
        &self,
        tenant: &str,
        table: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<StoredRow>, StoreError>;

    /// Insert a new row. Fails with `StoreError::Constraint` if the id is
    /// already present in the table.
    fn insert(&self, tenant: &str, table: &str, row: &StoredRow) -> Result<(), StoreError>;

    /// Replace the fields of an existing row. Fails with
    /// `StoreError::NotFound` if the row does not exist.
    fn update(&self, tenant: &str, table: &str, id: &str, fields: &Value)
        -> Result<(), StoreError>;

    /// Delete a row by id. Returns whether a row was actually removed.
    fn delete(&self, tenant: &str, table: &str, id: &str) -> Result<bool, StoreError>;

    /// Delete every row whose `field` equals `value`, returning the number of
    /// rows removed. Used for cascade deletes.
    fn delete_by(
        &self,
        tenant: &str,
        table: &str,
        field: &str,
        value: &str,
    ) -> Result<usize, StoreError>;

    /// Execute a closure inside a store transaction.
    ///
    /// The closure receives a reference to `self`; implementations begin a
    /// transaction before calling `f` and commit on `Ok`, roll back on `Err`.
    /// Nested calls must compose (inner failure rolls back only the inner
    /// scope).
    fn with_transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Self) -> Result<T, StoreError>;
}
