//! SQLite reference implementation of [`StoreHandle`].
//!
//! Built on rusqlite (bundled). The connection is protected by a
//! `parking_lot::ReentrantMutex<RefCell<Connection>>` so that
//! `with_transaction()` can hold the lock while calling the closure, which
//! also needs to lock in order to execute SQL. Transactions are SAVEPOINTs,
//! so nested `with_transaction` calls compose.
//!
//! All rows live in a single `rows` table keyed by (tenant, tbl, id), with
//! the field payload stored as a JSON text column. Field-equality lookups go
//! through `json_extract`.

use std::cell::{Cell, RefCell};

use parking_lot::ReentrantMutex;
use rusqlite::params;
use serde_json::Value;

use crate::error::StoreError;

use super::traits::{StoreHandle, StoredRow};

// ============================================================================
// Error helpers
// ============================================================================

/// Map a failed INSERT to `Constraint` when the id already exists.
fn insert_err(table: &str, id: &str, e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => StoreError::Constraint {
            table: table.to_string(),
            message: format!("duplicate id \"{id}\""),
        },
        _ => StoreError::Sqlite(e),
    }
}

/// Parse a stored JSON payload, surfacing parse failures as `Corruption`.
fn parse_fields(table: &str, id: &str, raw: &str) -> Result<Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corruption {
        table: table.to_string(),
        id: id.to_string(),
        source: Box::new(e),
    })
}

// ============================================================================
// SqliteStore
// ============================================================================

/// SQLite-backed store.
///
/// `ReentrantMutex` allows `with_transaction()` to hold the guard while the
/// closure re-acquires it for individual SQL operations.
pub struct SqliteStore {
    conn: ReentrantMutex<RefCell<rusqlite::Connection>>,
}

impl SqliteStore {
    /// Open a file-backed SQLite database and create the schema.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: ReentrantMutex::new(RefCell::new(conn)),
        })
    }

    /// Open an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: ReentrantMutex::new(RefCell::new(conn)),
        })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rows (
                tenant TEXT NOT NULL,
                tbl    TEXT NOT NULL,
                id     TEXT NOT NULL,
                fields TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (tenant, tbl, id)
            );
            CREATE INDEX IF NOT EXISTS idx_rows_tenant_tbl
                ON rows(tenant, tbl);",
        )?;
        Ok(())
    }

    /// Execute `f` with a shared reference to the underlying connection.
    fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T>,
    {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        f(&conn).map_err(StoreError::from)
    }
}

// ============================================================================
// StoreHandle implementation
// ============================================================================

impl StoreHandle for SqliteStore {
    fn get(&self, tenant: &str, table: &str, id: &str) -> Result<Option<StoredRow>, StoreError> {
        let raw: Option<String> = {
            let guard = self.conn.lock();
            let conn = guard.borrow();
            let mut stmt = conn.prepare_cached(
                "SELECT fields FROM rows WHERE tenant = ?1 AND tbl = ?2 AND id = ?3",
            )?;
            match stmt.query_row(params![tenant, table, id], |row| row.get::<_, String>(0)) {
                Ok(s) => Some(s),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(StoreError::Sqlite(e)),
            }
        };

        match raw {
            None => Ok(None),
            Some(s) => Ok(Some(StoredRow::new(id, parse_fields(table, id, &s)?))),
        }
    }

    fn select_by(
        &self,
        tenant: &str,
        table: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<StoredRow>, StoreError> {
        // Field names come from collection descriptors, never from user
        // input, so interpolating them into the json_extract path is safe.
        let sql = format!(
            "SELECT id, fields FROM rows \
             WHERE tenant = ?1 AND tbl = ?2 AND json_extract(fields, '$.{field}') = ?3 \
             ORDER BY rowid",
        );

        let raw: Vec<(String, String)> = {
            let guard = self.conn.lock();
            let conn = guard.borrow();
            let mut stmt = conn.prepare_cached(&sql)?;
            let mapped = stmt.query_map(params![tenant, table, value], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        raw.into_iter()
            .map(|(id, s)| {
                let fields = parse_fields(table, &id, &s)?;
                Ok(StoredRow { id, fields })
            })
            .collect()
    }

    fn insert(&self, tenant: &str, table: &str, row: &StoredRow) -> Result<(), StoreError> {
        let fields_str = row.fields.to_string();
        let guard = self.conn.lock();
        let conn = guard.borrow();
        let mut stmt = conn
            .prepare_cached("INSERT INTO rows (tenant, tbl, id, fields) VALUES (?1, ?2, ?3, ?4)")?;
        stmt.execute(params![tenant, table, row.id, fields_str])
            .map_err(|e| insert_err(table, &row.id, e))?;
        Ok(())
    }

    fn update(
        &self,
        tenant: &str,
        table: &str,
        id: &str,
        fields: &Value,
    ) -> Result<(), StoreError> {
        let fields_str = fields.to_string();
        let affected = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE rows SET fields = ?4 WHERE tenant = ?1 AND tbl = ?2 AND id = ?3",
            )?;
            stmt.execute(params![tenant, table, id, fields_str])
        })?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn delete(&self, tenant: &str, table: &str, id: &str) -> Result<bool, StoreError> {
        let affected = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("DELETE FROM rows WHERE tenant = ?1 AND tbl = ?2 AND id = ?3")?;
            stmt.execute(params![tenant, table, id])
        })?;
        Ok(affected > 0)
    }

    fn delete_by(
        &self,
        tenant: &str,
        table: &str,
        field: &str,
        value: &str,
    ) -> Result<usize, StoreError> {
        let sql = format!(
            "DELETE FROM rows \
             WHERE tenant = ?1 AND tbl = ?2 AND json_extract(fields, '$.{field}') = ?3",
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.execute(params![tenant, table, value])
        })
    }

    fn with_transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Self) -> Result<T, StoreError>,
    {
        // SAVEPOINTs compose with outer transactions. Each invocation gets a
        // unique name to avoid collisions when nested. ReentrantMutex lets
        // the closure re-acquire the lock for its SQL calls.
        thread_local! {
            static SP_COUNTER: Cell<u64> = const { Cell::new(0) };
        }
        let sp_name = SP_COUNTER.with(|c| {
            let n = c.get();
            c.set(n + 1);
            format!("sp_{n}")
        });

        {
            let guard = self.conn.lock();
            guard
                .borrow()
                .execute(&format!("SAVEPOINT {sp_name}"), [])?;
        }

        match f(self) {
            Ok(v) => {
                let guard = self.conn.lock();
                let release_ok = guard
                    .borrow()
                    .execute(&format!("RELEASE SAVEPOINT {sp_name}"), [])
                    .is_ok();
                drop(guard);
                if release_ok {
                    Ok(v)
                } else {
                    // Best-effort rollback to clean up the leaked savepoint
                    let guard = self.conn.lock();
                    let _ = guard
                        .borrow()
                        .execute(&format!("ROLLBACK TO SAVEPOINT {sp_name}"), []);
                    Err(StoreError::Transaction {
                        message: "RELEASE SAVEPOINT failed".to_string(),
                        source: None,
                    })
                }
            }
            Err(e) => {
                let guard = self.conn.lock();
                let _ = guard
                    .borrow()
                    .execute(&format!("ROLLBACK TO SAVEPOINT {sp_name}"), []);
                Err(e)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
