//! Three-way snapshot reconciliation.
//!
//! Recomputes the local view of a relationship collection from the latest
//! server snapshot, the previous local snapshot, and the pending action log.
//! Per-id rules, in priority order:
//!
//! - `Delete` entry: the row is suppressed unconditionally — the server has
//!   not seen the delete yet, so a refreshed server row must not resurrect it.
//! - `Update` entry: the server row with the patch overlaid; if the server
//!   does not know the id, the previous local row with the patch overlaid.
//! - `Insert` entry: the payload verbatim, never the server copy, even if a
//!   same-id row appears server-side (ids are client-generated, so a same-id
//!   server row is a race with our own commit).
//! - No entry: the server row if present, else the row is dropped — a row
//!   that only survives in the previous local snapshot was removed by another
//!   actor.
//!
//! Output order is server order, then patched server-unknown rows in previous
//! local order, then pending inserts in log order. Merging the same inputs
//! twice yields identical output.

use std::collections::HashSet;

use crate::log::ActionLog;
use crate::types::{LogEntry, RelationshipRecord, Snapshot};

// ============================================================================
// Merge
// ============================================================================

/// Reconcile a server snapshot with the previous local snapshot and the
/// pending action log, producing the new local snapshot.
///
/// Pure and synchronous; cannot fail at runtime.
pub fn merge(
    server: &[RelationshipRecord],
    previous_local: &[RelationshipRecord],
    log: &ActionLog,
) -> Snapshot {
    let server_ids: HashSet<&str> = server.iter().map(|r| r.id.as_str()).collect();

    let mut out: Snapshot = Vec::with_capacity(server.len() + log.len());

    // Server section, in server order.
    for row in server {
        match log.get(&row.id) {
            Some(LogEntry::Delete) => {}
            Some(LogEntry::Update(patch)) => {
                let mut merged = row.clone();
                patch.apply_to(&mut merged);
                out.push(merged);
            }
            // The insert payload is appended below; the server copy loses.
            Some(LogEntry::Insert(_)) => {}
            None => out.push(row.clone()),
        }
    }

    // Update entries whose id the server does not know fall back to the
    // previous local row. Rows with no entry are orphans and stay dropped.
    for row in previous_local {
        if server_ids.contains(row.id.as_str()) {
            continue;
        }
        if let Some(LogEntry::Update(patch)) = log.get(&row.id) {
            let mut merged = row.clone();
            patch.apply_to(&mut merged);
            out.push(merged);
        }
    }

    // Pending inserts, in stable log order.
    for entry in log.values() {
        if let LogEntry::Insert(record) = entry {
            out.push(record.clone());
        }
    }

    debug_check(&out, log);
    out
}

/// Internal self-checks. Violations are programming errors, not recoverable
/// conditions, so they assert rather than surface through the contract.
fn debug_check(out: &[RelationshipRecord], log: &ActionLog) {
    if cfg!(debug_assertions) {
        let mut seen: HashSet<&str> = HashSet::with_capacity(out.len());
        for row in out {
            debug_assert!(
                seen.insert(row.id.as_str()),
                "merged snapshot contains duplicate id {}",
                row.id
            );
            debug_assert!(
                !matches!(log.get(&row.id), Some(LogEntry::Delete)),
                "merged snapshot contains pending-delete id {}",
                row.id
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
