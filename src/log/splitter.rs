//! Partition an action log into per-table insert/update/delete batches.

use crate::types::{LogEntry, SplitBatches};

use super::ActionLog;

/// Split a log into its insert, update, and delete batches.
///
/// Total by construction: every entry lands in exactly one bucket by its tag,
/// and bucket-internal order follows log iteration order. The batch applier
/// consumes the buckets in inserts, updates, deletes order.
pub fn split(log: &ActionLog) -> SplitBatches {
    let mut batches = SplitBatches::default();
    for (id, entry) in log.iter() {
        match entry {
            LogEntry::Insert(record) => batches.inserts.push(record.clone()),
            LogEntry::Update(patch) => batches.updates.push(patch.clone()),
            LogEntry::Delete => batches.deletes.push(id.clone()),
        }
    }
    batches
}
