//! End-to-end flows wiring the edit session, the cursored loader, and the
//! batch applier over a real SQLite store.

#![cfg(feature = "sqlite")]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tether_sync::apply::{ApplyContext, CollectionDescriptor, TransactionalBatchApplier};
use tether_sync::error::FetchError;
use tether_sync::ident::generate_id;
use tether_sync::loader::{Cursor, CursoredCollectionLoader, Page, PageFetcher};
use tether_sync::session::EditSession;
use tether_sync::store::{SqliteStore, StoreHandle, StoredRow};
use tether_sync::types::{ParentDiff, RecordPatch, RelationshipRecord};

const TENANT: &str = "practice-1";

// ============================================================================
// Store-backed fetcher
// ============================================================================

/// Serves pages straight out of the store, ordered by `(kind, id)`, resuming
/// strictly after the cursor position.
struct StoreFetcher {
    store: Arc<SqliteStore>,
    parent_fk: &'static str,
    parent_id: String,
}

#[async_trait]
impl PageFetcher for StoreFetcher {
    async fn fetch_page(
        &self,
        collection: &str,
        cursor: Option<&Cursor>,
        page_size: usize,
        _filter: Option<&Value>,
    ) -> Result<Page, FetchError> {
        let rows = self
            .store
            .select_by(TENANT, collection, self.parent_fk, &self.parent_id)
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let mut keyed: Vec<(Cursor, StoredRow)> = rows
            .into_iter()
            .map(|row| {
                let kind = row.fields["kind"].as_str().unwrap_or_default().to_string();
                (Cursor::new(kind, row.id.clone()), row)
            })
            .collect();
        keyed.sort_by(|(a, _), (b, _)| a.cmp(b));

        let after: Vec<(Cursor, StoredRow)> = keyed
            .into_iter()
            .filter(|(key, _)| cursor.is_none_or(|c| key > c))
            .collect();
        let exhausted = after.len() <= page_size;
        let page: Vec<(Cursor, StoredRow)> = after.into_iter().take(page_size).collect();
        let next_cursor = if exhausted {
            None
        } else {
            page.last().map(|(key, _)| key.clone())
        };

        let records = page
            .into_iter()
            .map(|(_, row)| RelationshipRecord {
                id: row.id,
                parent_id: self.parent_id.clone(),
                related_id: row.fields["client_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                kind: row.fields["kind"].as_str().unwrap_or_default().to_string(),
                data: row.fields.get("data").cloned().unwrap_or(json!({})),
            })
            .collect();

        Ok(Page {
            records,
            next_cursor,
            exhausted,
        })
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    store: Arc<SqliteStore>,
    session: Arc<EditSession>,
    loader: CursoredCollectionLoader,
    applier: TransactionalBatchApplier<SqliteStore>,
    ctx: ApplyContext,
}

fn fixture(page_size: usize) -> Fixture {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let session = Arc::new(EditSession::new("dog-1"));
    session.register_collection("dog_clients", &["owner", "fosterer", "emergency-contact"]);

    let fetcher = Arc::new(StoreFetcher {
        store: store.clone(),
        parent_fk: "dog_id",
        parent_id: "dog-1".to_string(),
    });
    let loader = CursoredCollectionLoader::new(fetcher, session.clone(), page_size);
    let applier = TransactionalBatchApplier::new(
        store.clone(),
        "dogs",
        vec![CollectionDescriptor::new(
            "dog_clients",
            "dog_clients",
            "dog_id",
            "client_id",
        )],
    );

    Fixture {
        store,
        session,
        loader,
        applier,
        ctx: ApplyContext::new(TENANT),
    }
}

fn seed_client_row(store: &SqliteStore, id: &str, client: &str, kind: &str) {
    store
        .insert(
            TENANT,
            "dog_clients",
            &StoredRow::new(
                id,
                json!({"dog_id": "dog-1", "client_id": client, "kind": kind, "data": {}}),
            ),
        )
        .unwrap();
}

// ============================================================================
// Scenarios
// ============================================================================

/// Twelve server records paged five at a time with a pending local insert:
/// after two pages the merged view shows ten server rows plus the insert,
/// eleven records total, none duplicated.
#[tokio::test]
async fn paged_load_under_a_pending_insert() {
    let f = fixture(5);
    for i in 0..12 {
        seed_client_row(&f.store, &format!("rel-{i:02}"), &format!("client-{i}"), "owner");
    }
    f.session
        .stage_insert(
            "dog_clients",
            RelationshipRecord::new("local1", "dog-1", "client-new", "fosterer"),
        )
        .unwrap();

    f.loader.load_next_page("dog_clients", None).await.unwrap();
    f.loader.load_next_page("dog_clients", None).await.unwrap();

    let local = f.session.local_snapshot("dog_clients").unwrap();
    assert_eq!(local.len(), 11);
    let mut ids: Vec<&str> = local.iter().map(|r| r.id.as_str()).collect();
    assert!(ids.contains(&"local1"));
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 11, "no duplicates");
    assert!(!f.loader.is_exhausted("dog_clients"));

    let outcome = f.loader.load_next_page("dog_clients", None).await.unwrap();
    assert_eq!(outcome.appended, 2);
    assert!(outcome.exhausted);
    assert_eq!(f.session.local_snapshot("dog_clients").unwrap().len(), 13);
}

/// A full edit round trip: load, stage edits, apply, adopt the committed
/// state. The session ends clean with the store as its baseline.
#[tokio::test]
async fn edit_apply_commit_round_trip() {
    let f = fixture(10);
    seed_client_row(&f.store, "rel-1", "client-1", "owner");
    seed_client_row(&f.store, "rel-2", "client-2", "owner");
    f.loader.load_all("dog_clients", None).await.unwrap();

    f.session.set_parent_field("name", json!("Rex")).unwrap();
    f.session
        .stage_update(
            "dog_clients",
            RecordPatch::new("rel-1").with_kind("fosterer"),
        )
        .unwrap();
    f.session.stage_delete("dog_clients", "rel-2").unwrap();
    f.session
        .stage_insert(
            "dog_clients",
            RelationshipRecord::new("rel-3", "dog-1", "client-3", "emergency-contact"),
        )
        .unwrap();

    let committed = f
        .applier
        .apply(&f.ctx, &f.session.parent_diff(), &f.session.child_logs())
        .unwrap();
    f.session.commit_success(&committed).unwrap();

    assert_eq!(committed.parent.data, json!({"name": "Rex"}));
    let local = f.session.local_snapshot("dog_clients").unwrap();
    let mut pairs: Vec<(&str, &str)> = local
        .iter()
        .map(|r| (r.id.as_str(), r.kind.as_str()))
        .collect();
    pairs.sort_unstable();
    assert_eq!(
        pairs,
        [("rel-1", "fosterer"), ("rel-3", "emergency-contact")]
    );
    assert!(f.session.child_logs().get("dog_clients").unwrap().is_empty());
    assert_eq!(f.session.parent_diff().fields, json!({}));

    // The store agrees with the session's new baseline.
    assert!(f.store.get(TENANT, "dog_clients", "rel-2").unwrap().is_none());
    assert!(f.store.get(TENANT, "dog_clients", "rel-3").unwrap().is_some());
}

/// A record created and destroyed within one session never reaches the store.
#[tokio::test]
async fn insert_then_delete_never_hits_the_store() {
    let f = fixture(10);
    let ghost_id = generate_id();
    f.session
        .stage_insert(
            "dog_clients",
            RelationshipRecord::new(&ghost_id, "dog-1", "client-9", "owner"),
        )
        .unwrap();
    f.session.stage_delete("dog_clients", &ghost_id).unwrap();

    let logs = f.session.child_logs();
    assert!(logs.get("dog_clients").unwrap().is_empty());

    let committed = f
        .applier
        .apply(&f.ctx, &f.session.parent_diff(), &logs)
        .unwrap();
    assert!(committed.collections.get("dog_clients").unwrap().is_empty());
    assert!(f
        .store
        .get(TENANT, "dog_clients", &ghost_id)
        .unwrap()
        .is_none());
}

/// A refetch that races a just-landed commit does not duplicate the committed
/// insert: the log still holds the Insert, the server snapshot now knows the
/// id, and the merge keeps exactly one copy.
#[tokio::test]
async fn committed_insert_survives_racing_refetch_without_duplication() {
    let f = fixture(10);
    f.session
        .stage_insert(
            "dog_clients",
            RelationshipRecord::new("new1", "dog-1", "client-1", "owner"),
        )
        .unwrap();

    // The commit lands in the store but the session has not adopted it yet.
    f.applier
        .apply(&f.ctx, &f.session.parent_diff(), &f.session.child_logs())
        .unwrap();
    f.loader.load_all("dog_clients", None).await.unwrap();

    let local = f.session.local_snapshot("dog_clients").unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, "new1");
}

/// Deleting the parent entity removes its relationship rows in the same
/// transaction.
#[tokio::test]
async fn parent_delete_cascades() {
    let f = fixture(10);
    f.applier
        .apply(
            &f.ctx,
            &ParentDiff {
                id: "dog-1".to_string(),
                fields: json!({"name": "Rex"}),
            },
            &HashMap::new(),
        )
        .unwrap();
    seed_client_row(&f.store, "rel-1", "client-1", "owner");

    f.applier.delete_parent(&f.ctx, "dog-1").unwrap();

    assert!(f.store.get(TENANT, "dogs", "dog-1").unwrap().is_none());
    assert!(f
        .store
        .select_by(TENANT, "dog_clients", "dog_id", "dog-1")
        .unwrap()
        .is_empty());
}

/// A failed apply leaves the session's logs intact for resubmission; fixing
/// the bad entry and reapplying succeeds.
#[tokio::test]
async fn failed_apply_is_resubmittable() {
    let f = fixture(10);
    f.session
        .stage_update(
            "dog_clients",
            RecordPatch::new("missing").with_kind("owner"),
        )
        .unwrap();

    f.applier
        .apply(&f.ctx, &f.session.parent_diff(), &f.session.child_logs())
        .unwrap_err();

    // The log is untouched; withdraw the bad update and stage a valid insert.
    assert_eq!(f.session.child_logs().get("dog_clients").unwrap().len(), 1);
    f.session.stage_delete("dog_clients", "missing").unwrap();
    f.session
        .stage_insert(
            "dog_clients",
            RelationshipRecord::new("rel-1", "dog-1", "client-1", "owner"),
        )
        .unwrap();

    let committed = f
        .applier
        .apply(&f.ctx, &f.session.parent_diff(), &f.session.child_logs())
        .unwrap();
    f.session.commit_success(&committed).unwrap();
    assert!(f.store.get(TENANT, "dog_clients", "rel-1").unwrap().is_some());
}
