//! Cursor-based incremental loading of relationship collections.
//!
//! `CursoredCollectionLoader` pulls one page at a time from a `PageFetcher`
//! and feeds accepted pages into an `EditSession`. Page loads for the same
//! collection are serialized through a per-collection async lock; different
//! collections load concurrently. The fetch ticket is captured before the
//! request goes out, so a page that raced with a session invalidation or a
//! full refetch is discarded without advancing the cursor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{FetchError, LoadError};
use crate::session::EditSession;
use crate::types::RelationshipRecord;

// ============================================================================
// Cursor / Page
// ============================================================================

/// Opaque resume position within a collection's server-side ordering.
///
/// Field order matters: deriving `Ord` gives the composite
/// `(sort_key, id)` ordering, with `id` breaking sort-key ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    pub sort_key: String,
    pub id: String,
}

impl Cursor {
    pub fn new(sort_key: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            sort_key: sort_key.into(),
            id: id.into(),
        }
    }
}

/// One fetched page of relationship records.
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<RelationshipRecord>,
    /// Resume position for the next page. `None` when `exhausted`.
    pub next_cursor: Option<Cursor>,
    pub exhausted: bool,
}

/// Source of paged relationship data, typically a remote API client.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch the page after `cursor` (or the first page when `None`).
    ///
    /// Returns `FetchError::StaleCursor` when the cursor no longer names a
    /// valid resume position, e.g. the anchoring row was deleted server-side.
    async fn fetch_page(
        &self,
        collection: &str,
        cursor: Option<&Cursor>,
        page_size: usize,
        filter: Option<&Value>,
    ) -> Result<Page, FetchError>;
}

/// What a `load_next_page` call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOutcome {
    /// Records handed to the session (zero when the page was discarded or
    /// the collection was already exhausted).
    pub appended: usize,
    pub exhausted: bool,
    /// The page arrived but lost the session's fetch fence and was dropped.
    pub discarded: bool,
}

// ============================================================================
// CursoredCollectionLoader
// ============================================================================

#[derive(Debug, Clone, Default)]
struct CursorState {
    cursor: Option<Cursor>,
    exhausted: bool,
}

/// Incremental loader binding a `PageFetcher` to one `EditSession`.
pub struct CursoredCollectionLoader {
    fetcher: Arc<dyn PageFetcher>,
    session: Arc<EditSession>,
    page_size: usize,
    cursors: Mutex<HashMap<String, CursorState>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CursoredCollectionLoader {
    pub fn new(fetcher: Arc<dyn PageFetcher>, session: Arc<EditSession>, page_size: usize) -> Self {
        Self {
            fetcher,
            session,
            page_size,
            cursors: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &Arc<EditSession> {
        &self.session
    }

    /// Load the next page of `collection` into the session.
    ///
    /// No-op when the collection is already exhausted. On
    /// `FetchError::StaleCursor` the collection's pagination state resets so
    /// the next call restarts from the beginning, and the error surfaces as
    /// `LoadError::StaleCursor`.
    pub async fn load_next_page(
        &self,
        collection: &str,
        filter: Option<&Value>,
    ) -> Result<PageOutcome, LoadError> {
        let lock = self.collection_lock(collection);
        let _guard = lock.lock().await;

        let cursor = {
            let cursors = self.cursors.lock();
            let state = cursors.get(collection).cloned().unwrap_or_default();
            if state.exhausted {
                return Ok(PageOutcome {
                    appended: 0,
                    exhausted: true,
                    discarded: false,
                });
            }
            state.cursor
        };

        // Stamp the fence before the request leaves, so results order by
        // initiation even if responses arrive out of order.
        let ticket = self.session.begin_fetch();

        let page = match self
            .fetcher
            .fetch_page(collection, cursor.as_ref(), self.page_size, filter)
            .await
        {
            Ok(page) => page,
            Err(FetchError::StaleCursor) => {
                tracing::warn!(collection, "stale cursor, resetting pagination");
                self.reset(collection);
                return Err(LoadError::StaleCursor {
                    collection: collection.to_string(),
                });
            }
            Err(source) => {
                return Err(LoadError::Fetch {
                    collection: collection.to_string(),
                    source,
                });
            }
        };

        let next_cursor = page.next_cursor.clone();
        let exhausted = page.exhausted;
        let fetched = page.records.len();

        let accepted = self.session.append_page(collection, ticket, page.records)?;
        if !accepted {
            tracing::debug!(collection, "page lost the fetch fence, cursor not advanced");
            return Ok(PageOutcome {
                appended: 0,
                exhausted: false,
                discarded: true,
            });
        }

        {
            let mut cursors = self.cursors.lock();
            cursors.insert(
                collection.to_string(),
                CursorState {
                    cursor: next_cursor,
                    exhausted,
                },
            );
        }

        tracing::debug!(collection, appended = fetched, exhausted, "page loaded");
        Ok(PageOutcome {
            appended: fetched,
            exhausted,
            discarded: false,
        })
    }

    /// Load pages until the collection is exhausted. Discarded pages are
    /// retried on the next iteration with a fresh ticket.
    pub async fn load_all(
        &self,
        collection: &str,
        filter: Option<&Value>,
    ) -> Result<usize, LoadError> {
        let mut total = 0;
        loop {
            let outcome = self.load_next_page(collection, filter).await?;
            total += outcome.appended;
            if outcome.exhausted {
                return Ok(total);
            }
        }
    }

    /// Forget the collection's resume position; the next load starts over.
    pub fn reset(&self, collection: &str) {
        let mut cursors = self.cursors.lock();
        cursors.remove(collection);
    }

    pub fn is_exhausted(&self, collection: &str) -> bool {
        let cursors = self.cursors.lock();
        cursors.get(collection).map(|s| s.exhausted).unwrap_or(false)
    }

    fn collection_lock(&self, collection: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}
