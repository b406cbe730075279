use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ValidationError / ValidationErrors
// ---------------------------------------------------------------------------

/// A single field-level validation failure.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub path: String,
    pub expected: String,
    pub received: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"Validation failed at "{}": expected {}, received {}"#,
            self.path, self.expected, self.received
        )
    }
}

impl std::error::Error for ValidationError {}

/// A collection of one or more `ValidationError`s.
#[derive(Debug, Clone)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation failed:")?;
        for e in &self.0 {
            write!(f, "\n  - {}: expected {}, received {}", e.path, e.expected, e.received)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Row not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("Constraint violation on table \"{table}\": {message}")]
    Constraint { table: String, message: String },

    #[error("Row corruption in {table}/{id}: failed to parse stored payload")]
    Corruption {
        table: String,
        id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Side effect failed for collection \"{collection}\": {message}")]
    SideEffect { collection: String, message: String },

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// FetchError
// ---------------------------------------------------------------------------

/// Failure reported by a `PageFetcher` implementation.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Transport error: {0}")]
    Transport(String),

    /// The supplied cursor no longer names a valid resume position.
    #[error("Cursor is stale")]
    StaleCursor,
}

// ---------------------------------------------------------------------------
// LoadError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LoadError {
    /// Pagination must restart from the beginning of the unexhausted range.
    #[error("Stale cursor for collection \"{collection}\": pagination was reset")]
    StaleCursor { collection: String },

    #[error("Page fetch failed for collection \"{collection}\": {source}")]
    Fetch {
        collection: String,
        #[source]
        source: FetchError,
    },

    #[error(transparent)]
    Session(#[from] SessionError),
}

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Collection \"{0}\" is not registered with this edit session")]
    UnknownCollection(String),

    #[error("Edit session is closed")]
    Closed,

    #[error(transparent)]
    Validation(#[from] ValidationErrors),
}

// ---------------------------------------------------------------------------
// ApplyStep / ApplyFailure
// ---------------------------------------------------------------------------

/// Which stage of a batch apply was executing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStep {
    ParentUpsert,
    Inserts,
    Updates,
    Deletes,
    SideEffect,
    ReadBack,
    CascadeDelete,
}

impl fmt::Display for ApplyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ParentUpsert => "parent upsert",
            Self::Inserts => "relationship inserts",
            Self::Updates => "relationship updates",
            Self::Deletes => "relationship deletes",
            Self::SideEffect => "side effect",
            Self::ReadBack => "committed-state read back",
            Self::CascadeDelete => "cascade delete",
        };
        write!(f, "{name}")
    }
}

/// Single failure value returned when a batch apply rolls back.
///
/// The whole transaction has been rolled back by the time this is observed,
/// so the action logs it was built from are still valid and resubmittable.
#[derive(Debug)]
pub struct ApplyFailure {
    pub parent_id: String,
    /// The offending child collection, when determinable.
    pub collection: Option<String>,
    pub step: ApplyStep,
    pub source: StoreError,
}

impl fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.collection {
            Some(c) => write!(
                f,
                r#"Apply failed for parent "{}" during {} on collection "{}": {}"#,
                self.parent_id, self.step, c, self.source
            ),
            None => write!(
                f,
                r#"Apply failed for parent "{}" during {}: {}"#,
                self.parent_id, self.step, self.source
            ),
        }
    }
}

impl std::error::Error for ApplyFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

// ---------------------------------------------------------------------------
// EngineError — top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Apply(#[from] ApplyFailure),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience alias — the default error type is `EngineError`.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
