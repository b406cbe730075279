pub mod traits;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use traits::{StoreHandle, StoredRow};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
