//! Client-side identifier generation.
//!
//! Ids are assigned before the server has seen the record, so optimistic UI
//! can reference them immediately and they survive the eventual commit
//! unchanged.

/// Generate a random, globally-unique record id (UUID v4).
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
