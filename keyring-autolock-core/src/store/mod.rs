//! Secret store abstraction consumed by the autolock controller.
//!
//! A [`SecretStore`] enumerates keyring collections and locks them. Every
//! operation is asynchronous and fallible; the controller treats failures as
//! a skipped cycle and retries on the next periodic check.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Identifier of the backend-reserved session collection, which cannot be locked
pub const SESSION_COLLECTION_ID: &str = "session";

/// Opaque collection identifier (an object path on D-Bus backends)
pub type CollectionId = String;

/// Snapshot of one collection, valid for a single poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub label: String,
    pub locked: bool,
}

impl Collection {
    pub fn new(id: impl Into<CollectionId>, label: impl Into<String>, locked: bool) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            locked,
        }
    }

    /// Whether this is the session pseudo-collection
    pub fn is_session(&self) -> bool {
        self.id == SESSION_COLLECTION_ID
    }
}

/// Secret store error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Secret service unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to lock collection {id}: {reason}")]
    LockFailed { id: CollectionId, reason: String },

    #[error("Collection not found: {0}")]
    NotFound(CollectionId),
}

/// Backend capability for enumerating and locking collections.
///
/// Implementations must not cache lock flags across polls. Some backends keep
/// reporting a just-unlocked password-less collection as locked until the
/// connection is re-established, so the controller calls
/// [`SecretStore::reset_connection`] before every [`SecretStore::list_collections`].
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Drop any cached backend connection so the next call sees fresh state.
    async fn reset_connection(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// List collections, excluding `ignored` ones and the session collection,
    /// sorted by label.
    async fn list_collections(
        &self,
        ignored: &BTreeSet<CollectionId>,
    ) -> Result<Vec<Collection>, StoreError>;

    /// Lock every given collection, returning how many were locked.
    async fn lock_all(&self, collections: &[Collection]) -> Result<usize, StoreError>;

    /// Lock a single collection.
    async fn lock_one(&self, collection: &Collection) -> Result<(), StoreError>;
}

/// Apply the listing contract: drop ignored and session collections, sort by label.
pub fn relevant_collections(
    collections: impl IntoIterator<Item = Collection>,
    ignored: &BTreeSet<CollectionId>,
) -> Vec<Collection> {
    let mut relevant: Vec<Collection> = collections
        .into_iter()
        .filter(|c| !c.is_session() && !ignored.contains(&c.id))
        .collect();
    relevant.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.id.cmp(&b.id)));
    relevant
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relevant_collections_filters_and_sorts() {
        let collections = vec![
            Collection::new("work", "Work", false),
            Collection::new(SESSION_COLLECTION_ID, "Session", false),
            Collection::new("login", "Login", true),
            Collection::new("scratch", "Scratch", false),
        ];
        let ignored: BTreeSet<CollectionId> = ["scratch".to_string()].into_iter().collect();

        let relevant = relevant_collections(collections, &ignored);
        let labels: Vec<&str> = relevant.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["Login", "Work"]);
    }

    #[test]
    fn test_is_session() {
        assert!(Collection::new(SESSION_COLLECTION_ID, "Session", false).is_session());
        assert!(!Collection::new("login", "Login", false).is_session());
    }
}
