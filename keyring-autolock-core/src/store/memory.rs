//! In-process secret store.
//!
//! Keeps collection lock flags in memory. Used by the daemon's demo backend
//! and by tests, which can inject failures, latency and the stale-lock quirk
//! of real secret-service connections.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{relevant_collections, Collection, CollectionId, SecretStore, StoreError, SESSION_COLLECTION_ID};

#[derive(Default)]
struct MemoryState {
    collections: BTreeMap<CollectionId, Collection>,
    /// Lock flags the current "connection" still reports until reset
    stale: BTreeMap<CollectionId, bool>,
    fail_list: bool,
    fail_lock: bool,
    latency: Option<Duration>,
    list_calls: usize,
    lock_calls: usize,
    reset_calls: usize,
}

/// Secret store backed by an in-memory table
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store containing only the session collection
    pub fn new() -> Self {
        let store = Self::default();
        store.insert(Collection::new(SESSION_COLLECTION_ID, "Session", false));
        store
    }

    /// Create a store seeded with the given collections
    pub fn with_collections(collections: impl IntoIterator<Item = Collection>) -> Self {
        let store = Self::new();
        for collection in collections {
            store.insert(collection);
        }
        store
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or replace a collection
    pub fn insert(&self, collection: Collection) {
        self.state().collections.insert(collection.id.clone(), collection);
    }

    /// Set the lock flag of a collection
    pub fn set_locked(&self, id: &str, locked: bool) {
        if let Some(c) = self.state().collections.get_mut(id) {
            c.locked = locked;
        }
    }

    /// Unlock a collection while the current connection keeps reporting the
    /// old flag until [`SecretStore::reset_connection`] is called.
    pub fn unlock_stale(&self, id: &str) {
        let mut state = self.state();
        if let Some(c) = state.collections.get_mut(id) {
            let previous = c.locked;
            c.locked = false;
            state.stale.insert(id.to_string(), previous);
        }
    }

    /// Current lock flag of a collection
    pub fn is_locked(&self, id: &str) -> Option<bool> {
        self.state().collections.get(id).map(|c| c.locked)
    }

    /// Make `list_collections` fail until cleared
    pub fn fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    /// Make lock operations fail until cleared
    pub fn fail_lock(&self, fail: bool) {
        self.state().fail_lock = fail;
    }

    /// Delay every backend call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn lock_calls(&self) -> usize {
        self.state().lock_calls
    }

    pub fn reset_calls(&self) -> usize {
        self.state().reset_calls
    }

    async fn simulate_latency(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn lock_in_place(state: &mut MemoryState, id: &str) -> Result<(), StoreError> {
        if id == SESSION_COLLECTION_ID {
            return Err(StoreError::LockFailed {
                id: id.to_string(),
                reason: "session collection cannot be locked".to_string(),
            });
        }
        let collection = state
            .collections
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        collection.locked = true;
        state.stale.remove(id);
        Ok(())
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn reset_connection(&self) -> Result<(), StoreError> {
        let mut state = self.state();
        state.reset_calls += 1;
        state.stale.clear();
        Ok(())
    }

    async fn list_collections(
        &self,
        ignored: &BTreeSet<CollectionId>,
    ) -> Result<Vec<Collection>, StoreError> {
        self.simulate_latency().await;

        let mut state = self.state();
        state.list_calls += 1;
        if state.fail_list {
            return Err(StoreError::Unavailable("memory store listing disabled".to_string()));
        }

        let snapshot: Vec<Collection> = state
            .collections
            .values()
            .map(|c| {
                let mut c = c.clone();
                if let Some(&reported) = state.stale.get(&c.id) {
                    c.locked = reported;
                }
                c
            })
            .collect();

        Ok(relevant_collections(snapshot, ignored))
    }

    async fn lock_all(&self, collections: &[Collection]) -> Result<usize, StoreError> {
        self.simulate_latency().await;

        let mut state = self.state();
        state.lock_calls += 1;
        if state.fail_lock {
            return Err(StoreError::Unavailable("memory store locking disabled".to_string()));
        }

        let mut locked = 0;
        for collection in collections {
            Self::lock_in_place(&mut state, &collection.id)?;
            locked += 1;
        }
        debug!(locked, "Memory store locked collections");
        Ok(locked)
    }

    async fn lock_one(&self, collection: &Collection) -> Result<(), StoreError> {
        self.simulate_latency().await;

        let mut state = self.state();
        state.lock_calls += 1;
        if state.fail_lock {
            return Err(StoreError::LockFailed {
                id: collection.id.clone(),
                reason: "memory store locking disabled".to_string(),
            });
        }
        Self::lock_in_place(&mut state, &collection.id)
    }
}
