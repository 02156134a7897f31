//! Opaque-token store for passthrough object handles.
//!
//! A flat keyed table, separate from the registry proper: no versioning,
//! no listener fan-out, no multi-level indexing. Tokens map to weak
//! handles; a lookup promotes the weak handle and evicts the slot when
//! the owning process is gone.

use crate::handle::{ServiceHandle, WeakServiceHandle};
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// Flat token -> weak handle table.
#[derive(Default)]
pub struct TokenStore {
    map: HashMap<u64, WeakServiceHandle>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a token for `handle` and store a weak reference to it.
    ///
    /// Tokens are random; a collision with a live token triggers
    /// regeneration.
    pub fn create_token(&mut self, handle: &ServiceHandle) -> u64 {
        let mut rng = rand::rng();
        let mut token: u64 = rng.random();
        while self.map.contains_key(&token) {
            token = rng.random();
        }
        self.map.insert(token, handle.downgrade());
        token
    }

    /// Resolve a token to a strong handle.
    ///
    /// Returns `None` for unknown tokens and for tokens whose handle can
    /// no longer be promoted (owner died or dropped); a failed promotion
    /// evicts the slot.
    pub fn get(&mut self, token: u64) -> Option<ServiceHandle> {
        let weak = self.map.get(&token)?;
        match weak.upgrade() {
            Some(handle) => Some(handle),
            None => {
                debug!("Evicting token for dead handle");
                self.map.remove(&token);
                None
            }
        }
    }

    /// Remove a token. Returns whether it existed.
    pub fn unregister(&mut self, token: u64) -> bool {
        self.map.remove(&token).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleId;

    fn handle(id: u64) -> ServiceHandle {
        ServiceHandle::new(HandleId(id), Some(1), 0)
    }

    #[test]
    fn token_round_trip() {
        let mut store = TokenStore::new();
        let h = handle(1);
        let token = store.create_token(&h);
        assert_eq!(store.get(token).unwrap().id(), h.id());
    }

    #[test]
    fn unknown_token_misses() {
        let mut store = TokenStore::new();
        assert!(store.get(12345).is_none());
        assert!(!store.unregister(12345));
    }

    #[test]
    fn dead_handle_is_evicted_on_lookup() {
        let mut store = TokenStore::new();
        let h = handle(1);
        let token = store.create_token(&h);
        h.mark_dead();
        assert!(store.get(token).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn dropped_handle_is_evicted_on_lookup() {
        let mut store = TokenStore::new();
        let token = {
            let h = handle(1);
            store.create_token(&h)
        };
        assert!(store.get(token).is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn unregister_removes_live_token() {
        let mut store = TokenStore::new();
        let h = handle(1);
        let token = store.create_token(&h);
        assert!(store.unregister(token));
        assert!(store.get(token).is_none());
    }
}
