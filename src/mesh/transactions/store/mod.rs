//! The mapping state behind the transaction service.
//!
//! The service's hot paths (cache key derivation, the short id set
//! operations, contents storage) sit behind the narrow
//! `TransactionStore` trait, so a specialized backend can replace
//! the plain hash map implementation without the service noticing.

use crate::mesh::collections::{self, HashMap, HashSet};
use crate::mesh::crypto::hash::Digest;

/// The key a transaction hash is stored under.
pub type TxCacheKey = Digest;

/// The three way mapping between cache keys, short ids and raw
/// transaction contents.
pub trait TransactionStore {
    /// Derives the cache key of a transaction hash.
    fn cache_key(&self, tx_hash: &Digest) -> TxCacheKey {
        *tx_hash
    }

    /// Recovers the transaction hash behind a cache key.
    fn cache_key_to_hash(&self, key: &TxCacheKey) -> Digest {
        *key
    }

    /// Adds a short id to a key's assignment set and indexes the
    /// reverse mapping.
    fn insert_short_id(&mut self, key: TxCacheKey, short_id: u32);

    /// The short ids assigned to a key, if any.
    fn short_ids_of(&self, key: &TxCacheKey) -> Option<Vec<u32>>;

    /// Drops a key's whole assignment set, returning it.
    fn remove_short_ids_of(&mut self, key: &TxCacheKey) -> Option<Vec<u32>>;

    /// Drops one short id from a key's assignment set; returns how
    /// many assignments the key still has.
    fn remove_one_short_id(&mut self, key: &TxCacheKey, short_id: u32) -> usize;

    fn has_short_ids_of(&self, key: &TxCacheKey) -> bool;

    /// The key a short id resolves to.
    fn key_of(&self, short_id: u32) -> Option<TxCacheKey>;

    fn remove_key_of(&mut self, short_id: u32) -> Option<TxCacheKey>;

    fn has_short_id(&self, short_id: u32) -> bool;

    fn short_id_count(&self) -> usize;

    /// Stores contents under a key, returning the size of any
    /// contents previously stored there.
    fn set_contents(&mut self, key: TxCacheKey, contents: Vec<u8>) -> usize;

    fn contents_of(&self, key: &TxCacheKey) -> Option<&[u8]>;

    fn remove_contents_of(&mut self, key: &TxCacheKey) -> Option<Vec<u8>>;

    fn has_contents_of(&self, key: &TxCacheKey) -> bool;

    fn contents_count(&self) -> usize;

    /// Every key with stored contents.
    fn content_keys(&self) -> Vec<TxCacheKey>;

    /// Drops the whole mapping state.
    fn clear(&mut self);
}

/// The default `TransactionStore`, plain hash maps keyed by the
/// transaction hash itself.
pub struct HashStore {
    key_to_short_ids: HashMap<TxCacheKey, HashSet<u32>>,
    short_id_to_key: HashMap<u32, TxCacheKey>,
    key_to_contents: HashMap<TxCacheKey, Vec<u8>>,
}

impl HashStore {
    pub fn new() -> Self {
        HashStore {
            key_to_short_ids: collections::hash_map(),
            short_id_to_key: collections::hash_map(),
            key_to_contents: collections::hash_map(),
        }
    }
}

impl Default for HashStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionStore for HashStore {
    fn insert_short_id(&mut self, key: TxCacheKey, short_id: u32) {
        self.key_to_short_ids
            .entry(key)
            .or_insert_with(collections::hash_set)
            .insert(short_id);
        self.short_id_to_key.insert(short_id, key);
    }

    fn short_ids_of(&self, key: &TxCacheKey) -> Option<Vec<u32>> {
        self.key_to_short_ids
            .get(key)
            .map(|sids| sids.iter().copied().collect())
    }

    fn remove_short_ids_of(&mut self, key: &TxCacheKey) -> Option<Vec<u32>> {
        self.key_to_short_ids
            .remove(key)
            .map(|sids| sids.into_iter().collect())
    }

    fn remove_one_short_id(&mut self, key: &TxCacheKey, short_id: u32) -> usize {
        match self.key_to_short_ids.get_mut(key) {
            Some(sids) => {
                sids.remove(&short_id);
                let remaining = sids.len();
                if remaining == 0 {
                    self.key_to_short_ids.remove(key);
                }
                remaining
            }
            None => 0,
        }
    }

    fn has_short_ids_of(&self, key: &TxCacheKey) -> bool {
        self.key_to_short_ids.contains_key(key)
    }

    fn key_of(&self, short_id: u32) -> Option<TxCacheKey> {
        self.short_id_to_key.get(&short_id).copied()
    }

    fn remove_key_of(&mut self, short_id: u32) -> Option<TxCacheKey> {
        self.short_id_to_key.remove(&short_id)
    }

    fn has_short_id(&self, short_id: u32) -> bool {
        self.short_id_to_key.contains_key(&short_id)
    }

    fn short_id_count(&self) -> usize {
        self.short_id_to_key.len()
    }

    fn set_contents(&mut self, key: TxCacheKey, contents: Vec<u8>) -> usize {
        self.key_to_contents
            .insert(key, contents)
            .map(|old| old.len())
            .unwrap_or(0)
    }

    fn contents_of(&self, key: &TxCacheKey) -> Option<&[u8]> {
        self.key_to_contents.get(key).map(Vec::as_slice)
    }

    fn remove_contents_of(&mut self, key: &TxCacheKey) -> Option<Vec<u8>> {
        self.key_to_contents.remove(key)
    }

    fn has_contents_of(&self, key: &TxCacheKey) -> bool {
        self.key_to_contents.contains_key(key)
    }

    fn contents_count(&self) -> usize {
        self.key_to_contents.len()
    }

    fn content_keys(&self) -> Vec<TxCacheKey> {
        self.key_to_contents.keys().copied().collect()
    }

    fn clear(&mut self) {
        self.key_to_short_ids.clear();
        self.short_id_to_key.clear();
        self.key_to_contents.clear();
    }
}
