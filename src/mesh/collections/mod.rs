//! Collection types used by `bxmesh`.
//!
//! The hash maps and sets defined here are keyed by untrusted data
//! coming off the wire (transaction hashes, short ids), so the
//! default hasher is selected by a feature flag rather than being
//! hardwired to the standard library's.

#[cfg(feature = "collections_randomstate_std")]
pub type RandomState = std::collections::hash_map::RandomState;

#[cfg(feature = "collections_randomstate_twox_hash")]
pub type RandomState = twox_hash::RandomXxHashBuilder64;

/// The `HashMap` used throughout this crate.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// The `HashSet` used throughout this crate.
pub type HashSet<T> = std::collections::HashSet<T, RandomState>;

/// Creates a new `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::default()
}

/// Creates a new `HashSet`.
pub fn hash_set<T>() -> HashSet<T> {
    HashSet::default()
}
