//! Hashing utilities.
//!
//! All Spillway maps use the ahash hasher; these aliases keep call sites
//! short and the hasher choice in one place.

/// Hash map with the ahash hasher.
pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, ahash::RandomState>;

/// Insertion-ordered map with the ahash hasher.
pub type FxIndexMap<K, V> = indexmap::IndexMap<K, V, ahash::RandomState>;
