use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// The in-memory database: a flat string keyspace and a keyspace of hashes.
///
/// Each keyspace sits behind its own reader-writer lock. No command touches both, so a handle
/// never holds more than one lock at a time. Cloning is cheap and every clone sees the same data.
#[derive(Clone, Default)]
pub struct Store {
    pub strings: StringStore,
    pub hashes: HashStore,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }
}

#[derive(Clone, Default)]
pub struct StringStore {
    inner: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl StringStore {
    pub fn set(&self, key: String, value: Bytes) {
        self.inner.write().insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.read().get(key).cloned()
    }

    /// Returns whether the key existed.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.write().remove(key).is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

type Fields = HashMap<String, Bytes>;

/// Hashes are kept as a map of maps. A hash is present only while it has at least one field: the
/// inner map is created by the first `set` and dropped by the `remove` that empties it.
#[derive(Clone, Default)]
pub struct HashStore {
    inner: Arc<RwLock<HashMap<String, Fields>>>,
}

impl HashStore {
    pub fn set(&self, hash: String, field: String, value: Bytes) {
        self.inner
            .write()
            .entry(hash)
            .or_default()
            .insert(field, value);
    }

    pub fn get(&self, hash: &str, field: &str) -> Option<Bytes> {
        self.inner
            .read()
            .get(hash)
            .and_then(|fields| fields.get(field))
            .cloned()
    }

    /// Returns a copy of every field of `hash`, iteration order is unspecified.
    pub fn get_all(&self, hash: &str) -> Option<Fields> {
        self.inner.read().get(hash).cloned()
    }

    /// Returns whether the field existed.
    pub fn remove(&self, hash: &str, field: &str) -> bool {
        let mut hashes = self.inner.write();

        let Some(fields) = hashes.get_mut(hash) else {
            return false;
        };

        let existed = fields.remove(field).is_some();

        if fields.is_empty() {
            hashes.remove(hash);
        }

        existed
    }

    /// Number of hashes.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
