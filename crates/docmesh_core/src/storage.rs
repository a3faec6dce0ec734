//! Storage adapter abstraction.
//!
//! Backends are thin key/byte-range stores: they persist opaque chunks under
//! hierarchical keys and support prefix queries. All compaction policy lives
//! above this trait in the engine; a backend never interprets chunk contents.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;

/// Hierarchical storage key: an ordered list of string components.
///
/// Keys are prefix-addressable: `load_range`/`remove_range` operate on every
/// chunk whose key starts with the given components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageKey(Vec<String>);

impl StorageKey {
    /// Build a key from its components.
    pub fn new(components: Vec<String>) -> Self {
        Self(components)
    }

    /// The key's components, outermost first.
    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// Return a new key with `component` appended.
    pub fn with_component(&self, component: impl Into<String>) -> Self {
        let mut components = self.0.clone();
        components.push(component.into());
        Self(components)
    }

    /// Whether `self` starts with all of `prefix`'s components.
    pub fn starts_with(&self, prefix: &StorageKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// The final component, if any.
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }
}

impl<const N: usize> From<[&str; N]> for StorageKey {
    fn from(components: [&str; N]) -> Self {
        Self(components.iter().map(|c| c.to_string()).collect())
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// A stored chunk together with the key it lives under.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub key: StorageKey,
    pub data: Vec<u8>,
}

/// Pluggable storage backend.
///
/// I/O failures are propagated to the caller as `DocmeshError::StorageIo`;
/// this layer does not retry.
#[async_trait]
pub trait StorageAdapter: Send + Sync + 'static {
    /// Load the chunk at `key`, or `None` if absent.
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>>;

    /// Store `data` at `key`, replacing any existing chunk.
    async fn save(&self, key: &StorageKey, data: &[u8]) -> Result<()>;

    /// Remove the chunk at `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &StorageKey) -> Result<()>;

    /// Load every chunk whose key starts with `prefix`, in key order.
    async fn load_range(&self, prefix: &StorageKey) -> Result<Vec<Chunk>>;

    /// Remove every chunk whose key starts with `prefix`.
    async fn remove_range(&self, prefix: &StorageKey) -> Result<()>;
}

/// In-memory storage backend.
///
/// Reference implementation used by tests and ephemeral repos. Chunks live
/// in a `BTreeMap` so range queries come back in key order.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    chunks: RwLock<BTreeMap<StorageKey, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks. Test helper.
    pub fn len(&self) -> usize {
        self.chunks.read().unwrap().len()
    }

    /// Whether the store holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored key. Test helper.
    pub fn keys(&self) -> Vec<StorageKey> {
        self.chunks.read().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>> {
        Ok(self.chunks.read().unwrap().get(key).cloned())
    }

    async fn save(&self, key: &StorageKey, data: &[u8]) -> Result<()> {
        self.chunks
            .write()
            .unwrap()
            .insert(key.clone(), data.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &StorageKey) -> Result<()> {
        self.chunks.write().unwrap().remove(key);
        Ok(())
    }

    async fn load_range(&self, prefix: &StorageKey) -> Result<Vec<Chunk>> {
        Ok(self
            .chunks
            .read()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| Chunk {
                key: key.clone(),
                data: data.clone(),
            })
            .collect())
    }

    async fn remove_range(&self, prefix: &StorageKey) -> Result<()> {
        self.chunks
            .write()
            .unwrap()
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}
