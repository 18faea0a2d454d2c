//! Key/value persistence behind the state store.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{FutureExt as _, future::BoxFuture};

use crate::Result;

/// A storage service that hands out isolated namespaces
pub trait StorageBackend: Send + Sync {
    fn select(&self, namespace: &str) -> Arc<dyn StorageNamespace>;
}

/// One namespace of a storage backend.
///
/// Writes are last-write-wins; coordination between writers is up to the
/// caller.
pub trait StorageNamespace: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<serde_json::Value>>>;

    /// Returns whether the value was accepted
    fn set<'a>(&'a self, key: &'a str, value: serde_json::Value) -> BoxFuture<'a, Result<bool>>;

    /// Returns whether a value was removed
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;
}

/// Process local backend
#[derive(Default)]
pub struct MemoryBackend {
    namespaces: DashMap<String, Arc<MemoryNamespace>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn select(&self, namespace: &str) -> Arc<dyn StorageNamespace> {
        self.namespaces.entry(namespace.to_owned()).or_default().clone()
    }
}

#[derive(Default)]
pub struct MemoryNamespace {
    entries: DashMap<String, serde_json::Value>,
}

impl StorageNamespace for MemoryNamespace {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<serde_json::Value>>> {
        let value = self.entries.get(key).map(|entry| entry.value().clone());
        futures::future::ready(Ok(value)).boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: serde_json::Value) -> BoxFuture<'a, Result<bool>> {
        self.entries.insert(key.to_owned(), value);
        futures::future::ready(Ok(true)).boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        let removed = self.entries.remove(key).is_some();
        futures::future::ready(Ok(removed)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let backend = MemoryBackend::new();
        let states = backend.select("states");
        let other = backend.select("other");

        assert!(states.set("a", serde_json::json!({ "x": 1 })).await.unwrap());
        assert_eq!(states.get("a").await.unwrap(), Some(serde_json::json!({ "x": 1 })));
        assert_eq!(other.get("a").await.unwrap(), None);

        // same namespace again
        assert!(backend.select("states").delete("a").await.unwrap());
        assert!(!states.delete("a").await.unwrap());
    }
}
