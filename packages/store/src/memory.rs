//! In-process store. Used by tests and dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{CollectionStore, StoreError, validate_name};

/// Keeps every collection in memory behind one lock, so a rename is a
/// single map operation and trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, Vec<Value>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(name: &str) -> StoreError {
    StoreError::NotFound {
        name: name.to_string(),
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        validate_name(name)?;
        self.collections
            .write()
            .await
            .insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.collections.write().await.remove(name).is_some())
    }

    async fn write_batch(&self, name: &str, documents: Vec<Value>) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let collection = collections.get_mut(name).ok_or_else(|| not_found(name))?;
        collection.extend(documents);
        Ok(())
    }

    async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError> {
        validate_name(to)?;
        let mut collections = self.collections.write().await;
        let documents = collections.remove(from).ok_or_else(|| not_found(from))?;
        collections.insert(to.to_string(), documents);
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.collections.read().await.contains_key(name))
    }

    async fn count(&self, name: &str) -> Result<u64, StoreError> {
        self.collections
            .read()
            .await
            .get(name)
            .map(|c| c.len() as u64)
            .ok_or_else(|| not_found(name))
    }

    async fn get_chunk(
        &self,
        name: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let collections = self.collections.read().await;
        let collection = collections.get(name).ok_or_else(|| not_found(name))?;
        Ok(collection.iter().skip(skip).take(take).cloned().collect())
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn write_requires_existing_collection() {
        let store = MemoryStore::new();
        let result = store.write_batch("missing", vec![json!({})]).await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn rename_replaces_target() {
        let store = MemoryStore::new();
        store.create_collection("old").await.unwrap();
        store
            .write_batch("old", vec![json!(1), json!(2)])
            .await
            .unwrap();
        store.create_collection("new").await.unwrap();
        store.write_batch("new", vec![json!(3)]).await.unwrap();

        store.rename_collection("new", "old").await.unwrap();

        assert!(!store.exists("new").await.unwrap());
        assert_eq!(store.get_chunk("old", 0, 10).await.unwrap(), vec![json!(3)]);
        assert_eq!(store.list_collections().await.unwrap(), vec!["old"]);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = MemoryStore::new();
        store.create_collection("a").await.unwrap();
        assert!(store.delete_collection("a").await.unwrap());
        assert!(!store.delete_collection("a").await.unwrap());
        assert!(matches!(
            store.count("a").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn get_chunk_pages() {
        let store = MemoryStore::new();
        store.create_collection("a").await.unwrap();
        store
            .write_batch("a", (0..5).map(|i| json!(i)).collect())
            .await
            .unwrap();

        assert_eq!(
            store.get_chunk("a", 3, 10).await.unwrap(),
            vec![json!(3), json!(4)]
        );
        assert!(store.get_chunk("a", 5, 10).await.unwrap().is_empty());
    }
}
