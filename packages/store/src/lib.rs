#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Collection store used for verbatim harvests, processed instances, and
//! audit records.
//!
//! A collection is a named, unordered bag of JSON documents. The only
//! cross-collection operation is [`CollectionStore::rename_collection`],
//! which must replace the target atomically: readers see either the old
//! target or the complete new one.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Suffix appended to a collection name to form its scratch collection.
pub const SCRATCH_SUFFIX: &str = "-temp";

/// Returns the scratch collection name for `committed`.
#[must_use]
pub fn scratch_name(committed: &str) -> String {
    format!("{committed}{SCRATCH_SUFFIX}")
}

/// Errors raised by store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error in a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The named collection does not exist.
    #[error("Collection not found: {name}")]
    NotFound {
        /// Collection name.
        name: String,
    },

    /// The collection name contains characters the store cannot use.
    #[error("Invalid collection name: {name:?}")]
    InvalidName {
        /// Offending name.
        name: String,
    },
}

/// Document collection storage.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Creates an empty collection, discarding any existing collection of
    /// the same name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the name is invalid or the backend fails.
    async fn create_collection(&self, name: &str) -> Result<(), StoreError>;

    /// Deletes a collection. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn delete_collection(&self, name: &str) -> Result<bool, StoreError>;

    /// Appends documents to an existing collection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the collection does not exist.
    async fn write_batch(&self, name: &str, documents: Vec<Value>) -> Result<(), StoreError>;

    /// Renames `from` to `to`, atomically replacing `to` if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if `from` does not exist.
    async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError>;

    /// Whether a collection exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn exists(&self, name: &str) -> Result<bool, StoreError>;

    /// Number of documents in a collection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the collection does not exist.
    async fn count(&self, name: &str) -> Result<u64, StoreError>;

    /// Returns up to `take` documents starting at `skip`, in storage order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the collection does not exist.
    async fn get_chunk(&self, name: &str, skip: usize, take: usize)
    -> Result<Vec<Value>, StoreError>;

    /// Names of all collections, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;
}

/// Checks that `name` is usable as a collection name in every backend:
/// non-empty ASCII alphanumerics, `-`, `_` and `.`, not starting with `.`.
///
/// # Errors
///
/// Returns [`StoreError::InvalidName`] otherwise.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// Copies every document of `from` into a freshly created `to`, `page_size`
/// documents at a time. Returns the number of documents copied.
///
/// # Errors
///
/// Returns [`StoreError`] if either collection cannot be read or written.
pub async fn copy_collection(
    store: &dyn CollectionStore,
    from: &str,
    to: &str,
    page_size: usize,
) -> Result<u64, StoreError> {
    let page_size = page_size.max(1);
    store.create_collection(to).await?;

    let mut skip = 0;
    loop {
        let page = store.get_chunk(from, skip, page_size).await?;
        let len = page.len();
        if len == 0 {
            break;
        }
        store.write_batch(to, page).await?;
        skip += len;
        if len < page_size {
            break;
        }
    }

    log::debug!("Copied {skip} documents from {from} to {to}");
    Ok(skip as u64)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn names() {
        assert!(validate_name("verbatim-artportalen-temp").is_ok());
        assert!(validate_name("processed-0-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("a b").is_err());
        assert_eq!(scratch_name("x"), "x-temp");
    }

    #[tokio::test]
    async fn copy_collection_pages_through_everything() {
        let store = MemoryStore::new();
        store.create_collection("a").await.unwrap();
        store
            .write_batch("a", (0..7).map(|i| json!({ "i": i })).collect())
            .await
            .unwrap();

        let copied = copy_collection(&store, "a", "b", 3).await.unwrap();
        assert_eq!(copied, 7);
        assert_eq!(store.count("b").await.unwrap(), 7);
        assert_eq!(store.count("a").await.unwrap(), 7);
    }
}
