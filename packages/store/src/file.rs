//! File-backed store: one newline-delimited JSON file per collection.
//!
//! `create_collection` and `rename_collection` go through the filesystem's
//! rename, which replaces the target atomically on POSIX systems. Appends
//! are serialized through one writer lock per store.
//!
//! Paging remembers where the last `get_chunk` of each collection stopped,
//! so reading a collection front to back scans the file once.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _, BufReader};
use tokio::sync::Mutex;

use crate::{CollectionStore, StoreError, validate_name};

const EXTENSION: &str = "ndjson";

/// Document index and byte offset of the line following the last page read.
#[derive(Debug, Clone, Copy, Default)]
struct ReadCursor {
    index: usize,
    offset: u64,
}

/// Store rooted at a directory.
pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
    cursors: Mutex<BTreeMap<String, ReadCursor>>,
}

impl FileStore {
    /// Opens (creating if needed) a store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        log::debug!("Opened file store at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            cursors: Mutex::new(BTreeMap::new()),
        })
    }

    /// Directory holding the collection files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.{EXTENSION}")))
    }

    async fn require(&self, name: &str) -> Result<PathBuf, StoreError> {
        let path = self.path(name)?;
        if tokio::fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(StoreError::NotFound {
                name: name.to_string(),
            })
        }
    }

    async fn open_lines(
        &self,
        name: &str,
    ) -> Result<tokio::io::Lines<BufReader<tokio::fs::File>>, StoreError> {
        let path = self.require(name).await?;
        let file = tokio::fs::File::open(&path).await?;
        Ok(BufReader::new(file).lines())
    }

    /// Drops remembered read positions. Appends keep them valid; anything
    /// that replaces or removes a file does not.
    async fn forget_cursors(&self, names: &[&str]) {
        let mut cursors = self.cursors.lock().await;
        for name in names {
            cursors.remove(*name);
        }
    }
}

#[async_trait]
impl CollectionStore for FileStore {
    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path(name)?;
        let tmp_path = self.dir.join(format!(".{name}.{EXTENSION}.tmp"));

        let _guard = self.write_lock.lock().await;
        tokio::fs::write(&tmp_path, b"").await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        self.forget_cursors(&[name]).await;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path(name)?;

        let _guard = self.write_lock.lock().await;
        self.forget_cursors(&[name]).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_batch(&self, name: &str, documents: Vec<Value>) -> Result<(), StoreError> {
        let mut buffer = Vec::new();
        for document in &documents {
            serde_json::to_writer(&mut buffer, document)?;
            buffer.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let path = self.require(name).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        Ok(())
    }

    async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let to_path = self.path(to)?;

        let _guard = self.write_lock.lock().await;
        let from_path = self.require(from).await?;
        tokio::fs::rename(&from_path, &to_path).await?;
        self.forget_cursors(&[from, to]).await;
        log::debug!("Renamed collection {from} -> {to}");
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.path(name)?).await?)
    }

    async fn count(&self, name: &str) -> Result<u64, StoreError> {
        let mut lines = self.open_lines(name).await?;
        let mut count = 0;
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_chunk(
        &self,
        name: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let path = self.require(name).await?;
        let start = self
            .cursors
            .lock()
            .await
            .get(name)
            .copied()
            .filter(|cursor| cursor.index <= skip)
            .unwrap_or_default();

        let mut file = tokio::fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(start.offset)).await?;
        let mut reader = BufReader::new(file);

        let mut position = start;
        let mut documents = Vec::new();
        let mut line = String::new();

        while documents.len() < take {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            // A line without its newline is an append still in progress.
            if read == 0 || !line.ends_with('\n') {
                break;
            }
            position.offset += read as u64;

            if line.trim().is_empty() {
                continue;
            }
            if position.index >= skip {
                documents.push(serde_json::from_str(line.trim_end())?);
            }
            position.index += 1;
        }

        self.cursors.lock().await.insert(name.to_string(), position);
        Ok(documents)
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && !stem.starts_with('.')
            {
                names.push(stem.to_string());
            }
        }

        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn store(test: &str) -> FileStore {
        let dir = std::env::temp_dir().join(format!("sos_store_{test}"));
        let _ = std::fs::remove_dir_all(&dir);
        FileStore::open(dir).await.unwrap()
    }

    #[tokio::test]
    async fn write_and_read_back() {
        let store = store("write_and_read_back").await;
        store.create_collection("verbatim-1").await.unwrap();
        store
            .write_batch("verbatim-1", vec![json!({"id": 1}), json!({"id": 2})])
            .await
            .unwrap();
        store
            .write_batch("verbatim-1", vec![json!({"id": 3})])
            .await
            .unwrap();

        assert_eq!(store.count("verbatim-1").await.unwrap(), 3);
        assert_eq!(
            store.get_chunk("verbatim-1", 1, 5).await.unwrap(),
            vec![json!({"id": 2}), json!({"id": 3})]
        );
        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[tokio::test]
    async fn rename_replaces_target_file() {
        let store = store("rename_replaces_target_file").await;
        store.create_collection("committed").await.unwrap();
        store
            .write_batch("committed", (0..100).map(|i| json!(i)).collect())
            .await
            .unwrap();
        store.create_collection("committed-temp").await.unwrap();
        store
            .write_batch("committed-temp", (0..90).map(|i| json!(i)).collect())
            .await
            .unwrap();

        store
            .rename_collection("committed-temp", "committed")
            .await
            .unwrap();

        assert_eq!(store.count("committed").await.unwrap(), 90);
        assert!(!store.exists("committed-temp").await.unwrap());
        assert_eq!(store.list_collections().await.unwrap(), vec!["committed"]);
        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[tokio::test]
    async fn create_truncates_and_missing_is_not_found() {
        let store = store("create_truncates").await;
        store.create_collection("a").await.unwrap();
        store.write_batch("a", vec![json!(1)]).await.unwrap();
        store.create_collection("a").await.unwrap();
        assert_eq!(store.count("a").await.unwrap(), 0);

        assert!(matches!(
            store.get_chunk("b", 0, 1).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.rename_collection("b", "a").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(!store.delete_collection("b").await.unwrap());
        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[tokio::test]
    async fn paging_resumes_and_sees_later_writes() {
        let store = store("paging_resumes").await;
        store.create_collection("processed-0-1").await.unwrap();
        store
            .write_batch("processed-0-1", (0..5).map(|i| json!(i)).collect())
            .await
            .unwrap();

        let mut pages = Vec::new();
        let mut skip = 0;
        loop {
            let page = store.get_chunk("processed-0-1", skip, 2).await.unwrap();
            if page.is_empty() {
                break;
            }
            skip += page.len();
            pages.push(page);
        }
        assert_eq!(
            pages,
            vec![
                vec![json!(0), json!(1)],
                vec![json!(2), json!(3)],
                vec![json!(4)],
            ]
        );

        store
            .write_batch("processed-0-1", vec![json!(5)])
            .await
            .unwrap();
        assert_eq!(
            store.get_chunk("processed-0-1", 5, 10).await.unwrap(),
            vec![json!(5)]
        );
        assert_eq!(
            store.get_chunk("processed-0-1", 1, 2).await.unwrap(),
            vec![json!(1), json!(2)]
        );
        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[tokio::test]
    async fn paging_restarts_after_collection_is_replaced() {
        let store = store("paging_restarts").await;
        store.create_collection("a").await.unwrap();
        store
            .write_batch("a", (0..4).map(|i| json!(i)).collect())
            .await
            .unwrap();
        assert_eq!(store.get_chunk("a", 0, 3).await.unwrap().len(), 3);

        store.create_collection("a-temp").await.unwrap();
        store
            .write_batch("a-temp", vec![json!("x"), json!("y"), json!("z"), json!("w")])
            .await
            .unwrap();
        store.rename_collection("a-temp", "a").await.unwrap();

        assert_eq!(
            store.get_chunk("a", 3, 10).await.unwrap(),
            vec![json!("w")]
        );
        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[tokio::test]
    async fn rejects_path_like_names() {
        let store = store("rejects_path_like_names").await;
        assert!(matches!(
            store.create_collection("../escape").await,
            Err(StoreError::InvalidName { .. })
        ));
        let _ = std::fs::remove_dir_all(store.dir());
    }
}
