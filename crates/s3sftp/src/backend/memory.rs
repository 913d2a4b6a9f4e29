use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use s3sftp_core::path::{child_name, is_directory_marker};
use s3sftp_core::ObjectMetadata;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{BackendConfig, BackendFactory, DirEntry, ObjectHead, StorageClient, BACKEND_MEMORY};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
    etag: String,
}

impl StoredObject {
    fn new(data: Bytes) -> Self {
        let digest = Sha256::digest(&data);
        Self {
            etag: hex::encode(&digest[..16]),
            last_modified: Utc::now(),
            data,
        }
    }

    fn head(&self) -> ObjectHead {
        ObjectHead {
            size: self.data.len() as u64,
            last_modified: self.last_modified,
            etag: self.etag.clone(),
        }
    }
}

/// Process-local object store with S3 key semantics
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store, e.g. `MemoryStorage::with_keys(["a/b.txt", "dir/"])`
    pub fn with_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let objects = keys
            .into_iter()
            .map(|key| (key.into(), StoredObject::new(Bytes::new())))
            .collect();
        Self {
            objects: RwLock::new(objects),
        }
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Immediate children of `prefix` in key order: `(key, head)` for objects
    /// and `(subdir/, None)` for common prefixes.
    async fn children(&self, prefix: &str, limit: usize) -> Vec<(String, Option<ObjectHead>)> {
        let objects = self.objects.read().await;
        let mut out: Vec<(String, Option<ObjectHead>)> = Vec::new();

        for (key, object) in objects.range(prefix.to_string()..) {
            if out.len() >= limit {
                break;
            }
            if !key.starts_with(prefix) {
                break;
            }
            let Some(name) = child_name(prefix, key) else {
                continue;
            };
            let child = format!("{prefix}{name}");
            if key.len() > child.len() {
                let dir = format!("{child}/");
                if out.last().map(|(k, _)| k.as_str()) != Some(dir.as_str()) {
                    out.push((dir, None));
                }
            } else {
                out.push((child, Some(object.head())));
            }
        }

        out
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    fn backend_type(&self) -> &'static str {
        BACKEND_MEMORY
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>> {
        Ok(self.objects.read().await.get(key).map(StoredObject::head))
    }

    async fn list_immediate_children(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .children(prefix, limit)
            .await
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn list_directory(&self, prefix: &str) -> Result<Vec<DirEntry>> {
        Ok(self
            .children(prefix, usize::MAX)
            .await
            .into_iter()
            .filter_map(|(key, head)| {
                let name = child_name(prefix, &key)?.to_string();
                let metadata = match head {
                    Some(head) if !is_directory_marker(&key) => {
                        ObjectMetadata::file(head.size, head.last_modified, head.etag)
                    }
                    _ => ObjectMetadata::directory(false),
                };
                Some(DirEntry { name, metadata })
            })
            .collect())
    }

    async fn get_object_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        let objects = self.objects.read().await;
        let object = objects
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let size = object.data.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(size);
        let end = start
            .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
            .min(size);
        Ok(object.data.slice(start..end))
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), StoredObject::new(data));
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<()> {
        let mut objects = self.objects.write().await;
        let data = objects
            .get(from)
            .map(|object| object.data.clone())
            .ok_or_else(|| Error::NotFound(from.to_string()))?;
        objects.insert(to.to_string(), StoredObject::new(data));
        Ok(())
    }
}

/// Hands out one shared store per bucket name, so every session bound to the
/// same profile sees the same objects.
#[derive(Default)]
pub struct MemoryFactory {
    buckets: DashMap<String, Arc<MemoryStorage>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackendFactory for MemoryFactory {
    async fn create(&self, config: &BackendConfig) -> anyhow::Result<Arc<dyn StorageClient>> {
        let bucket = config.bucket.clone().unwrap_or_default();
        let storage = self
            .buckets
            .entry(bucket)
            .or_insert_with(|| Arc::new(MemoryStorage::new()))
            .clone();
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_immediate_children_collapse_subdirectories() {
        let store = MemoryStorage::with_keys(["a/", "a/b.txt", "a/c/d.txt", "a/c/e.txt", "ab.txt"]);

        let children = store.list_immediate_children("a/", 10).await.unwrap();
        assert_eq!(children, vec!["a/b.txt".to_string(), "a/c/".to_string()]);

        let children = store.list_immediate_children("a/", 1).await.unwrap();
        assert_eq!(children, vec!["a/b.txt".to_string()]);

        let top = store.list_immediate_children("", 10).await.unwrap();
        assert_eq!(top, vec!["a/".to_string(), "ab.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_marker_is_not_its_own_child() {
        let store = MemoryStorage::with_keys(["dir/"]);
        assert!(store.list_immediate_children("dir/", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_directory_metadata() {
        let store = MemoryStorage::new();
        store.put_object("d/file", Bytes::from_static(b"12345")).await.unwrap();
        store.put_object("d/sub/x", Bytes::new()).await.unwrap();

        let entries = store.list_directory("d/").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "file");
        assert_eq!(entries[0].metadata.size, 5);
        assert!(entries[0].metadata.is_regular_file());
        assert_eq!(entries[1].name, "sub");
        assert!(entries[1].metadata.is_directory());
    }

    #[tokio::test]
    async fn test_range_reads() {
        let store = MemoryStorage::new();
        store.put_object("f", Bytes::from_static(b"hello world")).await.unwrap();

        assert_eq!(store.get_object_range("f", 6, 100).await.unwrap(), "world");
        assert_eq!(store.get_object_range("f", 0, 5).await.unwrap(), "hello");
        assert!(store.get_object_range("f", 50, 5).await.unwrap().is_empty());
        assert!(matches!(
            store.get_object_range("missing", 0, 1).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_factory_shares_bucket() {
        let factory = MemoryFactory::new();
        let a = factory.create(&BackendConfig::memory("x")).await.unwrap();
        let b = factory.create(&BackendConfig::memory("x")).await.unwrap();
        a.put_object("k", Bytes::new()).await.unwrap();
        assert!(b.head_object("k").await.unwrap().is_some());

        let other = factory.create(&BackendConfig::memory("y")).await.unwrap();
        assert!(other.head_object("k").await.unwrap().is_none());
    }
}
