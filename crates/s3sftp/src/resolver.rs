//! Filesystem-shaped metadata over a flat object store.
//!
//! A logical path is a regular file when an object with exactly that key
//! exists, a directory when any key lives under `path/`, and an empty
//! directory when only its `path/` marker exists. Prefix checks always go
//! through the `/` boundary, so `foo` never matches `foobar`.

use chrono::Utc;
use s3sftp_core::path::{directory_prefix, normalize_key};
use s3sftp_core::ObjectMetadata;
use tracing::debug;

use crate::audit::AuditEvent;
use crate::backend::StorageClient;
use crate::{Error, Result};

/// Resolve `logical_path` against `client`.
///
/// `Ok(None)` is a valid absence. Any backend failure surfaces as
/// `Error::BackendUnavailable`; it is never reported as absence.
pub async fn resolve(
    client: &dyn StorageClient,
    logical_path: &str,
) -> Result<Option<ObjectMetadata>> {
    let key = normalize_key(logical_path);

    if key.is_empty() {
        let empty = client
            .list_immediate_children("", 1)
            .await
            .map_err(unavailable)?
            .is_empty();
        return Ok(Some(ObjectMetadata::directory(empty)));
    }

    let prefix = directory_prefix(key);

    if let Some(head) = client.head_object(key).await.map_err(unavailable)? {
        let has_children = !client
            .list_immediate_children(&prefix, 1)
            .await
            .map_err(unavailable)?
            .is_empty();
        if has_children {
            AuditEvent::BackendInconsistency {
                backend: client.backend_type().to_string(),
                key: key.to_string(),
                detail: "object exists alongside keys under its directory prefix".to_string(),
                timestamp: Utc::now(),
            }
            .log();
        }
        debug!(key, size = head.size, "Resolved regular file");
        return Ok(Some(ObjectMetadata::file(
            head.size,
            head.last_modified,
            head.etag,
        )));
    }

    let children = client
        .list_immediate_children(&prefix, 1)
        .await
        .map_err(unavailable)?;
    if !children.is_empty() {
        debug!(key, "Resolved directory");
        return Ok(Some(ObjectMetadata::directory(false)));
    }

    if client.head_object(&prefix).await.map_err(unavailable)?.is_some() {
        debug!(key, "Resolved empty directory");
        return Ok(Some(ObjectMetadata::directory(true)));
    }

    Ok(None)
}

fn unavailable(err: Error) -> Error {
    match err {
        Error::BackendUnavailable(_) => err,
        other => Error::BackendUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DirEntry, MemoryStorage, ObjectHead};
    use async_trait::async_trait;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_file_and_implied_directory() {
        let store = MemoryStorage::new();
        store
            .put_object("a/b.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let dir = resolve(&store, "a").await.unwrap().unwrap();
        assert!(dir.is_directory());
        assert!(!dir.is_empty_directory());
        assert_eq!(dir.size, 0);
        assert!(dir.etag.is_empty());

        let file = resolve(&store, "a/b.txt").await.unwrap().unwrap();
        assert!(file.is_regular_file());
        assert!(!file.is_directory());
        assert_eq!(file.size, 5);
        assert!(!file.etag.is_empty());

        assert!(resolve(&store, "z").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_substring_prefix_match() {
        let store = MemoryStorage::with_keys(["a/b.txt", "foobar"]);
        assert!(resolve(&store, "a/b").await.unwrap().is_none());
        assert!(resolve(&store, "foo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_marker_only_directory_is_empty() {
        let store = MemoryStorage::with_keys(["dir/"]);
        let dir = resolve(&store, "dir").await.unwrap().unwrap();
        assert!(dir.is_directory());
        assert!(dir.is_empty_directory());

        let same = resolve(&store, "/dir/").await.unwrap().unwrap();
        assert_eq!(dir, same);
    }

    #[tokio::test]
    async fn test_marker_with_children_is_not_empty() {
        let store = MemoryStorage::with_keys(["dir/", "dir/x"]);
        let dir = resolve(&store, "dir").await.unwrap().unwrap();
        assert!(!dir.is_empty_directory());
    }

    #[tokio::test]
    async fn test_exact_file_wins_over_children() {
        let store = MemoryStorage::with_keys(["a", "a/child"]);
        let meta = resolve(&store, "a").await.unwrap().unwrap();
        assert!(meta.is_regular_file());
    }

    #[tokio::test]
    async fn test_root_is_a_directory() {
        let store = MemoryStorage::new();
        assert!(resolve(&store, "/").await.unwrap().unwrap().is_empty_directory());

        store.put_object("x", Bytes::new()).await.unwrap();
        let root = resolve(&store, "").await.unwrap().unwrap();
        assert!(root.is_directory());
        assert!(!root.is_empty_directory());
    }

    struct FailingStorage;

    #[async_trait]
    impl StorageClient for FailingStorage {
        fn backend_type(&self) -> &'static str {
            "failing"
        }
        async fn head_object(&self, _key: &str) -> Result<Option<ObjectHead>> {
            Err(Error::Io(std::io::Error::other("connection reset")))
        }
        async fn list_immediate_children(
            &self,
            _prefix: &str,
            _limit: usize,
        ) -> Result<Vec<String>> {
            Err(Error::backend("connection reset"))
        }
        async fn list_directory(&self, _prefix: &str) -> Result<Vec<DirEntry>> {
            Err(Error::backend("connection reset"))
        }
        async fn get_object_range(&self, _key: &str, _offset: u64, _len: u64) -> Result<Bytes> {
            Err(Error::backend("connection reset"))
        }
        async fn put_object(&self, _key: &str, _data: Bytes) -> Result<()> {
            Err(Error::backend("connection reset"))
        }
        async fn delete_object(&self, _key: &str) -> Result<()> {
            Err(Error::backend("connection reset"))
        }
        async fn copy_object(&self, _from: &str, _to: &str) -> Result<()> {
            Err(Error::backend("connection reset"))
        }
    }

    #[tokio::test]
    async fn test_backend_failure_is_not_absence() {
        assert!(matches!(
            resolve(&FailingStorage, "anything").await,
            Err(Error::BackendUnavailable(_))
        ));
        assert!(matches!(
            resolve(&FailingStorage, "/").await,
            Err(Error::BackendUnavailable(_))
        ));
    }
}
