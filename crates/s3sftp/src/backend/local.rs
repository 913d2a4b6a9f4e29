use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use s3sftp_core::path::is_directory_marker;
use s3sftp_core::ObjectMetadata;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{BackendConfig, BackendFactory, DirEntry, ObjectHead, StorageClient, BACKEND_LOCAL};
use crate::{Error, Result};

/// Objects stored as files under a root directory.
///
/// A directory marker (`key/`) is a real directory on disk.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidPath(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn head_from(meta: &std::fs::Metadata) -> ObjectHead {
        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        ObjectHead {
            size: if meta.is_dir() { 0 } else { meta.len() },
            last_modified,
            etag: format!("{:x}-{:x}", meta.len(), last_modified.timestamp()),
        }
    }

    async fn read_dir_sorted(&self, prefix: &str) -> Result<Vec<(String, std::fs::Metadata)>> {
        let dir = self.object_path(prefix)?;
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => return Ok(Vec::new()),
            Err(e) => return Err(Error::backend(e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(Error::backend)? {
            let metadata = entry.metadata().await.map_err(Error::backend)?;
            entries.push((entry.file_name().to_string_lossy().into_owned(), metadata));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[async_trait]
impl StorageClient for LocalStorage {
    fn backend_type(&self) -> &'static str {
        BACKEND_LOCAL
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>> {
        let path = self.object_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() == is_directory_marker(key) => {
                Ok(Some(Self::head_from(&meta)))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::backend(e)),
        }
    }

    async fn list_immediate_children(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .read_dir_sorted(prefix)
            .await?
            .into_iter()
            .take(limit)
            .map(|(name, meta)| {
                if meta.is_dir() {
                    format!("{prefix}{name}/")
                } else {
                    format!("{prefix}{name}")
                }
            })
            .collect())
    }

    async fn list_directory(&self, prefix: &str) -> Result<Vec<DirEntry>> {
        Ok(self
            .read_dir_sorted(prefix)
            .await?
            .into_iter()
            .map(|(name, meta)| {
                let metadata = if meta.is_dir() {
                    ObjectMetadata::directory(false)
                } else {
                    let head = Self::head_from(&meta);
                    ObjectMetadata::file(head.size, head.last_modified, head.etag)
                };
                DirEntry { name, metadata }
            })
            .collect())
    }

    async fn get_object_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        let path = self.object_path(key)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(key.to_string()));
            }
            Err(e) => return Err(Error::backend(e)),
        };

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(Error::backend)?;
        let mut buf = Vec::new();
        file.take(len)
            .read_to_end(&mut buf)
            .await
            .map_err(Error::backend)?;
        Ok(Bytes::from(buf))
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(key)?;
        if is_directory_marker(key) {
            return fs::create_dir_all(&path).await.map_err(Error::backend);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(Error::backend)?;
        }
        fs::write(&path, &data).await.map_err(Error::backend)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        let result = if is_directory_marker(key) {
            fs::remove_dir(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::backend(e)),
        }
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<()> {
        let source = self.object_path(from)?;
        let target = self.object_path(to)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(Error::backend)?;
        }
        match fs::copy(&source, &target).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(from.to_string()))
            }
            Err(e) => Err(Error::backend(e)),
        }
    }
}

pub struct LocalFactory;

#[async_trait]
impl BackendFactory for LocalFactory {
    async fn create(&self, config: &BackendConfig) -> anyhow::Result<Arc<dyn StorageClient>> {
        let root = config
            .root
            .clone()
            .ok_or_else(|| anyhow::anyhow!("local storage requires a root directory"))?;
        fs::create_dir_all(&root).await?;
        Ok(Arc::new(LocalStorage::new(root)))
    }
}
