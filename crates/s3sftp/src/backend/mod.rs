//! Storage backends.
//!
//! A backend is anything that stores flat keys with byte payloads. The
//! gateway never assumes native directories: "directories" are key prefixes
//! and optional zero-byte marker objects whose key ends in `/`.

mod local;
mod memory;
mod registry;
mod s3;

pub use local::{LocalFactory, LocalStorage};
pub use memory::{MemoryFactory, MemoryStorage};
pub use registry::{BackendFactory, BackendRegistry};
pub use s3::{S3Factory, S3Storage};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use s3sftp_core::ObjectMetadata;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::Result;

pub const BACKEND_S3: &str = "s3";
pub const BACKEND_LOCAL: &str = "local";
pub const BACKEND_MEMORY: &str = "memory";

/// Stored metadata of a single object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
}

/// One immediate child returned by a directory listing
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub metadata: ObjectMetadata,
}

/// Operations the gateway needs from an object store.
///
/// Transport failures come back as `Error::BackendUnavailable`. Absence is
/// expressed through `Option`/empty results, never through an error, except
/// for `get_object_range` on a missing key which returns `Error::NotFound`.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Backend type identifier, for logs
    fn backend_type(&self) -> &'static str;

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>>;

    /// Up to `limit` keys directly below `prefix`.
    ///
    /// Files are returned as full keys, sub-directories as full keys with a
    /// trailing `/`. The marker object for `prefix` itself is never returned.
    async fn list_immediate_children(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;

    /// Every immediate child of `prefix` with metadata, sorted by name.
    async fn list_directory(&self, prefix: &str) -> Result<Vec<DirEntry>>;

    /// Bytes `[offset, offset + len)`, truncated at end of object.
    async fn get_object_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes>;

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()>;

    /// Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> Result<()>;

    async fn copy_object(&self, from: &str, to: &str) -> Result<()>;
}

/// Connection settings for one storage profile
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Registry identifier: `s3`, `local`, `memory`, or a custom type
    pub backend_type: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Root directory for the `local` backend
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            endpoint: None,
            bucket: None,
            region: None,
            access_key: None,
            secret_key: None,
            root: None,
        }
    }

    pub fn memory(bucket: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            ..Self::new(BACKEND_MEMORY)
        }
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::new(BACKEND_LOCAL)
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.backend_type.is_empty() {
            return Err("backend_type must not be empty".to_string());
        }
        match self.backend_type.as_str() {
            BACKEND_S3 if self.bucket.is_none() => Err("s3 storage requires a bucket".to_string()),
            BACKEND_LOCAL if self.root.is_none() => {
                Err("local storage requires a root directory".to_string())
            }
            _ => Ok(()),
        }
    }

    /// `s3sftp://<access>:<secret>@<endpoint>/<bucket>` with any http(s)
    /// scheme stripped from the endpoint. Contains the secret: use it as a
    /// cache key, never log it.
    pub fn connection_uri(&self) -> String {
        match self.backend_type.as_str() {
            BACKEND_LOCAL => format!(
                "s3sftp+local://{}",
                self.root
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ),
            BACKEND_MEMORY => format!(
                "s3sftp+memory://{}",
                self.bucket.as_deref().unwrap_or_default()
            ),
            _ => {
                let endpoint = self.endpoint.as_deref().unwrap_or_default();
                let endpoint = endpoint
                    .strip_prefix("https://")
                    .or_else(|| endpoint.strip_prefix("http://"))
                    .unwrap_or(endpoint)
                    .trim_end_matches('/');
                format!(
                    "s3sftp://{}:{}@{}/{}",
                    self.access_key.as_deref().unwrap_or_default(),
                    self.secret_key.as_deref().unwrap_or_default(),
                    endpoint,
                    self.bucket.as_deref().unwrap_or_default()
                )
            }
        }
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("backend_type", &self.backend_type)
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_uri_strips_scheme() {
        let config = BackendConfig {
            endpoint: Some("https://s3.example.com/".into()),
            bucket: Some("data".into()),
            access_key: Some("AK".into()),
            secret_key: Some("SK".into()),
            ..BackendConfig::new(BACKEND_S3)
        };
        assert_eq!(config.connection_uri(), "s3sftp://AK:SK@s3.example.com/data");

        let config = BackendConfig {
            endpoint: Some("http://127.0.0.1:9000".into()),
            ..config
        };
        assert_eq!(config.connection_uri(), "s3sftp://AK:SK@127.0.0.1:9000/data");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = BackendConfig {
            secret_key: Some("hunter2".into()),
            ..BackendConfig::new(BACKEND_S3)
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_validate() {
        assert!(BackendConfig::new(BACKEND_S3).validate().is_err());
        assert!(BackendConfig::new(BACKEND_LOCAL).validate().is_err());
        assert!(BackendConfig::memory("m").validate().is_ok());
        assert!(BackendConfig::new("").validate().is_err());
    }
}
