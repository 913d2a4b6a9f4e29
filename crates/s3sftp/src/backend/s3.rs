use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::{ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use s3sftp_core::path::child_name;
use s3sftp_core::ObjectMetadata;
use std::sync::Arc;
use tracing::debug;

use super::{BackendConfig, BackendFactory, DirEntry, ObjectHead, StorageClient, BACKEND_S3};
use crate::{Error, Result};

const DEFAULT_REGION: &str = "us-east-1";
const LIST_PAGE_SIZE: i32 = 1000;

/// Characters left verbatim in an `x-amz-copy-source` value
const COPY_SOURCE_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// S3-compatible object store (AWS, MinIO, Ceph RGW, ...)
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a path-style client from a storage profile
    pub async fn connect(config: &BackendConfig) -> anyhow::Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| anyhow::anyhow!("s3 storage requires a bucket"))?;
        let region = config
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "s3sftp",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let shared = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(s3_config);

        client
            .head_bucket()
            .bucket(&bucket)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!("bucket '{bucket}' is not reachable: {}", describe(&e))
            })?;

        Ok(Self::new(client, bucket))
    }
}

/// `bucket/key` with the key URL-encoded, as CopyObject expects
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE_SAFE))
}

fn describe<E: ProvideErrorMetadata + std::fmt::Display>(err: &E) -> String {
    match (err.code(), err.message()) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (Some(code), None) => code.to_string(),
        _ => err.to_string(),
    }
}

fn to_chrono(value: Option<&S3DateTime>) -> DateTime<Utc> {
    value
        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn clean_etag(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_string()
}

fn non_negative(size: Option<i64>) -> u64 {
    size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0)
}

#[async_trait]
impl StorageClient for S3Storage {
    fn backend_type(&self) -> &'static str {
        BACKEND_S3
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectHead {
                size: non_negative(output.content_length()),
                last_modified: to_chrono(output.last_modified()),
                etag: clean_etag(output.e_tag()),
            })),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(Error::backend(format!("head_object {key}: {}", describe(&err)))),
        }
    }

    async fn list_immediate_children(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let max_keys = i32::try_from(limit).unwrap_or(LIST_PAGE_SIZE).min(LIST_PAGE_SIZE);
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .delimiter("/")
            .max_keys(max_keys);
        // StartAfter is exclusive, which skips the prefix's own marker object.
        if !prefix.is_empty() {
            request = request.start_after(prefix);
        }

        let output = request
            .send()
            .await
            .map_err(|e| Error::backend(format!("list {prefix}: {}", describe(&e))))?;

        let mut keys: Vec<String> = output
            .contents()
            .iter()
            .filter_map(|object| object.key())
            .filter(|key| *key != prefix)
            .map(str::to_string)
            .chain(
                output
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix())
                    .map(str::to_string),
            )
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn list_directory(&self, prefix: &str) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter("/")
                .max_keys(LIST_PAGE_SIZE)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| Error::backend(format!("list {prefix}: {}", describe(&e))))?;

            for object in output.contents() {
                let Some(name) = object.key().and_then(|key| child_name(prefix, key)) else {
                    continue;
                };
                entries.push(DirEntry {
                    name: name.to_string(),
                    metadata: ObjectMetadata::file(
                        non_negative(object.size()),
                        to_chrono(object.last_modified()),
                        clean_etag(object.e_tag()),
                    ),
                });
            }
            for common in output.common_prefixes() {
                if let Some(name) = common.prefix().and_then(|p| child_name(prefix, p)) {
                    entries.push(DirEntry {
                        name: name.to_string(),
                        metadata: ObjectMetadata::directory(false),
                    });
                }
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(prefix, count = entries.len(), "Listed S3 directory");
        Ok(entries)
    }

    async fn get_object_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let last = offset.saturating_add(len - 1);
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(format!("bytes={offset}-{last}"))
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(Error::NotFound(key.to_string()));
            }
            // Range starting past the end of the object.
            Err(err) if err.code() == Some("InvalidRange") => return Ok(Bytes::new()),
            Err(err) => {
                return Err(Error::backend(format!("get_object {key}: {}", describe(&err))));
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| Error::backend(format!("get_object body {key}: {e}")))?;
        Ok(data.into_bytes())
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Error::backend(format!("put_object {key}: {}", describe(&e))))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::backend(format!("delete_object {key}: {}", describe(&e))))?;
        Ok(())
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(to)
            .copy_source(copy_source(&self.bucket, from))
            .send()
            .await
            .map_err(|e| Error::backend(format!("copy_object {from} -> {to}: {}", describe(&e))))?;
        Ok(())
    }
}

pub struct S3Factory;

#[async_trait]
impl BackendFactory for S3Factory {
    async fn create(&self, config: &BackendConfig) -> anyhow::Result<Arc<dyn StorageClient>> {
        Ok(Arc::new(S3Storage::connect(config).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_etag() {
        assert_eq!(clean_etag(Some("\"abc123\"")), "abc123");
        assert_eq!(clean_etag(None), "");
    }

    #[test]
    fn test_to_chrono() {
        let when = S3DateTime::from_secs(1_700_000_000);
        assert_eq!(to_chrono(Some(&when)).timestamp(), 1_700_000_000);
        assert_eq!(to_chrono(None), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_copy_source_encodes_key() {
        assert_eq!(copy_source("b", "dir/plain-name_1.txt"), "b/dir/plain-name_1.txt");
        assert_eq!(
            copy_source("b", "q1 report+draft%/résumé.pdf"),
            "b/q1%20report%2Bdraft%25/r%C3%A9sum%C3%A9.pdf"
        );
    }

    #[tokio::test]
    async fn test_connect_requires_bucket() {
        let err = S3Storage::connect(&BackendConfig::new(BACKEND_S3))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }
}
