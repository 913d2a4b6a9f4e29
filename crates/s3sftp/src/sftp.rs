//! SFTP subsystem over object storage
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-11 (Error Handling), AU-2 (Audit Events)
//! STIG: V-222566, V-222596
//! Implementation: One `SftpSession` per subsystem channel. Client paths are
//! confined to the session root and mapped to object keys; every backend
//! call runs under a timeout; mutating operations invalidate the shared
//! attribute and listing caches for the keys they touch.

use bytes::Bytes;
use chrono::Utc;
use s3sftp_core::path::{directory_prefix, normalize_key, parent_key};
use s3sftp_core::ObjectMetadata;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::audit::AuditEvent;
use crate::backend::{DirEntry, StorageClient};
use crate::cache::{CacheManager, DIRECTORY_CONTENTS_CACHE, FILE_ATTRIBUTES_CACHE};
use crate::config::Config;
use crate::protocol::{
    codec, read_packet, response, write_packet, FileAttrs, MessageType, OpenFlags, StatusCode,
};
use crate::resolver::resolve;
use crate::session::SessionContext;
use crate::traffic::WriteEventSink;
use crate::{Error, Result};

/// Names returned per READDIR response
const READDIR_BATCH: usize = 100;
/// Open handles allowed per session
const MAX_HANDLES: usize = 1024;
/// Room left in a DATA packet for its header
const DATA_HEADER_LEN: u32 = 13;

/// Tunables for one SFTP session
#[derive(Debug, Clone)]
pub struct SftpOptions {
    /// Bytes fetched per read-ahead fragment
    pub read_fragment_size: usize,
    /// Upper bound on any single backend call
    pub backend_timeout: Duration,
    pub max_packet_size: u32,
    /// Largest object one write handle may buffer
    pub max_upload_bytes: u64,
}

impl Default for SftpOptions {
    fn default() -> Self {
        Self {
            read_fragment_size: 64 * 1024,
            backend_timeout: Duration::from_secs(30),
            max_packet_size: 262_144,
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

impl SftpOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_fragment_size: config.read_fragment_size,
            backend_timeout: Duration::from_secs(config.backend_timeout_secs),
            max_packet_size: config.max_packet_size,
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

struct Fragment {
    offset: u64,
    data: Bytes,
}

impl Fragment {
    fn slice(&self, offset: u64, len: u64) -> Option<Bytes> {
        let end = self.offset + self.data.len() as u64;
        if offset < self.offset || offset >= end {
            return None;
        }
        let start = usize::try_from(offset - self.offset).ok()?;
        let stop = usize::try_from((offset + len).min(end) - self.offset).ok()?;
        Some(self.data.slice(start..stop))
    }
}

struct ReadHandle {
    key: String,
    client_path: String,
    size: u64,
    fragment: Option<Fragment>,
    bytes_served: u64,
}

struct WriteHandle {
    key: String,
    client_path: String,
    buffer: Vec<u8>,
    append: bool,
    /// Upload on close even without WRITE requests (create, truncate)
    dirty: bool,
}

struct DirHandle {
    entries: Vec<(String, FileAttrs)>,
    index: usize,
}

enum Handle {
    Read(ReadHandle),
    Write(WriteHandle),
    Dir(DirHandle),
}

enum Reply {
    Ok,
    Eof,
    Handle(Vec<u8>),
    Data(Bytes),
    Attrs(FileAttrs),
    Name(Vec<(String, FileAttrs)>),
}

impl Reply {
    fn encode(self, request_id: u32) -> Vec<u8> {
        match self {
            Self::Ok => response::ok(request_id),
            Self::Eof => response::status(request_id, StatusCode::Eof, "End of file"),
            Self::Handle(handle) => response::handle(request_id, &handle),
            Self::Data(data) => response::data(request_id, &data),
            Self::Attrs(attrs) => response::attrs(request_id, &attrs),
            Self::Name(entries) => response::name(request_id, &entries),
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    operation: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| Error::timeout(format!("{operation} exceeded {}s", limit.as_secs())))?
}

/// SFTP request handler bound to one authenticated session
pub struct SftpSession {
    context: SessionContext,
    client: Arc<dyn StorageClient>,
    caches: Arc<CacheManager>,
    write_events: Arc<dyn WriteEventSink>,
    options: SftpOptions,
    handles: HashMap<Vec<u8>, Handle>,
    next_handle_id: u32,
    initialized: bool,
}

impl SftpSession {
    pub fn new(
        context: SessionContext,
        client: Arc<dyn StorageClient>,
        caches: Arc<CacheManager>,
        write_events: Arc<dyn WriteEventSink>,
        options: SftpOptions,
    ) -> Self {
        Self {
            context,
            client,
            caches,
            write_events,
            options,
            handles: HashMap::new(),
            next_handle_id: 0,
            initialized: false,
        }
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Serve packets until the client closes the stream, then upload any
    /// write handles the client left open.
    pub async fn serve<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let mut stream = std::pin::pin!(stream);
        let result = async {
            while let Some(packet) = read_packet(&mut stream, self.options.max_packet_size).await? {
                let reply = self.handle_packet(&packet).await?;
                write_packet(&mut stream, &reply).await?;
            }
            Ok(())
        }
        .await;

        self.finish().await;
        result
    }

    /// Handle one packet payload and return the response payload.
    ///
    /// Request failures become STATUS responses. Only a malformed packet or
    /// a request before INIT is returned as an error.
    ///
    /// # NIST 800-53: SI-11 (Error Handling)
    /// # STIG: V-222566
    pub async fn handle_packet(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let Some((&kind, mut buf)) = data.split_first() else {
            return Err(Error::Protocol("Empty packet".into()));
        };
        let msg_type = MessageType::try_from(kind)?;
        debug!(?msg_type, "SFTP request");

        if msg_type == MessageType::Init {
            let version = codec::get_u32(&mut buf)?;
            info!(client_version = version, "SFTP session initialised");
            self.initialized = true;
            return Ok(response::version());
        }
        if !self.initialized {
            return Err(Error::Protocol("Session not initialized".into()));
        }

        let request_id = codec::get_u32(&mut buf)?;
        let buf = &mut buf;
        let result = match msg_type {
            MessageType::Open => self.open(buf).await,
            MessageType::Close => self.close(buf).await,
            MessageType::Read => self.read(buf).await,
            MessageType::Write => self.write(buf),
            MessageType::Stat | MessageType::Lstat => self.stat(buf).await,
            MessageType::Fstat => self.fstat(buf).await,
            MessageType::Setstat => self.setstat(buf),
            MessageType::Fsetstat => self.fsetstat(buf),
            MessageType::Opendir => self.opendir(buf).await,
            MessageType::Readdir => self.readdir(buf),
            MessageType::Remove => self.remove(buf).await,
            MessageType::Mkdir => self.mkdir(buf).await,
            MessageType::Rmdir => self.rmdir(buf).await,
            MessageType::Realpath => self.realpath(buf),
            MessageType::Rename => self.rename(buf).await,
            other => Err(Error::NotSupported(format!("{other:?}"))),
        };

        Ok(match result {
            Ok(reply) => reply.encode(request_id),
            Err(e) => {
                if e.is_security_event() {
                    AuditEvent::SecurityEvent {
                        username: self.context.username.clone(),
                        event: format!("rejected_{msg_type:?}").to_lowercase(),
                        details: e.to_string(),
                        timestamp: Utc::now(),
                    }
                    .log();
                } else if e.is_client_error() {
                    debug!(?msg_type, error = %e, "SFTP request failed");
                } else {
                    warn!(
                        ?msg_type,
                        error = %e,
                        recoverable = e.is_recoverable(),
                        "SFTP request failed on the server side"
                    );
                }
                response::error(request_id, &e)
            }
        })
    }

    fn allocate_handle(&mut self, handle: Handle) -> Result<Vec<u8>> {
        if self.handles.len() >= MAX_HANDLES {
            return Err(Error::Other("Too many open handles".into()));
        }
        let id = self.next_handle_id.to_be_bytes().to_vec();
        self.next_handle_id = self.next_handle_id.wrapping_add(1);
        self.handles.insert(id.clone(), handle);
        Ok(id)
    }

    fn cache_key(&self, key: &str) -> String {
        format!(
            "{}#{key}",
            self.context.backend_uri.as_deref().unwrap_or_default()
        )
    }

    /// Resolver result through the attribute cache
    async fn metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let cache_key = self.cache_key(key);
        if let Some(hit) = self
            .caches
            .get_as::<ObjectMetadata>(FILE_ATTRIBUTES_CACHE, &cache_key)?
        {
            return Ok(Some((*hit).clone()));
        }

        let meta = with_timeout(
            self.options.backend_timeout,
            "stat",
            resolve(self.client.as_ref(), key),
        )
        .await?
        .or_else(|| self.is_root(key).then(|| ObjectMetadata::directory(true)));
        if let Some(meta) = &meta {
            self.caches
                .put(FILE_ATTRIBUTES_CACHE, cache_key, Arc::new(meta.clone()))?;
        }
        Ok(meta)
    }

    /// The session root always exists, even before anything is stored below it
    fn is_root(&self, key: &str) -> bool {
        normalize_key(key) == normalize_key(&self.context.root_path)
    }

    /// Immediate children through the listing cache
    async fn listing(&self, key: &str) -> Result<Arc<Vec<DirEntry>>> {
        let prefix = directory_prefix(key);
        let cache_key = self.cache_key(&prefix);
        if let Some(hit) = self
            .caches
            .get_as::<Vec<DirEntry>>(DIRECTORY_CONTENTS_CACHE, &cache_key)?
        {
            return Ok(hit);
        }

        let entries = Arc::new(
            with_timeout(
                self.options.backend_timeout,
                "list",
                self.client.list_directory(&prefix),
            )
            .await?,
        );
        self.caches
            .put(DIRECTORY_CONTENTS_CACHE, cache_key, entries.clone())?;
        Ok(entries)
    }

    /// Drop cached state a mutation of `key` may have made stale
    /// Drop cached attributes and listings for `key` and every ancestor.
    ///
    /// Creating `a/b/c` can bring `a` and `a/b` into existence implicitly,
    /// and deleting it can make them vanish, so each level is stale.
    fn invalidate(&self, key: &str) {
        let mut current = normalize_key(key);
        loop {
            for (cache, entry) in [
                (FILE_ATTRIBUTES_CACHE, self.cache_key(current)),
                (DIRECTORY_CONTENTS_CACHE, self.cache_key(&directory_prefix(current))),
            ] {
                if let Err(e) = self.caches.invalidate(cache, &entry) {
                    warn!(cache, error = %e, "Cache invalidation failed");
                }
            }
            if current.is_empty() {
                break;
            }
            current = parent_key(current);
        }
    }

    fn file_event(&self, operation: &str, path: &str, bytes: Option<u64>, error: Option<&Error>) {
        AuditEvent::FileOperation {
            username: self.context.username.clone(),
            operation: operation.to_string(),
            path: path.to_string(),
            success: error.is_none(),
            bytes_transferred: bytes,
            error: error.map(ToString::to_string),
            timestamp: Utc::now(),
        }
        .log();
    }

    fn directory_event(&self, operation: &str, path: &str, error: Option<&Error>) {
        AuditEvent::DirectoryOperation {
            username: self.context.username.clone(),
            operation: operation.to_string(),
            path: path.to_string(),
            success: error.is_none(),
            error: error.map(ToString::to_string),
            timestamp: Utc::now(),
        }
        .log();
    }

    /// # NIST 800-53: AC-3 (Access Enforcement)
    async fn open(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let filename = codec::get_string(buf)?;
        let flags = OpenFlags(codec::get_u32(buf)?);
        let _attrs = FileAttrs::decode(buf)?;

        let path = self.context.resolve_path(&filename)?;
        let existing = self.metadata(&path.key).await?;
        if existing.as_ref().is_some_and(ObjectMetadata::is_directory) {
            return Err(Error::Other(format!("Is a directory: {}", path.client)));
        }

        let handle = if flags.has_write() {
            if flags.has_excl() && existing.is_some() {
                return Err(Error::AlreadyExists(path.client));
            }
            let buffer = match &existing {
                None if !flags.has_creat() => return Err(Error::NotFound(path.client)),
                Some(meta) if !flags.has_trunc() && meta.size > self.options.max_upload_bytes => {
                    return Err(Error::PermissionDenied(format!(
                        "{} exceeds the upload size limit",
                        path.client
                    )));
                }
                Some(meta) if !flags.has_trunc() && meta.size > 0 => with_timeout(
                    self.options.backend_timeout,
                    "read",
                    self.client.get_object_range(&path.key, 0, meta.size),
                )
                .await?
                .to_vec(),
                _ => Vec::new(),
            };
            Handle::Write(WriteHandle {
                dirty: existing.is_none() || flags.has_trunc(),
                key: path.key,
                client_path: path.client,
                buffer,
                append: flags.has_append(),
            })
        } else {
            let Some(meta) = existing else {
                return Err(Error::NotFound(path.client));
            };
            Handle::Read(ReadHandle {
                key: path.key,
                client_path: path.client,
                size: meta.size,
                fragment: None,
                bytes_served: 0,
            })
        };

        Ok(Reply::Handle(self.allocate_handle(handle)?))
    }

    async fn close(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let id = codec::get_bytes(buf)?;
        let handle = self
            .handles
            .remove(&id)
            .ok_or_else(|| Error::invalid_handle("Handle does not exist"))?;

        match handle {
            Handle::Read(h) => {
                self.file_event("download", &h.client_path, Some(h.bytes_served), None);
            }
            Handle::Write(h) => self.commit(h).await?,
            Handle::Dir(_) => {}
        }
        Ok(Reply::Ok)
    }

    /// Upload a write handle's buffer as the whole object
    async fn commit(&self, handle: WriteHandle) -> Result<()> {
        if !handle.dirty {
            return Ok(());
        }

        let size = handle.buffer.len() as u64;
        let result = with_timeout(
            self.options.backend_timeout,
            "upload",
            self.client.put_object(&handle.key, Bytes::from(handle.buffer)),
        )
        .await;
        self.invalidate(&handle.key);
        self.file_event("upload", &handle.client_path, Some(size), result.as_ref().err());
        result

    }

    async fn read(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let id = codec::get_bytes(buf)?;
        let offset = codec::get_u64(buf)?;
        let len = codec::get_u32(buf)?
            .min(self.options.max_packet_size.saturating_sub(DATA_HEADER_LEN));
        let len = u64::from(len);

        let client = self.client.clone();
        let limit = self.options.backend_timeout;
        let fragment_size = self.options.read_fragment_size as u64;
        let direct = self.context.direct_read;

        match self
            .handles
            .get_mut(&id)
            .ok_or_else(|| Error::invalid_handle("Handle does not exist or is closed"))?
        {
            Handle::Read(h) => {
                if offset >= h.size || len == 0 {
                    return Ok(Reply::Eof);
                }
                let want = len.min(h.size - offset);

                let data = if direct {
                    with_timeout(limit, "read", client.get_object_range(&h.key, offset, want))
                        .await?
                } else if let Some(hit) = h.fragment.as_ref().and_then(|f| f.slice(offset, want)) {
                    hit
                } else {
                    let fetched = with_timeout(
                        limit,
                        "read",
                        client.get_object_range(&h.key, offset, want.max(fragment_size)),
                    )
                    .await?;
                    let fragment = Fragment {
                        offset,
                        data: fetched,
                    };
                    let data = fragment.slice(offset, want).unwrap_or_default();
                    h.fragment = Some(fragment);
                    data
                };

                if data.is_empty() {
                    return Ok(Reply::Eof);
                }
                h.bytes_served += data.len() as u64;
                Ok(Reply::Data(data))
            }
            Handle::Write(h) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX);
                if start >= h.buffer.len() {
                    return Ok(Reply::Eof);
                }
                let end = start
                    .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
                    .min(h.buffer.len());
                Ok(Reply::Data(Bytes::copy_from_slice(&h.buffer[start..end])))
            }
            Handle::Dir(_) => Err(Error::invalid_handle("Cannot read from directory handle")),
        }
    }

    fn write(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let id = codec::get_bytes(buf)?;
        let offset = codec::get_u64(buf)?;
        let data = codec::get_bytes(buf)?;

        let Some(Handle::Write(h)) = self.handles.get_mut(&id) else {
            return Err(Error::invalid_handle("Handle not open for writing"));
        };

        let start = if h.append { h.buffer.len() as u64 } else { offset };
        let end = start
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.options.max_upload_bytes)
            .ok_or_else(|| {
                Error::PermissionDenied(format!(
                    "{} exceeds the upload size limit",
                    h.client_path
                ))
            })?;
        let (Ok(start), Ok(end)) = (usize::try_from(start), usize::try_from(end)) else {
            return Err(Error::PermissionDenied("Write offset out of range".into()));
        };

        if h.buffer.len() < end {
            h.buffer.resize(end, 0);
        }
        h.buffer[start..end].copy_from_slice(&data);
        h.dirty = true;

        if let Some(username) = &self.context.username {
            self.write_events.on_write(username, data.len() as u64);
        }
        Ok(Reply::Ok)
    }

    async fn stat(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let path = self.context.resolve_path(&codec::get_string(buf)?)?;
        let meta = self
            .metadata(&path.key)
            .await?
            .ok_or(Error::NotFound(path.client))?;
        Ok(Reply::Attrs(FileAttrs::from_metadata(&meta)))
    }

    async fn fstat(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let id = codec::get_bytes(buf)?;
        let key = match self.handles.get(&id) {
            Some(Handle::Read(h)) => h.key.clone(),
            Some(Handle::Write(h)) => {
                let meta = ObjectMetadata::file(h.buffer.len() as u64, Utc::now(), "");
                return Ok(Reply::Attrs(FileAttrs::from_metadata(&meta)));
            }
            Some(Handle::Dir(_)) => {
                return Ok(Reply::Attrs(FileAttrs::from_metadata(&ObjectMetadata::directory(
                    false,
                ))));
            }
            None => return Err(Error::invalid_handle("Handle does not exist")),
        };
        let meta = self
            .metadata(&key)
            .await?
            .ok_or_else(|| Error::NotFound(key.clone()))?;
        Ok(Reply::Attrs(FileAttrs::from_metadata(&meta)))
    }

    /// Object stores carry no owners or permissions; accepted and ignored.
    fn setstat(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let path = codec::get_string(buf)?;
        let _attrs = FileAttrs::decode(buf)?;
        self.context.resolve_path(&path)?;
        Ok(Reply::Ok)
    }

    fn fsetstat(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let id = codec::get_bytes(buf)?;
        let _attrs = FileAttrs::decode(buf)?;
        if !self.handles.contains_key(&id) {
            return Err(Error::invalid_handle("Handle does not exist"));
        }
        Ok(Reply::Ok)
    }

    async fn opendir(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let path = self.context.resolve_path(&codec::get_string(buf)?)?;
        match self.metadata(&path.key).await? {
            None => return Err(Error::NotFound(path.client)),
            Some(meta) if !meta.is_directory() => {
                return Err(Error::Other(format!("Not a directory: {}", path.client)));
            }
            Some(_) => {}
        }

        let entries = self
            .listing(&path.key)
            .await?
            .iter()
            .map(|entry| (entry.name.clone(), FileAttrs::from_metadata(&entry.metadata)))
            .collect();
        let handle = self.allocate_handle(Handle::Dir(DirHandle { entries, index: 0 }))?;
        Ok(Reply::Handle(handle))
    }

    fn readdir(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let id = codec::get_bytes(buf)?;
        let Some(Handle::Dir(dir)) = self.handles.get_mut(&id) else {
            return Err(Error::invalid_handle("Not a directory handle"));
        };

        if dir.index >= dir.entries.len() {
            return Ok(Reply::Eof);
        }
        let end = (dir.index + READDIR_BATCH).min(dir.entries.len());
        let batch = dir.entries[dir.index..end].to_vec();
        dir.index = end;
        Ok(Reply::Name(batch))
    }

    async fn remove(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let path = self.context.resolve_path(&codec::get_string(buf)?)?;
        match self.metadata(&path.key).await? {
            None => return Err(Error::NotFound(path.client)),
            Some(meta) if !meta.is_regular_file() => {
                return Err(Error::Other(format!("Not a regular file: {}", path.client)));
            }
            Some(_) => {}
        }

        let result = with_timeout(
            self.options.backend_timeout,
            "delete",
            self.client.delete_object(&path.key),
        )
        .await;
        self.invalidate(&path.key);
        self.file_event("delete_file", &path.client, None, result.as_ref().err());
        result?;
        Ok(Reply::Ok)
    }

    async fn mkdir(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let path = self.context.resolve_path(&codec::get_string(buf)?)?;
        let _attrs = FileAttrs::decode(buf)?;

        if self.metadata(&path.key).await?.is_some() {
            return Err(Error::AlreadyExists(path.client));
        }

        let result = with_timeout(
            self.options.backend_timeout,
            "mkdir",
            self.client
                .put_object(&directory_prefix(&path.key), Bytes::new()),
        )
        .await;
        self.invalidate(&path.key);
        self.directory_event("mkdir", &path.client, result.as_ref().err());
        result?;
        Ok(Reply::Ok)
    }

    async fn rmdir(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let path = self.context.resolve_path(&codec::get_string(buf)?)?;
        if self.is_root(&path.key) {
            return Err(Error::PermissionDenied("Cannot remove the root directory".into()));
        }

        match self.metadata(&path.key).await? {
            None => return Err(Error::NotFound(path.client)),
            Some(meta) if !meta.is_directory() => {
                return Err(Error::Other(format!("Not a directory: {}", path.client)));
            }
            Some(meta) if !meta.is_empty_directory() => {
                return Err(Error::DirectoryNotEmpty(path.client));
            }
            Some(_) => {}
        }

        let result = with_timeout(
            self.options.backend_timeout,
            "rmdir",
            self.client.delete_object(&directory_prefix(&path.key)),
        )
        .await;
        self.invalidate(&path.key);
        self.directory_event("delete_dir", &path.client, result.as_ref().err());
        result?;
        Ok(Reply::Ok)
    }

    fn realpath(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let path = self.context.resolve_path(&codec::get_string(buf)?)?;
        Ok(Reply::Name(vec![(path.client, FileAttrs::default())]))
    }

    async fn rename(&mut self, buf: &mut &[u8]) -> Result<Reply> {
        let from = self.context.resolve_path(&codec::get_string(buf)?)?;
        let to = self.context.resolve_path(&codec::get_string(buf)?)?;

        match self.metadata(&from.key).await? {
            None => return Err(Error::NotFound(from.client)),
            Some(meta) if meta.is_directory() => {
                return Err(Error::NotSupported("Directory rename".into()));
            }
            Some(_) => {}
        }
        if self.metadata(&to.key).await?.is_some() {
            return Err(Error::AlreadyExists(to.client));
        }

        let limit = self.options.backend_timeout;
        let result = async {
            with_timeout(limit, "copy", self.client.copy_object(&from.key, &to.key)).await?;
            with_timeout(limit, "delete", self.client.delete_object(&from.key)).await
        }
        .await;
        self.invalidate(&from.key);
        self.invalidate(&to.key);
        self.file_event(
            "rename",
            &format!("{} -> {}", from.client, to.client),
            None,
            result.as_ref().err(),
        );
        result?;
        Ok(Reply::Ok)
    }

    /// Upload whatever the client left open when the channel ended
    async fn finish(&mut self) {
        let handles: Vec<Handle> = self.handles.drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Cleaning up open handles on session end");
        for handle in handles {
            if let Handle::Write(h) = handle {
                let client_path = h.client_path.clone();
                if let Err(e) = self.commit(h).await {
                    warn!(path = %client_path, error = %e, "Upload of unclosed file failed");
                }
            }
        }
    }
}
