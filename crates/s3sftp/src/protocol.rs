//! SFTP wire format (draft-ietf-secsh-filexfer-02, protocol version 3).
//!
//! Each packet on the subsystem channel is `uint32 length` followed by
//! `length` bytes, the first of which is the message type.

use bytes::{BufMut, BytesMut};
use s3sftp_core::ObjectMetadata;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

pub const SFTP_VERSION: u32 = 3;

/// POSIX mode bits reported for directories
pub const DIRECTORY_MODE: u32 = 0o40755;
/// POSIX mode bits reported for regular files
pub const FILE_MODE: u32 = 0o100644;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        let msg = match value {
            1 => Self::Init,
            2 => Self::Version,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Read,
            6 => Self::Write,
            7 => Self::Lstat,
            8 => Self::Fstat,
            9 => Self::Setstat,
            10 => Self::Fsetstat,
            11 => Self::Opendir,
            12 => Self::Readdir,
            13 => Self::Remove,
            14 => Self::Mkdir,
            15 => Self::Rmdir,
            16 => Self::Realpath,
            17 => Self::Stat,
            18 => Self::Rename,
            19 => Self::Readlink,
            20 => Self::Symlink,
            101 => Self::Status,
            102 => Self::Handle,
            103 => Self::Data,
            104 => Self::Name,
            105 => Self::Attrs,
            200 => Self::Extended,
            201 => Self::ExtendedReply,
            other => {
                return Err(Error::Protocol(format!("Unknown message type: {other}")));
            }
        };
        Ok(msg)
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> Self {
        code as Self
    }
}

/// `pflags` of an OPEN request
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x0000_0001;
    pub const WRITE: u32 = 0x0000_0002;
    pub const APPEND: u32 = 0x0000_0004;
    pub const CREAT: u32 = 0x0000_0008;
    pub const TRUNC: u32 = 0x0000_0010;
    pub const EXCL: u32 = 0x0000_0020;

    pub const fn has_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub const fn has_write(self) -> bool {
        self.0 & (Self::WRITE | Self::APPEND) != 0
    }

    pub const fn has_append(self) -> bool {
        self.0 & Self::APPEND != 0
    }

    pub const fn has_creat(self) -> bool {
        self.0 & Self::CREAT != 0
    }

    pub const fn has_trunc(self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    pub const fn has_excl(self) -> bool {
        self.0 & Self::EXCL != 0
    }
}

/// ATTRS structure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x0000_0001;
    const FLAG_UIDGID: u32 = 0x0000_0002;
    const FLAG_PERMISSIONS: u32 = 0x0000_0004;
    const FLAG_ACMODTIME: u32 = 0x0000_0008;

    /// Object stores have no owners, so uid/gid are left unset.
    pub fn from_metadata(meta: &ObjectMetadata) -> Self {
        let mtime = u32::try_from(meta.last_modified.timestamp()).unwrap_or(0);
        Self {
            size: Some(meta.size),
            uid: None,
            gid: None,
            permissions: Some(if meta.is_directory() {
                DIRECTORY_MODE
            } else {
                FILE_MODE
            }),
            atime: Some(mtime),
            mtime: Some(mtime),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.permissions
            .is_some_and(|mode| mode & 0o170_000 == 0o040_000)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }

        buf.put_u32(flags);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let flags = codec::get_u32(buf)?;
        let mut attrs = Self::default();

        if flags & Self::FLAG_SIZE != 0 {
            attrs.size = Some(codec::get_u64(buf)?);
        }
        if flags & Self::FLAG_UIDGID != 0 {
            attrs.uid = Some(codec::get_u32(buf)?);
            attrs.gid = Some(codec::get_u32(buf)?);
        }
        if flags & Self::FLAG_PERMISSIONS != 0 {
            attrs.permissions = Some(codec::get_u32(buf)?);
        }
        if flags & Self::FLAG_ACMODTIME != 0 {
            attrs.atime = Some(codec::get_u32(buf)?);
            attrs.mtime = Some(codec::get_u32(buf)?);
        }

        Ok(attrs)
    }
}

/// Primitive encoders and decoders
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    use crate::{Error, Result};

    fn ensure(buf: &[u8], needed: usize, what: &str) -> Result<()> {
        if buf.remaining() < needed {
            return Err(Error::Protocol(format!("Insufficient data for {what}")));
        }
        Ok(())
    }

    pub fn get_u32(buf: &mut &[u8]) -> Result<u32> {
        ensure(buf, 4, "u32")?;
        Ok(buf.get_u32())
    }

    pub fn get_u64(buf: &mut &[u8]) -> Result<u64> {
        ensure(buf, 8, "u64")?;
        Ok(buf.get_u64())
    }

    pub fn put_string(buf: &mut BytesMut, s: &str) {
        put_bytes(buf, s.as_bytes());
    }

    pub fn get_string(buf: &mut &[u8]) -> Result<String> {
        let bytes = get_bytes(buf)?;
        String::from_utf8(bytes)
            .map_err(|e| Error::Protocol(format!("Invalid UTF-8 string: {e}")))
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    pub fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
        let len = get_u32(buf)? as usize;
        ensure(buf, len, "string")?;
        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(bytes)
    }
}

/// Read one length-prefixed packet. `Ok(None)` on clean end of stream.
pub async fn read_packet<R>(reader: &mut R, max_len: u32) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len == 0 || len > max_len {
        return Err(Error::Protocol(format!("Invalid packet length: {len}")));
    }

    let mut packet = vec![0u8; len as usize];
    reader.read_exact(&mut packet).await?;
    Ok(Some(packet))
}

#[allow(clippy::cast_possible_truncation)]
pub async fn write_packet<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Response encoders. Each returns a packet payload without the length prefix.
pub mod response {
    use bytes::{BufMut, BytesMut};

    use super::{codec, FileAttrs, MessageType, StatusCode, SFTP_VERSION};
    use crate::Error;

    fn start(msg: MessageType, request_id: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(msg as u8);
        buf.put_u32(request_id);
        buf
    }

    pub fn version() -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Version as u8);
        buf.put_u32(SFTP_VERSION);
        buf.to_vec()
    }

    pub fn status(request_id: u32, code: StatusCode, message: &str) -> Vec<u8> {
        let mut buf = start(MessageType::Status, request_id);
        buf.put_u32(code.into());
        codec::put_string(&mut buf, message);
        codec::put_string(&mut buf, "en");
        buf.to_vec()
    }

    pub fn ok(request_id: u32) -> Vec<u8> {
        status(request_id, StatusCode::Ok, "Success")
    }

    pub fn error(request_id: u32, error: &Error) -> Vec<u8> {
        let mut buf = start(MessageType::Status, request_id);
        buf.put_u32(error.to_status_code());
        codec::put_string(&mut buf, &error.sanitized_message());
        codec::put_string(&mut buf, "en");
        buf.to_vec()
    }

    pub fn handle(request_id: u32, handle: &[u8]) -> Vec<u8> {
        let mut buf = start(MessageType::Handle, request_id);
        codec::put_bytes(&mut buf, handle);
        buf.to_vec()
    }

    pub fn data(request_id: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = start(MessageType::Data, request_id);
        codec::put_bytes(&mut buf, data);
        buf.to_vec()
    }

    pub fn attrs(request_id: u32, attrs: &FileAttrs) -> Vec<u8> {
        let mut buf = start(MessageType::Attrs, request_id);
        attrs.encode(&mut buf);
        buf.to_vec()
    }

    /// NAME response; the long name is rendered `ls -l` style.
    #[allow(clippy::cast_possible_truncation)]
    pub fn name(request_id: u32, entries: &[(String, FileAttrs)]) -> Vec<u8> {
        let mut buf = start(MessageType::Name, request_id);
        buf.put_u32(entries.len() as u32);
        for (name, attrs) in entries {
            codec::put_string(&mut buf, name);
            codec::put_string(&mut buf, &long_name(name, attrs));
            attrs.encode(&mut buf);
        }
        buf.to_vec()
    }

    fn long_name(name: &str, attrs: &FileAttrs) -> String {
        let kind = if attrs.is_directory() { 'd' } else { '-' };
        let perms = if attrs.is_directory() {
            "rwxr-xr-x"
        } else {
            "rw-r--r--"
        };
        format!(
            "{kind}{perms} 1 owner group {:>12} {name}",
            attrs.size.unwrap_or(0)
        )
    }
}
