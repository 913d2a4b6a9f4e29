//! Shared domain types for the S3 SFTP gateway.
//!
//! Nothing in this crate performs I/O. It holds the vocabulary the gateway
//! crate builds on: object metadata, the session lifecycle state machine,
//! close reasons, authentication failure causes, and object-key path helpers.

pub mod error;
pub mod path;
pub mod types;

pub use error::{CoreError, Result};
pub use types::{
    AuthFailureCause, CloseReason, ObjectKind, ObjectMetadata, PersistenceId, SessionMeta,
    SessionState,
};
