//! # s3sftp
//!
//! SFTP gateway onto object storage.
//!
//! Clients speak SFTP over SSH (RFC 4251-4254, draft-ietf-secsh-filexfer-02);
//! every path is confined to the account's root and mapped to keys in an S3
//! compatible bucket, a local directory, or an in-memory store.
//!
//! ## Features
//!
//! - Pluggable storage backends chosen per account
//! - Directory semantics over flat keys (prefixes and `/` marker objects)
//! - Named, bounded caches for attributes, listings, and backend clients
//! - Session lifecycle tracking with a durable audit collaborator
//! - Periodic reaping of sessions an operator has closed administratively

pub mod audit;
pub mod backend;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod protocol;
pub mod reconciler;
pub mod resolver;
pub mod server;
pub mod session;
pub mod sftp;
pub mod traffic;

pub use audit::{AuditEvent, AuditSink, InMemoryAuditStore};
pub use backend::{BackendConfig, BackendRegistry, StorageClient};
pub use cache::CacheManager;
pub use config::{Config, LogFormat};
pub use credentials::{ConfigCredentialStore, CredentialStore};
pub use error::{Error, Result};
pub use reconciler::ReconciliationScheduler;
pub use server::{Server, Services};
pub use session::{SessionContext, SessionRegistry};
pub use sftp::{SftpOptions, SftpSession};
pub use traffic::{TrafficRecorder, WriteEventSink};
