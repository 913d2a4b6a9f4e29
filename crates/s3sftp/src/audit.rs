//! Audit trail
//!
//! NIST 800-53: AU-2 (Audit Events), AU-3 (Content of Audit Records), AU-12 (Audit Generation)
//! STIG: V-222648 (Audit Records)
//! Implementation: Two halves. `AuditEvent` is the structured log line every
//! security-relevant action emits. `AuditSink` is the durable collaborator that
//! hands out persistence ids, stores session records, and answers which
//! sessions an operator has marked for closure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use s3sftp_core::{AuthFailureCause, CloseReason, PersistenceId, SessionMeta};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// Audit event types
///
/// NIST 800-53: AU-2 (Audit Events)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    ConnectionEstablished {
        persistence_id: PersistenceId,
        client_addr: Option<SocketAddr>,
        timestamp: DateTime<Utc>,
    },
    ConnectionClosed {
        persistence_id: PersistenceId,
        username: Option<String>,
        reason: CloseReason,
        duration_secs: i64,
        timestamp: DateTime<Utc>,
    },
    AuthAttempt {
        persistence_id: PersistenceId,
        username: String,
        success: bool,
        cause: Option<AuthFailureCause>,
        timestamp: DateTime<Utc>,
    },
    FileOperation {
        username: Option<String>,
        /// upload, download, delete_file, rename
        operation: String,
        path: String,
        success: bool,
        bytes_transferred: Option<u64>,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    DirectoryOperation {
        username: Option<String>,
        /// mkdir, delete_dir
        operation: String,
        path: String,
        success: bool,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Operator-requested termination carried out by the reconciler
    AdministrativeClose {
        persistence_id: PersistenceId,
        username: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Store contents that cannot be mapped onto a filesystem cleanly,
    /// e.g. an object `a` alongside objects under `a/`
    BackendInconsistency {
        backend: String,
        key: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },
    SecurityEvent {
        username: Option<String>,
        event: String,
        details: String,
        timestamp: DateTime<Utc>,
    },
}

impl AuditEvent {
    /// Emit the event through `tracing`
    ///
    /// NIST 800-53: AU-12 (Audit Generation)
    pub fn log(&self) {
        match self {
            Self::ConnectionEstablished {
                persistence_id,
                client_addr,
                ..
            } => {
                info!(
                    event = "connection_established",
                    %persistence_id,
                    client_addr = ?client_addr,
                    audit = ?self,
                    "Connection established"
                );
            }
            Self::ConnectionClosed {
                persistence_id,
                username,
                reason,
                duration_secs,
                ..
            } => {
                info!(
                    event = "connection_closed",
                    %persistence_id,
                    username = ?username,
                    %reason,
                    duration_secs,
                    audit = ?self,
                    "Connection closed"
                );
            }
            Self::AuthAttempt {
                persistence_id,
                username,
                success: true,
                ..
            } => {
                info!(
                    event = "auth_success",
                    %persistence_id,
                    username,
                    audit = ?self,
                    "Authentication successful"
                );
            }
            Self::AuthAttempt {
                persistence_id,
                username,
                cause,
                ..
            } => {
                warn!(
                    event = "auth_failure",
                    %persistence_id,
                    username,
                    cause = ?cause,
                    audit = ?self,
                    "Authentication failed"
                );
            }
            Self::FileOperation {
                username,
                operation,
                path,
                success: true,
                bytes_transferred,
                ..
            } => {
                info!(
                    event = "file_operation",
                    username = ?username,
                    operation,
                    path,
                    bytes = ?bytes_transferred,
                    audit = ?self,
                    "File operation completed"
                );
            }
            Self::FileOperation {
                username,
                operation,
                path,
                error,
                ..
            } => {
                warn!(
                    event = "file_operation_failed",
                    username = ?username,
                    operation,
                    path,
                    error = ?error,
                    audit = ?self,
                    "File operation failed"
                );
            }
            Self::DirectoryOperation {
                username,
                operation,
                path,
                success,
                error,
                ..
            } => {
                if *success {
                    info!(
                        event = "directory_operation",
                        username = ?username,
                        operation,
                        path,
                        audit = ?self,
                        "Directory operation completed"
                    );
                } else {
                    warn!(
                        event = "directory_operation_failed",
                        username = ?username,
                        operation,
                        path,
                        error = ?error,
                        audit = ?self,
                        "Directory operation failed"
                    );
                }
            }
            Self::AdministrativeClose {
                persistence_id,
                username,
                ..
            } => {
                warn!(
                    event = "administrative_close",
                    %persistence_id,
                    username = ?username,
                    audit = ?self,
                    "Session closed by administrator"
                );
            }
            Self::BackendInconsistency {
                backend,
                key,
                detail,
                ..
            } => {
                warn!(
                    event = "backend_inconsistency",
                    backend,
                    key,
                    detail,
                    audit = ?self,
                    "Backend contents are inconsistent"
                );
            }
            Self::SecurityEvent {
                username,
                event,
                details,
                ..
            } => {
                warn!(
                    event = "security_event",
                    username = ?username,
                    security_event = event,
                    details,
                    audit = ?self,
                    "Security event detected"
                );
            }
        }
    }
}

/// Durable audit collaborator the session lifecycle reports to
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Create the session record and return its persistence id
    async fn record_key_established(&self, meta: &SessionMeta) -> Result<PersistenceId>;

    async fn record_auth_failure(
        &self,
        id: PersistenceId,
        username: &str,
        cause: AuthFailureCause,
    ) -> Result<()>;

    async fn record_auth_success(&self, id: PersistenceId, username: &str) -> Result<()>;

    async fn record_session_closed(&self, id: PersistenceId, reason: &CloseReason) -> Result<()>;

    /// Subset of `candidates` an operator has flagged for termination
    async fn list_administratively_closed(
        &self,
        candidates: &HashSet<PersistenceId>,
    ) -> Result<HashSet<PersistenceId>>;
}

/// One row of the in-memory audit store
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: PersistenceId,
    pub session_id: Uuid,
    pub client_addr: Option<SocketAddr>,
    pub username: Option<String>,
    pub authenticated: bool,
    pub auth_failures: Vec<AuthFailureCause>,
    pub auth_successes: u32,
    pub established_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub close_records: u32,
    pub marked_for_closure: bool,
}

/// Process-local audit store for tests, demos and single-node runs.
///
/// Ids increase monotonically from 1. `mark_for_closure` plays the part of
/// the operator action the reconciler polls for. Records are kept for the
/// life of the process; a deployment that needs retention plugs in its own
/// `AuditSink`.
pub struct InMemoryAuditStore {
    next_id: AtomicI64,
    records: DashMap<PersistenceId, SessionRecord>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            records: DashMap::new(),
        }
    }

    pub fn record(&self, id: PersistenceId) -> Option<SessionRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    pub fn records(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Flag a session for administrative closure. `false` if unknown.
    pub fn mark_for_closure(&self, id: PersistenceId) -> bool {
        self.records
            .get_mut(&id)
            .map(|mut record| record.marked_for_closure = true)
            .is_some()
    }

    fn update(&self, id: PersistenceId, f: impl FnOnce(&mut SessionRecord)) -> Result<()> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::Audit(format!("no audit record for session {id}")))?;
        f(&mut record);
        Ok(())
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditStore {
    async fn record_key_established(&self, meta: &SessionMeta) -> Result<PersistenceId> {
        let id = PersistenceId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records.insert(
            id,
            SessionRecord {
                id,
                session_id: meta.session_id,
                client_addr: meta.client_addr,
                username: None,
                authenticated: false,
                auth_failures: Vec::new(),
                auth_successes: 0,
                established_at: meta.established_at,
                closed_at: None,
                close_reason: None,
                close_records: 0,
                marked_for_closure: false,
            },
        );
        Ok(id)
    }

    async fn record_auth_failure(
        &self,
        id: PersistenceId,
        username: &str,
        cause: AuthFailureCause,
    ) -> Result<()> {
        self.update(id, |record| {
            record.username = Some(username.to_string());
            record.auth_failures.push(cause);
        })
    }

    async fn record_auth_success(&self, id: PersistenceId, username: &str) -> Result<()> {
        self.update(id, |record| {
            record.username = Some(username.to_string());
            record.authenticated = true;
            record.auth_successes += 1;
        })
    }

    async fn record_session_closed(&self, id: PersistenceId, reason: &CloseReason) -> Result<()> {
        self.update(id, |record| {
            record.closed_at = Some(Utc::now());
            record.close_reason = Some(reason.clone());
            record.close_records += 1;
        })
    }

    async fn list_administratively_closed(
        &self,
        candidates: &HashSet<PersistenceId>,
    ) -> Result<HashSet<PersistenceId>> {
        Ok(candidates
            .iter()
            .filter(|id| {
                self.records
                    .get(id)
                    .is_some_and(|record| record.marked_for_closure)
            })
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_serialization() {
        let event = AuditEvent::AuthAttempt {
            persistence_id: PersistenceId::new(7),
            username: "alice".to_string(),
            success: false,
            cause: Some(AuthFailureCause::PasswordMismatch),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"AuthAttempt\""));
        assert!(json.contains("PASSWD_FAILED_TO_MATCH"));
        event.log();
    }

    #[tokio::test]
    async fn test_ids_increase() {
        let store = InMemoryAuditStore::new();
        let a = store.record_key_established(&SessionMeta::new(None)).await.unwrap();
        let b = store.record_key_established(&SessionMeta::new(None)).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_record_lifecycle() {
        let store = InMemoryAuditStore::new();
        let id = store.record_key_established(&SessionMeta::new(None)).await.unwrap();

        store
            .record_auth_failure(id, "bob", AuthFailureCause::NoSuchUser)
            .await
            .unwrap();
        store.record_auth_success(id, "bob").await.unwrap();
        store
            .record_session_closed(id, &CloseReason::ClientInitiated)
            .await
            .unwrap();

        let record = store.record(id).unwrap();
        assert_eq!(record.auth_failures, vec![AuthFailureCause::NoSuchUser]);
        assert_eq!(record.auth_successes, 1);
        assert_eq!(record.close_reason, Some(CloseReason::ClientInitiated));
        assert_eq!(record.close_records, 1);
    }

    #[tokio::test]
    async fn test_unknown_id_is_an_error() {
        let store = InMemoryAuditStore::new();
        let result = store
            .record_auth_success(PersistenceId::new(99), "x")
            .await;
        assert!(matches!(result, Err(Error::Audit(_))));
    }

    #[tokio::test]
    async fn test_marked_for_closure_filters_candidates() {
        let store = InMemoryAuditStore::new();
        let a = store.record_key_established(&SessionMeta::new(None)).await.unwrap();
        let b = store.record_key_established(&SessionMeta::new(None)).await.unwrap();
        let c = store.record_key_established(&SessionMeta::new(None)).await.unwrap();
        assert!(store.mark_for_closure(b));
        assert!(store.mark_for_closure(c));
        assert!(!store.mark_for_closure(PersistenceId::new(1000)));

        let candidates: HashSet<_> = [a, b].into_iter().collect();
        let flagged = store.list_administratively_closed(&candidates).await.unwrap();
        assert_eq!(flagged, HashSet::from([b]));
    }
}
