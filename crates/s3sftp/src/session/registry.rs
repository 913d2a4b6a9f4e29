//! Session registry
//!
//! NIST 800-53: AC-12 (Session Termination), AU-2 (Audit Events)
//! STIG: V-222601 - The application must terminate sessions after organization-defined conditions
//! Implementation: Live sessions keyed by persistence id in a sharded map.
//! Every lifecycle callback takes the entry's shard lock only long enough to
//! read or advance its state; audit I/O always happens after the guard is
//! dropped.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use s3sftp_core::{AuthFailureCause, CloseReason, PersistenceId, SessionMeta, SessionState};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::{Error, Result};

/// The registry's view of a connection's transport
pub trait TransportHandle: Send + Sync {
    /// Tag the connection so its teardown is reported as an operator action
    fn mark_administratively_closed(&self);

    /// Request teardown. Returns once the request is issued, not once the
    /// transport has actually gone away.
    fn force_close(&self) -> Result<()>;
}

/// `TransportHandle` for a connection task driven by a cancellation token
#[derive(Debug, Clone, Default)]
pub struct ConnectionTransport {
    cancel: CancellationToken,
    administratively_closed: Arc<AtomicBool>,
}

impl ConnectionTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token the connection task selects on
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_administratively_closed(&self) -> bool {
        self.administratively_closed.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl TransportHandle for ConnectionTransport {
    fn mark_administratively_closed(&self) {
        self.administratively_closed.store(true, Ordering::Release);
    }

    fn force_close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Result of a close request. A second close of the same session is a
/// no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    AlreadyClosed,
}

struct SessionEntry {
    session_id: Uuid,
    client_addr: Option<SocketAddr>,
    transport: Arc<dyn TransportHandle>,
    state: SessionState,
    username: Option<String>,
    auth_failures: u32,
    established_at: DateTime<Utc>,
}

/// Read-only copy of a registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub persistence_id: PersistenceId,
    pub session_id: Uuid,
    pub client_addr: Option<SocketAddr>,
    pub state: SessionState,
    pub username: Option<String>,
    pub auth_failures: u32,
    pub established_at: DateTime<Utc>,
}

/// Table of live sessions and their lifecycle state
///
/// NIST 800-53: AC-12 (Session Termination)
pub struct SessionRegistry {
    sessions: DashMap<PersistenceId, SessionEntry>,
    audit: Arc<dyn AuditSink>,
}

impl SessionRegistry {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            sessions: DashMap::new(),
            audit,
        }
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Register a connection whose key exchange has completed.
    ///
    /// Fails closed: if the audit collaborator cannot assign a persistence
    /// id, nothing is registered and the connection must be dropped.
    ///
    /// # NIST 800-53: AU-3 (Content of Audit Records), AU-5 (Response to Audit Processing Failures)
    pub async fn on_key_established(
        &self,
        transport: Arc<dyn TransportHandle>,
        meta: SessionMeta,
    ) -> Result<PersistenceId> {
        let state = SessionState::Pending.transition(SessionState::KeyEstablished)?;

        let persistence_id = self
            .audit
            .record_key_established(&meta)
            .await
            .map_err(|e| {
                error!(
                    session_id = %meta.session_id,
                    client_addr = ?meta.client_addr,
                    error = %e,
                    "No persistence id for session; refusing it"
                );
                match e {
                    Error::Audit(_) => e,
                    other => Error::Audit(other.to_string()),
                }
            })?;

        self.sessions.insert(
            persistence_id,
            SessionEntry {
                session_id: meta.session_id,
                client_addr: meta.client_addr,
                transport,
                state,
                username: None,
                auth_failures: 0,
                established_at: meta.established_at,
            },
        );

        AuditEvent::ConnectionEstablished {
            persistence_id,
            client_addr: meta.client_addr,
            timestamp: Utc::now(),
        }
        .log();

        Ok(persistence_id)
    }

    /// Record a failed attempt. The session stays open for retries.
    ///
    /// # NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
    pub async fn on_auth_failure(
        &self,
        persistence_id: PersistenceId,
        username: &str,
        cause: AuthFailureCause,
    ) -> Result<()> {
        self.advance(persistence_id, SessionState::AuthFailure, |entry| {
            entry.username = Some(username.to_string());
            entry.auth_failures += 1;
        })?;

        AuditEvent::AuthAttempt {
            persistence_id,
            username: username.to_string(),
            success: false,
            cause: Some(cause),
            timestamp: Utc::now(),
        }
        .log();

        if let Err(e) = self
            .audit
            .record_auth_failure(persistence_id, username, cause)
            .await
        {
            warn!(%persistence_id, error = %e, "Failed to persist auth failure");
        }
        Ok(())
    }

    /// Record the successful authentication and activate the session.
    ///
    /// # NIST 800-53: IA-2 (Identification and Authentication)
    pub async fn on_auth_success(
        &self,
        persistence_id: PersistenceId,
        username: &str,
    ) -> Result<()> {
        self.advance(persistence_id, SessionState::AuthSuccess, |entry| {
            entry.username = Some(username.to_string());
        })?;
        self.advance(persistence_id, SessionState::Active, |_| {})?;

        AuditEvent::AuthAttempt {
            persistence_id,
            username: username.to_string(),
            success: true,
            cause: None,
            timestamp: Utc::now(),
        }
        .log();

        if let Err(e) = self.audit.record_auth_success(persistence_id, username).await {
            warn!(%persistence_id, error = %e, "Failed to persist auth success");
        }
        Ok(())
    }

    /// Remove the session and report why it ended.
    ///
    /// Client disconnects and the reconciler may race here; only the caller
    /// that actually removes the entry writes the audit record.
    ///
    /// # NIST 800-53: AC-12 (Session Termination)
    pub async fn on_session_closed(
        &self,
        persistence_id: PersistenceId,
        reason: CloseReason,
    ) -> CloseOutcome {
        let Some((_, entry)) = self.sessions.remove(&persistence_id) else {
            debug!(%persistence_id, "Session already closed");
            return CloseOutcome::AlreadyClosed;
        };

        AuditEvent::ConnectionClosed {
            persistence_id,
            username: entry.username.clone(),
            reason: reason.clone(),
            duration_secs: (Utc::now() - entry.established_at).num_seconds(),
            timestamp: Utc::now(),
        }
        .log();

        if let Err(e) = self.audit.record_session_closed(persistence_id, &reason).await {
            warn!(%persistence_id, error = %e, "Failed to persist session close");
        }
        CloseOutcome::Closed
    }

    /// Ids of every registered session
    pub fn live_ids(&self) -> HashSet<PersistenceId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn transport(&self, persistence_id: PersistenceId) -> Option<Arc<dyn TransportHandle>> {
        self.sessions
            .get(&persistence_id)
            .map(|entry| entry.transport.clone())
    }

    pub fn state(&self, persistence_id: PersistenceId) -> Option<SessionState> {
        self.sessions.get(&persistence_id).map(|entry| entry.state)
    }

    pub fn snapshot(&self, persistence_id: PersistenceId) -> Option<SessionSnapshot> {
        self.sessions.get(&persistence_id).map(|entry| SessionSnapshot {
            persistence_id,
            session_id: entry.session_id,
            client_addr: entry.client_addr,
            state: entry.state,
            username: entry.username.clone(),
            auth_failures: entry.auth_failures,
            established_at: entry.established_at,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn advance(
        &self,
        persistence_id: PersistenceId,
        next: SessionState,
        update: impl FnOnce(&mut SessionEntry),
    ) -> Result<()> {
        let mut entry = self
            .sessions
            .get_mut(&persistence_id)
            .ok_or(Error::UnknownSession(persistence_id.get()))?;
        entry.state = entry.state.transition(next)?;
        update(entry.value_mut());
        Ok(())
    }
}
