use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Durable session record id handed out by the audit collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistenceId(i64);

impl PersistenceId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PersistenceId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// What a resolved path turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    RegularFile,
    Directory { empty: bool },
}

/// Filesystem-shaped view of an object (or implied directory) in a flat store.
///
/// The kind is a single enum so a path can never be both a file and a
/// directory; the boolean accessors mirror the usual stat-style questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    pub etag: String,
    pub kind: ObjectKind,
}

impl ObjectMetadata {
    pub fn file(size: u64, last_modified: DateTime<Utc>, etag: impl Into<String>) -> Self {
        Self {
            last_modified,
            size,
            etag: etag.into(),
            kind: ObjectKind::RegularFile,
        }
    }

    /// Directories carry no backend size or etag and report the Unix epoch as
    /// their modification time.
    pub fn directory(empty: bool) -> Self {
        Self {
            last_modified: DateTime::<Utc>::UNIX_EPOCH,
            size: 0,
            etag: String::new(),
            kind: ObjectKind::Directory { empty },
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, ObjectKind::Directory { .. })
    }

    pub fn is_regular_file(&self) -> bool {
        matches!(self.kind, ObjectKind::RegularFile)
    }

    /// Only ever true for directories.
    pub fn is_empty_directory(&self) -> bool {
        matches!(self.kind, ObjectKind::Directory { empty: true })
    }
}

/// Connection lifecycle.
///
/// `Pending -> KeyEstablished -> (AuthFailure)* -> AuthSuccess -> Active -> Closed`,
/// with `Closed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    KeyEstablished,
    AuthFailure,
    AuthSuccess,
    Active,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Pending, KeyEstablished) => true,
            (KeyEstablished | AuthFailure, AuthFailure | AuthSuccess) => true,
            (AuthSuccess, Active) => true,
            _ => false,
        }
    }

    pub fn transition(self, next: SessionState) -> Result<SessionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::KeyEstablished => "key_established",
            SessionState::AuthFailure => "auth_failure",
            SessionState::AuthSuccess => "auth_success",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum CloseReason {
    ClientInitiated,
    Error(String),
    Administrative,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ClientInitiated => f.write_str("Normal shutdown"),
            CloseReason::Error(message) => f.write_str(message),
            CloseReason::Administrative => f.write_str("manual close"),
        }
    }
}

/// Authentication failure causes, keyed by the stable strings the audit
/// records store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthFailureCause {
    #[serde(rename = "SYS_NO_SUCH_USER")]
    NoSuchUser,
    #[serde(rename = "NOT_CONFIGURED_CLIENT_PUBLIC_KEY")]
    PublicKeyNotConfigured,
    #[serde(rename = "PUBLIC_KEY_FAILED_TO_MATCH")]
    PublicKeyMismatch,
    #[serde(rename = "PASSWD_FAILED_TO_MATCH")]
    PasswordMismatch,
    #[serde(rename = "SYS_ERROR_S3_STORAGE_CONFIG")]
    StorageConfig,
}

impl AuthFailureCause {
    pub fn as_key(self) -> &'static str {
        match self {
            AuthFailureCause::NoSuchUser => "SYS_NO_SUCH_USER",
            AuthFailureCause::PublicKeyNotConfigured => "NOT_CONFIGURED_CLIENT_PUBLIC_KEY",
            AuthFailureCause::PublicKeyMismatch => "PUBLIC_KEY_FAILED_TO_MATCH",
            AuthFailureCause::PasswordMismatch => "PASSWD_FAILED_TO_MATCH",
            AuthFailureCause::StorageConfig => "SYS_ERROR_S3_STORAGE_CONFIG",
        }
    }
}

impl std::fmt::Display for AuthFailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_key())
    }
}

/// Connection facts handed to the audit collaborator at key establishment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: Uuid,
    pub client_addr: Option<SocketAddr>,
    pub established_at: DateTime<Utc>,
}

impl SessionMeta {
    pub fn new(client_addr: Option<SocketAddr>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            client_addr,
            established_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_kinds_are_exclusive() {
        let file = ObjectMetadata::file(10, Utc::now(), "abc");
        assert!(file.is_regular_file());
        assert!(!file.is_directory());
        assert!(!file.is_empty_directory());

        let dir = ObjectMetadata::directory(true);
        assert!(dir.is_directory());
        assert!(dir.is_empty_directory());
        assert!(!dir.is_regular_file());
        assert_eq!(dir.size, 0);
        assert!(dir.etag.is_empty());

        assert!(!ObjectMetadata::directory(false).is_empty_directory());
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let state = SessionState::Pending
            .transition(SessionState::KeyEstablished)
            .and_then(|s| s.transition(SessionState::AuthFailure))
            .and_then(|s| s.transition(SessionState::AuthFailure))
            .and_then(|s| s.transition(SessionState::AuthSuccess))
            .and_then(|s| s.transition(SessionState::Active))
            .and_then(|s| s.transition(SessionState::Closed));
        assert_eq!(state, Ok(SessionState::Closed));
    }

    #[test]
    fn test_lifecycle_rejects_skips() {
        assert!(!SessionState::Pending.can_transition_to(SessionState::Active));
        assert!(!SessionState::KeyEstablished.can_transition_to(SessionState::Active));
        assert!(!SessionState::Active.can_transition_to(SessionState::AuthSuccess));
        assert!(!SessionState::AuthSuccess.can_transition_to(SessionState::AuthSuccess));

        let err = SessionState::Active
            .transition(SessionState::AuthSuccess)
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::InvalidTransition {
                from: SessionState::Active,
                to: SessionState::AuthSuccess,
            }
        );
    }

    #[test]
    fn test_closed_is_terminal() {
        for state in [
            SessionState::Pending,
            SessionState::KeyEstablished,
            SessionState::AuthFailure,
            SessionState::AuthSuccess,
            SessionState::Active,
        ] {
            assert!(state.can_transition_to(SessionState::Closed));
        }
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Closed.can_transition_to(SessionState::Closed));
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::ClientInitiated.to_string(), "Normal shutdown");
        assert_eq!(CloseReason::Administrative.to_string(), "manual close");
        assert_eq!(CloseReason::Error("reset".into()).to_string(), "reset");
    }

    #[test]
    fn test_auth_failure_cause_keys() {
        let json = serde_json::to_string(&AuthFailureCause::StorageConfig).unwrap();
        assert_eq!(json, "\"SYS_ERROR_S3_STORAGE_CONFIG\"");
        assert_eq!(AuthFailureCause::PasswordMismatch.as_key(), "PASSWD_FAILED_TO_MATCH");
    }
}
