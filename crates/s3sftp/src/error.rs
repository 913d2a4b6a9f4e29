//! Error types for the gateway
//!
//! NIST 800-53: SI-11 (Error Handling), AU-3 (Content of Audit Records)
//! STIG: V-222566 - Error messages must not reveal exploitable information
//! Implementation: Backend and lifecycle failures carry full context for
//! operators while clients only ever see a sanitised message.

use s3sftp_core::{CoreError, SessionState};
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway error types
///
/// NIST 800-53: SI-11 (Error Handling)
#[derive(Error, Debug)]
pub enum Error {
    /// No constructor is registered for the requested backend type
    #[error("Unknown backend type: {0}")]
    UnknownBackendType(String),

    /// The backend constructor ran and failed
    ///
    /// Bad credentials, unreachable endpoint, malformed configuration.
    #[error("Failed to construct '{backend_type}' backend client: {source}")]
    Construction {
        backend_type: String,
        #[source]
        source: anyhow::Error,
    },

    /// Transient transport failure while talking to the backend
    ///
    /// Never collapsed into `NotFound`.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Path resolved to nothing
    #[error("No such file: {0}")]
    NotFound(String),

    /// Cache name was never declared
    #[error("Unknown cache: {0}")]
    UnknownCache(String),

    /// Audit collaborator rejected or could not complete a call
    ///
    /// NIST 800-53: AU-5 (Response to Audit Processing Failures)
    #[error("Audit failure: {0}")]
    Audit(String),

    /// Lifecycle callback arrived in a state that does not allow it
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// Session id is not (or no longer) registered
    #[error("Unknown session: {0}")]
    UnknownSession(i64),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol error
    ///
    /// NIST 800-53: SI-11, SC-8 (Transmission Confidentiality)
    #[error("SSH error: {0}")]
    Ssh(String),

    /// SFTP protocol violation
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    ///
    /// NIST 800-53: IA-2 (Identification and Authentication)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Permission denied
    ///
    /// NIST 800-53: AC-3 (Access Enforcement)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Path failed validation
    ///
    /// NIST 800-53: SI-10 (Input Validation)
    /// STIG: V-222396
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Path already exists where it must not
    #[error("File already exists: {0}")]
    AlreadyExists(String),

    /// Directory removal on a non-empty directory
    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation exceeded its time limit
    ///
    /// NIST 800-53: AC-12 (Session Termination)
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid or closed file handle
    #[error("Invalid file handle: {0}")]
    InvalidHandle(String),

    /// Operation not supported over object storage
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// SSH channel closed underneath us
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// `true` if retrying the same operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::Timeout(_) | Self::ChannelClosed(_)
        )
    }

    /// `true` if the client's request was at fault
    ///
    /// NIST 800-53: SI-10 (Input Validation), SI-11
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath(_)
                | Self::NotFound(_)
                | Self::AlreadyExists(_)
                | Self::DirectoryNotEmpty(_)
                | Self::PermissionDenied(_)
                | Self::InvalidHandle(_)
                | Self::NotSupported(_)
                | Self::Protocol(_)
        )
    }

    /// `true` if the error should be raised as a security event
    ///
    /// NIST 800-53: AU-2 (Audit Events)
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::PermissionDenied(_) | Self::InvalidPath(_)
        )
    }

    /// SFTP status code for this error
    pub fn to_status_code(&self) -> u32 {
        use crate::protocol::StatusCode;

        let code = match self {
            Self::NotFound(_) => StatusCode::NoSuchFile,
            Self::PermissionDenied(_) => StatusCode::PermissionDenied,
            Self::InvalidPath(_) | Self::InvalidHandle(_) | Self::Protocol(_) => {
                StatusCode::BadMessage
            }
            Self::NotSupported(_) => StatusCode::OpUnsupported,
            Self::ChannelClosed(_) => StatusCode::ConnectionLost,
            _ => StatusCode::Failure,
        };
        code.into()
    }

    /// Message safe to send to the client
    ///
    /// NIST 800-53: SI-11 (Error Handling)
    /// STIG: V-222566
    /// Implementation: Never echoes backend endpoints, credentials, config
    /// details, or authentication causes.
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::Authentication(_) => "Authentication failed".to_string(),
            Self::PermissionDenied(_) => "Permission denied".to_string(),
            Self::InvalidPath(_) => "Invalid path".to_string(),
            Self::NotFound(_) => "No such file".to_string(),
            Self::AlreadyExists(_) => "File already exists".to_string(),
            Self::DirectoryNotEmpty(_) => "Directory not empty".to_string(),
            Self::Config(_)
            | Self::UnknownBackendType(_)
            | Self::Construction { .. }
            | Self::UnknownCache(_) => "Server configuration error".to_string(),
            Self::BackendUnavailable(_) | Self::Io(_) => "Storage backend failure".to_string(),
            Self::Timeout(_) => "Operation timed out".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn backend(context: impl std::fmt::Display) -> Self {
        Self::BackendUnavailable(context.to_string())
    }

    pub fn invalid_handle(context: impl Into<String>) -> Self {
        Self::InvalidHandle(context.into())
    }

    pub fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout(context.into())
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}

impl From<CoreError> for Error {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            CoreError::InvalidPath(path) => Self::InvalidPath(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StatusCode;

    #[test]
    fn test_is_recoverable() {
        assert!(Error::BackendUnavailable("timeout".into()).is_recoverable());
        assert!(Error::Timeout("test".into()).is_recoverable());
        assert!(!Error::NotFound("a".into()).is_recoverable());
        assert!(!Error::UnknownBackendType("ftp".into()).is_recoverable());
    }

    #[test]
    fn test_is_client_error() {
        assert!(Error::InvalidPath("test".into()).is_client_error());
        assert!(Error::NotFound("test".into()).is_client_error());
        assert!(Error::DirectoryNotEmpty("d".into()).is_client_error());
        assert!(!Error::BackendUnavailable("test".into()).is_client_error());
    }

    #[test]
    fn test_sanitized_message_hides_internals() {
        let err = Error::Construction {
            backend_type: "s3".into(),
            source: anyhow::anyhow!("invalid secret for http://minio.internal:9000"),
        };
        assert_eq!(err.sanitized_message(), "Server configuration error");

        let err = Error::BackendUnavailable("connection refused 10.0.0.5:9000".into());
        assert_eq!(err.sanitized_message(), "Storage backend failure");

        let err = Error::Authentication("PASSWD_FAILED_TO_MATCH".into());
        assert_eq!(err.sanitized_message(), "Authentication failed");
    }

    #[test]
    fn test_to_status_code() {
        assert_eq!(
            Error::NotFound("x".into()).to_status_code(),
            StatusCode::NoSuchFile as u32
        );
        assert_eq!(
            Error::NotSupported("symlink".into()).to_status_code(),
            StatusCode::OpUnsupported as u32
        );
        assert_eq!(
            Error::BackendUnavailable("x".into()).to_status_code(),
            StatusCode::Failure as u32
        );
    }

    #[test]
    fn test_from_core_error() {
        let err: Error = CoreError::InvalidTransition {
            from: SessionState::Active,
            to: SessionState::AuthSuccess,
        }
        .into();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }
}
