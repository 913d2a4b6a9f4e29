use s3sftp_core::path::{join_key, normalize_client_path};
use s3sftp_core::{AuthFailureCause, PersistenceId};
use std::collections::HashMap;

use crate::backend::BackendConfig;
use crate::credentials::UserRecord;
use crate::Result;

/// A client path confined to the session root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Normalised path as the client sees it, always `/`-rooted
    pub client: String,
    /// Object key below the session root, without leading `/`
    pub key: String,
}

/// Everything the gateway knows about one SSH connection.
///
/// Filled in as the lifecycle advances: the persistence id at key
/// establishment, identity and storage binding at authentication success.
#[derive(Clone, Default)]
pub struct SessionContext {
    pub persistence_id: Option<PersistenceId>,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    /// Key prefix every client path is resolved below
    pub root_path: String,
    pub backend_type: Option<String>,
    /// Connection URI of the bound backend; carries credentials
    pub backend_uri: Option<String>,
    pub backend: Option<BackendConfig>,
    pub last_failure: Option<AuthFailureCause>,
    /// Reads bypass the read-ahead fragment
    pub direct_read: bool,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some() && self.backend.is_some()
    }

    pub fn record_failure(&mut self, cause: AuthFailureCause) {
        self.last_failure = Some(cause);
    }

    /// Attach a verified account and its storage profile.
    ///
    /// A profile name missing from `storages` is an authentication failure;
    /// the context is left unbound.
    pub fn bind(
        &mut self,
        user: &UserRecord,
        storages: &HashMap<String, BackendConfig>,
    ) -> std::result::Result<(), AuthFailureCause> {
        let Some(backend) = storages.get(&user.storage) else {
            self.record_failure(AuthFailureCause::StorageConfig);
            return Err(AuthFailureCause::StorageConfig);
        };

        self.user_id = Some(user.user_id);
        self.username = Some(user.username.clone());
        self.root_path = user.root_path.clone();
        self.backend_type = Some(backend.backend_type.clone());
        self.backend_uri = Some(backend.connection_uri());
        self.backend = Some(backend.clone());
        self.direct_read = user.direct_read;
        Ok(())
    }

    /// Normalise a client path and map it to an object key under the root
    ///
    /// # NIST 800-53: AC-3 (Access Enforcement), SI-10 (Input Validation)
    pub fn resolve_path(&self, client_path: &str) -> Result<ResolvedPath> {
        let client = normalize_client_path(client_path)?;
        let key = join_key(&self.root_path, &client);
        Ok(ResolvedPath { client, key })
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("persistence_id", &self.persistence_id)
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("root_path", &self.root_path)
            .field("backend_type", &self.backend_type)
            .field("backend_uri", &self.backend_uri.as_ref().map(|_| "<redacted>"))
            .field("last_failure", &self.last_failure)
            .field("direct_read", &self.direct_read)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn alice() -> UserRecord {
        UserRecord {
            user_id: 7,
            username: "alice".to_string(),
            root_path: "home/alice".to_string(),
            storage: "main".to_string(),
            direct_read: true,
        }
    }

    #[test]
    fn test_bind() {
        let storages = HashMap::from([("main".to_string(), BackendConfig::memory("b"))]);
        let mut context = SessionContext::new();
        assert!(!context.is_authenticated());

        context.bind(&alice(), &storages).unwrap();
        assert!(context.is_authenticated());
        assert_eq!(context.backend_type.as_deref(), Some("memory"));
        assert_eq!(context.backend_uri.as_deref(), Some("s3sftp+memory://b"));
        assert!(context.direct_read);
    }

    #[test]
    fn test_bind_missing_storage() {
        let mut context = SessionContext::new();
        assert_eq!(
            context.bind(&alice(), &HashMap::new()),
            Err(AuthFailureCause::StorageConfig)
        );
        assert!(!context.is_authenticated());
        assert_eq!(context.last_failure, Some(AuthFailureCause::StorageConfig));
    }

    #[test]
    fn test_resolve_path_stays_under_root() {
        let context = SessionContext {
            root_path: "home/alice".to_string(),
            ..SessionContext::new()
        };

        let resolved = context.resolve_path("docs/../../../etc/passwd").unwrap();
        assert_eq!(resolved.client, "/etc/passwd");
        assert_eq!(resolved.key, "home/alice/etc/passwd");

        assert_eq!(context.resolve_path(".").unwrap().key, "home/alice");
        assert!(matches!(
            context.resolve_path("a\0b"),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_debug_hides_uri() {
        let storages = HashMap::from([(
            "main".to_string(),
            BackendConfig {
                bucket: Some("b".into()),
                secret_key: Some("TOPSECRET".into()),
                ..BackendConfig::new("s3")
            },
        )]);
        let mut context = SessionContext::new();
        context.bind(&alice(), &storages).unwrap();
        assert!(!format!("{context:?}").contains("TOPSECRET"));
    }
}
