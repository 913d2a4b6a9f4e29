//! Credential verification
//!
//! NIST 800-53: AC-2 (Account Management), IA-2 (Identification and Authentication)
//! STIG: V-222611 - Certificate validation
//! Implementation: Verifies passwords against stored bcrypt hashes and
//! public keys against each account's authorised OpenSSH keys. Failures carry
//! an `AuthFailureCause` for the audit trail; the client never sees it.

use async_trait::async_trait;
use russh::keys::ssh_key::PublicKey;
use s3sftp_core::AuthFailureCause;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::UserConfig;

/// An account that passed credential verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: i64,
    pub username: String,
    /// Key prefix the account is confined to
    pub root_path: String,
    /// Storage profile name
    pub storage: String,
    pub direct_read: bool,
}

pub type AuthResult = std::result::Result<UserRecord, AuthFailureCause>;

/// Source of truth for account credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn verify_password(&self, username: &str, password: &str) -> AuthResult;

    async fn verify_public_key(&self, username: &str, key: &PublicKey) -> AuthResult;
}

struct Account {
    record: UserRecord,
    password_bcrypt: Option<String>,
    public_keys: Vec<PublicKey>,
}

/// Accounts declared in the `[[users]]` section of the config file
pub struct ConfigCredentialStore {
    accounts: HashMap<String, Account>,
}

impl ConfigCredentialStore {
    /// Build the store. Unparseable public keys are skipped with a warning
    /// so one bad line does not lock the account out.
    ///
    /// # NIST 800-53: SI-10 (Information Input Validation)
    pub fn from_users(users: &[UserConfig]) -> Self {
        let accounts = users
            .iter()
            .map(|user| {
                let public_keys = user
                    .public_keys
                    .iter()
                    .enumerate()
                    .filter_map(|(index, line)| match parse_authorized_key(line) {
                        Ok(key) => Some(key),
                        Err(e) => {
                            warn!(
                                username = %user.username,
                                index,
                                error = %e,
                                "Skipping unparseable public key"
                            );
                            None
                        }
                    })
                    .collect();

                let account = Account {
                    record: UserRecord {
                        user_id: user.user_id,
                        username: user.username.clone(),
                        root_path: user.root_path.clone(),
                        storage: user.storage.clone(),
                        direct_read: user.direct_read,
                    },
                    password_bcrypt: user.password_bcrypt.clone(),
                    public_keys,
                };
                (user.username.clone(), account)
            })
            .collect();

        Self { accounts }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// `<type> <base64> [comment]`; the comment is ignored.
fn parse_authorized_key(line: &str) -> std::result::Result<PublicKey, String> {
    let mut parts = line.split_whitespace();
    let (Some(kind), Some(data)) = (parts.next(), parts.next()) else {
        return Err("expected at least <type> <key>".to_string());
    };
    PublicKey::from_openssh(&format!("{kind} {data}")).map_err(|e| e.to_string())
}

/// Check `password` against a `$2a$`/`$2b$`/`$2y$` hash off the async runtime
async fn bcrypt_matches(username: &str, password: &str, hash: &str) -> bool {
    let (password, hash) = (password.to_owned(), hash.to_owned());
    match tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await {
        Ok(Ok(matched)) => matched,
        Ok(Err(e)) => {
            warn!(username, error = %e, "Stored password hash is not a valid bcrypt hash");
            false
        }
        Err(e) => {
            warn!(username, error = %e, "Password verification task failed");
            false
        }
    }
}

#[async_trait]
impl CredentialStore for ConfigCredentialStore {
    /// # NIST 800-53: IA-5 (Authenticator Management)
    async fn verify_password(&self, username: &str, password: &str) -> AuthResult {
        let account = self
            .accounts
            .get(username)
            .ok_or(AuthFailureCause::NoSuchUser)?;
        let Some(hash) = &account.password_bcrypt else {
            return Err(AuthFailureCause::PasswordMismatch);
        };
        if bcrypt_matches(username, password, hash).await {
            debug!(username, "Password verified");
            Ok(account.record.clone())
        } else {
            Err(AuthFailureCause::PasswordMismatch)
        }
    }

    /// # NIST 800-53: IA-2 (Identification and Authentication)
    /// # STIG: V-222611
    async fn verify_public_key(&self, username: &str, key: &PublicKey) -> AuthResult {
        let account = self
            .accounts
            .get(username)
            .ok_or(AuthFailureCause::NoSuchUser)?;
        if account.public_keys.is_empty() {
            return Err(AuthFailureCause::PublicKeyNotConfigured);
        }
        if account
            .public_keys
            .iter()
            .any(|authorized| authorized.key_data() == key.key_data())
        {
            debug!(username, "Public key matched authorized key");
            Ok(account.record.clone())
        } else {
            Err(AuthFailureCause::PublicKeyMismatch)
        }
    }
}
