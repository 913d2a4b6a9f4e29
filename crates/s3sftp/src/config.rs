//! Gateway configuration

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::backend::BackendConfig;
use crate::cache::CacheSettings;
use crate::{Error, Result};

/// Server configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// SSH host key path (an ephemeral key is generated if missing)
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,

    /// Idle connection timeout in seconds
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Delay before answering a rejected authentication attempt
    ///
    /// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
    #[serde(default = "default_auth_rejection_delay")]
    pub auth_rejection_delay_ms: u64,

    /// Largest SFTP packet accepted from a client
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,

    /// Seconds between administrative-close reconciliation ticks
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Read-ahead fragment size for buffered reads
    #[serde(default = "default_read_fragment_size")]
    pub read_fragment_size: usize,

    /// Timeout applied to each backend call made on behalf of a client
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,

    /// Largest object a single write handle may produce; uploads are
    /// buffered in memory until close
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named storage profiles users bind to
    #[serde(default)]
    pub storages: HashMap<String, BackendConfig>,

    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// Logging configuration
///
/// NIST 800-53: AU-2 (Audit Events), AU-12 (Audit Generation)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    pub level: String,
    pub format: LogFormat,
    /// Optional log file path (stderr if unset)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable
    Text,
    /// One JSON object per line, for log aggregators
    Json,
}

/// A gateway account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub user_id: i64,
    pub username: String,
    /// bcrypt hash of the password (`$2a$`, `$2b$` or `$2y$`)
    #[serde(default)]
    pub password_bcrypt: Option<String>,
    /// OpenSSH formatted public keys
    #[serde(default)]
    pub public_keys: Vec<String>,
    /// Key prefix the user is confined to
    #[serde(default)]
    pub root_path: String,
    /// Name of the entry in `storages`
    pub storage: String,
    /// Bypass the read-ahead fragment for this user's reads
    #[serde(default)]
    pub direct_read: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            host_key_path: default_host_key_path(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            auth_rejection_delay_ms: default_auth_rejection_delay(),
            max_packet_size: default_max_packet_size(),
            reconcile_interval_secs: default_reconcile_interval(),
            read_fragment_size: default_read_fragment_size(),
            backend_timeout_secs: default_backend_timeout(),
            max_upload_bytes: default_max_upload_bytes(),
            cache: CacheSettings::default(),
            logging: LoggingConfig::default(),
            storages: HashMap::new(),
            users: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size < 32768 {
            return Err(Error::Config(
                "max_packet_size must be at least 32768 bytes (RFC 4254)".to_string(),
            ));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(Error::Config(
                "reconcile_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.read_fragment_size == 0 {
            return Err(Error::Config(
                "read_fragment_size must be greater than zero".to_string(),
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(Error::Config(
                "max_upload_bytes must be greater than zero".to_string(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(Error::Config(
                "cache.max_entries must be greater than zero".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for user in &self.users {
            if !seen.insert(user.username.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate username: {}",
                    user.username
                )));
            }
            if user.password_bcrypt.is_none() && user.public_keys.is_empty() {
                return Err(Error::Config(format!(
                    "User '{}' has neither a password nor public keys",
                    user.username
                )));
            }
        }

        for (name, storage) in &self.storages {
            storage
                .validate()
                .map_err(|e| Error::Config(format!("Storage '{name}': {e}")))?;
        }

        Ok(())
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2222
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("/etc/s3sftp/ssh_host_ed25519_key")
}

fn default_inactivity_timeout() -> u64 {
    300 // 5 minutes
}

fn default_auth_rejection_delay() -> u64 {
    3000
}

fn default_max_packet_size() -> u32 {
    262_144
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_read_fragment_size() -> usize {
    64 * 1024
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_max_upload_bytes() -> u64 {
    512 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
port = 2022
reconcile_interval_secs = 30

[cache]
max_entries = 500
idle_expiry_secs = 10

[logging]
format = "json"

[storages.minio]
backend_type = "s3"
endpoint = "http://127.0.0.1:9000"
bucket = "uploads"
access_key = "ak"
secret_key = "sk"

[[users]]
user_id = 1
username = "alice"
password_bcrypt = "$2a$10$N9qo8uLOickgx2ZMRZoMyeIjZAgcfl7p92ldGxad68LJZdL17lhWy"
root_path = "home/alice"
storage = "minio"
"#;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 2222);
        assert_eq!(config.reconcile_interval_secs, 60);
        assert_eq!(config.read_fragment_size, 65536);
        assert_eq!(config.cache.max_entries, 100_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.port, 2022);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.cache.max_entries, 500);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.storages["minio"].bucket.as_deref(), Some("uploads"));
        assert_eq!(config.users[0].root_path, "home/alice");
        assert!(!config.users[0].direct_read);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_small_packets() {
        let config = Config {
            max_packet_size: 1024,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_credentialless_user() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.users[0].password_bcrypt = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file("/nonexistent/s3sftp.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
