//! SSH front end
//!
//! NIST 800-53: AC-12 (Session Termination), IA-2 (Identification and Authentication)
//! Implementation: Each accepted TCP connection runs in its own task with a
//! cancellable transport. Lifecycle callbacks drive the session registry;
//! the `sftp` subsystem hands the channel to an `SftpSession` bound to the
//! account's storage backend.

use russh::keys::ssh_key;
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId};
use s3sftp_core::{AuthFailureCause, CloseReason, PersistenceId, SessionMeta};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendConfig, BackendRegistry, StorageClient};
use crate::cache::{CacheManager, BACKEND_CLIENTS_CACHE};
use crate::config::Config;
use crate::credentials::{AuthResult, CredentialStore};
use crate::session::{ConnectionTransport, SessionContext, SessionRegistry};
use crate::sftp::{SftpOptions, SftpSession};
use crate::traffic::WriteEventSink;
use crate::{Error, Result};

/// Everything a connection needs, shared by all connections
pub struct Services {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub backends: Arc<BackendRegistry>,
    pub caches: Arc<CacheManager>,
    pub credentials: Arc<dyn CredentialStore>,
    pub write_events: Arc<dyn WriteEventSink>,
}

impl Services {
    /// Storage client for a profile, shared across sessions with the same
    /// connection URI.
    pub async fn storage_client(&self, backend: &BackendConfig) -> Result<Arc<dyn StorageClient>> {
        let uri = backend.connection_uri();
        if let Some(client) = self
            .caches
            .get_as::<Arc<dyn StorageClient>>(BACKEND_CLIENTS_CACHE, &uri)?
        {
            return Ok(Arc::clone(&*client));
        }

        let client = self.backends.create(&backend.backend_type, backend).await?;
        self.caches
            .put(BACKEND_CLIENTS_CACHE, uri, Arc::new(Arc::clone(&client)))?;
        Ok(client)
    }
}

/// Load the host key, or generate a throwaway Ed25519 key when the file
/// does not exist.
///
/// # NIST 800-53: SC-12 (Cryptographic Key Establishment and Management)
pub async fn load_host_key(path: &Path) -> Result<PrivateKey> {
    if !tokio::fs::try_exists(path).await? {
        warn!(path = %path.display(), "Host key not found, generating temporary key");
        return PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .map_err(|e| Error::Config(format!("Failed to generate host key: {e}")));
    }

    let key_data = tokio::fs::read_to_string(path).await?;
    russh::keys::decode_secret_key(&key_data, None)
        .map_err(|e| Error::Config(format!("Failed to load host key: {e}")))
}

pub struct Server {
    services: Arc<Services>,
    ssh_config: Arc<server::Config>,
}

impl Server {
    pub fn new(services: Arc<Services>, host_key: PrivateKey) -> Self {
        let ssh_config = server::Config {
            inactivity_timeout: Some(Duration::from_secs(
                services.config.inactivity_timeout_secs,
            )),
            auth_rejection_time: Duration::from_millis(services.config.auth_rejection_delay_ms),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key],
            ..Default::default()
        };

        Self {
            services,
            ssh_config: Arc::new(ssh_config),
        }
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.services.config.bind_address, self.services.config.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "Starting SFTP gateway");
        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        loop {
            let (socket, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(%peer, "Connection accepted");
            tokio::spawn(run_connection(
                Arc::clone(&self.services),
                Arc::clone(&self.ssh_config),
                socket,
                peer,
                shutdown.clone(),
            ));
        }

        info!("SFTP gateway stopped accepting connections");
        Ok(())
    }
}

/// Drive one SSH connection to completion and report how it ended
async fn run_connection(
    services: Arc<Services>,
    ssh_config: Arc<server::Config>,
    socket: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let transport = ConnectionTransport::new();
    let persistence_id = Arc::new(OnceLock::new());
    let handler = ConnectionHandler {
        services: Arc::clone(&services),
        transport: transport.clone(),
        peer,
        persistence_id: Arc::clone(&persistence_id),
        context: SessionContext::new(),
        client: None,
        channels: HashMap::new(),
    };
    let cancel = transport.cancellation_token();

    let reason = match server::run_stream(ssh_config, socket, handler).await {
        Ok(running) => tokio::select! {
            result = running => match result {
                Ok(()) => CloseReason::ClientInitiated,
                Err(e) => CloseReason::Error(e.to_string()),
            },
            () = cancel.cancelled() => CloseReason::Error("Connection force-closed".to_string()),
            () = shutdown.cancelled() => CloseReason::Error("Server shutdown".to_string()),
        },
        Err(e) => CloseReason::Error(e.to_string()),
    };

    let Some(&id) = persistence_id.get() else {
        debug!(%peer, %reason, "Connection ended before key establishment");
        return;
    };
    let reason = if transport.is_administratively_closed() {
        CloseReason::Administrative
    } else {
        reason
    };
    services.registry.on_session_closed(id, reason).await;
}

/// Per-connection SSH handler
///
/// NIST 800-53: IA-2 (Identification and Authentication), AC-7 (Unsuccessful Logon Attempts)
struct ConnectionHandler {
    services: Arc<Services>,
    transport: ConnectionTransport,
    peer: SocketAddr,
    /// Shared with the connection task, which reports the close
    persistence_id: Arc<OnceLock<PersistenceId>>,
    context: SessionContext,
    client: Option<Arc<dyn StorageClient>>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ConnectionHandler {
    /// Register the connection on its first authentication callback.
    ///
    /// An audit failure here is returned as an error, which drops the
    /// connection before any credentials are checked.
    async fn ensure_key_established(&mut self) -> Result<PersistenceId> {
        if let Some(id) = self.context.persistence_id {
            return Ok(id);
        }

        let id = self
            .services
            .registry
            .on_key_established(
                Arc::new(self.transport.clone()),
                SessionMeta::new(Some(self.peer)),
            )
            .await?;
        self.context.persistence_id = Some(id);
        if self.persistence_id.set(id).is_err() {
            warn!(%id, "Persistence id already recorded for this connection");
        }
        Ok(id)
    }

    async fn conclude_auth(&mut self, user: &str, outcome: AuthResult) -> Result<Auth> {
        let id = self.ensure_key_established().await?;

        let record = match outcome {
            Ok(record) => record,
            Err(cause) => return self.reject(id, user, cause).await,
        };

        let mut context = self.context.clone();
        if let Err(cause) = context.bind(&record, &self.services.config.storages) {
            return self.reject(id, user, cause).await;
        }

        let client = match context.backend.as_ref() {
            Some(backend) => self.services.storage_client(backend).await,
            None => Err(Error::Config(format!("No storage bound for {user}"))),
        };
        let client = match client {
            Ok(client) => client,
            Err(e) => {
                error!(%id, username = %user, error = %e, "Storage backend unavailable at login");
                return self.reject(id, user, AuthFailureCause::StorageConfig).await;
            }
        };

        if let Err(e) = self.services.registry.on_auth_success(id, user).await {
            warn!(%id, username = %user, error = %e, "Rejecting out-of-order authentication");
            return Ok(Auth::reject());
        }

        info!(%id, username = %user, backend = ?context.backend_type, "User authenticated");
        self.context = context;
        self.client = Some(client);
        Ok(Auth::Accept)
    }

    async fn reject(
        &mut self,
        id: PersistenceId,
        user: &str,
        cause: AuthFailureCause,
    ) -> Result<Auth> {
        self.context.record_failure(cause);
        if let Err(e) = self.services.registry.on_auth_failure(id, user, cause).await {
            warn!(%id, username = %user, error = %e, "Authentication failure not recorded");
        }
        Ok(Auth::reject())
    }

    fn start_sftp(&self, channel: Channel<Msg>) -> Result<()> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| Error::Authentication("SFTP requested before login".into()))?;
        let sftp = SftpSession::new(
            self.context.clone(),
            client,
            Arc::clone(&self.services.caches),
            Arc::clone(&self.services.write_events),
            SftpOptions::from_config(&self.services.config),
        );
        let username = self.context.username.clone().unwrap_or_default();

        tokio::spawn(async move {
            info!(%username, "SFTP subsystem started");
            match sftp.serve(channel.into_stream()).await {
                Ok(()) => info!(%username, "SFTP subsystem ended"),
                Err(e) => warn!(%username, error = %e, "SFTP subsystem ended with error"),
            }
        });
        Ok(())
    }
}

impl server::Handler for ConnectionHandler {
    type Error = Error;

    // NIST 800-53: IA-2, IA-5 (Authenticator Management)
    // Implementation: Password checked against the account's stored digest
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        let outcome = self
            .services
            .credentials
            .verify_password(user, password)
            .await;
        self.conclude_auth(user, outcome).await
    }

    // NIST 800-53: IA-2
    // STIG: V-222611
    // Implementation: Called after russh verified the signature; we check the
    // key is one the account authorised.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth> {
        let outcome = self
            .services
            .credentials
            .verify_public_key(user, public_key)
            .await;
        self.conclude_auth(user, outcome).await
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        if self.client.is_none() {
            return Ok(false);
        }
        debug!(channel = %channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        let channel = match (name, self.channels.remove(&channel_id)) {
            ("sftp", Some(channel)) => channel,
            (_, channel) => {
                warn!(subsystem = name, "Unsupported subsystem request");
                if let Some(channel) = channel {
                    self.channels.insert(channel_id, channel);
                }
                session.channel_failure(channel_id)?;
                return Ok(());
            }
        };

        session.channel_success(channel_id)?;
        self.start_sftp(channel)
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        debug!(%channel, "Channel closed");
        self.channels.remove(&channel);
        Ok(())
    }
}
