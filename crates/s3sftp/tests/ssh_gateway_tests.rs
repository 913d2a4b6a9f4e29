//! End-to-end tests over a real SSH connection
//!
//! A russh client logs in to a gateway bound to 127.0.0.1 and speaks SFTP
//! over the `sftp` subsystem against an in-memory bucket.
//!
//! ## NIST 800-53 Compliance
//!
//! - **IA-2 (Identification and Authentication)**: Password login, success and failure
//! - **AC-12 (Session Termination)**: Client close and administrative close
//! - **AU-5 (Response to Audit Processing Failures)**: Connections refused when audit fails

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use russh::client;
use russh::keys::ssh_key;
use s3sftp::audit::{AuditSink, InMemoryAuditStore};
use s3sftp::backend::{BackendFactory, MemoryStorage};
use s3sftp::cache::CacheManager;
use s3sftp::config::UserConfig;
use s3sftp::protocol::{codec, read_packet, write_packet, MessageType, OpenFlags, StatusCode};
use s3sftp::server::load_host_key;
use s3sftp::{
    BackendConfig, BackendRegistry, Config, ConfigCredentialStore, ReconciliationScheduler,
    Server, Services, SessionRegistry, StorageClient, TrafficRecorder,
};
use s3sftp_core::{AuthFailureCause, CloseReason, PersistenceId, SessionMeta};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Every memory profile resolves to the same store the test inspects
struct SharedBucket(Arc<MemoryStorage>);

#[async_trait]
impl BackendFactory for SharedBucket {
    async fn create(&self, _config: &BackendConfig) -> anyhow::Result<Arc<dyn StorageClient>> {
        Ok(self.0.clone())
    }
}

struct Gateway {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    bucket: Arc<MemoryStorage>,
    traffic: TrafficRecorder,
    shutdown: CancellationToken,
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_gateway(audit: Arc<dyn AuditSink>) -> Gateway {
    let mut config = Config {
        auth_rejection_delay_ms: 0,
        ..Config::default()
    };
    config.storages.insert("main".into(), BackendConfig::memory("test"));
    config.users.push(UserConfig {
        user_id: 1,
        username: "alice".into(),
        password_bcrypt: Some(bcrypt::hash("wonderland", 4).unwrap()),
        public_keys: Vec::new(),
        root_path: "home/alice".into(),
        storage: "main".into(),
        direct_read: false,
    });
    config.users.push(UserConfig {
        user_id: 2,
        username: "mallory".into(),
        password_bcrypt: Some(bcrypt::hash("nowhere", 4).unwrap()),
        public_keys: Vec::new(),
        root_path: "home/mallory".into(),
        storage: "missing".into(),
        direct_read: false,
    });
    let config = Arc::new(config);

    let bucket = Arc::new(MemoryStorage::new());
    let backends = BackendRegistry::with_builtin();
    backends.register("memory", SharedBucket(bucket.clone()));

    let registry = Arc::new(SessionRegistry::new(audit));
    let (traffic, _task) = TrafficRecorder::spawn();
    let services = Arc::new(Services {
        config: config.clone(),
        registry: registry.clone(),
        backends: Arc::new(backends),
        caches: Arc::new(CacheManager::with_defaults(&config.cache)),
        credentials: Arc::new(ConfigCredentialStore::from_users(&config.users)),
        write_events: Arc::new(traffic.clone()),
    });

    let dir = tempfile::tempdir().unwrap();
    let host_key = load_host_key(&dir.path().join("missing_host_key")).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(Server::new(services, host_key).serve(listener, shutdown.clone()));

    Gateway {
        addr,
        registry,
        bucket,
        traffic,
        shutdown,
    }
}

async fn connect(addr: SocketAddr) -> client::Handle<AcceptAnyHostKey> {
    client::connect(Arc::new(client::Config::default()), addr, AcceptAnyHostKey)
        .await
        .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

/// Send one request and return the response payload
async fn request<S>(stream: &mut S, payload: &[u8]) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    write_packet(stream, payload).await.unwrap();
    read_packet(stream, 1 << 20).await.unwrap().unwrap()
}

fn packet(msg: MessageType, id: u32, body: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(msg as u8);
    buf.put_u32(id);
    body(&mut buf);
    buf.to_vec()
}

fn status_of(reply: &[u8]) -> u32 {
    let mut buf = reply;
    assert_eq!(buf.get_u8(), MessageType::Status as u8);
    buf.get_u32();
    buf.get_u32()
}

#[tokio::test]
async fn test_login_and_upload_over_sftp() {
    let audit = Arc::new(InMemoryAuditStore::new());
    let gateway = start_gateway(audit.clone()).await;

    let mut session = connect(gateway.addr).await;
    let auth = session
        .authenticate_password("alice", "wonderland")
        .await
        .unwrap();
    assert!(auth.success());

    let channel = session.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "sftp").await.unwrap();
    let mut stream = channel.into_stream();

    let version = request(&mut stream, &[MessageType::Init as u8, 0, 0, 0, 3]).await;
    assert_eq!(version[0], MessageType::Version as u8);

    let reply = request(
        &mut stream,
        &packet(MessageType::Open, 1, |b| {
            codec::put_string(b, "/inbox/hello.txt");
            b.put_u32(OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC);
            b.put_u32(0);
        }),
    )
    .await;
    let mut buf = &reply[..];
    assert_eq!(buf.get_u8(), MessageType::Handle as u8);
    buf.get_u32();
    let handle = codec::get_bytes(&mut buf).unwrap();

    let reply = request(
        &mut stream,
        &packet(MessageType::Write, 2, |b| {
            codec::put_bytes(b, &handle);
            b.put_u64(0);
            codec::put_bytes(b, b"hello over ssh");
        }),
    )
    .await;
    assert_eq!(status_of(&reply), StatusCode::Ok as u32);

    let reply = request(
        &mut stream,
        &packet(MessageType::Close, 3, |b| codec::put_bytes(b, &handle)),
    )
    .await;
    assert_eq!(status_of(&reply), StatusCode::Ok as u32);

    let stored = gateway
        .bucket
        .get_object_range("home/alice/inbox/hello.txt", 0, 100)
        .await
        .unwrap();
    assert_eq!(&stored[..], b"hello over ssh");

    gateway.traffic.flush().await;
    assert_eq!(gateway.traffic.stats("alice").unwrap().bytes_written, 14);

    let id = PersistenceId::new(1);
    assert_eq!(audit.record(id).unwrap().auth_successes, 1);

    drop(stream);
    session
        .disconnect(russh::Disconnect::ByApplication, "done", "en")
        .await
        .unwrap();

    let registry = gateway.registry.clone();
    wait_until(|| registry.is_empty()).await;
    let reason = audit.record(id).unwrap().close_reason;
    assert!(reason.is_some());
    assert_ne!(reason, Some(CloseReason::Administrative));
}

#[tokio::test]
async fn test_failed_logins_are_recorded() {
    let audit = Arc::new(InMemoryAuditStore::new());
    let gateway = start_gateway(audit.clone()).await;

    let mut session = connect(gateway.addr).await;
    let wrong = session.authenticate_password("alice", "guess").await.unwrap();
    assert!(!wrong.success());
    let unknown = session.authenticate_password("nobody", "guess").await.unwrap();
    assert!(!unknown.success());
    let unbound = session
        .authenticate_password("mallory", "nowhere")
        .await
        .unwrap();
    assert!(!unbound.success());

    let record = audit.record(PersistenceId::new(1)).unwrap();
    assert_eq!(
        record.auth_failures,
        vec![
            AuthFailureCause::PasswordMismatch,
            AuthFailureCause::NoSuchUser,
            AuthFailureCause::StorageConfig,
        ]
    );
    assert_eq!(gateway.registry.len(), 1);

    let ok = session
        .authenticate_password("alice", "wonderland")
        .await
        .unwrap();
    assert!(ok.success());
}

#[tokio::test]
async fn test_administrative_close_drops_connection() {
    let audit = Arc::new(InMemoryAuditStore::new());
    let gateway = start_gateway(audit.clone()).await;

    let mut session = connect(gateway.addr).await;
    assert!(session
        .authenticate_password("alice", "wonderland")
        .await
        .unwrap()
        .success());
    let channel = session.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "sftp").await.unwrap();
    let mut stream = channel.into_stream();
    request(&mut stream, &[MessageType::Init as u8, 0, 0, 0, 3]).await;

    let id = PersistenceId::new(1);
    assert!(audit.mark_for_closure(id));
    let report = ReconciliationScheduler::new(gateway.registry.clone(), Duration::from_secs(60))
        .tick()
        .await
        .unwrap();
    assert_eq!(report.closed, 1);
    assert!(gateway.registry.is_empty());

    let outcome = tokio::time::timeout(Duration::from_secs(10), read_packet(&mut stream, 1 << 20))
        .await
        .unwrap();
    assert!(!matches!(outcome, Ok(Some(_))));
    assert_eq!(
        audit.record(id).unwrap().close_reason,
        Some(CloseReason::Administrative)
    );
    assert_eq!(audit.record(id).unwrap().close_records, 1);
}

struct RefusingAudit;

#[async_trait]
impl AuditSink for RefusingAudit {
    async fn record_key_established(&self, _meta: &SessionMeta) -> s3sftp::Result<PersistenceId> {
        Err(s3sftp::Error::Audit("audit store offline".into()))
    }

    async fn record_auth_failure(
        &self,
        _id: PersistenceId,
        _username: &str,
        _cause: AuthFailureCause,
    ) -> s3sftp::Result<()> {
        Ok(())
    }

    async fn record_auth_success(&self, _id: PersistenceId, _username: &str) -> s3sftp::Result<()> {
        Ok(())
    }

    async fn record_session_closed(
        &self,
        _id: PersistenceId,
        _reason: &CloseReason,
    ) -> s3sftp::Result<()> {
        Ok(())
    }

    async fn list_administratively_closed(
        &self,
        _candidates: &HashSet<PersistenceId>,
    ) -> s3sftp::Result<HashSet<PersistenceId>> {
        Ok(HashSet::new())
    }
}

#[tokio::test]
async fn test_connection_refused_when_audit_unavailable() {
    let gateway = start_gateway(Arc::new(RefusingAudit)).await;

    let mut session = connect(gateway.addr).await;
    let outcome = session.authenticate_password("alice", "wonderland").await;
    assert!(!matches!(outcome, Ok(ref auth) if auth.success()));
    assert!(gateway.registry.is_empty());
}
