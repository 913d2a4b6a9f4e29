//! SFTP Gateway Binary
//!
//! NIST 800-53: AU-2 (Audit Events), AU-9 (Protection of Audit Information),
//! AU-12 (Audit Generation)
//! STIG: V-222648 (Audit Records)
//! Implementation: Gateway process with JSON logging for SIEM integration
//!
//! Run with: cargo run --bin s3sftp-server -- --config gateway.toml

use clap::Parser;
use s3sftp::cache::CacheManager;
use s3sftp::server::load_host_key;
use s3sftp::{
    BackendRegistry, Config, ConfigCredentialStore, InMemoryAuditStore, LogFormat,
    ReconciliationScheduler, Server, Services, SessionRegistry, TrafficRecorder,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Host key path
    #[arg(long)]
    host_key: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host_key) = self.host_key {
            config.host_key_path = host_key;
        }
        if let Some(log_format) = self.log_format {
            config.logging.format = log_format;
        }
        if let Some(log_file) = self.log_file {
            config.logging.file = Some(log_file);
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

/// Install the global subscriber.
///
/// NIST 800-53 AU-9: Protection of Audit Information
/// STIG V-222648: Audit records must be generated
/// Falls back to stderr when the log file cannot be opened.
fn init_logging(config: &Config) -> Option<WorkerGuard> {
    let filter = || EnvFilter::new(config.logging.level.clone());

    let file_writer = config.logging.file.as_ref().and_then(|log_file| {
        let parent = log_file.parent().filter(|p| !p.as_os_str().is_empty())?;
        let file_name = log_file.file_name()?;
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("Warning: Failed to create log directory: {e}");
            eprintln!("Falling back to stderr logging");
            return None;
        }
        let appender = tracing_appender::rolling::daily(parent, file_name);
        Some(tracing_appender::non_blocking(appender))
    });

    match (file_writer, config.logging.format) {
        (Some((writer, guard)), LogFormat::Json) => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter())
                .with_writer(writer)
                .with_current_span(true)
                .with_span_list(true)
                .init();
            Some(guard)
        }
        (Some((writer, guard)), LogFormat::Text) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(writer)
                .init();
            Some(guard)
        }
        (None, LogFormat::Json) => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter())
                .with_current_span(true)
                .with_span_list(true)
                .init();
            None
        }
        (None, LogFormat::Text) => {
            tracing_subscriber::fmt().with_env_filter(filter()).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);

    let _log_guard = init_logging(&config);

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting S3 SFTP gateway"
    );

    if let Err(e) = config.validate() {
        error!(
            event = "configuration_validation_failed",
            error = %e,
            "Configuration validation failed"
        );
        return Err(e.into());
    }
    if config.users.is_empty() {
        warn!("No users configured; every login will be rejected");
    }

    info!(
        event = "server_configuration",
        bind_address = %config.bind_address,
        port = config.port,
        storages = config.storages.len(),
        users = config.users.len(),
        reconcile_interval_secs = config.reconcile_interval_secs,
        read_fragment_size = config.read_fragment_size,
        cache_max_entries = config.cache.max_entries,
        cache_idle_expiry_secs = config.cache.idle_expiry_secs,
        log_format = ?config.logging.format,
        log_file = ?config.logging.file,
        "Gateway configuration"
    );

    let config = Arc::new(config);
    let host_key = load_host_key(&config.host_key_path).await?;

    let audit = Arc::new(InMemoryAuditStore::new());
    let registry = Arc::new(SessionRegistry::new(audit));
    let (traffic, traffic_task) = TrafficRecorder::spawn();
    let services = Arc::new(Services {
        config: Arc::clone(&config),
        registry: Arc::clone(&registry),
        backends: Arc::new(BackendRegistry::with_builtin()),
        caches: Arc::new(CacheManager::with_defaults(&config.cache)),
        credentials: Arc::new(ConfigCredentialStore::from_users(&config.users)),
        write_events: Arc::new(traffic.clone()),
    });

    let shutdown = CancellationToken::new();
    let reconciler = ReconciliationScheduler::new(
        Arc::clone(&registry),
        Duration::from_secs(config.reconcile_interval_secs),
    )
    .spawn(shutdown.clone());

    let mut server = tokio::spawn(Server::new(services, host_key).run(shutdown.clone()));

    info!(
        event = "server_running",
        "SFTP gateway is now running and accepting connections"
    );

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!(event = "shutdown_requested", "Shutdown requested");
            None
        }
        joined = &mut server => Some(joined),
    };

    shutdown.cancel();
    let joined = match finished {
        Some(joined) => joined,
        None => server.await,
    };
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(event = "server_error", error = %e, "Server encountered an error"),
        Err(e) => error!(event = "server_error", error = %e, "Server task failed"),
    }
    if let Err(e) = reconciler.await {
        error!(error = %e, "Reconciliation task failed");
    }

    traffic.flush().await;
    info!(
        event = "traffic_summary",
        bytes_written = traffic.total_bytes(),
        users = traffic.snapshot().len(),
        "Write traffic since start"
    );
    drop(traffic);
    traffic_task.abort();

    info!(event = "server_shutdown", "SFTP gateway shutdown complete");
    Ok(())
}
