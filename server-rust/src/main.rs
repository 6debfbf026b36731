use anyhow::{Context, Result};
use clap::Parser;
use fleet_server::{
    attestation::{self, AttestationService},
    config::{AttestationConfig, DispatchConfig, RevenueConfig, ServerConfig},
    routes, state, storage,
};
use std::path::PathBuf;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleet-server", about = "GPU fleet coordinator")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "8000", env = "FLEET_PORT")]
    port: u16,

    /// Bearer token for administrative endpoints
    #[arg(long, env = "FLEET_TOKEN")]
    token: String,

    /// Data directory for persistence
    #[arg(long, default_value = "./fleet-data", env = "FLEET_DATA_DIR")]
    data_dir: String,

    #[arg(long, default_value_t = 0.75, env = "FLEET_WORKER_SHARE")]
    worker_share: f64,

    #[arg(long, default_value_t = 0.15, env = "FLEET_PLATFORM_MAINTENANCE")]
    platform_maintenance: f64,

    #[arg(long, default_value_t = 0.10, env = "FLEET_DEVELOPMENT_FUND")]
    development_fund: f64,

    /// Seconds without a heartbeat before a worker counts as offline
    #[arg(long, default_value_t = 300, env = "FLEET_IDLE_THRESHOLD")]
    idle_threshold: u64,

    /// Timeout for generation calls to workers, in seconds
    #[arg(long, default_value_t = 300, env = "FLEET_WORKER_TIMEOUT")]
    worker_timeout: u64,

    /// Seconds between offline sweeps and registry snapshots
    #[arg(long, default_value_t = 60, env = "FLEET_SWEEP_INTERVAL")]
    sweep_interval: u64,

    /// Directory holding the attestation key pair (default: <data-dir>/keys)
    #[arg(long, env = "FLEET_KEY_DIR")]
    key_dir: Option<PathBuf>,

    /// Where to write the public ledger snapshot (default: <data-dir>/public/ledger.json)
    #[arg(long, env = "FLEET_PUBLIC_LEDGER")]
    public_ledger: Option<PathBuf>,

    /// Generate the attestation key pair if it does not exist yet
    #[arg(long, env = "FLEET_INIT_KEYS")]
    init_keys: bool,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig> {
        let revenue = RevenueConfig::new(self.worker_share, self.platform_maintenance, self.development_fund)?;
        let mut attestation = AttestationConfig::under(&self.data_dir);
        if let Some(dir) = self.key_dir {
            attestation.key_dir = dir;
        }
        if let Some(path) = self.public_ledger {
            attestation.public_ledger_path = path;
        }
        Ok(ServerConfig {
            port: self.port,
            admin_token: self.token,
            data_dir: self.data_dir,
            sweep_interval: Duration::from_secs(self.sweep_interval.max(1)),
            dispatch: DispatchConfig {
                idle_threshold_secs: self.idle_threshold,
                worker_timeout: Duration::from_secs(self.worker_timeout),
                ..DispatchConfig::default()
            },
            revenue,
            attestation,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let init_keys = cli.init_keys;
    let config = cli.into_config().context("Invalid configuration")?;
    tracing::info!(port = config.port, data_dir = %config.data_dir, "Starting fleet server");

    if init_keys {
        attestation::initialize_keys(&config.attestation.key_dir).await?;
    }
    let attestation = AttestationService::load(&config.attestation)
        .await
        .context("Attestation keys unavailable (run with --init-keys to create them)")?;

    let state = state::AppState::new(config, attestation);

    storage::load_state(&state)
        .await
        .context("Failed to load persisted revenue ledger")?;

    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweeper.config.sweep_interval);
        loop {
            ticker.tick().await;
            sweeper
                .registry
                .sweep_offline(sweeper.config.dispatch.idle_threshold_secs)
                .await;
            if let Err(e) = storage::save_state(&sweeper).await {
                tracing::warn!("Failed to persist state: {e}");
            }
        }
    });

    let app = routes::create_router(state.clone()).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    storage::save_state(&state).await?;
    tracing::info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
