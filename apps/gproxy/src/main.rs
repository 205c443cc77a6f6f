use std::error::Error;
use std::sync::Arc;

use clap::Parser;
mod cli;
mod config;
use gproxy_core::{Core, StoreAuth};
use gproxy_provider_core::KeyStore;
use gproxy_provider_impl::{
    build_client, DispatchEngine, KeySelector, TelemetrySink, WreqUpstream,
};
use gproxy_storage::TrafficStorage;
use tracing::{info, warn};

use crate::cli::{Cli, LogFormat};
use crate::config::Config;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("gproxy failed: {err}");
            std::process::exit(2);
        }
    };
    init_tracing(config.server.log_format);
    if let Err(err) = run(config).await {
        eprintln!("gproxy failed: {err}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    let storage = Arc::new(TrafficStorage::connect(&config.server.dsn).await?);
    info!(event = "db_connected", backend = %backend_name(&config.server.dsn));
    storage.sync().await?;
    seed(&storage, &config).await?;

    let client = build_client(&config.client_options())?;
    let store: Arc<dyn KeyStore> = storage.clone();
    let telemetry = TelemetrySink::spawn(store.clone(), config.telemetry_config());
    let engine = DispatchEngine::new(
        Arc::new(WreqUpstream::new(client)),
        telemetry.clone(),
        config.dispatch_options(),
    );
    let core = Core::new(
        config.core_options(),
        KeySelector::new(store.clone()),
        engine,
        Arc::new(StoreAuth::new(store)),
    );
    let app = core.router();

    let bind = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(
        event = "listening",
        addr = %bind,
        max_retries = config.dispatch.max_retries,
        flush_on_complete = config.telemetry.flush_on_complete
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(event = "telemetry_drain");
    telemetry.shutdown().await;
    info!(event = "stopped");
    Ok(())
}

/// Adds configured credentials and proxy keys; existing rows are kept.
async fn seed(
    storage: &TrafficStorage,
    config: &Config,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    for seed in &config.credentials {
        let id = storage
            .ensure_credential(seed.secret.trim(), seed.label.clone(), seed.owner_id)
            .await?;
        info!(
            event = "credential_seeded",
            credential_id = id,
            label = seed.label.as_deref().unwrap_or("")
        );
    }
    for seed in &config.auth.keys {
        storage
            .ensure_proxy_key(seed.key.trim(), seed.user_id, seed.label.clone())
            .await?;
    }
    if !config.auth.keys.is_empty() {
        info!(event = "proxy_keys_seeded", count = config.auth.keys.len());
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gproxy=info,sqlx=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// The DSN may carry credentials; only its scheme is logged.
fn backend_name(dsn: &str) -> &str {
    dsn.split_once(':').map(|(scheme, _)| scheme).unwrap_or("unknown")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(event = "signal_handler_failed", error = %err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(event = "signal_handler_failed", error = %err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(event = "shutdown_signal", signal = "SIGINT"),
        _ = terminate => info!(event = "shutdown_signal", signal = "SIGTERM"),
    }
}
