use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use ugrid_gateway::alerts::{self, Alerter};
use ugrid_gateway::cli::Args;
use ugrid_gateway::config::Config;
use ugrid_gateway::device::{CoapTransport, CommandPort};
use ugrid_gateway::poll::PollScheduler;
use ugrid_gateway::routes;
use ugrid_gateway::state::AppState;
use ugrid_gateway::status::StatusAggregator;
use ugrid_gateway::store::Store;

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ugrid_gateway=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind ugrid-gateway API on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind ugrid-gateway API on {addr}")),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    config.apply_args(&args);
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_tracing()?;
    if config.endpoints.is_empty() {
        tracing::warn!("no endpoints configured; polling is idle");
    }

    let store = Store::open(&config.database_path, config.drop_schema)
        .with_context(|| format!("failed to open database {}", config.database_path.display()))?;

    let cancel = CancellationToken::new();
    let (publisher, alert_rx) = alerts::channel(config.alert_queue);
    let publisher_handle = tokio::spawn(alerts::run_publisher(
        config.mqtt_settings(),
        alert_rx,
        cancel.clone(),
    ));
    let alerter = Alerter::new(store.clone(), publisher);

    let commands = CommandPort::new(Arc::new(CoapTransport::new(config.request_timeout())));
    let status = Arc::new(StatusAggregator::new(
        store.clone(),
        config.extras_capacity,
        config.default_price,
    ));

    let poll_handle = PollScheduler::new(
        config.endpoints.clone(),
        commands.clone(),
        store.clone(),
        status.clone(),
        alerter,
        config.poll_interval(),
        config.default_price,
    )
    .start(cancel.clone());

    let state = AppState::new(store, status, commands, &config.endpoints, config.default_price);
    let app = routes::router(state);

    let addr = config.http_addr();
    let listener = bind_listener(&addr).await?;
    tracing::info!(%addr, endpoints = config.endpoints.len(), "ugrid-gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    if let Err(err) = poll_handle.await {
        tracing::warn!(error = %err, "poll task failed");
    }
    if let Err(err) = publisher_handle.await {
        tracing::warn!(error = %err, "alert publisher task failed");
    }
    Ok(())
}
