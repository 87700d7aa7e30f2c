use anyhow::Context;
use clap::Parser;
use telemetry_gateway::config::Config;
use telemetry_gateway::db::Store;
use telemetry_gateway::mqtt::{Broker, Hooks, IngestConfig, IngestHook, LoggingHook};
use telemetry_gateway::rest::middleware::{ApiKey, LogConfig};
use telemetry_gateway::rest::ratelimit::RateLimiter;
use telemetry_gateway::rest::{self, AppState, GatewayConfig};
use telemetry_gateway::{logging, metrics};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    logging::init(config.debug);
    config.validate().context("invalid configuration")?;

    info!("Starting telemetry gateway");
    info!("MQTT listener: {}:{}", config.mqtt_address, config.mqtt_port);
    info!("HTTP port: {}", config.http_port);
    info!("Database: {}", config.database_path);

    metrics::init_metrics().context("failed to register metrics")?;

    let store = Store::connect(&config.database_path)
        .await
        .context("failed to open database")?;

    let ingest = IngestHook::new(IngestConfig {
        topic_prefix: config.data_topic_prefix.clone(),
        store: store.clone(),
    })?;
    let hooks = Hooks::builder()
        .add(LoggingHook)?
        .add(ingest)?
        .build();

    let broker = Broker::bind(&config.broker(), hooks)
        .await
        .context("failed to start MQTT listener")?;

    let shutdown = CancellationToken::new();
    let http = config.http();

    let gateway = GatewayConfig {
        api_key: ApiKey::new(&config.api_key)?,
        limiter: RateLimiter::new(http.max_requests_per_second, shutdown.clone())?,
        log: LogConfig {
            capture_bodies: config.debug,
        },
    };
    let app = rest::create_router(AppState { store: store.clone() }, gateway);
    let listener = TcpListener::bind(http.addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener to {}", http.addr))?;

    let broker_handle = tokio::spawn(broker.run(shutdown.clone()));
    let mut server_handle = tokio::spawn(rest::serve(listener, app, shutdown.clone()));

    tokio::select! {
        _ = wait_for_signal() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            error!("HTTP server terminated: {:?}", result);
        }
    }

    shutdown.cancel();
    info!("Shutting down");

    if !server_handle.is_finished() {
        match tokio::time::timeout(http.shutdown_grace, &mut server_handle).await {
            Ok(Ok(Err(e))) => error!("HTTP server error: {}", e),
            Ok(_) => {}
            Err(_) => {
                warn!(
                    "HTTP server did not drain within {:?}, aborting",
                    http.shutdown_grace
                );
                server_handle.abort();
            }
        }
    }

    match broker_handle.await {
        Ok(Err(e)) => error!("MQTT listener error: {}", e),
        Err(e) => error!("MQTT listener task failed: {}", e),
        Ok(Ok(())) => {}
    }

    store.close().await;
    info!("Shutdown complete");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
