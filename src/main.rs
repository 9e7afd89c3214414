use barbershop_kiosk_payments::api::{self, AppState};
use barbershop_kiosk_payments::config::AppConfig;
use barbershop_kiosk_payments::logging::init_tracing;
use barbershop_kiosk_payments::services::{build_pipeline, connect_slot};
use std::net::SocketAddr;
use tokio::signal;
use tracing::{error, info};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        backend = ?config.slot.backend,
        terminal_id = %config.slot.terminal_id,
        poll_interval_ms = config.reconciler.poller.poll_interval.as_millis() as u64,
        freshness_window_secs = config.reconciler.poller.freshness_window.as_secs(),
        "Starting kiosk payment service"
    );

    let slot = connect_slot(&config.slot).await?;
    let (reconciler, listener) = build_pipeline(config.reconciler.clone(), slot);
    let app = api::router(AppState::new(reconciler.clone(), listener.clone()));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let tcp = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "Server listening on http://{}", addr);

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reconciler.disarm();
    listener.stop();
    info!("Kiosk payment service stopped");
    Ok(())
}
