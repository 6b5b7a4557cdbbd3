//! Process startup and shutdown helpers.

use courier_config::{AppConfig, MetricsConfig};
use courier_core::{CourierError, CourierResult};
use courier_queue::register_metrics;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio::signal;
use tracing::{info, warn};

/// Logs the effective scheduling settings.
pub fn print_startup_info(config: &AppConfig) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("Environment:   {}", config.app.environment);
    info!(
        "Processes:     backend {} / frontend {}",
        config.worker.max_processes_backend, config.worker.max_processes_frontend
    );
    info!(
        "Load curve:    level {}%, exponent {}",
        config.worker.max_connections_level, config.worker.load_exponent
    );
    info!("Tick:          {} ms", config.daemon.tick_interval_ms);
    info!("Cron:          {}", config.daemon.cron_schedule);
    info!("Pidfile:       {}", config.daemon.pidfile.display());
    info!("{}", separator);
}

/// Serve metrics on the configured Prometheus address.
///
/// Returns whether an exporter was installed.
pub fn install_metrics_exporter(config: &MetricsConfig) -> CourierResult<bool> {
    let Some(addr) = config.prometheus_addr.as_deref() else {
        return Ok(false);
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| CourierError::configuration(format!("Invalid prometheus_addr {:?}: {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| CourierError::Internal(format!("Failed to install Prometheus exporter: {}", e)))?;

    register_metrics();
    info!(%addr, "Prometheus exporter listening");
    Ok(true)
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
