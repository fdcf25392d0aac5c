//! Rigforge Worker - background RabbitMQ consumer with health endpoints.
//!
//! Runs three tasks until SIGINT/SIGTERM:
//! - the queue consumer
//! - the activity-log stash flusher
//! - the health HTTP server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rigforge::activity::{run_stash_flusher, FileLogStore, LogStore};
use rigforge::health::HealthProbe;
use rigforge::{
    web, ActivityLogger, AmqpConnector, AppState, BrokerProbe, Config, ConnectionManager,
    Consumer, ConsumerSettings, JsonHandler, MailProbe,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        rabbitmq_host = %config.broker.host,
        rabbitmq_port = config.broker.port,
        queue = %config.broker.queue,
        prefetch_count = config.broker.prefetch_count,
        smtp_host = %config.mail.host,
        smtp_port = config.mail.port,
        smtp_tls = ?config.mail.tls,
        port = config.port,
        activity_log_path = %config.activity_log_path,
        "config_loaded"
    );

    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::new(&config.activity_log_path));
    let logger = Arc::new(ActivityLogger::new(store));
    let connections = Arc::new(ConnectionManager::new(AmqpConnector::new(
        config.broker.clone(),
    )));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = Consumer::new(
        Arc::clone(&connections),
        Arc::clone(&logger),
        JsonHandler,
        ConsumerSettings::from(&config.broker),
    );
    let consumer_task = tokio::spawn({
        let shutdown = wait_for_shutdown(shutdown_rx.clone());
        async move { consumer.run(shutdown).await }
    });

    let flusher_task = tokio::spawn(run_stash_flusher(
        Arc::clone(&logger),
        config.stash_flush_interval,
        wait_for_shutdown(shutdown_rx.clone()),
    ));

    let probes: Vec<Arc<dyn HealthProbe>> = vec![
        Arc::new(BrokerProbe::new(Arc::clone(&connections))),
        Arc::new(MailProbe::new(config.mail.clone())),
    ];
    let app = web::router(AppState::new(probes));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "health_server_listening");

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await
        .context("Server error")?;

    let exit = consumer_task.await.context("Consumer task panicked")?;
    info!(exit = ?exit, "consumer_task_finished");

    flusher_task.await.context("Stash flusher task panicked")?;

    // Close the shared broker connection
    connections.close().await;

    info!("worker_shutdown_complete");

    Ok(())
}

/// Resolve once the shutdown flag flips (or its sender is gone).
async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopping| *stopping).await;
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
