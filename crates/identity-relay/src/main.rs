// Outbox relay service
//
// Bridges the transactional outbox in PostgreSQL to RabbitMQ. The worker
// and the health server run as separate tasks; SIGINT/SIGTERM cancel the
// worker, which finishes its current statement before exiting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use identity_messaging::RabbitMqBroker;
use identity_relay::health::serve_health;
use identity_relay::{OutboxRelay, RelayConfig, RelayError};

const HEALTH_ADDR: &str = "0.0.0.0:8090";
const HEALTH_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "identity_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("outbox relay starting...");

    let config = RelayConfig::from_env().context("invalid relay configuration")?;

    let pool = PgPoolOptions::new()
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    info!("connected to database");

    let broker = Arc::new(
        RabbitMqBroker::connect(&config.rabbitmq_url, &config.baby_queue_name)
            .await
            .context("failed to connect to RabbitMQ")?,
    );
    info!(queue = %config.baby_queue_name, "connected to RabbitMQ");

    let relay = Arc::new(OutboxRelay::new(
        pool,
        config.database_url.clone(),
        broker.clone(),
        config.baby_queue_name.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_server = tokio::spawn(serve_health(
        HEALTH_ADDR,
        relay.health(),
        shutdown_tx.subscribe(),
    ));

    let mut worker = tokio::spawn({
        let relay = Arc::clone(&relay);
        async move {
            info!("starting event processing worker...");
            relay.start(shutdown_rx).await
        }
    });

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let worker_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, initiating shutdown...");
            shutdown_tx.send(true).ok();
            worker.await
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, initiating shutdown...");
            shutdown_tx.send(true).ok();
            worker.await
        }
        result = &mut worker => {
            shutdown_tx.send(true).ok();
            result
        }
    };

    match tokio::time::timeout(HEALTH_SHUTDOWN_TIMEOUT, health_server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => warn!(error = %err, "health server error"),
        Ok(Err(err)) => warn!(error = %err, "health server task failed"),
        Err(_) => warn!(
            "health server did not shut down within {:?}",
            HEALTH_SHUTDOWN_TIMEOUT
        ),
    }

    if let Err(err) = broker.close().await {
        warn!(error = %err, "error closing broker connection");
    }

    match worker_result {
        Ok(Err(RelayError::Cancelled)) | Ok(Ok(())) => {
            info!("shutdown complete");
            Ok(())
        }
        Ok(Err(err)) => {
            error!(error = %err, "relay worker failed");
            Err(err.into())
        }
        Err(err) => {
            error!(error = %err, "relay worker task failed");
            Err(err.into())
        }
    }
}
