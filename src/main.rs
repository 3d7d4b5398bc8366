use anyhow::{bail, Context, Result};
use payment_service::config::load_config;
use payment_service::payments::{init_db, run_migrations, PgAccountProvisioner};
use payment_service::rabbitmq::{ConnectionManager, Topology, UserCreatedConsumer};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config().context("Failed to load configuration")?;
    let rabbit = &config.rabbitmq;

    let mut manager = ConnectionManager::new(&rabbit.url, &rabbit.exchange, &rabbit.exchange_type)
        .with_retry_policy(config.retry.policy());
    let connection = manager.connect().await.context("Failed to connect to RabbitMQ")?;

    Topology::new(&rabbit.exchange, &rabbit.queue, &rabbit.routing_key)
        .bind(&connection)
        .await
        .context("Failed to declare queue topology")?;

    let pool = init_db(&config.database.dsn)
        .await
        .context("Failed to connect to payments database")?;
    run_migrations(&pool).await.context("Failed to migrate payments database")?;

    let provisioner = Arc::new(PgAccountProvisioner::new(pool.clone()));
    let consumer = UserCreatedConsumer::new(connection.clone(), &rabbit.queue, provisioner)
        .start()
        .await
        .context("Failed to start listener")?;

    info!("Payment service running. Press Ctrl+C to exit.");
    let interrupted = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            true
        }
        _ = consumer.stopped() => false,
    };

    if interrupted {
        info!("Shutting down...");
    } else {
        error!("Listener stopped on its own; broker channel or connection closed");
    }
    match consumer.shutdown().await {
        Ok(stats) => info!(?stats, "Listener stopped"),
        Err(e) => error!(error = %e, "Listener task failed"),
    }
    drop(connection);
    if let Err(e) = manager.close().await {
        error!(error = %e, "Failed to close RabbitMQ connection");
    }
    pool.close().await;

    if !interrupted {
        bail!("Listener stopped unexpectedly");
    }
    Ok(())
}
