use lapin::{
    options::ExchangeDeclareOptions, types::FieldTable, Connection, ConnectionProperties,
    ExchangeKind,
};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::errors::{RabbitMQError, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// How many times the initial dial is tried and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Always at least one attempt, even for a zero budget.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay slept after failed attempt `attempt` (1-based): `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Runs `op` until it succeeds or the policy's attempt budget is spent.
///
/// `op` receives the 1-based attempt number. There is no sleep after the
/// last attempt; the final error is handed back to the caller.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> std::result::Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => {
                error!(attempt, max_attempts, error = %err, "Max connection attempts reached. Giving up.");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Connection attempt failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Maps a configured exchange type onto the AMQP exchange kind.
pub fn exchange_kind(exchange_type: &str) -> ExchangeKind {
    match exchange_type.to_ascii_lowercase().as_str() {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        _ => ExchangeKind::Custom(exchange_type.to_string()),
    }
}

/// Owns the single broker connection shared by the consumer and publisher.
pub struct ConnectionManager {
    uri: String,
    exchange: String,
    exchange_kind: ExchangeKind,
    retry: RetryPolicy,
    connection: Option<Arc<Connection>>,
}

impl ConnectionManager {
    pub fn new(uri: &str, exchange: &str, exchange_type: &str) -> Self {
        ConnectionManager {
            uri: uri.to_string(),
            exchange: exchange.to_string(),
            exchange_kind: exchange_kind(exchange_type),
            retry: RetryPolicy::default(),
            connection: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The live connection, if `connect` has succeeded.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.clone()
    }

    /// Dials the broker with backoff and declares the exchange.
    ///
    /// Only the dial is retried. Failing to open the setup channel or to
    /// declare the exchange closes the fresh connection and is returned as is.
    #[tracing::instrument(skip(self), fields(exchange = %self.exchange), err)]
    pub async fn connect(&mut self) -> Result<Arc<Connection>> {
        if let Some(conn) = self.connection.as_ref().filter(|c| c.status().connected()) {
            return Ok(conn.clone());
        }

        let uri = self.uri.as_str();
        let connection = retry_with_backoff(&self.retry, |attempt| async move {
            info!(attempt, "Attempting to connect to RabbitMQ");
            Connection::connect(uri, ConnectionProperties::default()).await
        })
        .await
        .map_err(|source| RabbitMQError::ConnectionError {
            attempts: self.retry.attempts(),
            source,
        })?;

        if let Err(err) = declare_exchange(&connection, &self.exchange, self.exchange_kind.clone()).await {
            if let Err(close_err) = connection.close(0, "Exchange setup failed").await {
                warn!(error = %close_err, "Failed to close connection after setup failure");
            }
            return Err(err);
        }

        info!(exchange = %self.exchange, "Connected to RabbitMQ and exchange declared");
        let connection = Arc::new(connection);
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    // Closes the shared connection once the consumer has been shut down
    pub async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.connection.take() {
            info!("Closing RabbitMQ connection gracefully");
            conn.close(0, "Closing connection")
                .await
                .map_err(RabbitMQError::channel)?;
        }
        Ok(())
    }
}

/// Declares a durable exchange on a channel that lives only for this call.
pub async fn declare_exchange(connection: &Connection, exchange: &str, kind: ExchangeKind) -> Result<()> {
    let channel = connection
        .create_channel()
        .await
        .map_err(RabbitMQError::channel)?;

    let declared = channel
        .exchange_declare(
            exchange,
            kind,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| RabbitMQError::topology("exchange", exchange, e));

    // A conflicting declare already closed the channel broker-side
    if channel.status().connected() {
        if let Err(e) = channel.close(200, "Exchange declared").await {
            debug!(error = %e, "Setup channel close failed");
        }
    }

    declared
}
