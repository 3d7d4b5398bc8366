use futures_lite::{future::poll_once, Stream, StreamExt};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions},
    types::FieldTable,
    Connection,
};
use std::future::Future;
use std::fmt::Display;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::errors::{RabbitMQError, Result};
use crate::models::UserCreated;
use crate::payments::{AccountProvisioner, Provisioned};

/// Counters for one consume-loop lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeStats {
    pub received: u64,
    pub created: u64,
    pub existing: u64,
    pub undecodable: u64,
    pub failed: u64,
}

/// What happened to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Provisioned(Provisioned),
    Undecodable,
    Failed,
}

impl ConsumeStats {
    fn record(&mut self, outcome: DeliveryOutcome) {
        self.received += 1;
        match outcome {
            DeliveryOutcome::Provisioned(Provisioned::Created(_)) => self.created += 1,
            DeliveryOutcome::Provisioned(Provisioned::Existing(_)) => self.existing += 1,
            DeliveryOutcome::Undecodable => self.undecodable += 1,
            DeliveryOutcome::Failed => self.failed += 1,
        }
    }
}

pub fn decode(body: &[u8]) -> Result<UserCreated> {
    serde_json::from_slice(body).map_err(RabbitMQError::DeserializationError)
}

/// Decodes one body and provisions its account. Never fails: errors are
/// logged and the delivery is dropped.
pub async fn handle_delivery<P>(provisioner: &P, body: &[u8]) -> DeliveryOutcome
where
    P: AccountProvisioner + ?Sized,
{
    let event = match decode(body) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                error = %e,
                body = %String::from_utf8_lossy(body),
                "Failed to parse user.created event, dropping delivery"
            );
            return DeliveryOutcome::Undecodable;
        }
    };

    info!(user_id = event.user_id, username = %event.username, "Received user.created event");

    match provisioner
        .create_if_absent(event.user_id, &event.username, &event.email)
        .await
    {
        Ok(provisioned) => DeliveryOutcome::Provisioned(provisioned),
        Err(e) => {
            error!(user_id = event.user_id, error = %e, "Failed to create payment account");
            DeliveryOutcome::Failed
        }
    }
}

/// Handles deliveries one at a time until the stream ends, yields an
/// error, or `shutdown` is cancelled.
///
/// Deliveries are already acked by the time they are buffered, so after
/// cancellation every delivery that is ready is still handled; the loop only
/// stops once the stream has nothing ready or has ended.
pub async fn drain<S, E, P>(deliveries: S, provisioner: &P, shutdown: CancellationToken) -> ConsumeStats
where
    S: Stream<Item = std::result::Result<Vec<u8>, E>>,
    E: Display,
    P: AccountProvisioner + ?Sized,
{
    tokio::pin!(deliveries);
    let mut stats = ConsumeStats::default();

    loop {
        let next = tokio::select! {
            next = deliveries.next() => next,
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, handling buffered deliveries");
                flush_ready(&mut deliveries, provisioner, &mut stats).await;
                break;
            }
        };

        if !handle_next(next, provisioner, &mut stats).await {
            break;
        }
    }

    debug!(?stats, "Consumer drained");
    stats
}

// Returns false once the stream has failed or ended
async fn handle_next<E, P>(
    next: Option<std::result::Result<Vec<u8>, E>>,
    provisioner: &P,
    stats: &mut ConsumeStats,
) -> bool
where
    E: Display,
    P: AccountProvisioner + ?Sized,
{
    match next {
        Some(Ok(body)) => {
            stats.record(handle_delivery(provisioner, &body).await);
            true
        }
        Some(Err(e)) => {
            error!(error = %e, "Delivery stream failed, stopping consumer");
            false
        }
        None => {
            warn!("Delivery stream closed");
            false
        }
    }
}

async fn flush_ready<S, E, P>(deliveries: &mut S, provisioner: &P, stats: &mut ConsumeStats)
where
    S: Stream<Item = std::result::Result<Vec<u8>, E>> + Unpin,
    E: Display,
    P: AccountProvisioner + ?Sized,
{
    while let Some(next) = poll_once(deliveries.next()).await {
        if !handle_next(next, provisioner, stats).await {
            break;
        }
    }
}

/// Subscribes to the user-created queue and provisions an account per event.
///
/// Deliveries are auto-acknowledged: the broker forgets a message as soon as
/// it is handed over, so a failed decode or insert is never redelivered.
pub struct UserCreatedConsumer {
    connection: Arc<Connection>,
    queue: String,
    consumer_tag: String,
    provisioner: Arc<dyn AccountProvisioner>,
}

impl UserCreatedConsumer {
    pub fn new(connection: Arc<Connection>, queue: &str, provisioner: Arc<dyn AccountProvisioner>) -> Self {
        Self {
            connection,
            queue: queue.to_string(),
            consumer_tag: format!("payment-service-{}", uuid::Uuid::new_v4()),
            provisioner,
        }
    }

    /// Opens the consume channel and spawns the drain task.
    pub async fn start(self) -> Result<ConsumerHandle> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(RabbitMQError::channel)?;

        let consumer = channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(RabbitMQError::ConsumeError)?;

        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Started consuming");

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let provisioner = self.provisioner;
        let consumer_tag = self.consumer_tag;

        Ok(ConsumerHandle::spawn(token, async move {
            let deliveries = consumer.map(|delivery| delivery.map(|d| d.data));
            let drained = CancellationToken::new();

            // Stop the broker pushing before the loop flushes what it holds
            let stopper = async {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        if let Err(e) = channel
                            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                            .await
                        {
                            warn!(error = %e, "Failed to cancel consumer");
                        }
                        drained.cancel();
                    }
                    _ = drained.cancelled() => {}
                }
            };
            let draining = async {
                let stats = drain(deliveries, provisioner.as_ref(), drained.clone()).await;
                drained.cancel();
                stats
            };
            let ((), stats) = tokio::join!(stopper, draining);

            if channel.status().connected() {
                if let Err(e) = channel.close(200, "Consumer stopped").await {
                    warn!(error = %e, "Failed to close consumer channel");
                }
            }
            stats
        }))
    }
}

/// Owner of a running consume loop.
pub struct ConsumerHandle {
    token: CancellationToken,
    done: CancellationToken,
    task: JoinHandle<ConsumeStats>,
}

impl ConsumerHandle {
    fn spawn<F>(token: CancellationToken, consume: F) -> Self
    where
        F: Future<Output = ConsumeStats> + Send + 'static,
    {
        let done = CancellationToken::new();
        let finished = done.clone().drop_guard();
        let task = tokio::spawn(async move {
            let _finished = finished;
            consume.await
        });
        Self { token, done, task }
    }

    /// Resolves once the loop has ended, whether asked to or not.
    pub async fn stopped(&self) {
        self.done.cancelled().await
    }

    /// Stops the loop once buffered deliveries are handled and waits for it.
    pub async fn shutdown(self) -> std::result::Result<ConsumeStats, JoinError> {
        self.token.cancel();
        let stats = self.task.await?;
        info!(?stats, "Consumer stopped");
        Ok(stats)
    }
}
