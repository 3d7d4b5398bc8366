use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    BasicProperties, Channel, Connection,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};
use super::topology::USER_CREATED_ROUTING_KEY;
use crate::models::UserCreated;

/// AMQP delivery mode 2: the broker writes the message to disk.
pub const PERSISTENT: u8 = 2;

/// Anything that can hand out fresh channels.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn open_channel(&self) -> lapin::Result<Channel>;
}

#[async_trait]
impl ChannelSource for Connection {
    async fn open_channel(&self) -> lapin::Result<Channel> {
        self.create_channel().await
    }
}

/// Closes the wrapped channel when dropped unless `close` already ran.
struct ScopedChannel {
    channel: Channel,
    closed: bool,
}

impl ScopedChannel {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            closed: false,
        }
    }

    async fn close(mut self) {
        self.closed = true;
        if let Err(e) = self.channel.close(200, "Publish done").await {
            debug!(error = %e, "Publish channel close failed");
        }
    }
}

impl Drop for ScopedChannel {
    fn drop(&mut self) {
        // Only reached when the publish future was dropped mid-flight
        if !self.closed {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let channel = self.channel.clone();
                handle.spawn(async move {
                    let _ = channel.close(200, "Publish abandoned").await;
                });
            }
        }
    }
}

pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

pub fn message_properties() -> BasicProperties {
    BasicProperties::default()
        .with_message_id(Uuid::new_v4().to_string().into())
        .with_content_type("application/json".into())
        .with_delivery_mode(PERSISTENT)
        .with_timestamp(chrono::Utc::now().timestamp() as u64)
}

/// Publishes JSON events to one exchange, one channel per call.
///
/// Publishing is neither mandatory nor immediate: a message no queue is bound
/// for is dropped by the broker without telling the caller. Retrying is left
/// to the caller.
pub struct Publisher<C: ChannelSource = Connection> {
    connection: Arc<C>,
    exchange: String,
}

impl<C: ChannelSource> Publisher<C> {
    pub fn new(connection: Arc<C>, exchange: &str) -> Self {
        Publisher {
            connection,
            exchange: exchange.to_string(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    #[tracing::instrument(skip(self, payload), fields(exchange = %self.exchange), err)]
    pub async fn publish<T: Serialize + ?Sized>(&self, routing_key: &str, payload: &T) -> Result<()> {
        // Nothing reaches the broker if the payload does not serialize
        let body = encode(payload)?;

        let channel = self
            .connection
            .open_channel()
            .await
            .map(ScopedChannel::new)
            .map_err(RabbitMQError::channel)?;

        let result = self.publish_on(&channel.channel, routing_key, &body).await;
        channel.close().await;

        if result.is_ok() {
            info!(
                "Published event {} to exchange '{}': {}",
                routing_key,
                self.exchange,
                String::from_utf8_lossy(&body)
            );
        }
        result
    }

    pub async fn publish_user_created(&self, event: &UserCreated) -> Result<()> {
        self.publish(USER_CREATED_ROUTING_KEY, event).await
    }

    async fn publish_on(&self, channel: &Channel, routing_key: &str, body: &[u8]) -> Result<()> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(RabbitMQError::channel)?;

        let confirmation = channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                body,
                message_properties(),
            )
            .await
            .map_err(RabbitMQError::PublishError)?
            .await
            .map_err(RabbitMQError::PublishError)?;

        if confirmation.is_nack() {
            warn!(routing_key, "Broker nacked published message");
            return Err(RabbitMQError::PublishRejected(routing_key.to_string()));
        }
        Ok(())
    }
}
