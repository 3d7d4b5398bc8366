use lapin::{
    options::{QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Connection,
};
use tracing::{debug, info};

use super::errors::{RabbitMQError, Result};

pub const USER_CREATED_QUEUE: &str = "user-created-queue";
pub const USER_CREATED_ROUTING_KEY: &str = "user.created";

/// Names of the queue and binding hung off an already declared exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Topology {
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    pub fn user_created(exchange: &str) -> Self {
        Self::new(exchange, USER_CREATED_QUEUE, USER_CREATED_ROUTING_KEY)
    }

    /// Durable, shared and kept when the last consumer goes away.
    pub fn queue_options() -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: true,
            auto_delete: false,
            exclusive: false,
            ..QueueDeclareOptions::default()
        }
    }

    /// Declares the queue and binds it to the exchange.
    ///
    /// Repeating an identical declaration is a broker-side no-op. A queue
    /// that already exists with different arguments makes the broker close
    /// the channel, which surfaces here as `TopologyError`.
    #[tracing::instrument(skip(self, connection), fields(queue = %self.queue, routing_key = %self.routing_key), err)]
    pub async fn bind(&self, connection: &Connection) -> Result<()> {
        let channel = connection
            .create_channel()
            .await
            .map_err(RabbitMQError::channel)?;

        let queue = channel
            .queue_declare(&self.queue, Self::queue_options(), FieldTable::default())
            .await
            .map_err(|e| RabbitMQError::topology("queue", &self.queue, e))?;

        debug!(
            queue = %self.queue,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Queue declared"
        );

        channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                &self.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::topology("binding", &self.routing_key, e))?;

        channel
            .close(200, "Topology declared")
            .await
            .map_err(RabbitMQError::channel)?;

        info!(
            "Queue '{}' bound to exchange '{}' with routing key '{}'",
            self.queue, self.exchange, self.routing_key
        );
        Ok(())
    }
}
