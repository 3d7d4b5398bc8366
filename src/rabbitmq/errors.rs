// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    /// The broker stayed unreachable for the whole retry budget.
    #[error("RabbitMQ unreachable after {attempts} attempts: {source}")]
    ConnectionError {
        attempts: u32,
        #[source]
        source: LapinError,
    },

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    /// A declaration conflicted with what the broker already holds.
    #[error("RabbitMQ topology error declaring {entity} '{name}': {source}")]
    TopologyError {
        entity: &'static str,
        name: String,
        #[source]
        source: LapinError,
    },

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(#[source] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(#[source] LapinError),

    #[error("Broker nacked message published with routing key '{0}'")]
    PublishRejected(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(#[source] LapinError),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    pub(crate) fn channel(error: LapinError) -> Self {
        RabbitMQError::ChannelError(error.to_string())
    }

    pub(crate) fn topology(entity: &'static str, name: &str, source: LapinError) -> Self {
        RabbitMQError::TopologyError {
            entity,
            name: name.to_string(),
            source,
        }
    }

    /// Errors that leave the broker unusable or the topology unsafe to consume from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError { .. } | RabbitMQError::TopologyError { .. }
        )
    }
}
