// src/rabbitmq/mod.rs
// Broker side of the payment service: connection, topology, consumer, publisher

pub mod errors;
pub mod connection;
pub mod topology;
pub mod consumer;
pub mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use connection::{ConnectionManager, RetryPolicy};
pub use consumer::{ConsumeStats, ConsumerHandle, UserCreatedConsumer};
pub use errors::{RabbitMQError, Result};
pub use publisher::{ChannelSource, Publisher};
pub use topology::{Topology, USER_CREATED_QUEUE, USER_CREATED_ROUTING_KEY};
