//! Provisions a payment account for every `user.created` event seen on the
//! broker, and publishes domain events back onto it.
//!
//! Startup wires the pieces in order: [`rabbitmq::ConnectionManager`] dials
//! the broker and declares the exchange, [`rabbitmq::Topology`] declares and
//! binds the queue, and [`rabbitmq::UserCreatedConsumer`] drains it into an
//! [`payments::AccountProvisioner`]. [`rabbitmq::Publisher`] shares the same
//! connection for outbound events.

pub mod config;
pub mod models;
pub mod payments;
pub mod rabbitmq;

#[cfg(test)]
mod test_tools;
