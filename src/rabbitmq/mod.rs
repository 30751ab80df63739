// src/rabbitmq/mod.rs
// Typed publish/subscribe with outcome-driven acknowledgment

pub mod amqp_client;
pub mod channel_manager;
pub mod client;
pub mod consumer;
pub mod envelope;
pub mod errors;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod publisher;
pub mod transport;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{connect, AmqpChannel, AmqpConnection};
pub use channel_manager::{Binding, BindingManager, DurabilityMode, QueueAttributes};
pub use client::PubSub;
pub use consumer::{AckDecision, Handler, StatsSnapshot, Subscription, SubscriptionOptions};
pub use envelope::{Envelope, JSON_CONTENT_TYPE};
pub use errors::{PubSubError, Result, SetupError, TransportFault};
pub use publisher::publish_json;
pub use transport::{BrokerChannel, BrokerConnection, InboundDelivery, QueueHandle};
