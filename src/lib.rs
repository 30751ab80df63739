//! Peril pub/sub - typed publish/subscribe over RabbitMQ with
//! outcome-driven acknowledgment for the Peril game server and clients.

pub mod config;
pub mod env;
pub mod game;
pub mod models;
pub mod rabbitmq;

pub use config::{PerilConfig, RoutingConfig};
pub use rabbitmq::{
    AckDecision, Binding, DurabilityMode, Handler, PubSub, PubSubError, SetupError, Subscription,
};
