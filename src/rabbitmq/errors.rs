// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::task::JoinError;

/// A failure reported by the broker transport, carried as text so that the
/// lapin-backed and in-memory transports share one error shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportFault(pub String);

impl TransportFault {
    pub fn new(message: impl Into<String>) -> Self {
        TransportFault(message.into())
    }
}

impl From<LapinError> for TransportFault {
    fn from(error: LapinError) -> Self {
        TransportFault(error.to_string())
    }
}

/// Failures while provisioning a binding or registering a consumer.
/// None of these are retried at this layer.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Invalid binding: {0}")]
    InvalidBinding(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(TransportFault),

    #[error("Queue declaration rejected for '{queue}': {source}")]
    DeclarationError {
        queue: String,
        #[source]
        source: TransportFault,
    },

    #[error("Queue bind rejected for '{queue}' -> '{exchange}' ({routing_key}): {source}")]
    BindError {
        queue: String,
        exchange: String,
        routing_key: String,
        #[source]
        source: TransportFault,
    },

    #[error("Failed to apply prefetch limit on '{queue}': {source}")]
    QosError {
        queue: String,
        #[source]
        source: TransportFault,
    },

    #[error("RabbitMQ consume error on '{queue}': {source}")]
    ConsumeError {
        queue: String,
        #[source]
        source: TransportFault,
    },
}

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    TransportError(TransportFault),

    #[error("Message deserialization error: {0}")]
    DeliveryDecodeError(String),

    #[error("Invalid publishing routing key '{0}'")]
    InvalidRoutingKey(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(TransportFault),

    #[error("Subscription task failed: {0}")]
    SubscriptionTask(String),
}

// Custom Result type for pub/sub operations
pub type Result<T> = std::result::Result<T, PubSubError>;

impl From<JoinError> for PubSubError {
    fn from(error: JoinError) -> Self {
        PubSubError::SubscriptionTask(error.to_string())
    }
}

impl PubSubError {
    /// Setup-phase failures abort the requested operation; everything else
    /// is reported per call or per message.
    pub fn is_setup(&self) -> bool {
        matches!(self, PubSubError::Setup(_))
    }
}
