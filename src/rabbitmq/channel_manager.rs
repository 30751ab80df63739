// src/rabbitmq/channel_manager.rs
// Declares queues and binds them to exchanges.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use super::errors::SetupError;
use super::transport::{BrokerChannel, BrokerConnection, QueueHandle};

/// Queue argument naming the exchange that receives rejected or expired messages.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Lifetime policy of a queue, fixed at declaration time. Redeclaring a
/// queue with a different mode is rejected by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityMode {
    /// Non-durable, exclusive to the declaring connection, deleted when the
    /// last consumer goes away.
    Transient,
    /// Survives broker restarts, shared, never auto-deleted.
    Durable,
}

impl DurabilityMode {
    pub fn queue_attributes(self, dead_letter_exchange: &str) -> QueueAttributes {
        let dead_letter_exchange = Some(dead_letter_exchange.to_string());
        match self {
            DurabilityMode::Transient => QueueAttributes {
                durable: false,
                auto_delete: true,
                exclusive: true,
                dead_letter_exchange,
            },
            DurabilityMode::Durable => QueueAttributes {
                durable: true,
                auto_delete: false,
                exclusive: false,
                dead_letter_exchange,
            },
        }
    }
}

impl fmt::Display for DurabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurabilityMode::Transient => f.write_str("transient"),
            DurabilityMode::Durable => f.write_str("durable"),
        }
    }
}

impl FromStr for DurabilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "transient" => Ok(DurabilityMode::Transient),
            "durable" => Ok(DurabilityMode::Durable),
            other => Err(format!("unknown durability mode '{}'", other)),
        }
    }
}

/// Declaration attributes derived from a [`DurabilityMode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAttributes {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub dead_letter_exchange: Option<String>,
}

/// Exchange, queue and routing key plus the queue's durability mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub mode: DurabilityMode,
}

impl Binding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        mode: DurabilityMode,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            mode,
        }
    }

    fn validate(&self) -> Result<(), SetupError> {
        if self.exchange.trim().is_empty() {
            return Err(SetupError::InvalidBinding(format!(
                "exchange name is empty for queue '{}'",
                self.queue
            )));
        }
        if self.queue.trim().is_empty() {
            return Err(SetupError::InvalidBinding(format!(
                "queue name is empty for exchange '{}'",
                self.exchange
            )));
        }
        Ok(())
    }
}

/// Provisions channels, queues and bindings on a shared connection.
pub struct BindingManager<C: BrokerConnection> {
    connection: Arc<C>,
    dead_letter_exchange: String,
}

impl<C: BrokerConnection> Clone for BindingManager<C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            dead_letter_exchange: self.dead_letter_exchange.clone(),
        }
    }
}

impl<C: BrokerConnection> BindingManager<C> {
    pub fn new(connection: Arc<C>, dead_letter_exchange: impl Into<String>) -> Self {
        let dead_letter_exchange = dead_letter_exchange.into();
        debug!(dead_letter_exchange = %dead_letter_exchange, "Creating binding manager");
        Self {
            connection,
            dead_letter_exchange,
        }
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    /// Opens a fresh channel without declaring anything on it.
    pub async fn open_channel(&self) -> Result<C::Channel, SetupError> {
        self.connection
            .open_channel()
            .await
            .map_err(SetupError::ChannelError)
    }

    /// Opens a channel, declares the queue with the attributes of
    /// `binding.mode` and binds it to the exchange. Calling this again with
    /// the same binding leaves broker state unchanged.
    pub async fn declare_and_bind(
        &self,
        binding: &Binding,
    ) -> Result<(C::Channel, QueueHandle), SetupError> {
        binding.validate()?;

        let channel = self.open_channel().await?;
        let attributes = binding.mode.queue_attributes(&self.dead_letter_exchange);

        debug!(
            queue = %binding.queue,
            mode = %binding.mode,
            durable = attributes.durable,
            exclusive = attributes.exclusive,
            auto_delete = attributes.auto_delete,
            "Declaring queue"
        );
        let queue = channel
            .declare_queue(&binding.queue, &attributes)
            .await
            .map_err(|source| SetupError::DeclarationError {
                queue: binding.queue.clone(),
                source,
            })?;

        channel
            .bind_queue(&binding.queue, &binding.exchange, &binding.routing_key)
            .await
            .map_err(|source| SetupError::BindError {
                queue: binding.queue.clone(),
                exchange: binding.exchange.clone(),
                routing_key: binding.routing_key.clone(),
                source,
            })?;

        info!(
            exchange = %binding.exchange,
            queue = %queue.name,
            routing_key = %binding.routing_key,
            mode = %binding.mode,
            "Queue declared and bound"
        );

        Ok((channel, queue))
    }
}
