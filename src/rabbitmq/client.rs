// src/rabbitmq/client.rs
// Typed publish/subscribe over one shared broker connection.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use super::channel_manager::{Binding, BindingManager};
use super::consumer::{subscribe_json, Handler, Subscription, SubscriptionOptions};
use super::errors::{Result, SetupError};
use super::publisher::publish_json;
use super::transport::{BrokerConnection, QueueHandle};

pub struct PubSub<C: BrokerConnection> {
    bindings: BindingManager<C>,
    options: SubscriptionOptions,
}

impl<C: BrokerConnection> Clone for PubSub<C> {
    fn clone(&self) -> Self {
        Self {
            bindings: self.bindings.clone(),
            options: self.options.clone(),
        }
    }
}

impl<C: BrokerConnection> PubSub<C> {
    pub fn new(
        connection: Arc<C>,
        dead_letter_exchange: impl Into<String>,
        options: SubscriptionOptions,
    ) -> Self {
        Self {
            bindings: BindingManager::new(connection, dead_letter_exchange),
            options,
        }
    }

    pub fn bindings(&self) -> &BindingManager<C> {
        &self.bindings
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    pub async fn declare_and_bind(
        &self,
        binding: &Binding,
    ) -> std::result::Result<(C::Channel, QueueHandle), SetupError> {
        self.bindings.declare_and_bind(binding).await
    }

    /// A channel for one publishing context. Channels are not shared
    /// between concurrent publishers.
    pub async fn publish_channel(&self) -> std::result::Result<C::Channel, SetupError> {
        self.bindings.open_channel().await
    }

    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        channel: &C::Channel,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<()> {
        publish_json(channel, exchange, routing_key, value).await
    }

    pub async fn subscribe_json<T, H>(
        &self,
        binding: &Binding,
        handler: H,
    ) -> std::result::Result<Subscription<H>, SetupError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        subscribe_json(&self.bindings, &self.options, binding, handler).await
    }
}
