// src/rabbitmq/transport.rs
// The broker operations the pub/sub layer consumes. The lapin client and the
// in-memory broker both implement these.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::channel_manager::QueueAttributes;
use super::consumer::AckDecision;
use super::envelope::Envelope;
use super::errors::TransportFault;

/// Deliveries pushed by the broker for one consumer. The stream ends when
/// the consumer is cancelled or its channel/connection closes.
pub type DeliveryFeed<D> = BoxStream<'static, Result<D, TransportFault>>;

/// Result of a successful queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> Result<Self::Channel, TransportFault>;
}

#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    type Delivery: InboundDelivery;

    async fn declare_queue(
        &self,
        queue: &str,
        attributes: &QueueAttributes,
    ) -> Result<QueueHandle, TransportFault>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportFault>;

    /// Sends with `mandatory` and `immediate` both off; unroutable messages
    /// are dropped by the broker.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), TransportFault>;

    /// Limit on unacknowledged deliveries for consumers on this channel.
    /// Zero means unlimited.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportFault>;

    /// Registers a manual-acknowledgment consumer on `queue`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryFeed<Self::Delivery>, TransportFault>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportFault>;

    async fn close(&self) -> Result<(), TransportFault>;
}

#[async_trait]
pub trait InboundDelivery: Send + Sync + 'static {
    fn delivery_tag(&self) -> u64;

    fn routing_key(&self) -> &str;

    fn redelivered(&self) -> bool;

    fn content_type(&self) -> Option<&str>;

    fn payload(&self) -> &[u8];

    /// Finalizes the broker-side state of this delivery.
    async fn settle(&self, decision: AckDecision) -> Result<(), TransportFault>;
}
