//! In-process broker implementing the transport traits.
//!
//! Follows the AMQP 0-9-1 behaviour the pub/sub layer relies on: direct,
//! topic and fanout routing, queue equivalence checks on redeclaration,
//! exclusive queues, auto-delete, per-channel prefetch, manual
//! acknowledgment, requeue and dead-lettering. Channel-level errors close the
//! channel the same way RabbitMQ does.

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::channel_manager::{QueueAttributes, DEAD_LETTER_EXCHANGE_ARG};
use super::consumer::AckDecision;
use super::envelope::Envelope;
use super::errors::TransportFault;
use super::transport::{BrokerChannel, BrokerConnection, DeliveryFeed, InboundDelivery, QueueHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

type FeedSender = UnboundedSender<Result<MemoryDelivery, TransportFault>>;

#[derive(Debug, Clone)]
struct QueuedMessage {
    routing_key: String,
    envelope: Envelope,
    redelivered: bool,
}

struct QueueState {
    attributes: QueueAttributes,
    owner: Option<u64>,
    messages: VecDeque<QueuedMessage>,
    consumers: Vec<String>,
    next_consumer: usize,
}

struct ConsumerState {
    queue: String,
    channel_id: u64,
    sender: FeedSender,
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: QueuedMessage,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<(String, String, String)>,
    consumers: HashMap<String, ConsumerState>,
    channels: HashMap<u64, ChannelState>,
    open_connections: HashSet<u64>,
    unacked: HashMap<u64, Unacked>,
    next_id: u64,
    next_delivery_tag: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_channel(&self, channel_id: u64) -> Result<u64, TransportFault> {
        self.channels
            .get(&channel_id)
            .map(|channel| channel.connection_id)
            .ok_or_else(|| TransportFault::new(format!("channel {} is closed", channel_id)))
    }

    /// Channel-level protocol errors close the channel.
    fn channel_error(&mut self, channel_id: u64, message: String) -> TransportFault {
        debug!(channel_id, "Closing channel after error: {}", message);
        self.close_channel(channel_id);
        TransportFault::new(message)
    }

    fn route(&mut self, exchange: &str, routing_key: &str, envelope: &Envelope) -> usize {
        let targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let kind = match self.exchanges.get(exchange) {
                Some(kind) => *kind,
                None => return 0,
            };
            let mut targets: Vec<String> = self
                .bindings
                .iter()
                .filter(|(bound_exchange, _, pattern)| {
                    bound_exchange == exchange
                        && match kind {
                            ExchangeKind::Direct => pattern == routing_key,
                            ExchangeKind::Topic => topic_matches(pattern, routing_key),
                            ExchangeKind::Fanout => true,
                        }
                })
                .map(|(_, queue, _)| queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                state.messages.push_back(QueuedMessage {
                    routing_key: routing_key.to_string(),
                    envelope: envelope.clone(),
                    redelivered: false,
                });
            }
        }
        for queue in &targets {
            self.dispatch(queue);
        }
        targets.len()
    }

    fn unacked_on_channel(&self, channel_id: u64) -> usize {
        self.unacked
            .values()
            .filter(|unacked| unacked.channel_id == channel_id)
            .count()
    }

    fn has_capacity(&self, channel_id: u64) -> bool {
        match self.channels.get(&channel_id) {
            Some(channel) if channel.prefetch == 0 => true,
            Some(channel) => self.unacked_on_channel(channel_id) < channel.prefetch as usize,
            None => false,
        }
    }

    /// Pushes ready messages to consumers with spare prefetch capacity,
    /// round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let (tag, channel_id, message) = {
                let queue = match self.queues.get(queue_name) {
                    Some(queue) if !queue.messages.is_empty() && !queue.consumers.is_empty() => queue,
                    _ => return,
                };

                let count = queue.consumers.len();
                let start = queue.next_consumer % count;
                let chosen = (0..count)
                    .map(|offset| (start + offset) % count)
                    .find(|&index| {
                        self.consumers
                            .get(&queue.consumers[index])
                            .map_or(false, |consumer| self.has_capacity(consumer.channel_id))
                    });
                let index = match chosen {
                    Some(index) => index,
                    None => return,
                };
                let tag = queue.consumers[index].clone();
                let channel_id = match self.consumers.get(&tag) {
                    Some(consumer) => consumer.channel_id,
                    None => return,
                };

                let queue = match self.queues.get_mut(queue_name) {
                    Some(queue) => queue,
                    None => return,
                };
                queue.next_consumer = index + 1;
                let message = match queue.messages.pop_front() {
                    Some(message) => message,
                    None => return,
                };
                (tag, channel_id, message)
            };

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let delivery = MemoryDelivery {
                delivery_tag,
                channel_id,
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                content_type: Some(message.envelope.content_type.clone()),
                payload: message.envelope.payload.clone(),
                broker: None,
            };

            let sent = self
                .consumers
                .get(&tag)
                .map_or(false, |consumer| consumer.sender.unbounded_send(Ok(delivery)).is_ok());

            if sent {
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        channel_id,
                        queue: queue_name.to_string(),
                        message,
                    },
                );
            } else {
                // Receiver gone: the consumer is dead, put the message back.
                if let Some(queue) = self.queues.get_mut(queue_name) {
                    queue.messages.push_front(message);
                }
                self.remove_consumer(&tag);
            }
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.messages.push_front(message);
        }
    }

    fn dead_letter(&mut self, unacked: Unacked) {
        let exchange = self
            .queues
            .get(&unacked.queue)
            .and_then(|queue| queue.attributes.dead_letter_exchange.clone());

        match exchange {
            Some(exchange) if self.exchanges.contains_key(&exchange) => {
                let routed = self.route(&exchange, &unacked.message.routing_key, &unacked.message.envelope);
                debug!(queue = %unacked.queue, %exchange, routed, "Dead-lettered message");
            }
            _ => debug!(queue = %unacked.queue, "Dropped rejected message"),
        }
    }

    fn remove_consumer(&mut self, consumer_tag: &str) {
        let consumer = match self.consumers.remove(consumer_tag) {
            Some(consumer) => consumer,
            None => return,
        };
        // Dropping the sender ends the consumer's feed.
        drop(consumer.sender);

        let delete = match self.queues.get_mut(&consumer.queue) {
            Some(queue) => {
                queue.consumers.retain(|tag| tag != consumer_tag);
                queue.attributes.auto_delete && queue.consumers.is_empty()
            }
            None => false,
        };
        if delete {
            debug!(queue = %consumer.queue, "Auto-deleting queue after last consumer left");
            self.delete_queue(&consumer.queue);
        }
    }

    fn delete_queue(&mut self, queue_name: &str) {
        self.queues.remove(queue_name);
        self.bindings.retain(|(_, queue, _)| queue != queue_name);
        let consumers: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.queue == queue_name)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in consumers {
            self.consumers.remove(&tag);
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        if self.channels.remove(&channel_id).is_none() {
            return;
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so that pushing to the front restores the original order.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        let mut touched = HashSet::new();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                touched.insert(unacked.queue.clone());
                self.requeue(unacked);
            }
        }

        let consumers: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.channel_id == channel_id)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in consumers {
            self.remove_consumer(&tag);
        }

        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        if !self.open_connections.remove(&connection_id) {
            return;
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }
    }
}

/// Shared broker state. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Exchange topology is provisioned outside the pub/sub layer; tests set
    /// it up here.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        self.lock().exchanges.insert(name.to_string(), kind);
    }

    /// Binds outside of any client connection, e.g. a dead-letter queue to
    /// its exchange.
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str, attributes: QueueAttributes) {
        let mut state = self.lock();
        state.queues.entry(queue.to_string()).or_insert_with(|| QueueState {
            attributes,
            owner: None,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        });
        state
            .bindings
            .insert((exchange.to_string(), queue.to_string(), routing_key.to_string()));
    }

    pub fn connect(&self) -> MemoryConnection {
        let mut state = self.lock();
        let id = state.next_id();
        state.open_connections.insert(id);
        MemoryConnection {
            id,
            broker: self.clone(),
        }
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Messages ready for delivery, not counting unacknowledged ones.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|queue| queue.messages.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .unacked
            .values()
            .filter(|unacked| unacked.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    pub fn binding_count(&self, queue: &str) -> usize {
        self.lock()
            .bindings
            .iter()
            .filter(|(_, bound, _)| bound == queue)
            .count()
    }

    /// Ready messages of a queue, oldest first.
    pub fn peek(&self, queue: &str) -> Vec<Envelope> {
        self.lock()
            .queues
            .get(queue)
            .map(|queue| queue.messages.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    fn settle(&self, channel_id: u64, delivery_tag: u64, decision: AckDecision) -> Result<(), TransportFault> {
        let mut state = self.lock();
        state.check_channel(channel_id)?;

        let owned_here = state
            .unacked
            .get(&delivery_tag)
            .map_or(false, |unacked| unacked.channel_id == channel_id);
        let unacked = if owned_here {
            state.unacked.remove(&delivery_tag)
        } else {
            None
        };
        let unacked = match unacked {
            Some(unacked) => unacked,
            None => {
                return Err(state.channel_error(
                    channel_id,
                    format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
                ))
            }
        };

        let queue = unacked.queue.clone();
        match decision {
            AckDecision::Ack => {}
            AckDecision::NackRequeue => state.requeue(unacked),
            AckDecision::NackDiscard => state.dead_letter(unacked),
        }
        state.dispatch(&queue);
        Ok(())
    }
}

pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Closes every channel of this connection and deletes its exclusive queues.
    pub fn close(&self) {
        self.broker.lock().close_connection(self.id);
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel, TransportFault> {
        let mut state = self.broker.lock();
        if !state.open_connections.contains(&self.id) {
            return Err(TransportFault::new(format!("connection {} is closed", self.id)));
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
            },
        );
        Ok(MemoryChannel {
            id,
            broker: self.broker.clone(),
        })
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.id)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    type Delivery = MemoryDelivery;

    async fn declare_queue(
        &self,
        queue: &str,
        attributes: &QueueAttributes,
    ) -> Result<QueueHandle, TransportFault> {
        let mut state = self.broker.lock();
        let connection_id = state.check_channel(self.id)?;

        let conflict = match state.queues.get(queue) {
            Some(existing) if existing.owner.is_some() && existing.owner != Some(connection_id) => Some(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                queue
            )),
            Some(existing) if existing.attributes != *attributes => Some(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}' (durable={}, exclusive={}, auto_delete={}, {}={:?})",
                queue,
                existing.attributes.durable,
                existing.attributes.exclusive,
                existing.attributes.auto_delete,
                DEAD_LETTER_EXCHANGE_ARG,
                existing.attributes.dead_letter_exchange
            )),
            _ => None,
        };
        if let Some(message) = conflict {
            return Err(state.channel_error(self.id, message));
        }

        let entry = state.queues.entry(queue.to_string()).or_insert_with(|| QueueState {
            attributes: attributes.clone(),
            owner: attributes.exclusive.then_some(connection_id),
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        });

        Ok(QueueHandle {
            name: queue.to_string(),
            message_count: entry.messages.len() as u32,
            consumer_count: entry.consumers.len() as u32,
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportFault> {
        let mut state = self.broker.lock();
        state.check_channel(self.id)?;

        if !state.exchanges.contains_key(exchange) {
            return Err(state.channel_error(self.id, format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(state.channel_error(self.id, format!("NOT_FOUND - no queue '{}'", queue)));
        }

        state
            .bindings
            .insert((exchange.to_string(), queue.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), TransportFault> {
        let mut state = self.broker.lock();
        state.check_channel(self.id)?;

        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(state.channel_error(self.id, format!("NOT_FOUND - no exchange '{}'", exchange)));
        }

        let routed = state.route(exchange, routing_key, envelope);
        if routed == 0 {
            debug!(exchange, routing_key, "Dropped unroutable message");
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportFault> {
        let mut state = self.broker.lock();
        match state.channels.get_mut(&self.id) {
            Some(channel) => {
                channel.prefetch = count;
                Ok(())
            }
            None => Err(TransportFault::new(format!("channel {} is closed", self.id))),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryFeed<MemoryDelivery>, TransportFault> {
        let mut state = self.broker.lock();
        let connection_id = state.check_channel(self.id)?;

        let owner = match state.queues.get(queue) {
            Some(existing) => existing.owner,
            None => return Err(state.channel_error(self.id, format!("NOT_FOUND - no queue '{}'", queue))),
        };
        if owner.is_some() && owner != Some(connection_id) {
            return Err(state.channel_error(
                self.id,
                format!("RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'", queue),
            ));
        }
        if state.consumers.contains_key(consumer_tag) {
            return Err(state.channel_error(
                self.id,
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", consumer_tag),
            ));
        }

        let (sender, receiver) = mpsc::unbounded();
        state.consumers.insert(
            consumer_tag.to_string(),
            ConsumerState {
                queue: queue.to_string(),
                channel_id: self.id,
                sender,
            },
        );
        if let Some(existing) = state.queues.get_mut(queue) {
            existing.consumers.push(consumer_tag.to_string());
        }
        state.dispatch(queue);
        drop(state);

        let broker = self.broker.clone();
        Ok(receiver
            .map(move |delivery| {
                delivery.map(|mut delivery: MemoryDelivery| {
                    delivery.broker = Some(broker.clone());
                    delivery
                })
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportFault> {
        let mut state = self.broker.lock();
        state.check_channel(self.id)?;
        state.remove_consumer(consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportFault> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}

pub struct MemoryDelivery {
    delivery_tag: u64,
    channel_id: u64,
    routing_key: String,
    redelivered: bool,
    content_type: Option<String>,
    payload: Vec<u8>,
    broker: Option<MemoryBroker>,
}

#[async_trait]
impl InboundDelivery for MemoryDelivery {
    fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn settle(&self, decision: AckDecision) -> Result<(), TransportFault> {
        match &self.broker {
            Some(broker) => broker.settle(self.channel_id, self.delivery_tag, decision),
            None => Err(TransportFault::new("delivery is detached from its broker")),
        }
    }
}
