use async_trait::async_trait;
use futures::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel_manager::{Binding, BindingManager};
use super::envelope::decode_payload;
use super::errors::{PubSubError, Result, SetupError};
use super::transport::{BrokerChannel, BrokerConnection, DeliveryFeed, InboundDelivery};

/// What to do with a delivered message once its handler has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckDecision {
    /// Remove the message from the queue for good.
    Ack,
    /// Drop the message, or dead-letter it if the queue has a dead-letter exchange.
    NackDiscard,
    /// Put the message back for immediate redelivery.
    NackRequeue,
}

/// Domain-side processing of one decoded message. The handler owns its
/// state; the consumption loop calls it one message at a time.
#[async_trait]
pub trait Handler<T: Send + 'static>: Send + 'static {
    async fn handle(&mut self, value: T) -> AckDecision;
}

#[async_trait]
impl<T, F> Handler<T> for F
where
    T: Send + 'static,
    F: FnMut(T) -> AckDecision + Send + 'static,
{
    async fn handle(&mut self, value: T) -> AckDecision {
        (self)(value)
    }
}

/// Consumer-side settings applied to every subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Unacknowledged deliveries allowed in flight per subscription (0 means unlimited)
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    #[serde(default = "default_consumer_tag_prefix")]
    pub consumer_tag_prefix: String,
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_consumer_tag_prefix() -> String {
    "peril".to_string()
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            prefetch_count: default_prefetch_count(),
            consumer_tag_prefix: default_consumer_tag_prefix(),
        }
    }
}

/// Per-subscription counters. Steady-state failures never leave the
/// consumption loop, so this is where they show up.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    delivered: AtomicU64,
    acked: AtomicU64,
    discarded: AtomicU64,
    requeued: AtomicU64,
    decode_failures: AtomicU64,
    settle_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub acked: u64,
    pub discarded: u64,
    pub requeued: u64,
    pub decode_failures: u64,
    pub settle_failures: u64,
}

impl SubscriptionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
        }
    }

    fn record_settled(&self, decision: AckDecision) {
        let counter = match decision {
            AckDecision::Ack => &self.acked,
            AckDecision::NackDiscard => &self.discarded,
            AckDecision::NackRequeue => &self.requeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to a running consumption loop.
///
/// Dropping it detaches the loop, which then runs until its channel or
/// connection closes.
pub struct Subscription<H> {
    queue: String,
    consumer_tag: String,
    stats: Arc<SubscriptionStats>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<H>,
}

impl<H> Subscription<H> {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the consumer, closes its channel and waits for the loop to
    /// exit. Deliveries not yet settled go back to the queue. Returns the
    /// handler with whatever state it accumulated.
    pub async fn stop(self) -> Result<H> {
        Ok(self.stop_with_stats().await?.0)
    }

    /// Like [`Subscription::stop`], also returning the counters as they
    /// stand once the loop has exited.
    pub async fn stop_with_stats(mut self) -> Result<(H, StatsSnapshot)> {
        if let Some(shutdown) = self.shutdown.take() {
            // The loop may already be gone if the feed closed first.
            let _ = shutdown.send(());
        }
        let handler = self.task.await?;
        let stats = self.stats.snapshot();
        info!(
            queue = %self.queue,
            consumer_tag = %self.consumer_tag,
            delivered = stats.delivered,
            "Subscription stopped"
        );
        Ok((handler, stats))
    }

    /// Waits for the delivery feed to close on its own.
    pub async fn join(mut self) -> Result<H> {
        // Keep the sender alive so waiting here is not mistaken for a detach.
        let _shutdown = self.shutdown.take();
        Ok(self.task.await?)
    }
}

struct LoopContext<T> {
    queue: String,
    consumer_tag: String,
    stats: Arc<SubscriptionStats>,
    _message: PhantomData<fn() -> T>,
}

/// Declares and binds the queue, applies the prefetch limit, registers a
/// manual-ack consumer and spawns the consumption loop. Every failure here
/// is returned to the caller; nothing is retried.
pub async fn subscribe_json<C, T, H>(
    bindings: &BindingManager<C>,
    options: &SubscriptionOptions,
    binding: &Binding,
    handler: H,
) -> std::result::Result<Subscription<H>, SetupError>
where
    C: BrokerConnection,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let (channel, queue) = bindings.declare_and_bind(binding).await?;

    if options.prefetch_count == 0 {
        warn!(queue = %queue.name, "Subscribing without a prefetch limit");
    }
    if let Err(source) = channel.set_prefetch(options.prefetch_count).await {
        close_quietly(&channel, &queue.name).await;
        return Err(SetupError::QosError {
            queue: queue.name,
            source,
        });
    }

    let consumer_tag = format!("{}-{}", options.consumer_tag_prefix, Uuid::new_v4());
    let feed = match channel.consume(&queue.name, &consumer_tag).await {
        Ok(feed) => feed,
        Err(source) => {
            close_quietly(&channel, &queue.name).await;
            return Err(SetupError::ConsumeError {
                queue: queue.name,
                source,
            });
        }
    };

    info!(
        queue = %queue.name,
        consumer_tag = %consumer_tag,
        prefetch = options.prefetch_count,
        "Started consuming"
    );

    let stats = Arc::new(SubscriptionStats::default());
    let context = LoopContext::<T> {
        queue: queue.name.clone(),
        consumer_tag: consumer_tag.clone(),
        stats: stats.clone(),
        _message: PhantomData,
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(consume_loop(channel, feed, handler, context, shutdown_rx));

    Ok(Subscription {
        queue: queue.name,
        consumer_tag,
        stats,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn close_quietly<Ch: BrokerChannel>(channel: &Ch, queue: &str) {
    if let Err(e) = channel.close().await {
        warn!(queue, "Failed to close channel after setup failure: {}", e);
    }
}

async fn consume_loop<Ch, T, H>(
    channel: Ch,
    mut feed: DeliveryFeed<Ch::Delivery>,
    mut handler: H,
    context: LoopContext<T>,
    mut shutdown: oneshot::Receiver<()>,
) -> H
where
    Ch: BrokerChannel,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let mut detached = false;

    loop {
        tokio::select! {
            biased;

            signal = &mut shutdown, if !detached => match signal {
                Ok(()) => {
                    if let Err(e) = channel.cancel(&context.consumer_tag).await {
                        warn!(queue = %context.queue, "Failed to cancel consumer: {}", e);
                    }
                    if let Err(e) = channel.close().await {
                        warn!(queue = %context.queue, "Failed to close channel: {}", e);
                    }
                    break;
                }
                Err(_) => {
                    debug!(queue = %context.queue, "Subscription handle dropped, consuming until the channel closes");
                    detached = true;
                }
            },

            next = feed.next() => match next {
                Some(Ok(delivery)) => {
                    process_delivery(&delivery, &mut handler, &context).await;
                    // A requeued delivery can be ready again at once; let other tasks run.
                    tokio::task::yield_now().await;
                }
                Some(Err(e)) => {
                    error!(queue = %context.queue, "Error receiving message: {}", e);
                    break;
                }
                None => {
                    info!(queue = %context.queue, "Delivery feed closed");
                    break;
                }
            },
        }
    }

    handler
}

async fn process_delivery<D, T, H>(delivery: &D, handler: &mut H, context: &LoopContext<T>)
where
    D: InboundDelivery,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let delivery_tag = delivery.delivery_tag();
    context.stats.delivered.fetch_add(1, Ordering::Relaxed);

    let decision = match decode_payload::<T>(delivery.content_type(), delivery.payload()) {
        Ok(value) => handler.handle(value).await,
        Err(e) => {
            context.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                queue = %context.queue,
                delivery_tag,
                routing_key = %delivery.routing_key(),
                "Discarding undecodable delivery: {}",
                e
            );
            AckDecision::NackDiscard
        }
    };

    match delivery.settle(decision).await {
        Ok(()) => {
            context.stats.record_settled(decision);
            debug!(
                queue = %context.queue,
                delivery_tag,
                redelivered = delivery.redelivered(),
                ?decision,
                "Delivery settled"
            );
        }
        Err(fault) => {
            context.stats.settle_failures.fetch_add(1, Ordering::Relaxed);
            let e = PubSubError::AckError(fault);
            error!(queue = %context.queue, delivery_tag, ?decision, "{}", e);
        }
    }
}
