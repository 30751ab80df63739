// End-to-end pub/sub behaviour against the in-process broker.

use async_trait::async_trait;
use futures::StreamExt;
use peril_pubsub::models::{GameLog, PlayingState};
use peril_pubsub::rabbitmq::memory::{topic_matches, ExchangeKind, MemoryBroker, MemoryConnection};
use peril_pubsub::rabbitmq::{
    AckDecision, Binding, BrokerChannel, BrokerConnection, DurabilityMode, Envelope, Handler,
    InboundDelivery, PubSub, PubSubError, QueueAttributes, SetupError, SubscriptionOptions,
    JSON_CONTENT_TYPE,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

const DIRECT: &str = "peril_direct";
const TOPIC: &str = "peril_topic";
const DLX: &str = "peril_dlx";
const DLQ: &str = "peril_dlq";

fn test_broker() -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.declare_exchange(DIRECT, ExchangeKind::Direct);
    broker.declare_exchange(TOPIC, ExchangeKind::Topic);
    broker.declare_exchange(DLX, ExchangeKind::Fanout);
    broker.bind(
        DLQ,
        DLX,
        "",
        QueueAttributes {
            durable: true,
            auto_delete: false,
            exclusive: false,
            dead_letter_exchange: None,
        },
    );
    broker
}

fn pubsub_on(broker: &MemoryBroker) -> (Arc<MemoryConnection>, PubSub<MemoryConnection>) {
    let connection = Arc::new(broker.connect());
    let pubsub = PubSub::new(connection.clone(), DLX, SubscriptionOptions::default());
    (connection, pubsub)
}

fn pause_binding(username: &str) -> Binding {
    Binding::new(DIRECT, format!("pause.{}", username), "pause", DurabilityMode::Transient)
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Collects every value and answers with a fixed decision.
struct Recorder<T> {
    seen: Vec<T>,
    decision: AckDecision,
}

impl<T> Recorder<T> {
    fn new(decision: AckDecision) -> Self {
        Self {
            seen: Vec::new(),
            decision,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Handler<T> for Recorder<T> {
    async fn handle(&mut self, value: T) -> AckDecision {
        self.seen.push(value);
        self.decision
    }
}

#[tokio::test]
async fn declare_and_bind_is_idempotent() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);

    for (queue, mode) in [
        ("game_logs", DurabilityMode::Durable),
        ("pause.alice", DurabilityMode::Transient),
    ] {
        let binding = Binding::new(TOPIC, queue, "game_logs.*", mode);

        let (_, first) = pubsub.declare_and_bind(&binding).await.unwrap();
        let (_, second) = pubsub.declare_and_bind(&binding).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.name, queue);
        assert!(broker.queue_exists(queue));
        assert_eq!(broker.binding_count(queue), 1);
    }
}

#[tokio::test]
async fn redeclaring_with_another_mode_is_a_declaration_error() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);

    pubsub
        .declare_and_bind(&Binding::new(DIRECT, "pause.bob", "pause", DurabilityMode::Durable))
        .await
        .unwrap();
    let err = pubsub.declare_and_bind(&pause_binding("bob")).await.unwrap_err();

    match err {
        SetupError::DeclarationError { queue, source } => {
            assert_eq!(queue, "pause.bob");
            assert!(source.0.contains("PRECONDITION_FAILED"));
        }
        other => panic!("expected a declaration error, got {:?}", other),
    }

    pubsub.declare_and_bind(&pause_binding("zoe")).await.unwrap();
    let err = pubsub
        .declare_and_bind(&Binding::new(DIRECT, "pause.zoe", "pause", DurabilityMode::Durable))
        .await
        .unwrap_err();
    assert!(matches!(err, SetupError::DeclarationError { .. }));
}

#[tokio::test]
async fn binding_to_a_missing_exchange_is_a_bind_error() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);

    let err = pubsub
        .declare_and_bind(&Binding::new("nowhere", "orphan", "k", DurabilityMode::Durable))
        .await
        .unwrap_err();

    assert!(matches!(err, SetupError::BindError { ref exchange, .. } if exchange == "nowhere"));
}

#[tokio::test]
async fn closed_connection_is_a_channel_error() {
    let broker = test_broker();
    let (connection, pubsub) = pubsub_on(&broker);
    connection.close();

    let err = pubsub.declare_and_bind(&pause_binding("carol")).await.unwrap_err();
    assert!(matches!(err, SetupError::ChannelError(_)));
    assert!(!broker.queue_exists("pause.carol"));
}

#[tokio::test]
async fn empty_queue_names_are_rejected_before_touching_the_broker() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);

    let err = pubsub
        .declare_and_bind(&Binding::new(DIRECT, "", "pause", DurabilityMode::Durable))
        .await
        .unwrap_err();
    assert!(matches!(err, SetupError::InvalidBinding(_)));
}

#[tokio::test]
async fn pause_reaches_the_player_exactly_once() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);

    let subscription = pubsub
        .subscribe_json(&pause_binding("alice"), Recorder::<PlayingState>::new(AckDecision::Ack))
        .await
        .unwrap();
    assert_eq!(subscription.queue(), "pause.alice");
    assert!(subscription.consumer_tag().starts_with("peril-"));

    let channel = pubsub.publish_channel().await.unwrap();
    pubsub
        .publish(&channel, DIRECT, "pause", &PlayingState { is_paused: true })
        .await
        .unwrap();

    eventually("the pause to be acknowledged", || subscription.stats().acked == 1).await;
    assert_eq!(broker.queue_depth("pause.alice"), Some(0));
    assert_eq!(broker.unacked_count("pause.alice"), 0);

    let recorder = subscription.stop().await.unwrap();
    assert_eq!(recorder.seen, vec![PlayingState { is_paused: true }]);
}

#[tokio::test]
async fn stopping_a_transient_subscription_deletes_its_queue() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);

    let subscription = pubsub
        .subscribe_json(&pause_binding("dave"), Recorder::<PlayingState>::new(AckDecision::Ack))
        .await
        .unwrap();
    assert_eq!(broker.consumer_count("pause.dave"), 1);

    subscription.stop().await.unwrap();
    assert!(!broker.queue_exists("pause.dave"));
}

#[tokio::test]
async fn join_returns_once_the_connection_closes() {
    let broker = test_broker();
    let (connection, pubsub) = pubsub_on(&broker);

    let subscription = pubsub
        .subscribe_json(&pause_binding("frank"), Recorder::<PlayingState>::new(AckDecision::Ack))
        .await
        .unwrap();

    let channel = pubsub.publish_channel().await.unwrap();
    pubsub
        .publish(&channel, DIRECT, "pause", &PlayingState { is_paused: true })
        .await
        .unwrap();
    eventually("the pause to be acknowledged", || subscription.stats().acked == 1).await;

    connection.close();
    let recorder = tokio::time::timeout(Duration::from_secs(2), subscription.join())
        .await
        .expect("subscription did not finish after the connection closed")
        .unwrap();
    assert_eq!(recorder.seen.len(), 1);
    assert!(!broker.queue_exists("pause.frank"));
}

#[tokio::test]
async fn malformed_payloads_do_not_stop_the_subscription() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);
    let binding = Binding::new(DIRECT, "pause.erin", "pause", DurabilityMode::Durable);

    let subscription = pubsub
        .subscribe_json(&binding, Recorder::<PlayingState>::new(AckDecision::Ack))
        .await
        .unwrap();

    let channel = pubsub.publish_channel().await.unwrap();
    let garbage = Envelope {
        content_type: JSON_CONTENT_TYPE.to_string(),
        payload: b"{not json".to_vec(),
    };
    channel.publish(DIRECT, "pause", &garbage).await.unwrap();
    pubsub
        .publish(&channel, DIRECT, "pause", &PlayingState { is_paused: false })
        .await
        .unwrap();

    eventually("both deliveries to settle", || {
        let stats = subscription.stats();
        stats.acked + stats.discarded == 2
    })
    .await;

    let stats = subscription.stats();
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.acked, 1);
    assert!(!subscription.is_finished());

    // The undecodable message was dead-lettered, not dropped.
    assert_eq!(broker.queue_depth(DLQ), Some(1));

    let recorder = subscription.stop().await.unwrap();
    assert_eq!(recorder.seen, vec![PlayingState { is_paused: false }]);
}

#[tokio::test]
async fn requeued_messages_come_back_until_acknowledged() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);
    let binding = Binding::new(TOPIC, "war", "war.*", DurabilityMode::Durable);

    let mut attempts = 0u32;
    let subscription = pubsub
        .subscribe_json::<PlayingState, _>(&binding, move |_state: PlayingState| {
            attempts += 1;
            if attempts < 3 {
                AckDecision::NackRequeue
            } else {
                AckDecision::Ack
            }
        })
        .await
        .unwrap();

    let channel = pubsub.publish_channel().await.unwrap();
    pubsub
        .publish(&channel, TOPIC, "war.alice", &PlayingState { is_paused: true })
        .await
        .unwrap();

    eventually("the third attempt to be acknowledged", || subscription.stats().acked == 1).await;
    let stats = subscription.stats();
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.requeued, 2);
    assert_eq!(broker.queue_depth("war"), Some(0));
    assert_eq!(broker.queue_depth(DLQ), Some(0));

    subscription.stop().await.unwrap();
}

#[tokio::test]
async fn requeued_deliveries_are_flagged_as_redelivered() {
    let broker = test_broker();
    let connection = broker.connect();
    let channel = connection.open_channel().await.unwrap();
    let attributes = DurabilityMode::Durable.queue_attributes(DLX);
    channel.declare_queue("moves", &attributes).await.unwrap();
    channel.bind_queue("moves", TOPIC, "army_moves.*").await.unwrap();
    channel
        .publish(TOPIC, "army_moves.bob", &Envelope::encode(&PlayingState { is_paused: false }).unwrap())
        .await
        .unwrap();

    let mut feed = channel.consume("moves", "inspector").await.unwrap();
    let first = feed.next().await.unwrap().unwrap();
    assert!(!first.redelivered());
    assert_eq!(first.routing_key(), "army_moves.bob");
    assert_eq!(first.content_type(), Some(JSON_CONTENT_TYPE));
    first.settle(AckDecision::NackRequeue).await.unwrap();

    let second = feed.next().await.unwrap().unwrap();
    assert!(second.redelivered());
    assert_eq!(second.payload(), first.payload());
    second.settle(AckDecision::Ack).await.unwrap();
    assert_eq!(broker.queue_depth("moves"), Some(0));
}

#[tokio::test]
async fn discarded_messages_are_dead_lettered_once() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);
    let binding = Binding::new(TOPIC, "game_logs", "game_logs.*", DurabilityMode::Durable);

    let subscription = pubsub
        .subscribe_json(&binding, Recorder::<GameLog>::new(AckDecision::NackDiscard))
        .await
        .unwrap();

    let channel = pubsub.publish_channel().await.unwrap();
    for n in 0..3 {
        let log = GameLog::now("alice", format!("entry {}", n));
        pubsub.publish(&channel, TOPIC, "game_logs.alice", &log).await.unwrap();
    }

    eventually("all logs to be discarded", || subscription.stats().discarded == 3).await;
    assert_eq!(subscription.stats().requeued, 0);
    assert_eq!(broker.queue_depth("game_logs"), Some(0));

    let dead: Vec<GameLog> = broker
        .peek(DLQ)
        .iter()
        .map(|envelope| envelope.decode().unwrap())
        .collect();
    assert_eq!(dead.len(), 3);
    assert_eq!(dead[0].message, "entry 0");
    assert_eq!(dead[2].message, "entry 2");

    let recorder = subscription.stop().await.unwrap();
    assert_eq!(recorder.seen.len(), 3);
}

#[tokio::test]
async fn durable_queues_outlive_their_consumers() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);
    let binding = Binding::new(DIRECT, "slow", "slow", DurabilityMode::Durable);

    let channel = pubsub.publish_channel().await.unwrap();
    // Declare first so the message is queued before anyone consumes.
    pubsub.declare_and_bind(&binding).await.unwrap();
    pubsub
        .publish(&channel, DIRECT, "slow", &PlayingState { is_paused: true })
        .await
        .unwrap();

    let subscription = pubsub
        .subscribe_json(&binding, Recorder::<PlayingState>::new(AckDecision::Ack))
        .await
        .unwrap();
    eventually("the message to be acknowledged", || subscription.stats().acked == 1).await;

    let recorder = subscription.stop().await.unwrap();
    assert_eq!(recorder.seen.len(), 1);
    assert_eq!(broker.consumer_count("slow"), 0);
    // Durable queues outlive their consumers.
    assert!(broker.queue_exists("slow"));
}

/// Holds every message until a permit is released for it.
struct Gated {
    permits: Arc<Semaphore>,
    handled: usize,
}

#[async_trait]
impl Handler<PlayingState> for Gated {
    async fn handle(&mut self, _state: PlayingState) -> AckDecision {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
        self.handled += 1;
        AckDecision::Ack
    }
}

async fn gated_subscription(
    broker: &MemoryBroker,
    prefetch_count: u16,
) -> (
    PubSub<MemoryConnection>,
    Arc<Semaphore>,
    peril_pubsub::Subscription<Gated>,
) {
    let options = SubscriptionOptions {
        prefetch_count,
        ..SubscriptionOptions::default()
    };
    let pubsub = PubSub::new(Arc::new(broker.connect()), DLX, options);
    let permits = Arc::new(Semaphore::new(0));
    let binding = Binding::new(DIRECT, "slow", "slow", DurabilityMode::Durable);
    let subscription = pubsub
        .subscribe_json(
            &binding,
            Gated {
                permits: permits.clone(),
                handled: 0,
            },
        )
        .await
        .unwrap();

    let channel = pubsub.publish_channel().await.unwrap();
    for _ in 0..5 {
        pubsub
            .publish(&channel, DIRECT, "slow", &PlayingState { is_paused: true })
            .await
            .unwrap();
    }
    (pubsub, permits, subscription)
}

#[tokio::test]
async fn prefetch_limit_bounds_unacknowledged_deliveries() {
    let broker = test_broker();
    let (_pubsub, permits, subscription) = gated_subscription(&broker, 1).await;

    eventually("the first delivery", || subscription.stats().delivered == 1).await;
    assert_eq!(broker.unacked_count("slow"), 1);
    assert_eq!(broker.queue_depth("slow"), Some(4));

    permits.add_permits(5);
    eventually("all five to be acknowledged", || subscription.stats().acked == 5).await;
    assert_eq!(broker.queue_depth("slow"), Some(0));

    let gated = subscription.stop().await.unwrap();
    assert_eq!(gated.handled, 5);
}

#[tokio::test]
async fn zero_prefetch_delivers_everything_at_once() {
    let broker = test_broker();
    let (_pubsub, permits, subscription) = gated_subscription(&broker, 0).await;

    eventually("the first delivery", || subscription.stats().delivered == 1).await;
    assert_eq!(broker.unacked_count("slow"), 5);
    assert_eq!(broker.queue_depth("slow"), Some(0));

    permits.add_permits(5);
    eventually("all five to be acknowledged", || subscription.stats().acked == 5).await;
    subscription.stop().await.unwrap();
}

#[tokio::test]
async fn final_stats_include_deliveries_settled_during_shutdown() {
    let broker = test_broker();
    let (_pubsub, permits, subscription) = gated_subscription(&broker, 0).await;

    eventually("the first delivery", || subscription.stats().delivered == 1).await;
    assert_eq!(subscription.stats().acked, 0);

    // The held delivery completes while the subscription is shutting down.
    permits.add_permits(1);
    let (gated, stats) = subscription.stop_with_stats().await.unwrap();

    assert_eq!(gated.handled, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(broker.unacked_count("slow"), 0);
    assert_eq!(broker.queue_depth("slow"), Some(4));
}

#[tokio::test]
async fn wildcard_publish_keys_are_rejected() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);
    let channel = pubsub.publish_channel().await.unwrap();

    let err = pubsub
        .publish(&channel, TOPIC, "army_moves.*", &PlayingState { is_paused: true })
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::InvalidRoutingKey(ref key) if key == "army_moves.*"));
}

#[tokio::test]
async fn publishing_to_a_missing_exchange_is_a_transport_error() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);
    let channel = pubsub.publish_channel().await.unwrap();

    let err = pubsub
        .publish(&channel, "missing", "pause", &PlayingState { is_paused: true })
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::TransportError(_)));
}

#[tokio::test]
async fn subscribe_setup_failures_are_returned() {
    let broker = test_broker();
    let (_connection, pubsub) = pubsub_on(&broker);

    let result = pubsub
        .subscribe_json(
            &Binding::new("missing", "q", "k", DurabilityMode::Durable),
            Recorder::<PlayingState>::new(AckDecision::Ack),
        )
        .await;
    assert!(matches!(result, Err(SetupError::BindError { .. })));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn published_values_arrive_unchanged(username in "[a-z]{1,12}", message in ".{0,64}") {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let received = runtime.block_on(async {
            let broker = test_broker();
            let (_connection, pubsub) = pubsub_on(&broker);
            let binding = Binding::new(TOPIC, "game_logs", "game_logs.*", DurabilityMode::Durable);
            let subscription = pubsub
                .subscribe_json(&binding, Recorder::<GameLog>::new(AckDecision::Ack))
                .await
                .unwrap();

            let log = GameLog::now(username.clone(), message.clone());
            let channel = pubsub.publish_channel().await.unwrap();
            pubsub
                .publish(&channel, TOPIC, &format!("game_logs.{}", username), &log)
                .await
                .unwrap();

            eventually("the log to arrive", || subscription.stats().acked == 1).await;
            let recorder = subscription.stop().await.unwrap();
            (log, recorder.seen)
        });

        prop_assert_eq!(received.1, vec![received.0]);
    }

    #[test]
    fn single_word_wildcard_matches_any_one_word(prefix in "[a-z_]{1,10}", word in "[a-z0-9]{1,10}") {
        let pattern = format!("{}.*", prefix);
        let one_word = format!("{}.{}", prefix, word);
        let two_words = format!("{}.{}.{}", prefix, word, word);
        prop_assert!(topic_matches(&pattern, &one_word));
        prop_assert!(!topic_matches(&pattern, &prefix));
        prop_assert!(!topic_matches(&pattern, &two_words));
        prop_assert!(topic_matches("#", &one_word));
    }
}
