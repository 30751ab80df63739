use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{GameEngine, MoveOutcome};
use crate::config::RoutingConfig;
use crate::models::{ArmyMove, GameLog, Player, PlayingState, RecognitionOfWar};
use crate::rabbitmq::{publish_json, AckDecision, BrokerChannel, Handler};

/// One game state shared by the pause, move and war subscriptions of a client.
pub type SharedEngine<E> = Arc<Mutex<E>>;

pub struct PauseHandler<E> {
    engine: SharedEngine<E>,
}

impl<E: GameEngine> PauseHandler<E> {
    pub fn new(engine: SharedEngine<E>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<E: GameEngine> Handler<PlayingState> for PauseHandler<E> {
    async fn handle(&mut self, state: PlayingState) -> AckDecision {
        let mut engine = self.engine.lock().await;
        engine.handle_pause(&state);
        info!(username = %engine.username(), paused = state.is_paused, "Applied pause state");
        AckDecision::Ack
    }
}

/// Applies other players' moves. A move that starts a war is announced on
/// the war routing key before it is acknowledged.
pub struct MoveHandler<E, Ch> {
    engine: SharedEngine<E>,
    channel: Ch,
    routing: RoutingConfig,
}

impl<E: GameEngine, Ch: BrokerChannel> MoveHandler<E, Ch> {
    pub fn new(engine: SharedEngine<E>, channel: Ch, routing: RoutingConfig) -> Self {
        Self {
            engine,
            channel,
            routing,
        }
    }
}

#[async_trait]
impl<E: GameEngine, Ch: BrokerChannel> Handler<ArmyMove> for MoveHandler<E, Ch> {
    async fn handle(&mut self, army_move: ArmyMove) -> AckDecision {
        let (outcome, username) = {
            let mut engine = self.engine.lock().await;
            let outcome = engine.handle_move(&army_move);
            (outcome, engine.username().to_string())
        };

        if outcome != MoveOutcome::MakeWar {
            return outcome.decision();
        }

        let war = RecognitionOfWar {
            attacker: army_move.player,
            defender: Player::new(username.clone()),
        };
        let routing_key = self.routing.war_key(&username);
        match publish_json(&self.channel, &self.routing.exchange_topic, &routing_key, &war).await {
            Ok(()) => {
                info!(attacker = %war.attacker.username, defender = %username, "Declared war");
                outcome.decision()
            }
            Err(e) => {
                error!(routing_key = %routing_key, "Failed to publish war declaration: {}", e);
                AckDecision::NackRequeue
            }
        }
    }
}

/// Resolves wars and records their result in the game log.
pub struct WarHandler<E, Ch> {
    engine: SharedEngine<E>,
    channel: Ch,
    routing: RoutingConfig,
}

impl<E: GameEngine, Ch: BrokerChannel> WarHandler<E, Ch> {
    pub fn new(engine: SharedEngine<E>, channel: Ch, routing: RoutingConfig) -> Self {
        Self {
            engine,
            channel,
            routing,
        }
    }
}

#[async_trait]
impl<E: GameEngine, Ch: BrokerChannel> Handler<RecognitionOfWar> for WarHandler<E, Ch> {
    async fn handle(&mut self, war: RecognitionOfWar) -> AckDecision {
        let (outcome, username) = {
            let mut engine = self.engine.lock().await;
            let outcome = engine.handle_war(&war);
            (outcome, engine.username().to_string())
        };

        let message = match outcome.log_message() {
            Some(message) => message,
            None => return outcome.decision(),
        };

        let log = GameLog::now(username.clone(), message);
        let routing_key = self.routing.game_log_key(&username);
        match publish_json(&self.channel, &self.routing.exchange_topic, &routing_key, &log).await {
            Ok(()) => outcome.decision(),
            Err(e) => {
                error!(routing_key = %routing_key, "Failed to publish game log: {}", e);
                AckDecision::NackRequeue
            }
        }
    }
}

/// Server-side sink for game logs: one line per entry, written without
/// blocking the runtime.
pub struct GameLogWriter<W> {
    writer: W,
    written: u64,
}

impl<W: AsyncWrite + Unpin + Send + 'static> GameLogWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    async fn append(&mut self, log: &GameLog) -> std::io::Result<()> {
        let line = format!(
            "{} {}: {}\n",
            log.current_time.to_rfc3339(),
            log.username,
            log.message
        );
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> Handler<GameLog> for GameLogWriter<W> {
    async fn handle(&mut self, log: GameLog) -> AckDecision {
        match self.append(&log).await {
            Ok(()) => {
                self.written += 1;
                AckDecision::Ack
            }
            Err(e) => {
                warn!(username = %log.username, "Failed to write game log, requeueing: {}", e);
                AckDecision::NackRequeue
            }
        }
    }
}
