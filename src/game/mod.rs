//! Acknowledgment policies for game events.
//!
//! The simulation itself lives behind [`GameEngine`]; this module only turns
//! its outcomes into acknowledgment decisions and follow-up publications.

pub mod handlers;

use crate::models::{ArmyMove, PlayingState, RecognitionOfWar};
use crate::rabbitmq::AckDecision;

pub use handlers::{GameLogWriter, MoveHandler, PauseHandler, SharedEngine, WarHandler};

/// Result of applying another player's move to the local game state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The move was our own, echoed back through the topic exchange.
    SamePlayer,
    Safe,
    /// The move lands on our units and starts a war.
    MakeWar,
}

impl MoveOutcome {
    pub fn decision(self) -> AckDecision {
        match self {
            MoveOutcome::SamePlayer => AckDecision::NackDiscard,
            MoveOutcome::Safe | MoveOutcome::MakeWar => AckDecision::Ack,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarOutcome {
    /// Someone else's war; leave it for the players involved.
    NotInvolved,
    NoUnits,
    OpponentWon { winner: String, loser: String },
    YouWon { winner: String, loser: String },
    Draw { attacker: String, defender: String },
}

impl WarOutcome {
    pub fn decision(&self) -> AckDecision {
        match self {
            WarOutcome::NotInvolved => AckDecision::NackRequeue,
            WarOutcome::NoUnits => AckDecision::NackDiscard,
            WarOutcome::OpponentWon { .. } | WarOutcome::YouWon { .. } | WarOutcome::Draw { .. } => {
                AckDecision::Ack
            }
        }
    }

    /// Line to publish to the game log, for outcomes that resolved a war.
    pub fn log_message(&self) -> Option<String> {
        match self {
            WarOutcome::OpponentWon { winner, loser } | WarOutcome::YouWon { winner, loser } => {
                Some(format!("{} won a war against {}", winner, loser))
            }
            WarOutcome::Draw { attacker, defender } => Some(format!(
                "A war between {} and {} resulted in a draw",
                attacker, defender
            )),
            WarOutcome::NotInvolved | WarOutcome::NoUnits => None,
        }
    }
}

/// The game simulation, treated as a black box.
pub trait GameEngine: Send + 'static {
    fn username(&self) -> &str;

    fn handle_pause(&mut self, state: &PlayingState);

    fn handle_move(&mut self, army_move: &ArmyMove) -> MoveOutcome;

    fn handle_war(&mut self, war: &RecognitionOfWar) -> WarOutcome;
}
