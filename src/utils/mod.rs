//! Shared types and helpers

pub mod helpers;
pub mod types;

pub use types::{
    Action, ActionScores, ConsensusResult, ConsensusType, EvaluatorVote, MarketSnapshot,
    Strength, TradeProposal, VoteDecision, VoteModification,
};
