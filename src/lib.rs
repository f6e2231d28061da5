//! Adaptive Multi-Evaluator Trade Consensus Engine
//!
//! Trades a set of symbols by putting every technical proposal to a panel of
//! weighted evaluators, gating the result with a volatility-adaptive
//! confidence threshold and feeding closed-trade outcomes back into the
//! evaluator weights.

pub mod agent;
pub mod config;
pub mod consensus;
pub mod engines;
pub mod error;
pub mod evaluators;
pub mod exchange;
pub mod ledger;
pub mod network;
pub mod position;
pub mod state;
pub mod telemetry;
pub mod utils;

// Re-export main types
pub use agent::{AgentParts, CycleOutcome, RoundReport, TradingAgent};
pub use config::AppConfig;
pub use consensus::ConsensusCoordinator;
pub use engines::{Classification, Regime, VolatilityClassifier};
pub use error::{EvaluatorError, ExchangeError, LedgerError};
pub use exchange::{ExchangeConnector, PaperExchange};
pub use ledger::WeightLedger;
pub use network::{Event, EventBus};
pub use position::{Position, PositionLedger};
pub use state::SharedState;
pub use utils::types::{Action, ConsensusResult, ConsensusType, TradeProposal};
