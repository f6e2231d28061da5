//! Common types used throughout the application

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::engines::volatility::Regime;

/// Trading action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    /// +1 for BUY, -1 for SELL, 0 for HOLD
    pub fn direction(&self) -> f64 {
        match self {
            Action::Buy => 1.0,
            Action::Sell => -1.0,
            Action::Hold => 0.0,
        }
    }

    pub fn is_directional(&self) -> bool {
        !matches!(self, Action::Hold)
    }

    pub fn opposite(&self) -> Action {
        match self {
            Action::Buy => Action::Sell,
            Action::Sell => Action::Buy,
            Action::Hold => Action::Hold,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Action::Buy => 1,
            Action::Sell => 2,
            Action::Hold => 0,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Hold => write!(f, "HOLD"),
        }
    }
}

/// Decision an evaluator can return. `Reject` is only a veto when the
/// evaluator holds veto power; otherwise it counts as HOLD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteDecision {
    Buy,
    Sell,
    Hold,
    Reject,
}

impl VoteDecision {
    pub fn as_action(&self) -> Action {
        match self {
            VoteDecision::Buy => Action::Buy,
            VoteDecision::Sell => Action::Sell,
            VoteDecision::Hold | VoteDecision::Reject => Action::Hold,
        }
    }

    /// Parse free-form model output, defaulting to HOLD
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "BUY" | "LONG" | "BULLISH" => VoteDecision::Buy,
            "SELL" | "SHORT" | "BEARISH" => VoteDecision::Sell,
            "REJECT" | "REJECTED" | "VETO" => VoteDecision::Reject,
            _ => VoteDecision::Hold,
        }
    }
}

impl From<Action> for VoteDecision {
    fn from(action: Action) -> Self {
        match action {
            Action::Buy => VoteDecision::Buy,
            Action::Sell => VoteDecision::Sell,
            Action::Hold => VoteDecision::Hold,
        }
    }
}

impl fmt::Display for VoteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteDecision::Buy => write!(f, "BUY"),
            VoteDecision::Sell => write!(f, "SELL"),
            VoteDecision::Hold => write!(f, "HOLD"),
            VoteDecision::Reject => write!(f, "REJECT"),
        }
    }
}

/// Point-in-time market view for one consensus round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    /// Precomputed indicator values keyed by name (rsi, macd, ...)
    #[serde(default)]
    pub indicators: BTreeMap<String, f64>,
    /// Volatility index reading at capture time
    pub volatility_index: f64,
    pub timestamp: i64,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>, price: f64, volume: f64, volatility_index: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume,
            indicators: BTreeMap::new(),
            volatility_index,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_indicator(mut self, name: &str, value: f64) -> Self {
        self.indicators.insert(name.to_string(), value);
        self
    }

    pub fn indicator(&self, name: &str) -> Option<f64> {
        self.indicators.get(name).copied()
    }
}

/// A trade proposal. Never mutated; `refine` yields a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeProposal {
    pub id: String,
    pub version: u32,
    pub symbol: String,
    pub action: Action,
    /// Fraction of capital to commit
    pub size_fraction: f64,
    /// Technical score in [-1, 1]
    pub technical_score: f64,
    /// Acceptance threshold in effect at creation
    pub threshold: f64,
    pub regime: Regime,
    pub created_at: i64,
}

impl TradeProposal {
    pub fn new(
        symbol: impl Into<String>,
        action: Action,
        size_fraction: f64,
        technical_score: f64,
        threshold: f64,
        regime: Regime,
    ) -> Self {
        Self {
            id: super::helpers::generate_id(),
            version: 1,
            symbol: symbol.into(),
            action,
            size_fraction,
            technical_score,
            threshold,
            regime,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn refine(&self, action: Action, size_fraction: f64) -> Self {
        Self {
            id: super::helpers::generate_id(),
            version: self.version + 1,
            action,
            size_fraction,
            created_at: chrono::Utc::now().timestamp_millis(),
            ..self.clone()
        }
    }
}

/// Structured change an evaluator attaches to its vote
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteModification {
    /// Suggested multiplier on the proposed size (e.g. 0.5 halves it)
    #[serde(default)]
    pub size_multiplier: Option<f64>,
    /// Explicit request to override a risk veto
    #[serde(default)]
    pub override_veto: bool,
}

/// One evaluator's answer to one proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorVote {
    pub evaluator_id: String,
    pub decision: VoteDecision,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub rationale: String,
    pub latency_ms: u64,
    #[serde(default)]
    pub modification: Option<VoteModification>,
}

impl EvaluatorVote {
    pub fn new(evaluator_id: impl Into<String>, decision: VoteDecision, confidence: f64) -> Self {
        Self {
            evaluator_id: evaluator_id.into(),
            decision,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: String::new(),
            latency_ms: 0,
            modification: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_modification(mut self, modification: VoteModification) -> Self {
        self.modification = Some(modification);
        self
    }

    pub fn overrides_veto(&self) -> bool {
        self.modification.as_ref().map(|m| m.override_veto).unwrap_or(false)
    }
}

/// Strength of a consensus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strength {
    Strong,
    Normal,
    Weak,
}

/// Consensus classification recorded on every result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusType {
    Strong(Action),
    Normal(Action),
    Weak(Action),
    /// Risk veto stood
    RejectedByRisk,
    /// Risk veto overridden by auditor and a peer; reduced size
    Mediated(Action),
    /// Consensus passed but blended confidence did not clear the threshold
    BelowThreshold(Action),
    /// Technical-only fallback
    Degraded,
}

impl ConsensusType {
    pub fn classify(action: Action, strength: Strength) -> Self {
        match strength {
            Strength::Strong => ConsensusType::Strong(action),
            Strength::Normal => ConsensusType::Normal(action),
            Strength::Weak => ConsensusType::Weak(action),
        }
    }
}

impl fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusType::Strong(a) => write!(f, "STRONG_{}", a),
            ConsensusType::Normal(a) => write!(f, "{}", a),
            ConsensusType::Weak(a) => write!(f, "WEAK_{}", a),
            ConsensusType::RejectedByRisk => write!(f, "REJECTED_BY_RISK"),
            ConsensusType::Mediated(a) => write!(f, "MEDIATED_{}", a),
            ConsensusType::BelowThreshold(a) => write!(f, "BELOW_THRESHOLD_{}", a),
            ConsensusType::Degraded => write!(f, "DEGRADED"),
        }
    }
}

/// Weighted score per action
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionScores {
    pub buy: f64,
    pub sell: f64,
    pub hold: f64,
}

impl ActionScores {
    pub fn get(&self, action: Action) -> f64 {
        match action {
            Action::Buy => self.buy,
            Action::Sell => self.sell,
            Action::Hold => self.hold,
        }
    }

    pub fn add(&mut self, action: Action, value: f64) {
        match action {
            Action::Buy => self.buy += value,
            Action::Sell => self.sell += value,
            Action::Hold => self.hold += value,
        }
    }

    /// Highest-scoring action; ties resolve toward HOLD
    pub fn winner(&self) -> (Action, f64) {
        let mut best = (Action::Hold, self.hold);
        for (action, score) in [(Action::Buy, self.buy), (Action::Sell, self.sell)] {
            if score > best.1 {
                best = (action, score);
            }
        }
        if self.buy == self.sell && self.buy >= self.hold && self.buy > 0.0 {
            return (Action::Hold, self.hold);
        }
        best
    }
}

/// Canonical record of one consensus round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub id: String,
    pub proposal_id: String,
    pub symbol: String,
    pub decision: Action,
    /// Final blended confidence
    pub confidence: f64,
    pub consensus_type: ConsensusType,
    pub votes: Vec<EvaluatorVote>,
    /// Evaluators that did not answer by the deadline
    pub abstentions: Vec<String>,
    pub scores: ActionScores,
    pub veto: bool,
    pub mediated: bool,
    pub degraded: bool,
    /// Size approved for execution
    pub size_fraction: f64,
    pub technical_score: f64,
    pub threshold: f64,
    pub timestamp: i64,
}

impl ConsensusResult {
    /// Evaluators whose vote matched the final decision
    pub fn supporting_evaluators(&self) -> Vec<String> {
        if self.degraded || !self.decision.is_directional() {
            return Vec::new();
        }
        self.votes
            .iter()
            .filter(|v| v.decision.as_action() == self.decision)
            .map(|v| v.evaluator_id.clone())
            .collect()
    }

    pub fn vote_of(&self, evaluator_id: &str) -> Option<&EvaluatorVote> {
        self.votes.iter().find(|v| v.evaluator_id == evaluator_id)
    }

    pub fn is_actionable(&self) -> bool {
        self.decision.is_directional() && self.size_fraction > 0.0
    }
}

pub type AppResult<T> = anyhow::Result<T>;
