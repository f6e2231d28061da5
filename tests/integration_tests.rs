//! Integration Tests for the Consensus Trader
//!
//! Tests the complete flow from regime classification through consensus,
//! execution and weight feedback.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use consensus_trader::agent::rebalancer::FeedbackRebalancer;
use consensus_trader::agent::{exit_levels, AgentParts, CycleOutcome, TradingAgent};
use consensus_trader::config::AppConfig;
use consensus_trader::consensus::{ConsensusCoordinator, DecisionLog};
use consensus_trader::engines::technical::PrecomputedScorer;
use consensus_trader::engines::volatility::{classify_reading, StaticVolatilitySource};
use consensus_trader::engines::Regime;
use consensus_trader::error::{EvaluatorError, LedgerError};
use consensus_trader::evaluators::{EvaluationRequest, Evaluator, EvaluatorRole};
use consensus_trader::exchange::{PaperConfig, PaperExchange};
use consensus_trader::ledger::WeightLedger;
use consensus_trader::network::EventBus;
use consensus_trader::position::{CloseReason, Outcome, PositionLedger};
use consensus_trader::state::SharedState;
use consensus_trader::utils::types::{
    Action, ConsensusType, EvaluatorVote, MarketSnapshot, TradeProposal, VoteDecision, VoteModification,
};

const PANEL: [(&str, EvaluatorRole); 5] = [
    ("strategy", EvaluatorRole::Strategy),
    ("market", EvaluatorRole::Market),
    ("risk", EvaluatorRole::Risk),
    ("execution", EvaluatorRole::Execution),
    ("auditor", EvaluatorRole::Auditor),
];

/// Evaluator whose answer comes from a shared, editable script
struct Scripted {
    id: String,
    role: EvaluatorRole,
    script: Arc<Script>,
}

#[derive(Default)]
struct Script {
    votes: Mutex<HashMap<String, EvaluatorVote>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl Script {
    fn set(&self, id: &str, decision: VoteDecision, confidence: f64) {
        self.votes
            .lock()
            .insert(id.to_string(), EvaluatorVote::new(id, decision, confidence));
    }

    fn set_with(&self, id: &str, vote: EvaluatorVote) {
        self.votes.lock().insert(id.to_string(), vote);
    }

    fn stall(&self, id: &str, delay: Duration) {
        self.delays.lock().insert(id.to_string(), delay);
    }

    fn all(&self, decision: VoteDecision, confidence: f64) {
        for (id, _) in PANEL {
            self.set(id, decision, confidence);
        }
    }
}

#[async_trait]
impl Evaluator for Scripted {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> EvaluatorRole {
        self.role
    }

    async fn evaluate(&self, _request: &EvaluationRequest) -> Result<EvaluatorVote, EvaluatorError> {
        let delay = self.script.delays.lock().get(&self.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let vote = self.script.votes.lock().get(&self.id).cloned();
        vote.ok_or_else(|| EvaluatorError::BackendUnavailable(format!("no scripted vote for {}", self.id)))
    }
}

fn panel(script: &Arc<Script>) -> Vec<Arc<dyn Evaluator>> {
    PANEL
        .iter()
        .map(|(id, role)| {
            Arc::new(Scripted {
                id: id.to_string(),
                role: *role,
                script: script.clone(),
            }) as Arc<dyn Evaluator>
        })
        .collect()
}

/// Paper defaults with the five evaluators at equal 0.20 weight
fn equal_weight_config() -> AppConfig {
    let mut config = AppConfig::paper_default();
    config.trading.symbols = vec!["BTC/USDT".to_string()];
    for evaluator in &mut config.evaluators {
        evaluator.initial_weight = 0.20;
    }
    config
}

fn ledger(config: &AppConfig) -> Arc<WeightLedger> {
    Arc::new(WeightLedger::new(&config.evaluators, config.rebalance.clone()).unwrap())
}

fn low_regime_proposal(technical_score: f64) -> TradeProposal {
    let (regime, threshold) = classify_reading(&AppConfig::paper_default().volatility.bands, 10.0);
    TradeProposal::new("BTC/USDT", Action::Buy, 0.05, technical_score, threshold, regime)
}

fn snapshot() -> MarketSnapshot {
    MarketSnapshot::new("BTC/USDT", 100.0, 1_000.0, 10.0)
}

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("consensus-trader-{}-{}", uuid::Uuid::new_v4(), name))
}

#[test]
fn test_shipped_config_is_valid() {
    let config = AppConfig::from_yaml(include_str!("../config.yaml")).unwrap();
    assert!(config.paper_trading);
    assert_eq!(config.evaluators.len(), 5);
}

#[test]
fn test_low_volatility_reading_classifies_low() {
    let bands = AppConfig::paper_default().volatility.bands;
    assert_eq!(classify_reading(&bands, 10.0), (Regime::Low, 0.40));
    assert_eq!(classify_reading(&bands, 35.0), (Regime::Panic, 0.70));
}

/// Test unanimous BUY in a calm market
#[tokio::test]
async fn test_unanimous_buy_in_low_regime() {
    let config = equal_weight_config();
    let script = Arc::new(Script::default());
    for ((id, _), confidence) in PANEL.iter().zip([0.8, 0.7, 0.6, 0.75, 0.9]) {
        script.set(id, VoteDecision::Buy, confidence);
    }
    let coordinator = ConsensusCoordinator::new(&config, panel(&script), ledger(&config));

    let result = coordinator.evaluate(&low_regime_proposal(0.42), &snapshot()).await;

    assert!((result.scores.buy - 0.75).abs() < 1e-9);
    assert_eq!(result.consensus_type, ConsensusType::Strong(Action::Buy));
    assert_eq!(result.decision, Action::Buy);
    assert!(result.confidence > 0.40);
    assert!(!result.degraded);
    assert_eq!(result.supporting_evaluators().len(), 5);
}

/// Test risk veto without override
#[tokio::test]
async fn test_risk_veto_forces_hold() {
    let config = equal_weight_config();
    let script = Arc::new(Script::default());
    for ((id, _), confidence) in PANEL.iter().zip([0.8, 0.7, 0.6, 0.75, 0.9]) {
        script.set(id, VoteDecision::Buy, confidence);
    }
    script.set("risk", VoteDecision::Reject, 0.9);
    let coordinator = ConsensusCoordinator::new(&config, panel(&script), ledger(&config));

    let result = coordinator.evaluate(&low_regime_proposal(0.42), &snapshot()).await;

    assert!(result.veto);
    assert!(!result.mediated);
    assert_eq!(result.decision, Action::Hold);
    assert_eq!(result.consensus_type, ConsensusType::RejectedByRisk);
    assert!(!result.is_actionable());
}

/// Test auditor plus peer override yields a reduced-size trade
#[tokio::test]
async fn test_veto_override_is_mediated() {
    let config = equal_weight_config();
    let script = Arc::new(Script::default());
    script.all(VoteDecision::Buy, 0.8);
    script.set("risk", VoteDecision::Reject, 0.9);
    let overriding = VoteModification {
        override_veto: true,
        ..Default::default()
    };
    for id in ["auditor", "market"] {
        script.set_with(
            id,
            EvaluatorVote::new(id, VoteDecision::Buy, 0.8).with_modification(overriding.clone()),
        );
    }
    let coordinator = ConsensusCoordinator::new(&config, panel(&script), ledger(&config));

    let result = coordinator.evaluate(&low_regime_proposal(0.42), &snapshot()).await;

    assert!(result.mediated);
    assert_eq!(result.decision, Action::Buy);
    assert_eq!(result.consensus_type, ConsensusType::Mediated(Action::Buy));
    assert!(result.size_fraction <= config.consensus.mediation_max_size_fraction + 1e-12);
}

/// Test degraded mode when most evaluators time out
#[tokio::test]
async fn test_three_timeouts_fall_back_to_technical() {
    let mut config = equal_weight_config();
    config.consensus.evaluator_timeout_ms = 50;
    config.consensus.global_deadline_ms = 200;

    let script = Arc::new(Script::default());
    script.all(VoteDecision::Sell, 0.9);
    for id in ["risk", "execution", "auditor"] {
        script.stall(id, Duration::from_secs(5));
    }
    let coordinator = ConsensusCoordinator::new(&config, panel(&script), ledger(&config));

    let approved = coordinator.evaluate(&low_regime_proposal(0.42), &snapshot()).await;
    assert!(approved.degraded);
    assert_eq!(approved.abstentions.len(), 3);
    assert_eq!(approved.consensus_type, ConsensusType::Degraded);
    // Votes are ignored; the technical score alone clears 0.40
    assert_eq!(approved.decision, Action::Buy);
    assert!((approved.confidence - 0.42).abs() < 1e-9);
    assert!(approved.supporting_evaluators().is_empty());

    let held = coordinator.evaluate(&low_regime_proposal(0.30), &snapshot()).await;
    assert!(held.degraded);
    assert_eq!(held.decision, Action::Hold);
}

/// Test stop-out feedback down to the weight floor
#[tokio::test]
async fn test_stop_out_penalizes_supporters_to_floor() {
    let config = equal_weight_config();
    let weights = ledger(&config);
    let script = Arc::new(Script::default());
    for id in ["strategy", "market", "execution"] {
        script.set(id, VoteDecision::Buy, 1.0);
    }
    for id in ["risk", "auditor"] {
        script.set(id, VoteDecision::Hold, 0.2);
    }
    let coordinator = ConsensusCoordinator::new(&config, panel(&script), weights.clone());
    let result = coordinator.evaluate(&low_regime_proposal(0.42), &snapshot()).await;
    assert_eq!(result.decision, Action::Buy);

    let positions = PositionLedger::new(exit_levels(&config.trading));
    positions.open(&result, 100.0, 1.0).unwrap();
    let closed = positions.close("BTC/USDT", 95.0, CloseReason::StopLoss).unwrap();
    assert_eq!(closed.outcome, Outcome::StoppedOut);
    assert!((closed.realized_pnl + 5.0).abs() < 1e-9);

    let rebalancer = FeedbackRebalancer::new(weights.clone());
    rebalancer.rebalance(&closed).await.unwrap();
    let strategy = weights.weight_of("strategy").unwrap();
    assert!(strategy < 0.20);
    assert!(weights.weight_of("risk").unwrap() > 0.20);

    for _ in 0..100 {
        rebalancer.rebalance(&closed).await.unwrap();
    }
    let after = weights.weights();
    assert!((after["strategy"] - config.rebalance.min_weight).abs() < 1e-6);
    assert!((after.values().sum::<f64>() - 1.0).abs() < 1e-9);
    assert!(after
        .values()
        .all(|w| *w >= config.rebalance.min_weight - 1e-9 && *w <= config.rebalance.max_weight + 1e-9));
}

/// Test closing an already closed position
#[tokio::test]
async fn test_double_close_is_rejected() {
    let config = equal_weight_config();
    let script = Arc::new(Script::default());
    script.all(VoteDecision::Buy, 0.9);
    let coordinator = ConsensusCoordinator::new(&config, panel(&script), ledger(&config));
    let result = coordinator.evaluate(&low_regime_proposal(0.42), &snapshot()).await;

    let positions = PositionLedger::new(exit_levels(&config.trading));
    positions.open(&result, 100.0, 2.0).unwrap();
    positions.close("BTC/USDT", 101.0, CloseReason::Manual).unwrap();

    let err = positions.close("BTC/USDT", 101.0, CloseReason::Manual).unwrap_err();
    assert!(matches!(err, LedgerError::NoOpenPosition(_)));
    assert_eq!(positions.closed_positions().len(), 1);
}

/// Test weights surviving a restart
#[tokio::test]
async fn test_weights_persist_across_restart() {
    let config = equal_weight_config();
    let path = temp_path("weights.json");

    let weights = WeightLedger::open(&config.evaluators, config.rebalance.clone(), &path)
        .await
        .unwrap();
    weights
        .apply_outcome(&["auditor".to_string()], Outcome::Correct)
        .unwrap();
    weights.save().await.unwrap();
    let saved = weights.weights();

    let reopened = WeightLedger::open(&config.evaluators, config.rebalance.clone(), &path)
        .await
        .unwrap();
    for (id, weight) in reopened.weights() {
        assert!((weight - saved[&id]).abs() < 1e-9);
    }
    assert_eq!(reopened.record("auditor").unwrap().correct, 1);

    let _ = std::fs::remove_file(&path);
}

/// Test full rounds against the paper exchange: open, close on the
/// opposite signal, and the weights already updated when the round returns
#[tokio::test]
async fn test_paper_round_trip_feeds_back_weights() {
    let mut config = AppConfig::paper_default();
    config.trading.symbols = vec!["BTC/USDT".to_string()];
    let config = Arc::new(config);
    let exchange = Arc::new(PaperExchange::new(PaperConfig {
        fee_rate: 0.0,
        step_volatility: 0.0,
        ..PaperConfig::default()
    }));
    exchange.set_price("BTC/USDT", 100.0);

    let script = Arc::new(Script::default());
    script.all(VoteDecision::Buy, 0.9);
    script.set("market", VoteDecision::Hold, 0.9);

    let weights = ledger(&config);
    let market_before = weights.weight_of("market").unwrap();
    let strategy_before = weights.weight_of("strategy").unwrap();

    let parts = AgentParts {
        exchange: exchange.clone(),
        volatility_source: Arc::new(StaticVolatilitySource::new(10.0)),
        scorer: Arc::new(PrecomputedScorer),
        evaluators: panel(&script),
        weights: weights.clone(),
        positions: PositionLedger::new(exit_levels(&config.trading)),
        decisions: DecisionLog::in_memory(100),
    };
    let agent = Arc::new(TradingAgent::new(
        config.clone(),
        Arc::new(SharedState::new()),
        Arc::new(EventBus::new(256)),
        parts,
    ));

    let first = agent.run_once().await;
    assert!(first.failures.is_empty());
    let opened = match first.outcome("BTC/USDT") {
        Some(CycleOutcome::Opened(p)) => p.clone(),
        other => panic!("expected open, got {:?}", other),
    };
    assert_eq!(opened.entry_price, 100.0);
    assert!((exchange.holding("BTC/USDT") - opened.quantity).abs() < 1e-9);

    // Inside the stop/take band, so the close comes from the vote
    exchange.set_price("BTC/USDT", 103.0);
    script.all(VoteDecision::Sell, 0.9);
    script.set("market", VoteDecision::Hold, 0.9);

    let second = agent.run_once().await;
    let closed = match second.outcome("BTC/USDT") {
        Some(CycleOutcome::Closed(p)) => p.clone(),
        other => panic!("expected close, got {:?}", other),
    };
    assert_eq!(closed.outcome, Outcome::Correct);
    assert!(closed.realized_pnl > 0.0);
    assert_eq!(exchange.holding("BTC/USDT"), 0.0);

    assert_eq!(second.closed_count(), 1);
    assert_eq!(agent.rebalancer().rebalance_count(), 1);
    let opening = agent.coordinator().decision(&closed.consensus_id).unwrap();
    assert_eq!(opening.decision, Action::Buy);
    assert!(weights.weight_of("strategy").unwrap() > strategy_before);
    assert!(weights.weight_of("market").unwrap() < market_before);
    assert_eq!(weights.record("market").unwrap().total(), 0);

    agent.stop().await;
}
