//! Consensus Coordinator
//!
//! Runs one voting round per proposal:
//! - Fans the proposal out to every evaluator concurrently
//! - Collects votes until all answer or the global deadline passes
//! - Falls back to a technical-only decision when most evaluators abstain
//! - Tracks backend health across rounds
//! - Keeps every result for lookup by consensus id

pub mod history;
pub mod tally;

pub use history::DecisionLog;
pub use tally::{Ballot, Decision, TallyParams, VetoOutcome};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::EvaluatorError;
use crate::evaluators::{EvaluationRequest, Evaluator, EvaluatorRole};
use crate::ledger::WeightLedger;
use crate::network::event_bus::Event;
use crate::telemetry::metrics;
use crate::utils::helpers::{current_timestamp_millis, elapsed_ms, generate_id};
use crate::utils::types::{ConsensusResult, EvaluatorVote, MarketSnapshot, TradeProposal};

/// Healthy until a round gets no answer at all; recovers on the first
/// round with any answer.
#[derive(Debug)]
pub struct BackendHealth {
    healthy: AtomicBool,
}

impl BackendHealth {
    pub fn new() -> Self {
        Self { healthy: AtomicBool::new(true) }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Returns `Some(new_state)` when the state flipped
    fn observe(&self, responders: usize) -> Option<bool> {
        let healthy = responders > 0;
        let previous = self.healthy.swap(healthy, Ordering::SeqCst);
        (previous != healthy).then_some(healthy)
    }
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self::new()
    }
}

type EvaluatorReply = (String, Result<EvaluatorVote, EvaluatorError>, u64);

/// One panel member as seen by status reports
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorStatus {
    pub id: String,
    pub role: EvaluatorRole,
    pub weight: f64,
}

/// Snapshot of the evaluator panel
#[derive(Debug, Clone)]
pub struct PanelStatus {
    pub evaluators: Vec<EvaluatorStatus>,
    pub healthy: bool,
    /// Results currently held in the decision history
    pub decisions_recorded: usize,
    pub last_decision: Option<ConsensusResult>,
}

pub struct ConsensusCoordinator {
    /// Panel, in configuration order
    evaluators: Vec<Arc<dyn Evaluator>>,
    /// Weight source read at the start of each round
    weights: Arc<WeightLedger>,
    params: TallyParams,
    /// Budget for each evaluator call
    evaluator_timeout: Duration,
    /// Fan-in cutoff for the whole round
    global_deadline: Duration,
    health: BackendHealth,
    /// Every result, bounded, with an optional journal
    history: DecisionLog,
    events: Option<broadcast::Sender<Event>>,
}

impl ConsensusCoordinator {
    pub fn new(config: &AppConfig, evaluators: Vec<Arc<dyn Evaluator>>, weights: Arc<WeightLedger>) -> Self {
        Self {
            evaluators,
            weights,
            params: TallyParams::from_config(&config.consensus, config.trading.max_size_fraction),
            evaluator_timeout: Duration::from_millis(config.consensus.evaluator_timeout_ms),
            global_deadline: Duration::from_millis(config.consensus.global_deadline_ms),
            health: BackendHealth::new(),
            history: DecisionLog::in_memory(config.consensus.history_size),
            events: None,
        }
    }

    /// Replace the in-memory history, e.g. with a journal-backed one
    pub fn with_decision_log(mut self, history: DecisionLog) -> Self {
        self.history = history;
        self
    }

    pub fn with_event_sender(mut self, sender: broadcast::Sender<Event>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn health(&self) -> &BackendHealth {
        &self.health
    }

    pub fn evaluator_count(&self) -> usize {
        self.evaluators.len()
    }

    pub fn decisions(&self) -> &DecisionLog {
        &self.history
    }

    /// The result a position's `consensus_id` refers to
    pub fn decision(&self, consensus_id: &str) -> Option<ConsensusResult> {
        self.history.get(consensus_id)
    }

    pub fn status(&self) -> PanelStatus {
        let weights = self.weights.weights();
        PanelStatus {
            evaluators: self
                .evaluators
                .iter()
                .map(|e| EvaluatorStatus {
                    id: e.id().to_string(),
                    role: e.role(),
                    weight: weights.get(e.id()).copied().unwrap_or(0.0),
                })
                .collect(),
            healthy: self.health.is_healthy(),
            decisions_recorded: self.history.len(),
            last_decision: self.history.recent(1).into_iter().next(),
        }
    }

    fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Fan out, then collect until everyone answers or the deadline passes.
    /// Stragglers keep running; their late send fails and is dropped.
    async fn collect_votes(&self, request: Arc<EvaluationRequest>) -> HashMap<String, EvaluatorVote> {
        let (tx, mut rx) = mpsc::channel::<EvaluatorReply>(self.evaluators.len().max(1));

        for evaluator in &self.evaluators {
            let evaluator = evaluator.clone();
            let request = request.clone();
            let tx = tx.clone();
            let timeout = self.evaluator_timeout;

            tokio::spawn(async move {
                let id = evaluator.id().to_string();
                let start = Instant::now();
                let outcome = match tokio::time::timeout(timeout, evaluator.evaluate(&request)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EvaluatorError::Timeout {
                        evaluator_id: id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                };
                let _ = tx.send((id, outcome, elapsed_ms(start))).await;
            });
        }
        drop(tx);

        let mut votes = HashMap::new();
        let deadline = tokio::time::sleep(self.global_deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                reply = rx.recv() => match reply {
                    Some((id, Ok(mut vote), latency_ms)) => {
                        vote.evaluator_id = id.clone();
                        if vote.latency_ms == 0 {
                            vote.latency_ms = latency_ms;
                        }
                        metrics::record_evaluator_latency(&id, latency_ms);
                        votes.insert(id, vote);
                    }
                    Some((id, Err(e), latency_ms)) => {
                        warn!("Evaluator {} abstained after {}ms: {}", id, latency_ms, e);
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        "Consensus deadline of {}ms reached with {}/{} votes",
                        self.global_deadline.as_millis(),
                        votes.len(),
                        self.evaluators.len()
                    );
                    break;
                }
            }
        }

        votes
    }

    pub async fn evaluate(&self, proposal: &TradeProposal, snapshot: &MarketSnapshot) -> ConsensusResult {
        let started = Instant::now();
        let weights = self.weights.weights();
        let request = Arc::new(EvaluationRequest {
            proposal: proposal.clone(),
            snapshot: snapshot.clone(),
        });

        let mut votes = self.collect_votes(request).await;

        let mut ordered = Vec::with_capacity(votes.len());
        let mut ballots = Vec::with_capacity(votes.len());
        let mut abstentions = Vec::new();
        for evaluator in &self.evaluators {
            match votes.remove(evaluator.id()) {
                Some(vote) => {
                    ballots.push(Ballot {
                        vote: vote.clone(),
                        role: evaluator.role(),
                        weight: weights.get(evaluator.id()).copied().unwrap_or(0.0),
                    });
                    ordered.push(vote);
                }
                None => {
                    metrics::record_abstention(evaluator.id());
                    abstentions.push(evaluator.id().to_string());
                }
            }
        }

        match self.health.observe(ordered.len()) {
            Some(false) => {
                warn!("Inference backend UNHEALTHY: no evaluator answered for {}", proposal.symbol);
                metrics::record_backend_health(false);
                self.publish(Event::BackendHealthChanged {
                    healthy: false,
                    detail: format!("all {} evaluators unreachable", self.evaluators.len()),
                });
            }
            Some(true) => {
                info!("Inference backend RECOVERED: {} evaluators answered", ordered.len());
                metrics::record_backend_health(true);
                self.publish(Event::BackendHealthChanged {
                    healthy: true,
                    detail: format!("{} evaluators answering", ordered.len()),
                });
            }
            None => {}
        }

        let degraded = tally::is_degraded(abstentions.len(), self.evaluators.len());
        let decision = if degraded {
            warn!(
                "Degraded consensus for {}: {}/{} evaluators abstained, using technical score {:.3}",
                proposal.symbol,
                abstentions.len(),
                self.evaluators.len(),
                proposal.technical_score
            );
            metrics::record_degraded_cycle();
            tally::degraded_decision(proposal, &self.params)
        } else {
            tally::decide(proposal, &ballots, &self.params)
        };

        if decision.veto {
            metrics::record_veto(decision.mediated);
        }

        let result = ConsensusResult {
            id: generate_id(),
            proposal_id: proposal.id.clone(),
            symbol: proposal.symbol.clone(),
            decision: decision.action,
            confidence: decision.confidence,
            consensus_type: decision.consensus_type,
            votes: ordered,
            abstentions,
            scores: decision.scores,
            veto: decision.veto,
            mediated: decision.mediated,
            degraded,
            size_fraction: decision.size_fraction,
            technical_score: proposal.technical_score,
            threshold: proposal.threshold,
            timestamp: current_timestamp_millis(),
        };

        info!(
            "Consensus {} for {}: {} ({}) confidence {:.3} vs threshold {:.2}, size {:.4}, {} votes, {} abstained in {}ms",
            result.id,
            result.symbol,
            result.decision,
            result.consensus_type,
            result.confidence,
            result.threshold,
            result.size_fraction,
            result.votes.len(),
            result.abstentions.len(),
            elapsed_ms(started)
        );
        debug!("Scores for {}: {:?}", result.symbol, result.scores);
        metrics::record_consensus_decision(&result.decision.to_string());

        if let Err(e) = self.history.record(&result).await {
            warn!("Failed to journal decision {}: {}", result.id, e);
            metrics::record_error();
        }
        self.publish(Event::ConsensusReached { result: result.clone() });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::volatility::Regime;
    use crate::evaluators::EvaluatorRole;
    use crate::utils::types::{Action, ConsensusType, VoteDecision};
    use async_trait::async_trait;

    struct FixedEvaluator {
        id: String,
        role: EvaluatorRole,
        decision: VoteDecision,
        confidence: f64,
        delay: Duration,
    }

    #[async_trait]
    impl Evaluator for FixedEvaluator {
        fn id(&self) -> &str {
            &self.id
        }

        fn role(&self) -> EvaluatorRole {
            self.role
        }

        async fn evaluate(&self, _request: &EvaluationRequest) -> Result<EvaluatorVote, EvaluatorError> {
            tokio::time::sleep(self.delay).await;
            Ok(EvaluatorVote::new(self.id.clone(), self.decision, self.confidence))
        }
    }

    const ROLES: [(&str, EvaluatorRole); 5] = [
        ("strategy", EvaluatorRole::Strategy),
        ("market", EvaluatorRole::Market),
        ("risk", EvaluatorRole::Risk),
        ("execution", EvaluatorRole::Execution),
        ("auditor", EvaluatorRole::Auditor),
    ];

    fn config() -> AppConfig {
        let mut config = AppConfig::paper_default();
        for e in config.evaluators.iter_mut() {
            e.initial_weight = 0.2;
        }
        config.consensus.evaluator_timeout_ms = 1_000;
        config.consensus.global_deadline_ms = 2_000;
        config
    }

    fn coordinator(votes: [(VoteDecision, f64, u64); 5]) -> ConsensusCoordinator {
        let config = config();
        let evaluators = ROLES
            .iter()
            .zip(votes.iter())
            .map(|((id, role), (decision, confidence, delay_ms))| {
                Arc::new(FixedEvaluator {
                    id: id.to_string(),
                    role: *role,
                    decision: *decision,
                    confidence: *confidence,
                    delay: Duration::from_millis(*delay_ms),
                }) as Arc<dyn Evaluator>
            })
            .collect();
        let weights = Arc::new(WeightLedger::new(&config.evaluators, config.rebalance.clone()).unwrap());
        ConsensusCoordinator::new(&config, evaluators, weights)
    }

    fn inputs(score: f64, threshold: f64) -> (TradeProposal, MarketSnapshot) {
        (
            TradeProposal::new("BTC/USDT", Action::Buy, 0.05, score, threshold, Regime::Low),
            MarketSnapshot::new("BTC/USDT", 100.0, 1.0, 10.0),
        )
    }

    #[tokio::test]
    async fn test_unanimous_round() {
        let c = coordinator([
            (VoteDecision::Buy, 0.8, 0),
            (VoteDecision::Buy, 0.7, 0),
            (VoteDecision::Buy, 0.6, 0),
            (VoteDecision::Buy, 0.75, 0),
            (VoteDecision::Buy, 0.9, 0),
        ]);
        let (proposal, snapshot) = inputs(0.6, 0.40);
        let result = c.evaluate(&proposal, &snapshot).await;

        assert_eq!(result.decision, Action::Buy);
        assert_eq!(result.consensus_type, ConsensusType::Strong(Action::Buy));
        assert_eq!(result.proposal_id, proposal.id);
        assert_eq!(result.supporting_evaluators().len(), 5);
        assert!(!result.degraded);
    }

    #[tokio::test]
    async fn test_veto_round() {
        let c = coordinator([
            (VoteDecision::Buy, 0.9, 0),
            (VoteDecision::Buy, 0.9, 0),
            (VoteDecision::Reject, 0.9, 0),
            (VoteDecision::Buy, 0.9, 0),
            (VoteDecision::Buy, 0.9, 0),
        ]);
        let (proposal, snapshot) = inputs(0.9, 0.40);
        let result = c.evaluate(&proposal, &snapshot).await;

        assert_eq!(result.decision, Action::Hold);
        assert!(result.veto);
        assert_eq!(result.consensus_type, ConsensusType::RejectedByRisk);
    }

    #[tokio::test]
    async fn test_results_are_kept_for_lookup() {
        let c = coordinator([(VoteDecision::Buy, 0.8, 0); 5]);
        let (proposal, snapshot) = inputs(0.6, 0.40);

        let first = c.evaluate(&proposal, &snapshot).await;
        let second = c.evaluate(&proposal, &snapshot).await;

        assert_eq!(c.decision(&first.id), Some(first.clone()));
        let status = c.status();
        assert_eq!(status.decisions_recorded, 2);
        assert_eq!(status.last_decision.map(|r| r.id), Some(second.id));
        assert_eq!(status.evaluators.len(), 5);
        assert!((status.evaluators.iter().map(|e| e.weight).sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(c.decision("missing").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_majority_timeout_degrades() {
        let c = coordinator([
            (VoteDecision::Sell, 0.9, 0),
            (VoteDecision::Sell, 0.9, 0),
            (VoteDecision::Reject, 0.9, 5_000),
            (VoteDecision::Sell, 0.9, 5_000),
            (VoteDecision::Sell, 0.9, 5_000),
        ]);
        let (proposal, snapshot) = inputs(0.5, 0.45);
        let result = c.evaluate(&proposal, &snapshot).await;

        assert!(result.degraded);
        assert_eq!(result.consensus_type, ConsensusType::Degraded);
        assert_eq!(result.decision, Action::Buy);
        assert_eq!(result.abstentions, vec!["risk", "execution", "auditor"]);
        assert!(result.supporting_evaluators().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_abstention_renormalizes() {
        let c = coordinator([
            (VoteDecision::Buy, 0.8, 0),
            (VoteDecision::Buy, 0.8, 0),
            (VoteDecision::Buy, 0.8, 0),
            (VoteDecision::Buy, 0.8, 0),
            (VoteDecision::Buy, 0.8, 5_000),
        ]);
        let (proposal, snapshot) = inputs(0.5, 0.40);
        let result = c.evaluate(&proposal, &snapshot).await;

        assert!(!result.degraded);
        assert!((result.scores.buy - 0.8).abs() < 1e-9);
        assert_eq!(result.abstentions, vec!["auditor"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_outage_and_recovery() {
        let (tx, mut rx) = broadcast::channel(16);
        let c = coordinator([(VoteDecision::Buy, 0.8, 5_000); 5]).with_event_sender(tx);
        let (proposal, snapshot) = inputs(0.5, 0.40);

        let result = c.evaluate(&proposal, &snapshot).await;
        assert!(result.degraded);
        assert!(!c.health().is_healthy());

        let mut saw_unhealthy = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::BackendHealthChanged { healthy: false, .. } = event {
                saw_unhealthy = true;
            }
        }
        assert!(saw_unhealthy);

        assert_eq!(c.health.observe(1), Some(true));
        assert!(c.health().is_healthy());
    }
}
