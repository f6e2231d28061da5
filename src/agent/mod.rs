//! Agent Module
//!
//! Drives the trading loop:
//! - One cycle per symbol per round, symbols in parallel
//! - Cycles for the same symbol serialized behind a per-symbol lock
//! - Stop/take exits, consensus voting and execution within a cycle
//! - Evaluator feedback applied in the cycle that closes a position

pub mod rebalancer;
pub mod risk_manager;
pub mod state_machine;

pub use rebalancer::FeedbackRebalancer;
pub use risk_manager::{PauseCause, RiskCheckResult, RiskManager, RiskMetrics};
pub use state_machine::{CycleState, CycleStateMachine, StateTransition};

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, TradingConfig};
use crate::consensus::{ConsensusCoordinator, DecisionLog};
use crate::engines::technical::IndicatorScorer;
use crate::engines::volatility::{source_from_config, Classification, VolatilityClassifier, VolatilitySource};
use crate::engines::{ProposalEngine, TechnicalScorer};
use crate::error::ExchangeError;
use crate::evaluators::{build_evaluators, Evaluator};
use crate::exchange::ExchangeConnector;
use crate::ledger::WeightLedger;
use crate::network::event_bus::{Event, EventBus};
use crate::position::{CloseReason, ExitLevels, Position, PositionLedger, Side};
use crate::state::SharedState;
use crate::telemetry::metrics;
use crate::utils::types::{ConsensusResult, MarketSnapshot};

/// Extra time on top of the consensus deadline for a round to wind down
const SHUTDOWN_SLACK: Duration = Duration::from_secs(10);

/// What one symbol cycle ended with
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Trading paused; nothing was done
    Paused,
    /// No snapshot this cycle
    NoMarketData(ExchangeError),
    /// Open position hit its stop or take level
    Exited(Position),
    /// Consensus did not approve a trade
    Held(ConsensusResult),
    /// Approved in the direction already held; no stacking
    AlreadyPositioned(ConsensusResult),
    Opened(Position),
    /// Approved against the open position, which was closed
    Closed(Position),
    /// The exchange refused the order; retried next cycle
    ExecutionFailed {
        result: Option<ConsensusResult>,
        error: ExchangeError,
    },
}

impl CycleOutcome {
    pub fn consensus(&self) -> Option<&ConsensusResult> {
        match self {
            CycleOutcome::Held(r) | CycleOutcome::AlreadyPositioned(r) => Some(r),
            CycleOutcome::ExecutionFailed { result, .. } => result.as_ref(),
            _ => None,
        }
    }

    pub fn closed_position(&self) -> Option<&Position> {
        match self {
            CycleOutcome::Exited(p) | CycleOutcome::Closed(p) => Some(p),
            _ => None,
        }
    }
}

/// Result of one round across all symbols
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub cycle: u64,
    pub classification: Option<Classification>,
    pub outcomes: Vec<(String, CycleOutcome)>,
    /// Symbols whose cycle failed outright
    pub failures: Vec<(String, String)>,
}

impl RoundReport {
    pub fn outcome(&self, symbol: &str) -> Option<&CycleOutcome> {
        self.outcomes.iter().find(|(s, _)| s == symbol).map(|(_, o)| o)
    }

    pub fn closed_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.closed_position().is_some()).count()
    }
}

/// Collaborators the agent is assembled from
pub struct AgentParts {
    pub exchange: Arc<dyn ExchangeConnector>,
    pub volatility_source: Arc<dyn VolatilitySource>,
    pub scorer: Arc<dyn TechnicalScorer>,
    pub evaluators: Vec<Arc<dyn Evaluator>>,
    pub weights: Arc<WeightLedger>,
    pub positions: PositionLedger,
    /// History backing consensus id lookups
    pub decisions: DecisionLog,
}

impl AgentParts {
    /// Build every part from config, restoring persisted ledgers
    pub async fn from_config(config: &AppConfig, exchange: Arc<dyn ExchangeConnector>) -> Result<Self> {
        let volatility_source =
            source_from_config(&config.volatility.source).context("Failed to build volatility source")?;
        let evaluators = build_evaluators(config).context("Failed to build evaluators")?;
        let weights = WeightLedger::open(
            &config.evaluators,
            config.rebalance.clone(),
            &config.persistence.weights_path,
        )
        .await
        .context("Failed to open weight ledger")?;
        let positions = PositionLedger::open_file(exit_levels(&config.trading), &config.persistence.positions_path)
            .await
            .context("Failed to open position ledger")?;
        let decisions = DecisionLog::open(&config.persistence.decisions_path, config.consensus.history_size)
            .await
            .context("Failed to open decision history")?;

        Ok(Self {
            exchange,
            volatility_source,
            scorer: Arc::new(IndicatorScorer::default()),
            evaluators,
            weights: Arc::new(weights),
            positions,
            decisions,
        })
    }
}

/// Stop/take percentages from config; 0 disables a level
pub fn exit_levels(trading: &TradingConfig) -> ExitLevels {
    ExitLevels {
        stop_loss_pct: (trading.stop_loss_pct > 0.0).then_some(trading.stop_loss_pct),
        take_profit_pct: (trading.take_profit_pct > 0.0).then_some(trading.take_profit_pct),
    }
}

/// Trading agent that coordinates all components
pub struct TradingAgent {
    /// Configuration
    config: Arc<AppConfig>,
    /// Shared state
    state: Arc<SharedState>,
    /// Market data and order placement
    exchange: Arc<dyn ExchangeConnector>,
    /// Regime and confidence threshold for each round
    classifier: Arc<VolatilityClassifier>,
    /// Builds trade proposals from snapshots
    proposals: ProposalEngine,
    /// Runs the evaluator vote
    coordinator: Arc<ConsensusCoordinator>,
    /// Open and closed positions
    positions: Arc<PositionLedger>,
    /// Evaluator weights
    weights: Arc<WeightLedger>,
    /// Sizing, exits and system limits
    risk_manager: Arc<RiskManager>,
    /// Applies trade outcomes to the weights
    rebalancer: Arc<FeedbackRebalancer>,
    /// Event bus for observers
    bus: Arc<EventBus>,
    /// Per-symbol cycle lock; holding it serializes that symbol's cycles
    cycles: DashMap<String, Arc<tokio::sync::Mutex<CycleStateMachine>>>,
    /// Background task handles
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Is running
    running: Arc<RwLock<bool>>,
    /// Wakes the loop out of its interval wait on stop
    shutdown: Arc<Notify>,
}

impl TradingAgent {
    pub fn new(config: Arc<AppConfig>, state: Arc<SharedState>, bus: Arc<EventBus>, parts: AgentParts) -> Self {
        let events = bus.sender();

        let classifier = Arc::new(
            VolatilityClassifier::new(config.volatility.clone(), parts.volatility_source)
                .with_event_sender(events.clone()),
        );
        let coordinator = Arc::new(
            ConsensusCoordinator::new(&config, parts.evaluators, parts.weights.clone())
                .with_decision_log(parts.decisions)
                .with_event_sender(events.clone()),
        );
        let positions = Arc::new(parts.positions.with_event_sender(events.clone()));
        let rebalancer = Arc::new(FeedbackRebalancer::new(parts.weights.clone()).with_event_sender(events));
        let risk_manager = Arc::new(RiskManager::new(config.clone(), state.clone()));

        Self {
            proposals: ProposalEngine::new(config.clone(), parts.scorer),
            config,
            state,
            exchange: parts.exchange,
            classifier,
            coordinator,
            positions,
            weights: parts.weights,
            risk_manager,
            rebalancer,
            bus,
            cycles: DashMap::new(),
            background: Mutex::new(Vec::new()),
            running: Arc::new(RwLock::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn positions(&self) -> &Arc<PositionLedger> {
        &self.positions
    }

    pub fn weights(&self) -> &Arc<WeightLedger> {
        &self.weights
    }

    pub fn classifier(&self) -> &Arc<VolatilityClassifier> {
        &self.classifier
    }

    pub fn coordinator(&self) -> &Arc<ConsensusCoordinator> {
        &self.coordinator
    }

    pub fn risk_manager(&self) -> &Arc<RiskManager> {
        &self.risk_manager
    }

    pub fn rebalancer(&self) -> &Arc<FeedbackRebalancer> {
        &self.rebalancer
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn publish(&self, event: Event) {
        self.bus.publish(event);
    }

    fn cycle_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<CycleStateMachine>> {
        self.cycles
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(CycleStateMachine::new(symbol))))
            .clone()
    }

    /// Current state of `symbol`'s cycle, waiting for any cycle in flight
    pub async fn cycle_state(&self, symbol: &str) -> CycleState {
        self.cycle_lock(symbol).lock().await.current_state()
    }

    /// Move an idle symbol into Paused
    fn park(machine: &mut CycleStateMachine, reason: Option<String>) {
        if machine.current_state() != CycleState::Paused {
            machine.transition_to_with_reason(CycleState::Paused, reason);
        }
    }

    /// Run one cycle for `symbol` under the round's classification
    pub async fn run_symbol_cycle(&self, symbol: &str, classification: &Classification) -> Result<CycleOutcome> {
        let lock = self.cycle_lock(symbol);
        let mut machine = lock.lock().await;

        if self.state.is_paused() {
            debug!("{}: trading paused, skipping cycle", symbol);
            Self::park(&mut machine, self.state.pause_reason());
            return Ok(CycleOutcome::Paused);
        }
        if machine.current_state() == CycleState::Paused {
            machine.transition_to_with_reason(CycleState::Idle, Some("trading resumed".to_string()));
        }

        match self.drive_cycle(&mut machine, symbol, classification).await {
            Ok(outcome) => {
                if machine.current_state() != CycleState::Idle {
                    machine.transition_to(CycleState::Idle);
                }
                Ok(outcome)
            }
            Err(e) => {
                error!("{}: cycle failed: {:#}", symbol, e);
                self.state.increment_error_count();
                metrics::record_error();
                machine.reset(&e.to_string());
                Err(e)
            }
        }
    }

    async fn drive_cycle(
        &self,
        machine: &mut CycleStateMachine,
        symbol: &str,
        classification: &Classification,
    ) -> Result<CycleOutcome> {
        machine.transition_to(CycleState::Observing);
        metrics::record_cycle(symbol);

        let snapshot = match self.exchange.get_snapshot(symbol).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("{}: no snapshot this cycle: {}", symbol, e);
                self.state.increment_error_count();
                machine.transition_to_with_reason(CycleState::Idle, Some(e.to_string()));
                return Ok(CycleOutcome::NoMarketData(e));
            }
        };

        if let Some(position) = self.positions.get_open(symbol) {
            self.positions
                .mark(symbol, snapshot.price)
                .context("Failed to mark open position")?;

            if let Some(reason) = self.risk_manager.exit_for(&position, snapshot.price) {
                machine.transition_to_with_reason(CycleState::Exiting, Some(reason.to_string()));
                return self.exit_position(&position, reason, None).await;
            }
        }

        machine.transition_to(CycleState::Proposing);
        let proposal = self.proposals.propose(&snapshot, classification);
        self.publish(Event::ProposalCreated { proposal: proposal.clone() });

        machine.transition_to(CycleState::Voting);
        let result = self.coordinator.evaluate(&proposal, &snapshot).await;
        self.record_consensus(&result, &snapshot);

        if !result.is_actionable() {
            debug!("{}: {} ({:.3}), nothing to execute", symbol, result.consensus_type, result.confidence);
            return Ok(CycleOutcome::Held(result));
        }

        machine.transition_to(CycleState::Executing);
        self.execute(&result, &snapshot).await
    }

    fn record_consensus(&self, result: &ConsensusResult, snapshot: &MarketSnapshot) {
        self.state
            .record_decision(&result.symbol, snapshot.price, result.decision, result.confidence);
        self.state.set_backend_healthy(self.coordinator.health().is_healthy());
        if result.degraded {
            self.state.increment_degraded_cycles();
        }
        if result.veto {
            self.state.increment_veto_count();
        }
    }

    /// Act on an approved decision: open, close on an opposite signal, or
    /// leave a same-side position alone
    async fn execute(&self, result: &ConsensusResult, snapshot: &MarketSnapshot) -> Result<CycleOutcome> {
        let symbol = result.symbol.as_str();

        if let Some(position) = self.positions.get_open(symbol) {
            if Side::from_action(result.decision) == Some(position.side) {
                info!(
                    "{}: {} approved but a {} position is already open, not stacking",
                    symbol, result.decision, position.side
                );
                return Ok(CycleOutcome::AlreadyPositioned(result.clone()));
            }
            info!(
                "{}: {} approved against open {} position, closing",
                symbol, result.decision, position.side
            );
            return self.exit_position(&position, CloseReason::Signal, Some(result)).await;
        }

        let Some(quantity) = self.risk_manager.quantity_for(result.size_fraction, snapshot.price) else {
            warn!(
                "{}: size {:.4} at {} gives no valid quantity",
                symbol, result.size_fraction, snapshot.price
            );
            return Ok(CycleOutcome::Held(result.clone()));
        };

        let fill = match self.exchange.place_order(symbol, result.decision, quantity).await {
            Ok(fill) => fill,
            Err(e) => return Ok(self.execution_failed(symbol, Some(result), e)),
        };
        self.record_fill();

        let position = self
            .positions
            .open(result, fill, quantity)
            .context("Filled order could not be recorded")
            .inspect_err(|e| {
                self.publish(Event::LedgerInvariantViolation {
                    detail: format!("{}: {:#}", symbol, e),
                })
            })?;

        self.persist().await;
        Ok(CycleOutcome::Opened(position))
    }

    async fn exit_position(
        &self,
        position: &Position,
        reason: CloseReason,
        result: Option<&ConsensusResult>,
    ) -> Result<CycleOutcome> {
        let symbol = position.symbol.as_str();
        let fill = match self
            .exchange
            .place_order(symbol, position.side.exit_action(), position.quantity)
            .await
        {
            Ok(fill) => fill,
            Err(e) => return Ok(self.execution_failed(symbol, result, e)),
        };
        self.record_fill();

        let closed = self
            .positions
            .close(symbol, fill, reason)
            .context("Exit fill could not be recorded")
            .inspect_err(|e| {
                self.publish(Event::LedgerInvariantViolation {
                    detail: format!("{}: {:#}", symbol, e),
                })
            })?;
        metrics::record_position_closed(&closed.outcome.to_string());

        // Failures are logged and published inside rebalance
        let _ = self.rebalancer.rebalance(&closed).await;

        self.persist().await;
        Ok(match reason {
            CloseReason::Signal => CycleOutcome::Closed(closed),
            _ => CycleOutcome::Exited(closed),
        })
    }

    fn execution_failed(&self, symbol: &str, result: Option<&ConsensusResult>, error: ExchangeError) -> CycleOutcome {
        warn!("{}: execution failed, will retry next cycle: {}", symbol, error);
        metrics::record_trade_failure();
        self.state.increment_error_count();
        self.publish(Event::ExecutionFailed {
            symbol: symbol.to_string(),
            reason: error.to_string(),
        });
        CycleOutcome::ExecutionFailed {
            result: result.cloned(),
            error,
        }
    }

    fn record_fill(&self) {
        metrics::record_trade_success();
        self.state.increment_trade_count();
    }

    async fn persist(&self) {
        if let Err(e) = self.positions.save().await {
            error!("Failed to persist positions: {}", e);
            metrics::record_error();
        }
    }

    fn refresh_pnl(&self) {
        let totals = self.positions.totals();
        self.state.realized_pnl.store(totals.realized_pnl);
        self.state.unrealized_pnl.store(totals.unrealized_pnl);
        metrics::record_pnl(totals.realized_pnl, totals.unrealized_pnl);
    }

    /// One round: classify once, then run every symbol concurrently
    pub async fn run_round(self: &Arc<Self>) -> RoundReport {
        let was_paused = self.state.is_paused();
        let check = self.risk_manager.check_all(&self.positions.totals());
        if check.resumed {
            info!("Risk limits cleared, trading resumed");
            self.publish(Event::SystemResume);
        }
        if check.should_pause && !was_paused {
            let reason = check.reasons.join("; ");
            warn!("Risk check paused trading: {}", reason);
            self.publish(Event::SystemPause { reason });
        }
        if self.state.is_paused() {
            let reason = self.state.pause_reason();
            for symbol in &self.config.trading.symbols {
                let lock = self.cycle_lock(symbol);
                Self::park(&mut *lock.lock().await, reason.clone());
            }
            return RoundReport {
                cycle: self.state.cycle_count.load(Ordering::SeqCst),
                classification: None,
                outcomes: self
                    .config
                    .trading
                    .symbols
                    .iter()
                    .map(|s| (s.clone(), CycleOutcome::Paused))
                    .collect(),
                failures: Vec::new(),
            };
        }

        let cycle = self.state.increment_cycle_count();
        let errors_before = self.state.error_count.load(Ordering::SeqCst);
        let classification = self.classifier.for_cycle().await;
        self.state.update_regime(classification.regime, classification.reading);
        info!(
            "Round {}: regime {} (reading {:.2}{}), threshold {:.2}",
            cycle,
            classification.regime,
            classification.reading,
            if classification.fallback { ", fallback" } else { "" },
            classification.threshold
        );

        let tasks: Vec<_> = self
            .config
            .trading
            .symbols
            .iter()
            .map(|symbol| {
                let agent = self.clone();
                let symbol = symbol.clone();
                let classification = classification.clone();
                tokio::spawn(async move {
                    let outcome = agent.run_symbol_cycle(&symbol, &classification).await;
                    (symbol, outcome)
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        let mut failures = Vec::new();
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok((symbol, Ok(outcome))) => outcomes.push((symbol, outcome)),
                Ok((symbol, Err(e))) => failures.push((symbol, format!("{:#}", e))),
                Err(e) => {
                    error!("Symbol task panicked: {}", e);
                    failures.push(("<unknown>".to_string(), e.to_string()));
                }
            }
        }

        if self.state.error_count.load(Ordering::SeqCst) == errors_before {
            self.state.clear_consecutive_errors();
        }

        self.refresh_pnl();
        self.publish(Event::Heartbeat {
            timestamp: chrono::Utc::now().timestamp_millis(),
        });

        RoundReport {
            cycle,
            classification: Some((*classification).clone()),
            outcomes,
            failures,
        }
    }

    /// Single round; evaluator feedback for anything it closed is already applied
    pub async fn run_once(self: &Arc<Self>) -> RoundReport {
        self.run_round().await
    }

    /// Start the periodic trading loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        *self.running.write().await = true;
        info!(
            "Trading agent starting: {} symbols every {}s",
            self.config.trading.symbols.len(),
            self.config.trading.cycle_interval_secs
        );

        let agent = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(agent.config.trading.cycle_interval_secs.max(1)));

            while *agent.running.read().await {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = agent.shutdown.notified() => break,
                }
                if !*agent.running.read().await {
                    break;
                }

                let report = agent.run_round().await;
                for (symbol, failure) in &report.failures {
                    error!("Round {} failed for {}: {}", report.cycle, symbol, failure);
                }
            }

            info!("Trading agent stopped");
        });
        self.background.lock().push(handle);

        Ok(())
    }

    /// Stop the loop, letting a round in flight finish its cycles
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.shutdown.notify_one();
        info!("Trading agent stopping");

        let grace = Duration::from_millis(self.config.consensus.global_deadline_ms) + SHUTDOWN_SLACK;
        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Round still running after {:?}, aborting", grace);
                handle.abort();
            }
        }
        self.persist().await;
        if let Err(e) = self.weights.save().await {
            error!("Failed to persist weights: {}", e);
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Close the open position for `symbol` at market
    pub async fn close_manually(&self, symbol: &str) -> Result<Position> {
        let lock = self.cycle_lock(symbol);
        let _machine = lock.lock().await;

        let position = self
            .positions
            .get_open(symbol)
            .with_context(|| format!("no open position for {}", symbol))?;
        match self.exit_position(&position, CloseReason::Manual, None).await? {
            CycleOutcome::Exited(closed) => Ok(closed),
            CycleOutcome::ExecutionFailed { error, .. } => Err(error).context("manual close failed"),
            other => anyhow::bail!("unexpected outcome {:?}", other),
        }
    }

    /// Event receiver for callers that want to watch the loop
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Paused flag and reason
    pub fn pause(&self, reason: &str) {
        warn!("Trading paused: {}", reason);
        self.state.pause(reason);
        self.publish(Event::SystemPause {
            reason: reason.to_string(),
        });
    }

    pub fn resume(&self) {
        info!("Trading resumed");
        self.risk_manager.reset();
        self.publish(Event::SystemResume);
    }
}
