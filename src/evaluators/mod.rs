//! Evaluators Module
//!
//! An evaluator is one independent opinion on a trade proposal. All of them
//! share the [`Evaluator`] trait; what differs is role data (veto power,
//! override rights, mandate) and the inference backend behind the call.

pub mod backend;
pub mod heuristic;
pub mod ollama;

pub use backend::{BackendReply, InferenceBackend};
pub use heuristic::HeuristicBackend;
pub use ollama::OllamaBackend;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{AppConfig, BackendConfig};
use crate::error::EvaluatorError;
use crate::utils::helpers::elapsed_ms;
use crate::utils::types::{EvaluatorVote, MarketSnapshot, TradeProposal};

/// Evaluator role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorRole {
    Strategy,
    Market,
    Risk,
    Execution,
    Auditor,
}

impl EvaluatorRole {
    /// Only Risk can block a trade outright
    pub fn has_veto_power(&self) -> bool {
        matches!(self, EvaluatorRole::Risk)
    }

    /// The auditor is the mandatory party to any veto override
    pub fn is_auditor(&self) -> bool {
        matches!(self, EvaluatorRole::Auditor)
    }

    pub fn mandate(&self) -> &'static str {
        match self {
            EvaluatorRole::Strategy => {
                "You are a crypto trading strategist. Judge whether the proposed trade \
                 fits the technical picture and the current volatility regime."
            }
            EvaluatorRole::Market => {
                "You are a market analyst. Judge trend, momentum and volume context \
                 for the proposed trade."
            }
            EvaluatorRole::Risk => {
                "You are the risk manager and hold veto power. Answer REJECT when the \
                 trade is unsafe; suggest a size_multiplier below 1 when it is only too large."
            }
            EvaluatorRole::Execution => {
                "You are an execution specialist. Judge liquidity and whether now is a \
                 reasonable moment to enter."
            }
            EvaluatorRole::Auditor => {
                "You are the auditor. Check the proposal for conflicting signals. Set \
                 override_veto only when a risk rejection would clearly be a mistake."
            }
        }
    }
}

impl std::fmt::Display for EvaluatorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluatorRole::Strategy => write!(f, "strategy"),
            EvaluatorRole::Market => write!(f, "market"),
            EvaluatorRole::Risk => write!(f, "risk"),
            EvaluatorRole::Execution => write!(f, "execution"),
            EvaluatorRole::Auditor => write!(f, "auditor"),
        }
    }
}

/// Input to one evaluator call
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRequest {
    pub proposal: TradeProposal,
    pub snapshot: MarketSnapshot,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    fn id(&self) -> &str;

    fn role(&self) -> EvaluatorRole;

    fn has_veto_power(&self) -> bool {
        self.role().has_veto_power()
    }

    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluatorVote, EvaluatorError>;
}

/// Evaluator that delegates to an inference backend
pub struct ModelEvaluator {
    id: String,
    role: EvaluatorRole,
    backend: Arc<dyn InferenceBackend>,
}

impl ModelEvaluator {
    pub fn new(id: impl Into<String>, role: EvaluatorRole, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            id: id.into(),
            role,
            backend,
        }
    }
}

#[async_trait]
impl Evaluator for ModelEvaluator {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> EvaluatorRole {
        self.role
    }

    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluatorVote, EvaluatorError> {
        let start = Instant::now();
        let reply = self.backend.infer(self.role, request).await?;

        let mut vote = EvaluatorVote::new(self.id.clone(), reply.decision, reply.confidence)
            .with_rationale(reply.rationale);
        if let Some(modification) = reply.modification {
            vote = vote.with_modification(modification);
        }
        vote.latency_ms = elapsed_ms(start);

        debug!(
            "Evaluator {} ({} via {}) voted {} @ {:.2} in {}ms",
            self.id,
            self.role,
            self.backend.name(),
            vote.decision,
            vote.confidence,
            vote.latency_ms
        );
        Ok(vote)
    }
}

/// Build the evaluator set described in config
pub fn build_evaluators(config: &AppConfig) -> Result<Vec<Arc<dyn Evaluator>>> {
    let timeout = Duration::from_millis(config.consensus.evaluator_timeout_ms);
    let heuristic: Arc<dyn InferenceBackend> = Arc::new(HeuristicBackend::default());

    config
        .evaluators
        .iter()
        .map(|e| {
            let backend: Arc<dyn InferenceBackend> = match &e.backend {
                BackendConfig::Heuristic => heuristic.clone(),
                BackendConfig::Ollama { url, model, temperature } => {
                    Arc::new(OllamaBackend::new(url, model, *temperature, timeout)?)
                }
            };
            Ok(Arc::new(ModelEvaluator::new(e.id.clone(), e.role, backend)) as Arc<dyn Evaluator>)
        })
        .collect()
}
