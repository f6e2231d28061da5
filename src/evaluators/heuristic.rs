//! Deterministic rule-based backend
//!
//! Stands in for a model during paper trading and tests. Each role applies a
//! small rule set to the snapshot indicators and the proposal.

use async_trait::async_trait;

use super::backend::{BackendReply, InferenceBackend};
use super::{EvaluationRequest, EvaluatorRole};
use crate::engines::technical::indicators;
use crate::engines::volatility::Regime;
use crate::error::EvaluatorError;
use crate::utils::types::{Action, VoteDecision, VoteModification};

#[derive(Debug, Clone)]
pub struct HeuristicBackend {
    /// Technical conviction a strategist needs to follow the proposal
    pub min_conviction: f64,
    /// Conviction at which the auditor will back an override
    pub override_conviction: f64,
    /// Volume ratio below which execution declines
    pub thin_volume_ratio: f64,
}

impl Default for HeuristicBackend {
    fn default() -> Self {
        Self {
            min_conviction: 0.3,
            override_conviction: 0.8,
            thin_volume_ratio: 0.5,
        }
    }
}

impl HeuristicBackend {
    fn reply(decision: VoteDecision, confidence: f64, rationale: impl Into<String>) -> BackendReply {
        BackendReply {
            decision,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.into(),
            modification: None,
        }
    }

    fn strategy(&self, request: &EvaluationRequest) -> BackendReply {
        let p = &request.proposal;
        let conviction = p.technical_score.abs();
        if p.action.is_directional() && conviction >= self.min_conviction {
            Self::reply(p.action.into(), 0.5 + conviction / 2.0, format!("technical score {:.2}", p.technical_score))
        } else {
            Self::reply(VoteDecision::Hold, 0.5, "technical conviction too low")
        }
    }

    fn market(&self, request: &EvaluationRequest) -> BackendReply {
        let s = &request.snapshot;
        let surge = s.indicator(indicators::VOLUME_RATIO).map(|v| v > 1.2).unwrap_or(false);
        let bonus = if surge { 0.1 } else { 0.0 };

        match s.indicator(indicators::SMA_50) {
            Some(sma) if s.price > sma => Self::reply(VoteDecision::Buy, 0.6 + bonus, "price above SMA50"),
            Some(sma) if s.price < sma => Self::reply(VoteDecision::Sell, 0.6 + bonus, "price below SMA50"),
            _ => Self::reply(request.proposal.action.into(), 0.5, "no trend reference"),
        }
    }

    fn risk(&self, request: &EvaluationRequest) -> BackendReply {
        let p = &request.proposal;
        if !p.action.is_directional() {
            return Self::reply(VoteDecision::Hold, 0.6, "nothing to approve");
        }

        if p.regime == Regime::Panic && p.technical_score.abs() < self.override_conviction {
            return Self::reply(VoteDecision::Reject, 0.85, "panic regime without strong conviction");
        }
        let rsi = request.snapshot.indicator(indicators::RSI);
        let against_rsi = match (p.action, rsi) {
            (Action::Buy, Some(rsi)) => rsi > 75.0,
            (Action::Sell, Some(rsi)) => rsi < 25.0,
            _ => false,
        };
        if against_rsi {
            return Self::reply(VoteDecision::Reject, 0.8, "entry against an RSI extreme");
        }

        let mut reply = Self::reply(p.action.into(), 0.65, "within risk limits");
        if p.regime == Regime::Elevated {
            reply.modification = Some(VoteModification {
                size_multiplier: Some(0.5),
                override_veto: false,
            });
            reply.rationale = "elevated volatility, halve size".to_string();
        }
        reply
    }

    fn execution(&self, request: &EvaluationRequest) -> BackendReply {
        let thin = request
            .snapshot
            .indicator(indicators::VOLUME_RATIO)
            .map(|v| v < self.thin_volume_ratio)
            .unwrap_or(false);
        if thin {
            Self::reply(VoteDecision::Hold, 0.6, "thin liquidity")
        } else {
            Self::reply(request.proposal.action.into(), 0.6, "liquidity adequate")
        }
    }

    fn auditor(&self, request: &EvaluationRequest) -> BackendReply {
        let p = &request.proposal;
        let conviction = p.technical_score.abs();
        let mut reply = Self::reply(p.action.into(), 0.5 + conviction * 0.3, "no conflicting signals");
        if p.action.is_directional() && conviction >= self.override_conviction {
            reply.modification = Some(VoteModification {
                size_multiplier: None,
                override_veto: true,
            });
        }
        reply
    }
}

#[async_trait]
impl InferenceBackend for HeuristicBackend {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn infer(&self, role: EvaluatorRole, request: &EvaluationRequest) -> Result<BackendReply, EvaluatorError> {
        Ok(match role {
            EvaluatorRole::Strategy => self.strategy(request),
            EvaluatorRole::Market => self.market(request),
            EvaluatorRole::Risk => self.risk(request),
            EvaluatorRole::Execution => self.execution(request),
            EvaluatorRole::Auditor => self.auditor(request),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::{MarketSnapshot, TradeProposal};

    fn request(action: Action, score: f64, regime: Regime) -> EvaluationRequest {
        EvaluationRequest {
            proposal: TradeProposal::new("BTC/USDT", action, 0.05, score, 0.45, regime),
            snapshot: MarketSnapshot::new("BTC/USDT", 100.0, 1.0, 15.0),
        }
    }

    #[tokio::test]
    async fn test_risk_vetoes_in_panic() {
        let backend = HeuristicBackend::default();
        let reply = backend.infer(EvaluatorRole::Risk, &request(Action::Buy, 0.5, Regime::Panic)).await.unwrap();
        assert_eq!(reply.decision, VoteDecision::Reject);
    }

    #[tokio::test]
    async fn test_risk_halves_size_when_elevated() {
        let backend = HeuristicBackend::default();
        let reply = backend.infer(EvaluatorRole::Risk, &request(Action::Sell, 0.5, Regime::Elevated)).await.unwrap();
        assert_eq!(reply.decision, VoteDecision::Sell);
        assert_eq!(reply.modification.unwrap().size_multiplier, Some(0.5));
    }

    #[tokio::test]
    async fn test_auditor_backs_override_on_strong_conviction() {
        let backend = HeuristicBackend::default();
        let reply = backend.infer(EvaluatorRole::Auditor, &request(Action::Buy, 0.9, Regime::Panic)).await.unwrap();
        assert!(reply.modification.unwrap().override_veto);
    }

    #[tokio::test]
    async fn test_strategy_holds_on_weak_score() {
        let backend = HeuristicBackend::default();
        let reply = backend.infer(EvaluatorRole::Strategy, &request(Action::Buy, 0.1, Regime::Low)).await.unwrap();
        assert_eq!(reply.decision, VoteDecision::Hold);
    }
}
