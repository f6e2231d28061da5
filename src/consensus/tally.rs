//! Consensus Tally
//!
//! Pure decision math for one round: veto resolution, weighted scoring,
//! strength bands, the technical blend and the threshold gate. Nothing here
//! touches I/O, so the coordinator and the benchmarks share it.

use crate::config::ConsensusConfig;
use crate::evaluators::EvaluatorRole;
use crate::utils::types::{Action, ActionScores, ConsensusType, EvaluatorVote, Strength, TradeProposal, VoteDecision};

/// A vote paired with its evaluator's role and current weight
#[derive(Debug, Clone)]
pub struct Ballot {
    pub vote: EvaluatorVote,
    pub role: EvaluatorRole,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct TallyParams {
    pub strong_band: f64,
    pub normal_band: f64,
    pub technical_weight: f64,
    pub consensus_weight: f64,
    pub mediation_size_factor: f64,
    pub mediation_max_size_fraction: f64,
    pub max_size_fraction: f64,
}

impl TallyParams {
    pub fn from_config(config: &ConsensusConfig, max_size_fraction: f64) -> Self {
        Self {
            strong_band: config.strong_band,
            normal_band: config.normal_band,
            technical_weight: config.technical_weight,
            consensus_weight: config.consensus_weight,
            mediation_size_factor: config.mediation_size_factor,
            mediation_max_size_fraction: config.mediation_max_size_fraction,
            max_size_fraction,
        }
    }
}

impl Default for TallyParams {
    fn default() -> Self {
        Self::from_config(&ConsensusConfig::default(), 0.10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VetoOutcome {
    /// No veto-capable evaluator rejected
    NotRaised,
    /// Veto stands; the round is a HOLD
    Upheld,
    /// Auditor plus one other non-risk evaluator asked to override
    Overridden,
}

/// Outcome of the tally, before it is stamped into a `ConsensusResult`
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub confidence: f64,
    pub consensus_type: ConsensusType,
    pub scores: ActionScores,
    pub veto: bool,
    pub mediated: bool,
    pub size_fraction: f64,
}

pub fn resolve_veto(ballots: &[Ballot]) -> VetoOutcome {
    let raised = ballots
        .iter()
        .any(|b| b.role.has_veto_power() && b.vote.decision == VoteDecision::Reject);
    if !raised {
        return VetoOutcome::NotRaised;
    }

    let auditor = ballots
        .iter()
        .any(|b| b.role.is_auditor() && b.vote.overrides_veto());
    let peer = ballots
        .iter()
        .any(|b| !b.role.is_auditor() && !b.role.has_veto_power() && b.vote.overrides_veto());

    if auditor && peer {
        VetoOutcome::Overridden
    } else {
        VetoOutcome::Upheld
    }
}

/// `score[a] = Σ w_i × c_i` over the ballots voting `a`, with weights
/// renormalized over the ballots present. REJECT counts toward HOLD.
pub fn weighted_scores(ballots: &[Ballot]) -> ActionScores {
    let mut scores = ActionScores::default();
    let total: f64 = ballots.iter().map(|b| b.weight.max(0.0)).sum();
    if total <= 0.0 {
        return scores;
    }

    for ballot in ballots {
        let weight = ballot.weight.max(0.0) / total;
        scores.add(ballot.vote.decision.as_action(), weight * ballot.vote.confidence);
    }
    scores
}

pub fn strength(score: f64, params: &TallyParams) -> Strength {
    if score >= params.strong_band {
        Strength::Strong
    } else if score >= params.normal_band {
        Strength::Normal
    } else {
        Strength::Weak
    }
}

/// Technical score signed toward `action`, clamped to [0, 1]
pub fn directional_technical(technical_score: f64, action: Action) -> f64 {
    (technical_score * action.direction()).clamp(0.0, 1.0)
}

pub fn blend(technical_score: f64, action: Action, consensus_score: f64, params: &TallyParams) -> f64 {
    params.technical_weight * directional_technical(technical_score, action)
        + params.consensus_weight * consensus_score
}

/// Most conservative size multiplier among ballots backing `action`
fn size_multiplier(ballots: &[Ballot], action: Action) -> f64 {
    ballots
        .iter()
        .filter(|b| b.vote.decision.as_action() == action)
        .filter_map(|b| b.vote.modification.as_ref().and_then(|m| m.size_multiplier))
        .fold(1.0_f64, f64::min)
        .clamp(0.0, 1.0)
}

fn hold(consensus_type: ConsensusType, confidence: f64, scores: ActionScores, veto: bool) -> Decision {
    Decision {
        action: Action::Hold,
        confidence,
        consensus_type,
        scores,
        veto,
        mediated: false,
        size_fraction: 0.0,
    }
}

/// Full decision for a round that has enough responders
pub fn decide(proposal: &TradeProposal, ballots: &[Ballot], params: &TallyParams) -> Decision {
    let veto = resolve_veto(ballots);
    let scores = weighted_scores(ballots);

    if veto == VetoOutcome::Upheld {
        return hold(ConsensusType::RejectedByRisk, 0.0, scores, true);
    }

    let (winner, score) = scores.winner();
    let mut class = strength(score, params);
    let confidence = blend(proposal.technical_score, winner, score, params);

    if !winner.is_directional() {
        return hold(ConsensusType::classify(Action::Hold, class), confidence, scores, veto == VetoOutcome::Overridden);
    }
    if class == Strength::Weak {
        return hold(ConsensusType::Weak(winner), confidence, scores, veto == VetoOutcome::Overridden);
    }

    let mediated = veto == VetoOutcome::Overridden;
    if mediated && class == Strength::Strong {
        class = Strength::Normal;
    }

    if confidence <= proposal.threshold {
        return hold(ConsensusType::BelowThreshold(winner), confidence, scores, mediated);
    }

    let mut size = proposal.size_fraction * size_multiplier(ballots, winner);
    if mediated {
        size = (size * params.mediation_size_factor).min(params.mediation_max_size_fraction);
    }
    size = size.min(params.max_size_fraction);

    Decision {
        action: winner,
        confidence,
        consensus_type: if mediated {
            ConsensusType::Mediated(winner)
        } else {
            ConsensusType::classify(winner, class)
        },
        scores,
        veto: mediated,
        mediated,
        size_fraction: size,
    }
}

/// Technical-only fallback used when too few evaluators answered
pub fn degraded_decision(proposal: &TradeProposal, params: &TallyParams) -> Decision {
    let technical = proposal.technical_score;
    let action = if technical > 0.0 {
        Action::Buy
    } else if technical < 0.0 {
        Action::Sell
    } else {
        Action::Hold
    };
    let confidence = technical.abs().min(1.0);
    let approved = action.is_directional() && confidence > proposal.threshold;

    Decision {
        action: if approved { action } else { Action::Hold },
        confidence,
        consensus_type: ConsensusType::Degraded,
        scores: ActionScores::default(),
        veto: false,
        mediated: false,
        size_fraction: if approved {
            proposal.size_fraction.min(params.max_size_fraction)
        } else {
            0.0
        },
    }
}

/// Degraded when strictly more than half of the evaluators abstained
pub fn is_degraded(abstentions: usize, total: usize) -> bool {
    total == 0 || abstentions * 2 > total
}
