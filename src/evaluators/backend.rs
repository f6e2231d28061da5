//! Inference backend seam and reply parsing

use async_trait::async_trait;
use serde::Deserialize;

use super::{EvaluationRequest, EvaluatorRole};
use crate::error::EvaluatorError;
use crate::utils::types::{Action, VoteDecision, VoteModification};

/// Structured vote returned by a backend, before it is stamped with an id
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    pub decision: VoteDecision,
    pub confidence: f64,
    pub rationale: String,
    pub modification: Option<VoteModification>,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn infer(&self, role: EvaluatorRole, request: &EvaluationRequest) -> Result<BackendReply, EvaluatorError>;
}

/// Loose shape of a model's JSON answer; every field is optional
#[derive(Debug, Default, Deserialize)]
struct RawReply {
    decision: Option<String>,
    action: Option<String>,
    approved: Option<bool>,
    confidence: Option<f64>,
    #[serde(alias = "reasoning")]
    rationale: Option<String>,
    size_multiplier: Option<f64>,
    override_veto: Option<bool>,
}

/// Pull the JSON object out of free text: a fenced ```json block first,
/// otherwise the outermost brace span.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        let end = body.find("```").unwrap_or(body.len());
        return Some(body[..end].trim());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse a model reply. Non-JSON replies fall back to keyword matching at a
/// flat 0.5 confidence.
pub fn parse_reply(text: &str, proposed: Action) -> BackendReply {
    let parsed = extract_json(text).and_then(|json| serde_json::from_str::<RawReply>(json).ok());

    match parsed {
        Some(raw) => {
            let decision = match raw.decision.as_deref().or(raw.action.as_deref()) {
                Some(d) => VoteDecision::parse_lenient(d),
                None => match raw.approved {
                    Some(true) => VoteDecision::from(proposed),
                    Some(false) => VoteDecision::Reject,
                    None => VoteDecision::Hold,
                },
            };
            let modification = (raw.size_multiplier.is_some() || raw.override_veto.is_some()).then(|| {
                VoteModification {
                    size_multiplier: raw.size_multiplier.map(|m| m.clamp(0.0, 1.0)),
                    override_veto: raw.override_veto.unwrap_or(false),
                }
            });

            BackendReply {
                decision,
                confidence: raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
                rationale: raw.rationale.unwrap_or_default(),
                modification,
            }
        }
        None => BackendReply {
            decision: keyword_decision(text),
            confidence: 0.5,
            rationale: text.chars().take(200).collect(),
            modification: None,
        },
    }
}

fn keyword_decision(text: &str) -> VoteDecision {
    let upper = text.to_uppercase();
    if upper.contains("REJECT") {
        VoteDecision::Reject
    } else if upper.contains("BUY") && !upper.contains("SELL") {
        VoteDecision::Buy
    } else if upper.contains("SELL") && !upper.contains("BUY") {
        VoteDecision::Sell
    } else {
        VoteDecision::Hold
    }
}
