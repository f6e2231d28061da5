//! Signal Engines Module
//!
//! Provides the deterministic inputs to each consensus round:
//! - Volatility regime classification and adaptive threshold
//! - Technical scoring of precomputed indicators
//! - Proposal construction from both

pub mod technical;
pub mod volatility;

pub use technical::{IndicatorScorer, TechnicalScore, TechnicalScorer};
pub use volatility::{Classification, Regime, VolatilityClassifier, VolatilitySource};

use std::sync::Arc;
use tracing::debug;

use crate::config::AppConfig;
use crate::utils::types::{MarketSnapshot, TradeProposal};

/// Builds trade proposals from a snapshot and the current classification
pub struct ProposalEngine {
    config: Arc<AppConfig>,
    scorer: Arc<dyn TechnicalScorer>,
}

impl ProposalEngine {
    pub fn new(config: Arc<AppConfig>, scorer: Arc<dyn TechnicalScorer>) -> Self {
        Self { config, scorer }
    }

    pub fn propose(&self, snapshot: &MarketSnapshot, classification: &Classification) -> TradeProposal {
        let technical = self.scorer.score(snapshot);
        let size = self
            .config
            .trading
            .base_size_fraction
            .min(self.config.trading.max_size_fraction);

        debug!(
            "{}: technical score {:.3} (buy {:.1} / sell {:.1}) {}",
            snapshot.symbol,
            technical.score,
            technical.buy_points,
            technical.sell_points,
            technical.reasons.join(", ")
        );

        TradeProposal::new(
            snapshot.symbol.clone(),
            technical.action(),
            size,
            technical.score,
            classification.threshold,
            classification.regime,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::technical::PrecomputedScorer;
    use crate::utils::types::Action;

    #[test]
    fn test_proposal_carries_threshold_and_regime() {
        let config = Arc::new(AppConfig::paper_default());
        let engine = ProposalEngine::new(config, Arc::new(PrecomputedScorer));
        let classification = Classification {
            regime: Regime::Low,
            threshold: 0.40,
            reading: 10.0,
            fallback: false,
            classified_at: 0,
        };
        let snapshot = MarketSnapshot::new("BTC/USDT", 100.0, 1.0, 10.0).with_indicator("technical_score", -0.6);

        let proposal = engine.propose(&snapshot, &classification);
        assert_eq!(proposal.action, Action::Sell);
        assert_eq!(proposal.threshold, 0.40);
        assert_eq!(proposal.regime, Regime::Low);
        assert_eq!(proposal.size_fraction, 0.05);
    }
}
