//! Technical Signal Scorer
//!
//! Folds precomputed indicator values into a single directional score in
//! [-1, 1]. Indicator formulas are computed upstream; this only reads them
//! off the snapshot.

use serde::{Deserialize, Serialize};

use crate::utils::types::{Action, MarketSnapshot};

/// Scored technical view of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalScore {
    /// Positive favours BUY, negative favours SELL
    pub score: f64,
    pub buy_points: f64,
    pub sell_points: f64,
    pub reasons: Vec<String>,
}

impl TechnicalScore {
    pub fn neutral() -> Self {
        Self {
            score: 0.0,
            buy_points: 0.0,
            sell_points: 0.0,
            reasons: Vec::new(),
        }
    }

    /// Action the score leans toward
    pub fn action(&self) -> Action {
        if self.score > 0.0 {
            Action::Buy
        } else if self.score < 0.0 {
            Action::Sell
        } else {
            Action::Hold
        }
    }
}

pub trait TechnicalScorer: Send + Sync {
    fn score(&self, snapshot: &MarketSnapshot) -> TechnicalScore;
}

/// Indicator names read from the snapshot
pub mod indicators {
    pub const RSI: &str = "rsi";
    pub const MACD: &str = "macd";
    pub const MACD_SIGNAL: &str = "macd_signal";
    pub const MACD_PREV: &str = "macd_prev";
    pub const MACD_SIGNAL_PREV: &str = "macd_signal_prev";
    pub const BB_UPPER: &str = "bb_upper";
    pub const BB_MIDDLE: &str = "bb_middle";
    pub const BB_LOWER: &str = "bb_lower";
    pub const VOLUME_RATIO: &str = "volume_ratio";
    pub const SMA_50: &str = "sma_50";
}

/// Point-based scorer over RSI, MACD, Bollinger position, volume and trend
#[derive(Debug, Clone)]
pub struct IndicatorScorer {
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub volume_surge: f64,
    /// Points a side needs before it counts at all
    pub min_points: f64,
    pub buy_total: f64,
    pub sell_total: f64,
}

impl Default for IndicatorScorer {
    fn default() -> Self {
        Self {
            rsi_oversold: 35.0,
            rsi_overbought: 65.0,
            volume_surge: 1.2,
            min_points: 3.0,
            buy_total: 6.0,
            sell_total: 5.0,
        }
    }
}

impl IndicatorScorer {
    fn buy_points(&self, s: &MarketSnapshot, reasons: &mut Vec<String>) -> f64 {
        use indicators::*;
        let mut points = 0.0;

        if let Some(rsi) = s.indicator(RSI) {
            if rsi < self.rsi_oversold {
                points += 1.5;
                reasons.push(format!("RSI oversold ({:.1})", rsi));
            } else if rsi < 40.0 {
                points += 0.5;
            }
        }
        if let (Some(macd), Some(signal)) = (s.indicator(MACD), s.indicator(MACD_SIGNAL)) {
            if macd > signal {
                points += 1.0;
                reasons.push("MACD above signal".to_string());
            }
        }
        if let (Some(prev), Some(prev_signal)) = (s.indicator(MACD_PREV), s.indicator(MACD_SIGNAL_PREV)) {
            if prev <= prev_signal {
                points += 1.0;
            }
        }
        if let Some(lower) = s.indicator(BB_LOWER) {
            if s.price < lower {
                points += 1.0;
                reasons.push("Price below lower band".to_string());
            } else if s.indicator(BB_MIDDLE).map(|m| s.price < m).unwrap_or(false) {
                points += 0.3;
            }
        }
        if s.indicator(VOLUME_RATIO).map(|v| v > self.volume_surge).unwrap_or(false) {
            points += 0.5;
        }
        if s.indicator(SMA_50).map(|sma| s.price > sma).unwrap_or(false) {
            points += 0.5;
        }

        points
    }

    fn sell_points(&self, s: &MarketSnapshot, reasons: &mut Vec<String>) -> f64 {
        use indicators::*;
        let mut points = 0.0;

        if let Some(rsi) = s.indicator(RSI) {
            if rsi > self.rsi_overbought {
                points += 1.5;
                reasons.push(format!("RSI overbought ({:.1})", rsi));
            } else if rsi > 60.0 {
                points += 0.5;
            }
        }
        if let (Some(macd), Some(signal)) = (s.indicator(MACD), s.indicator(MACD_SIGNAL)) {
            if macd < signal {
                points += 1.0;
                reasons.push("MACD below signal".to_string());
            }
        }
        if let (Some(prev), Some(prev_signal)) = (s.indicator(MACD_PREV), s.indicator(MACD_SIGNAL_PREV)) {
            if prev >= prev_signal {
                points += 1.0;
            }
        }
        if s.indicator(BB_UPPER).map(|upper| s.price > upper).unwrap_or(false) {
            points += 1.0;
            reasons.push("Price above upper band".to_string());
        }
        if s.indicator(VOLUME_RATIO).map(|v| v > self.volume_surge).unwrap_or(false) {
            points += 0.5;
        }

        points
    }
}

impl TechnicalScorer for IndicatorScorer {
    fn score(&self, snapshot: &MarketSnapshot) -> TechnicalScore {
        let mut reasons = Vec::new();
        let buy_points = self.buy_points(snapshot, &mut reasons);
        let sell_points = self.sell_points(snapshot, &mut reasons);

        let score = if buy_points >= self.min_points && buy_points > sell_points {
            (buy_points / self.buy_total).min(1.0)
        } else if sell_points >= self.min_points && sell_points > buy_points {
            -(sell_points / self.sell_total).min(1.0)
        } else {
            0.0
        };

        TechnicalScore {
            score,
            buy_points,
            sell_points,
            reasons,
        }
    }
}

/// Scorer that trusts a `technical_score` value already on the snapshot
#[derive(Debug, Clone, Default)]
pub struct PrecomputedScorer;

impl TechnicalScorer for PrecomputedScorer {
    fn score(&self, snapshot: &MarketSnapshot) -> TechnicalScore {
        match snapshot.indicator("technical_score") {
            Some(score) => TechnicalScore {
                score: score.clamp(-1.0, 1.0),
                ..TechnicalScore::neutral()
            },
            None => TechnicalScore::neutral(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indicators::*;

    #[test]
    fn test_oversold_crossover_scores_buy() {
        let snapshot = MarketSnapshot::new("BTC/USDT", 95.0, 1_000.0, 15.0)
            .with_indicator(RSI, 28.0)
            .with_indicator(MACD, 0.4)
            .with_indicator(MACD_SIGNAL, 0.1)
            .with_indicator(MACD_PREV, 0.0)
            .with_indicator(MACD_SIGNAL_PREV, 0.1)
            .with_indicator(BB_LOWER, 96.0)
            .with_indicator(VOLUME_RATIO, 1.5);

        let score = IndicatorScorer::default().score(&snapshot);
        assert_eq!(score.buy_points, 5.0);
        assert!((score.score - 5.0 / 6.0).abs() < 1e-9);
        assert_eq!(score.action(), Action::Buy);
    }

    #[test]
    fn test_overbought_scores_sell() {
        let snapshot = MarketSnapshot::new("ETH/USDT", 110.0, 1_000.0, 15.0)
            .with_indicator(RSI, 72.0)
            .with_indicator(MACD, -0.2)
            .with_indicator(MACD_SIGNAL, 0.1)
            .with_indicator(BB_UPPER, 105.0);

        let score = IndicatorScorer::default().score(&snapshot);
        assert!((score.score + 3.5 / 5.0).abs() < 1e-9);
        assert_eq!(score.action(), Action::Sell);
    }

    #[test]
    fn test_weak_signal_is_neutral() {
        let snapshot = MarketSnapshot::new("BTC/USDT", 100.0, 1_000.0, 15.0).with_indicator(RSI, 50.0);
        assert_eq!(IndicatorScorer::default().score(&snapshot).score, 0.0);
    }

    #[test]
    fn test_precomputed_scorer_clamps() {
        let snapshot = MarketSnapshot::new("BTC/USDT", 100.0, 1.0, 15.0).with_indicator("technical_score", 1.7);
        assert_eq!(PrecomputedScorer.score(&snapshot).score, 1.0);
    }
}
