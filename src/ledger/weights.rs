//! Evaluator Weight Ledger
//!
//! Per-evaluator weight and accuracy stats, persisted as JSON. The weight
//! update itself is the pure [`rebalance_weights`]; the ledger only checks
//! the result and stores it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::{EvaluatorConfig, RebalanceConfig};
use crate::error::{LedgerError, LedgerResult};
use crate::position::Outcome;

const SUM_TOLERANCE: f64 = 1e-6;

/// Persisted state of one evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRecord {
    pub evaluator_id: String,
    pub weight: f64,
    pub correct: u64,
    pub incorrect: u64,
    /// Most recent outcomes, newest last; true = correct
    #[serde(default)]
    pub recent: VecDeque<bool>,
    #[serde(default)]
    pub rolling_win_rate: f64,
}

impl WeightRecord {
    fn new(evaluator_id: &str, weight: f64) -> Self {
        Self {
            evaluator_id: evaluator_id.to_string(),
            weight,
            correct: 0,
            incorrect: 0,
            recent: VecDeque::new(),
            rolling_win_rate: 0.0,
        }
    }

    fn record_outcome(&mut self, correct: bool, window: usize) {
        if correct {
            self.correct += 1;
        } else {
            self.incorrect += 1;
        }
        self.recent.push_back(correct);
        while self.recent.len() > window {
            self.recent.pop_front();
        }
        let wins = self.recent.iter().filter(|c| **c).count();
        self.rolling_win_rate = wins as f64 / self.recent.len() as f64;
    }

    pub fn total(&self) -> u64 {
        self.correct + self.incorrect
    }
}

/// Check sum-to-one and per-weight bounds
pub fn check_invariant(weights: &BTreeMap<String, f64>, min: f64, max: f64) -> LedgerResult<()> {
    let sum: f64 = weights.values().sum();
    if (sum - 1.0).abs() > SUM_TOLERANCE {
        return Err(LedgerError::WeightInvariant(format!("weights sum to {:.9}", sum)));
    }
    for (id, w) in weights {
        if !w.is_finite() || *w < min - SUM_TOLERANCE || *w > max + SUM_TOLERANCE {
            return Err(LedgerError::WeightInvariant(format!(
                "{} has weight {:.6} outside [{}, {}]",
                id, w, min, max
            )));
        }
    }
    Ok(())
}

fn clamped_sum(weights: &BTreeMap<String, f64>, lambda: f64, min: f64, max: f64) -> f64 {
    weights.values().map(|w| (lambda * w).clamp(min, max)).sum()
}

/// Bounded proportional normalization: find λ with Σ clamp(λ·wᵢ, min, max) = 1
/// by bisection and return the clamped, scaled weights.
pub fn normalize_bounded(
    weights: &BTreeMap<String, f64>,
    min: f64,
    max: f64,
) -> LedgerResult<BTreeMap<String, f64>> {
    let n = weights.len() as f64;
    if weights.is_empty() {
        return Err(LedgerError::WeightInvariant("no evaluators".to_string()));
    }
    if n * min > 1.0 + SUM_TOLERANCE || n * max < 1.0 - SUM_TOLERANCE {
        return Err(LedgerError::WeightInvariant(format!(
            "bounds [{}, {}] cannot sum to 1 across {} evaluators",
            min, max, weights.len()
        )));
    }
    if let Some((id, w)) = weights.iter().find(|(_, w)| !w.is_finite() || **w <= 0.0) {
        return Err(LedgerError::WeightInvariant(format!("{} has non-positive weight {}", id, w)));
    }

    let mut lo = 0.0_f64;
    let mut hi = 1.0_f64;
    for _ in 0..64 {
        if clamped_sum(weights, hi, min, max) >= 1.0 {
            break;
        }
        lo = hi;
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = (lo + hi) / 2.0;
        if clamped_sum(weights, mid, min, max) < 1.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let normalized = weights
        .iter()
        .map(|(id, w)| (id.clone(), (hi * w).clamp(min, max)))
        .collect();
    check_invariant(&normalized, min, max)?;
    Ok(normalized)
}

/// New weights after one closed trade. Only `matched` evaluators move:
/// rewarded on CORRECT, penalized on FALSE_POSITIVE / STOPPED_OUT.
pub fn rebalance_weights(
    weights: &BTreeMap<String, f64>,
    matched: &[String],
    outcome: Outcome,
    params: &RebalanceConfig,
) -> LedgerResult<BTreeMap<String, f64>> {
    let factor = match outcome {
        Outcome::Correct => params.reward_multiplier,
        Outcome::FalsePositive | Outcome::StoppedOut => params.penalty_multiplier,
        Outcome::Pending => return Ok(weights.clone()),
    };
    if matched.is_empty() {
        return Ok(weights.clone());
    }

    let scaled: BTreeMap<String, f64> = weights
        .iter()
        .map(|(id, w)| {
            let w = if matched.contains(id) { w * factor } else { *w };
            (id.clone(), w)
        })
        .collect();

    normalize_bounded(&scaled, params.min_weight, params.max_weight)
}

pub struct WeightLedger {
    params: RebalanceConfig,
    path: Option<PathBuf>,
    records: RwLock<BTreeMap<String, WeightRecord>>,
}

impl WeightLedger {
    /// Fresh ledger from configured initial weights, normalized into bounds
    pub fn new(evaluators: &[EvaluatorConfig], params: RebalanceConfig) -> LedgerResult<Self> {
        let initial: BTreeMap<String, f64> = evaluators
            .iter()
            .map(|e| (e.id.clone(), e.initial_weight))
            .collect();
        let weights = normalize_bounded(&initial, params.min_weight, params.max_weight)?;
        let records = weights
            .iter()
            .map(|(id, w)| (id.clone(), WeightRecord::new(id, *w)))
            .collect();

        Ok(Self {
            params,
            path: None,
            records: RwLock::new(records),
        })
    }

    /// Ledger backed by a JSON file. Persisted weights win for evaluators
    /// that are still configured; new evaluators start at their initial
    /// weight and the set is renormalized.
    pub async fn open(
        evaluators: &[EvaluatorConfig],
        params: RebalanceConfig,
        path: impl AsRef<Path>,
    ) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut ledger = Self::new(evaluators, params)?;
        ledger.path = Some(path.clone());

        if !path.exists() {
            info!("No weight ledger at {:?}, starting from configured weights", path);
            return Ok(ledger);
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let persisted: Vec<WeightRecord> = serde_json::from_str(&content)?;
        let mut persisted: HashMap<String, WeightRecord> = persisted
            .into_iter()
            .map(|r| (r.evaluator_id.clone(), r))
            .collect();

        {
            let mut records = ledger.records.write();
            for (id, record) in records.iter_mut() {
                if let Some(saved) = persisted.remove(id) {
                    *record = saved;
                }
            }
            for id in persisted.keys() {
                warn!("Dropping persisted weight for unconfigured evaluator {}", id);
            }

            let raw: BTreeMap<String, f64> = records.iter().map(|(id, r)| (id.clone(), r.weight)).collect();
            let normalized = normalize_bounded(&raw, ledger.params.min_weight, ledger.params.max_weight)?;
            for (id, w) in normalized {
                if let Some(record) = records.get_mut(&id) {
                    record.weight = w;
                }
            }
            info!("Weight ledger loaded from {:?}: {} evaluators", path, records.len());
        }

        Ok(ledger)
    }

    pub fn weights(&self) -> BTreeMap<String, f64> {
        self.records
            .read()
            .iter()
            .map(|(id, r)| (id.clone(), r.weight))
            .collect()
    }

    pub fn weight_of(&self, evaluator_id: &str) -> Option<f64> {
        self.records.read().get(evaluator_id).map(|r| r.weight)
    }

    pub fn record(&self, evaluator_id: &str) -> LedgerResult<WeightRecord> {
        self.records
            .read()
            .get(evaluator_id)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownEvaluator(evaluator_id.to_string()))
    }

    pub fn records(&self) -> Vec<WeightRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn params(&self) -> &RebalanceConfig {
        &self.params
    }

    /// Apply one closed-trade outcome. Stats move only for matched
    /// evaluators; unknown ids are skipped.
    pub fn apply_outcome(&self, matched: &[String], outcome: Outcome) -> LedgerResult<BTreeMap<String, f64>> {
        if outcome == Outcome::Pending {
            return Err(LedgerError::InvalidInput("cannot rebalance on a pending outcome".to_string()));
        }

        let mut records = self.records.write();
        let known: Vec<String> = matched
            .iter()
            .filter(|id| {
                let present = records.contains_key(id.as_str());
                if !present {
                    warn!("Skipping unknown evaluator {} in rebalance", id);
                }
                present
            })
            .cloned()
            .collect();

        let current: BTreeMap<String, f64> = records.iter().map(|(id, r)| (id.clone(), r.weight)).collect();
        let updated = rebalance_weights(&current, &known, outcome, &self.params).map_err(|e| {
            error!("Weight rebalance rejected: {}", e);
            e
        })?;

        for (id, w) in &updated {
            if let Some(record) = records.get_mut(id) {
                debug!("Weight {}: {:.4} -> {:.4}", id, record.weight, w);
                record.weight = *w;
            }
        }
        let correct = outcome == Outcome::Correct;
        for id in &known {
            if let Some(record) = records.get_mut(id) {
                record.record_outcome(correct, self.params.rolling_window);
            }
        }

        Ok(updated)
    }

    /// Write all records to the backing file, if any
    pub async fn save(&self) -> LedgerResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = self.records();
        let content = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content).await?;
        debug!("Weight ledger saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluators::EvaluatorRole;
    use proptest::prelude::*;

    fn equal_evaluators() -> Vec<EvaluatorConfig> {
        ["strategy", "market", "risk", "execution", "auditor"]
            .iter()
            .map(|id| EvaluatorConfig {
                id: id.to_string(),
                role: EvaluatorRole::Strategy,
                initial_weight: 0.2,
                backend: Default::default(),
            })
            .collect()
    }

    fn map(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(id, w)| (id.to_string(), *w)).collect()
    }

    #[test]
    fn test_reward_moves_weight_up() {
        let params = RebalanceConfig::default();
        let weights = map(&[("a", 0.2), ("b", 0.2), ("c", 0.2), ("d", 0.2), ("e", 0.2)]);
        let updated = rebalance_weights(&weights, &["a".to_string()], Outcome::Correct, &params).unwrap();

        assert!(updated["a"] > 0.2);
        assert!(updated["b"] < 0.2);
        check_invariant(&updated, 0.10, 0.40).unwrap();
    }

    #[test]
    fn test_penalty_is_floor_clamped() {
        let params = RebalanceConfig::default();
        let weights = map(&[("a", 0.10), ("b", 0.225), ("c", 0.225), ("d", 0.225), ("e", 0.225)]);
        let updated = rebalance_weights(&weights, &["a".to_string()], Outcome::StoppedOut, &params).unwrap();

        assert!((updated["a"] - 0.10).abs() < 1e-9);
        check_invariant(&updated, 0.10, 0.40).unwrap();
    }

    #[test]
    fn test_no_matched_evaluators_changes_nothing() {
        let params = RebalanceConfig::default();
        let weights = map(&[("a", 0.3), ("b", 0.3), ("c", 0.4)]);
        let updated = rebalance_weights(&weights, &[], Outcome::FalsePositive, &params).unwrap();
        assert_eq!(updated, weights);
    }

    #[test]
    fn test_infeasible_bounds_are_rejected() {
        let weights = map(&[("a", 0.5), ("b", 0.5)]);
        assert!(matches!(
            normalize_bounded(&weights, 0.10, 0.40),
            Err(LedgerError::WeightInvariant(_))
        ));
    }

    #[test]
    fn test_stats_and_rolling_win_rate() {
        let params = RebalanceConfig { rolling_window: 2, ..Default::default() };
        let ledger = WeightLedger::new(&equal_evaluators(), params).unwrap();
        let matched = vec!["strategy".to_string()];

        ledger.apply_outcome(&matched, Outcome::Correct).unwrap();
        ledger.apply_outcome(&matched, Outcome::FalsePositive).unwrap();
        ledger.apply_outcome(&matched, Outcome::FalsePositive).unwrap();

        let record = ledger.record("strategy").unwrap();
        assert_eq!(record.correct, 1);
        assert_eq!(record.incorrect, 2);
        assert_eq!(record.rolling_win_rate, 0.0);
        assert_eq!(ledger.record("market").unwrap().total(), 0);
        assert!(matches!(ledger.record("nobody"), Err(LedgerError::UnknownEvaluator(_))));
    }

    #[test]
    fn test_pending_outcome_is_invalid() {
        let ledger = WeightLedger::new(&equal_evaluators(), RebalanceConfig::default()).unwrap();
        assert!(ledger.apply_outcome(&["risk".to_string()], Outcome::Pending).is_err());
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = std::env::temp_dir().join(format!("weights-{}", uuid::Uuid::new_v4()));
        let path = dir.join("weights.json");

        let ledger = WeightLedger::open(&equal_evaluators(), RebalanceConfig::default(), &path).await.unwrap();
        ledger.apply_outcome(&["auditor".to_string()], Outcome::Correct).unwrap();
        ledger.save().await.unwrap();

        let reloaded = WeightLedger::open(&equal_evaluators(), RebalanceConfig::default(), &path).await.unwrap();
        assert_eq!(reloaded.records(), ledger.records());

        let _ = std::fs::remove_dir_all(dir);
    }

    proptest! {
        #[test]
        fn prop_rebalance_keeps_distribution(
            raw in prop::collection::vec(0.01f64..1.0, 3..8),
            mask in prop::collection::vec(any::<bool>(), 8),
            outcome in prop_oneof![
                Just(Outcome::Correct),
                Just(Outcome::FalsePositive),
                Just(Outcome::StoppedOut)
            ],
        ) {
            let n = raw.len();
            let params = RebalanceConfig {
                min_weight: 0.5 / n as f64,
                max_weight: (2.0 / n as f64).min(1.0),
                ..Default::default()
            };
            let weights: BTreeMap<String, f64> =
                raw.iter().enumerate().map(|(i, w)| (format!("e{}", i), *w)).collect();
            let start = normalize_bounded(&weights, params.min_weight, params.max_weight).unwrap();
            let matched: Vec<String> =
                (0..n).filter(|i| mask[*i]).map(|i| format!("e{}", i)).collect();

            let updated = rebalance_weights(&start, &matched, outcome, &params).unwrap();
            let sum: f64 = updated.values().sum();
            prop_assert!((sum - 1.0).abs() < 1e-6);
            for w in updated.values() {
                prop_assert!(*w >= params.min_weight - 1e-9 && *w <= params.max_weight + 1e-9);
            }
        }
    }
}
