//! Feedback Rebalancer
//!
//! Closes the learning loop:
//! - Runs in the closing cycle, right after the position ledger closes a trade
//! - Rewards or penalizes the evaluators that backed the trade
//! - Persists the new weights and publishes them

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::WeightLedger;
use crate::network::event_bus::Event;
use crate::position::{Outcome, Position};
use crate::telemetry::metrics;
use crate::utils::helpers::current_timestamp_millis;

/// Feedback rebalancer
pub struct FeedbackRebalancer {
    /// Ledger the outcomes are applied to
    weights: Arc<WeightLedger>,
    /// Observers of `WeightsUpdated` and invariant violations
    events: Option<broadcast::Sender<Event>>,
    /// Successful rebalances
    rebalance_count: AtomicU64,
    /// Unix millis of the last rebalance, 0 before the first
    last_rebalance: AtomicI64,
}

impl FeedbackRebalancer {
    pub fn new(weights: Arc<WeightLedger>) -> Self {
        Self {
            weights,
            events: None,
            rebalance_count: AtomicU64::new(0),
            last_rebalance: AtomicI64::new(0),
        }
    }

    pub fn with_event_sender(mut self, sender: broadcast::Sender<Event>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn weights(&self) -> &Arc<WeightLedger> {
        &self.weights
    }

    pub fn rebalance_count(&self) -> u64 {
        self.rebalance_count.load(Ordering::SeqCst)
    }

    pub fn last_rebalance(&self) -> Option<i64> {
        match self.last_rebalance.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Apply a closed position's outcome to the weight ledger.
    ///
    /// Returns the new weights, or `None` when the trade carries no
    /// evaluator signal (degraded decision or no supporters).
    pub async fn rebalance(&self, position: &Position) -> LedgerResult<Option<BTreeMap<String, f64>>> {
        if position.is_open() || position.outcome == Outcome::Pending {
            return Err(LedgerError::InvalidInput(format!(
                "position {} is not closed",
                position.id
            )));
        }
        if position.degraded {
            debug!("Skipping rebalance for degraded trade {}", position.id);
            return Ok(None);
        }
        if position.supporting_evaluators.is_empty() {
            debug!("Skipping rebalance for {}: no supporting evaluators", position.id);
            return Ok(None);
        }

        let updated = match self
            .weights
            .apply_outcome(&position.supporting_evaluators, position.outcome)
        {
            Ok(updated) => updated,
            Err(e) => {
                error!("Rebalance for position {} failed: {}", position.id, e);
                metrics::record_error();
                self.publish(Event::LedgerInvariantViolation {
                    detail: format!("rebalance of {}: {}", position.id, e),
                });
                return Err(e);
            }
        };

        if let Err(e) = self.weights.save().await {
            error!("Failed to persist weights: {}", e);
            metrics::record_error();
            self.publish(Event::LedgerInvariantViolation {
                detail: format!("weight persistence: {}", e),
            });
            return Err(e);
        }

        for (id, weight) in &updated {
            metrics::record_evaluator_weight(id, *weight);
        }
        self.rebalance_count.fetch_add(1, Ordering::SeqCst);
        self.last_rebalance.store(current_timestamp_millis(), Ordering::SeqCst);

        info!(
            "Weights rebalanced after {} {} ({} supporters): {}",
            position.symbol,
            position.outcome,
            position.supporting_evaluators.len(),
            updated
                .iter()
                .map(|(id, w)| format!("{}={:.3}", id, w))
                .collect::<Vec<_>>()
                .join(" ")
        );
        self.publish(Event::WeightsUpdated {
            weights: updated.iter().map(|(id, w)| (id.clone(), *w)).collect(),
        });

        Ok(Some(updated))
    }
}
