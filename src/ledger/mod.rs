//! Evaluator weight ledger

pub mod weights;

pub use weights::{check_invariant, normalize_bounded, rebalance_weights, WeightLedger, WeightRecord};
