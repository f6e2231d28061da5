//! Shared State Module
//!
//! Thread-safe runtime state read by the agent, telemetry and the CLI.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::engines::volatility::Regime;
use crate::utils::helpers::current_timestamp_millis;
use crate::utils::types::Action;

/// Atomic floating point wrapper using u64 bit representation
#[derive(Debug, Default)]
pub struct AtomicF64 {
    inner: AtomicU64,
}

impl AtomicF64 {
    pub fn new(val: f64) -> Self {
        Self {
            inner: AtomicU64::new(val.to_bits()),
        }
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.inner.load(Ordering::SeqCst))
    }

    pub fn store(&self, val: f64) {
        self.inner.store(val.to_bits(), Ordering::SeqCst);
    }
}

/// Last decision taken for a symbol
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolStatus {
    /// Snapshot price the decision was made at
    pub last_price: f64,
    /// Final consensus action
    pub last_decision: Action,
    /// Blended confidence behind the action
    pub last_confidence: f64,
    /// Unix millis of the cycle
    pub last_cycle_at: i64,
}

/// Central shared state store
pub struct SharedState {
    // Market
    /// Latest decision per symbol
    pub symbols: DashMap<String, SymbolStatus>,
    /// Regime of the current round
    pub regime: RwLock<Regime>,
    /// Volatility reading the regime was derived from
    pub volatility_reading: AtomicF64,

    // Consensus
    /// Rounds started
    pub cycle_count: AtomicU64,
    /// Decisions taken without an evaluator majority
    pub degraded_cycles: AtomicU64,
    /// Decisions where the risk evaluator vetoed
    pub veto_count: AtomicU64,
    /// Whether any evaluator answered the last round
    pub backend_healthy: AtomicBool,

    // P&L
    pub realized_pnl: AtomicF64,
    pub unrealized_pnl: AtomicF64,

    // System
    /// Unix millis of the last completed symbol cycle
    pub last_cycle: AtomicI64,
    /// Errors since start or the last daily reset
    pub error_count: AtomicU64,
    /// Errors since the last round that finished without one
    pub consecutive_errors: AtomicU64,
    /// Orders filled
    pub trade_count: AtomicU64,
    pub is_paused: RwLock<bool>,
    pub pause_reason: RwLock<Option<String>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            symbols: DashMap::new(),
            regime: RwLock::new(Regime::Normal),
            volatility_reading: AtomicF64::new(0.0),
            cycle_count: AtomicU64::new(0),
            degraded_cycles: AtomicU64::new(0),
            veto_count: AtomicU64::new(0),
            backend_healthy: AtomicBool::new(true),
            realized_pnl: AtomicF64::new(0.0),
            unrealized_pnl: AtomicF64::new(0.0),
            last_cycle: AtomicI64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
            trade_count: AtomicU64::new(0),
            is_paused: RwLock::new(false),
            pause_reason: RwLock::new(None),
        }
    }

    /// Record the outcome of a symbol cycle
    pub fn record_decision(&self, symbol: &str, price: f64, decision: Action, confidence: f64) {
        let now = current_timestamp_millis();
        self.symbols.insert(
            symbol.to_string(),
            SymbolStatus {
                last_price: price,
                last_decision: decision,
                last_confidence: confidence,
                last_cycle_at: now,
            },
        );
        self.last_cycle.store(now, Ordering::SeqCst);
    }

    pub fn update_regime(&self, regime: Regime, reading: f64) {
        *self.regime.write() = regime;
        self.volatility_reading.store(reading);
    }

    pub fn current_regime(&self) -> Regime {
        *self.regime.read()
    }

    /// Returns the previous health flag
    pub fn set_backend_healthy(&self, healthy: bool) -> bool {
        self.backend_healthy.swap(healthy, Ordering::SeqCst)
    }

    pub fn is_backend_healthy(&self) -> bool {
        self.backend_healthy.load(Ordering::SeqCst)
    }

    pub fn pause(&self, reason: &str) {
        *self.is_paused.write() = true;
        *self.pause_reason.write() = Some(reason.to_string());
    }

    pub fn resume(&self) {
        *self.is_paused.write() = false;
        *self.pause_reason.write() = None;
    }

    pub fn is_paused(&self) -> bool {
        *self.is_paused.read()
    }

    pub fn pause_reason(&self) -> Option<String> {
        self.pause_reason.read().clone()
    }

    pub fn increment_cycle_count(&self) -> u64 {
        self.cycle_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn increment_degraded_cycles(&self) {
        self.degraded_cycles.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_veto_count(&self) {
        self.veto_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Count an error towards both the running total and the current streak
    pub fn increment_error_count(&self) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst);
    }

    /// End the current error streak
    pub fn clear_consecutive_errors(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    /// Clear both error counters
    pub fn reset_errors(&self) {
        self.error_count.store(0, Ordering::SeqCst);
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    pub fn increment_trade_count(&self) {
        self.trade_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
