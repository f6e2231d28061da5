//! Domain error types
//!
//! Recoverable failures (evaluator timeouts, exchange rejections) and fatal
//! ledger invariant violations are kept apart so callers can tell them from
//! each other without string matching.

use thiserror::Error;

/// Failure of a single evaluator call. Always recovered as an abstention.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluatorError {
    #[error("evaluator {evaluator_id} timed out after {timeout_ms}ms")]
    Timeout { evaluator_id: String, timeout_ms: u64 },

    #[error("inference backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("malformed evaluator response: {0}")]
    MalformedResponse(String),
}

/// Exchange-side failure. Stops the execution step of one cycle only.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("order rejected for {symbol}: {reason}")]
    Rejected { symbol: String, reason: String },

    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    #[error("no market data for {0}")]
    NoMarketData(String),
}

/// Ledger invariant violations. Fatal for the operation, never corrected.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("no open position for {0}")]
    NoOpenPosition(String),

    #[error("insufficient quantity for {symbol}: requested {requested}, open {available}")]
    InsufficientQuantity {
        symbol: String,
        requested: f64,
        available: f64,
    },

    #[error("position already open for {0}")]
    PositionAlreadyOpen(String),

    #[error("invalid ledger input: {0}")]
    InvalidInput(String),

    #[error("weight invariant violated: {0}")]
    WeightInvariant(String),

    #[error("unknown evaluator: {0}")]
    UnknownEvaluator(String),

    #[error("ledger persistence failed: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Persistence(e.to_string())
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;
