//! Exchange Module
//!
//! The engine only needs two things from a venue: a market snapshot per
//! symbol and immediate fills. Failures stop one cycle's execution step and
//! are retried on the next cycle.

pub mod paper;

pub use paper::{PaperConfig, PaperExchange};

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::utils::types::{Action, MarketSnapshot};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Current market view for `symbol`
    async fn get_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError>;

    /// Execute a market order, returning the fill price
    async fn place_order(&self, symbol: &str, action: Action, quantity: f64) -> Result<f64, ExchangeError>;
}
