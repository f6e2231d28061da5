//! Position Ledger Module
//!
//! Tracks open and closed positions and their P&L:
//! - At most one open position per symbol (per-symbol entry locking)
//! - Partial and full closes with realized P&L
//! - Outcome classification on full close, the ground truth for rebalancing
//! - JSON persistence of open and closed positions

pub mod metrics;

pub use metrics::{calculate_metrics, PerformanceMetrics};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::network::event_bus::Event;
use crate::utils::helpers::{current_timestamp_millis, generate_id};
use crate::utils::types::{Action, ConsensusResult};

const QTY_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn from_action(action: Action) -> Option<Side> {
        match action {
            Action::Buy => Some(Side::Long),
            Action::Sell => Some(Side::Short),
            Action::Hold => None,
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    /// Action that opened this side
    pub fn entry_action(&self) -> Action {
        match self {
            Side::Long => Action::Buy,
            Side::Short => Action::Sell,
        }
    }

    /// Action that unwinds this side
    pub fn exit_action(&self) -> Action {
        self.entry_action().opposite()
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Trade outcome used to reward or penalize evaluators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Pending,
    Correct,
    FalsePositive,
    StoppedOut,
}

impl Outcome {
    /// Classify a fully closed position from its total realized P&L
    pub fn classify(total_pnl: f64, reason: CloseReason) -> Outcome {
        if total_pnl > 0.0 {
            Outcome::Correct
        } else if reason.is_stop() {
            Outcome::StoppedOut
        } else {
            Outcome::FalsePositive
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Pending => write!(f, "PENDING"),
            Outcome::Correct => write!(f, "CORRECT"),
            Outcome::FalsePositive => write!(f, "FALSE_POSITIVE"),
            Outcome::StoppedOut => write!(f, "STOPPED_OUT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    /// Opposite consensus decision
    Signal,
    StopLoss,
    TakeProfit,
    Manual,
}

impl CloseReason {
    pub fn is_stop(&self) -> bool {
        matches!(self, CloseReason::StopLoss)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Signal => write!(f, "signal"),
            CloseReason::StopLoss => write!(f, "stop_loss"),
            CloseReason::TakeProfit => write!(f, "take_profit"),
            CloseReason::Manual => write!(f, "manual"),
        }
    }
}

/// One exit fill (partial or final)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitFill {
    pub price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub reason: CloseReason,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    /// Quantity-weighted average entry of the open quantity
    pub entry_price: f64,
    /// Open quantity
    pub quantity: f64,
    pub initial_quantity: f64,
    pub entry_time: i64,
    /// Consensus round that authorized the position
    pub consensus_id: String,
    /// Evaluators whose vote matched the executed action
    pub supporting_evaluators: Vec<String>,
    pub degraded: bool,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_time: Option<i64>,
    pub close_reason: Option<CloseReason>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub mark_price: f64,
    pub outcome: Outcome,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub fills: Vec<ExitFill>,
}

impl Position {
    /// P&L of `quantity` units exited at `price`
    pub fn pnl_at(&self, price: f64, quantity: f64) -> f64 {
        (price - self.entry_price) * quantity * self.side.sign()
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Return on the initial notional, in percent
    pub fn roi_pct(&self) -> f64 {
        let notional = self.entry_price * self.initial_quantity;
        if notional > 0.0 {
            self.realized_pnl / notional * 100.0
        } else {
            0.0
        }
    }

    pub fn hold_hours(&self) -> f64 {
        let end = self.exit_time.unwrap_or_else(current_timestamp_millis);
        (end - self.entry_time) as f64 / 3_600_000.0
    }
}

/// Stop-loss and take-profit distances applied at open, in percent
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitLevels {
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
}

impl ExitLevels {
    fn prices(&self, side: Side, entry: f64) -> (Option<f64>, Option<f64>) {
        let stop = self.stop_loss_pct.map(|pct| entry * (1.0 - side.sign() * pct / 100.0));
        let take = self.take_profit_pct.map(|pct| entry * (1.0 + side.sign() * pct / 100.0));
        (stop, take)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    open: Vec<Position>,
    closed: Vec<Position>,
}

/// Realized, unrealized and count totals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerTotals {
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub open_positions: usize,
    pub closed_positions: usize,
}

pub struct PositionLedger {
    open: DashMap<String, Position>,
    closed: RwLock<Vec<Position>>,
    exit_levels: ExitLevels,
    path: Option<PathBuf>,
    events: Option<broadcast::Sender<Event>>,
}

fn validate_price(price: f64) -> LedgerResult<()> {
    if !price.is_finite() || price <= 0.0 {
        return Err(LedgerError::InvalidInput(format!("price must be positive, got {}", price)));
    }
    Ok(())
}

fn validate_quantity(quantity: f64) -> LedgerResult<()> {
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(LedgerError::InvalidInput(format!("quantity must be positive, got {}", quantity)));
    }
    Ok(())
}

impl PositionLedger {
    pub fn new(exit_levels: ExitLevels) -> Self {
        Self {
            open: DashMap::new(),
            closed: RwLock::new(Vec::new()),
            exit_levels,
            path: None,
            events: None,
        }
    }

    /// Ledger backed by a JSON file, restoring its contents if present
    pub async fn open_file(exit_levels: ExitLevels, path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut ledger = Self::new(exit_levels);

        if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let file: LedgerFile = serde_json::from_str(&content)?;
            for position in file.open {
                if ledger.open.insert(position.symbol.clone(), position).is_some() {
                    return Err(LedgerError::PositionAlreadyOpen(format!("duplicate open entry in {:?}", path)));
                }
            }
            *ledger.closed.write() = file.closed;
            info!(
                "Position ledger loaded from {:?}: {} open, {} closed",
                path,
                ledger.open.len(),
                ledger.closed.read().len()
            );
        }

        ledger.path = Some(path);
        Ok(ledger)
    }

    pub fn with_event_sender(mut self, sender: broadcast::Sender<Event>) -> Self {
        self.events = Some(sender);
        self
    }

    fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Open a position from an approved consensus result
    pub fn open(&self, result: &ConsensusResult, entry_price: f64, quantity: f64) -> LedgerResult<Position> {
        let side = Side::from_action(result.decision).ok_or_else(|| {
            LedgerError::InvalidInput(format!("consensus {} decided HOLD", result.id))
        })?;
        validate_price(entry_price)?;
        validate_quantity(quantity)?;

        let (stop_loss, take_profit) = self.exit_levels.prices(side, entry_price);
        let position = Position {
            id: generate_id(),
            symbol: result.symbol.clone(),
            side,
            entry_price,
            quantity,
            initial_quantity: quantity,
            entry_time: current_timestamp_millis(),
            consensus_id: result.id.clone(),
            supporting_evaluators: result.supporting_evaluators(),
            degraded: result.degraded,
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            close_reason: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            mark_price: entry_price,
            outcome: Outcome::Pending,
            stop_loss,
            take_profit,
            fills: Vec::new(),
        };

        match self.open.entry(result.symbol.clone()) {
            Entry::Occupied(_) => return Err(LedgerError::PositionAlreadyOpen(result.symbol.clone())),
            Entry::Vacant(slot) => {
                slot.insert(position.clone());
            }
        }

        info!(
            "Position opened: {} {} {} @ {} (consensus {})",
            position.side, position.quantity, position.symbol, position.entry_price, position.consensus_id
        );
        self.publish(Event::PositionOpened { position: position.clone() });
        Ok(position)
    }

    /// Fully close the open position for `symbol`
    pub fn close(&self, symbol: &str, exit_price: f64, reason: CloseReason) -> LedgerResult<Position> {
        validate_price(exit_price)?;
        let (_, mut position) = self
            .open
            .remove(symbol)
            .ok_or_else(|| LedgerError::NoOpenPosition(symbol.to_string()))?;

        let now = current_timestamp_millis();
        let pnl = position.pnl_at(exit_price, position.quantity);
        position.fills.push(ExitFill {
            price: exit_price,
            quantity: position.quantity,
            realized_pnl: pnl,
            reason,
            timestamp: now,
        });
        position.realized_pnl += pnl;
        position.quantity = 0.0;
        position.unrealized_pnl = 0.0;
        position.mark_price = exit_price;
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(now);
        position.close_reason = Some(reason);
        position.outcome = Outcome::classify(position.realized_pnl, reason);

        info!(
            "Position closed: {} {} @ {} ({}) P&L {:.2} -> {}",
            position.side, position.symbol, exit_price, reason, position.realized_pnl, position.outcome
        );
        self.closed.write().push(position.clone());
        self.publish(Event::PositionClosed { position: position.clone() });
        Ok(position)
    }

    /// Close part of the open position. Closing the whole remainder is a
    /// full close.
    pub fn reduce(&self, symbol: &str, exit_price: f64, quantity: f64, reason: CloseReason) -> LedgerResult<Position> {
        validate_price(exit_price)?;
        validate_quantity(quantity)?;

        let mut entry = self
            .open
            .get_mut(symbol)
            .ok_or_else(|| LedgerError::NoOpenPosition(symbol.to_string()))?;
        let available = entry.quantity;

        if quantity > available + QTY_EPSILON {
            return Err(LedgerError::InsufficientQuantity {
                symbol: symbol.to_string(),
                requested: quantity,
                available,
            });
        }
        if (available - quantity).abs() <= QTY_EPSILON {
            drop(entry);
            return self.close(symbol, exit_price, reason);
        }

        let pnl = entry.pnl_at(exit_price, quantity);
        entry.fills.push(ExitFill {
            price: exit_price,
            quantity,
            realized_pnl: pnl,
            reason,
            timestamp: current_timestamp_millis(),
        });
        entry.realized_pnl += pnl;
        entry.quantity = available - quantity;
        // Remaining units all entered at the same average, so it carries over
        let unrealized = entry.pnl_at(entry.mark_price, entry.quantity);
        entry.unrealized_pnl = unrealized;

        debug!(
            "Position reduced: {} by {} @ {}, {} left, realized {:.2}",
            symbol, quantity, exit_price, entry.quantity, entry.realized_pnl
        );
        Ok(entry.clone())
    }

    /// Mark the open position to `price`; returns its unrealized P&L
    pub fn mark(&self, symbol: &str, price: f64) -> LedgerResult<f64> {
        validate_price(price)?;
        let mut entry = self
            .open
            .get_mut(symbol)
            .ok_or_else(|| LedgerError::NoOpenPosition(symbol.to_string()))?;
        let unrealized = entry.pnl_at(price, entry.quantity);
        entry.mark_price = price;
        entry.unrealized_pnl = unrealized;
        Ok(unrealized)
    }

    pub fn get_open(&self, symbol: &str) -> Option<Position> {
        self.open.get(symbol).map(|p| p.value().clone())
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.iter().map(|p| p.value().clone()).collect()
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        self.closed.read().clone()
    }

    pub fn recent_closed(&self, n: usize) -> Vec<Position> {
        self.closed.read().iter().rev().take(n).cloned().collect()
    }

    pub fn totals(&self) -> LedgerTotals {
        let closed = self.closed.read();
        let closed_realized: f64 = closed.iter().map(|p| p.realized_pnl).sum();
        let (open_realized, unrealized) = self
            .open
            .iter()
            .fold((0.0, 0.0), |(r, u), p| (r + p.realized_pnl, u + p.unrealized_pnl));

        LedgerTotals {
            realized_pnl: closed_realized + open_realized,
            unrealized_pnl: unrealized,
            open_positions: self.open.len(),
            closed_positions: closed.len(),
        }
    }

    pub fn performance(&self) -> PerformanceMetrics {
        calculate_metrics(&self.closed.read())
    }

    /// Write open and closed positions to the backing file, if any
    pub async fn save(&self) -> LedgerResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = LedgerFile {
            open: self.open_positions(),
            closed: self.closed_positions(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if let Err(e) = tokio::fs::write(path, content).await {
            warn!("Failed to write position ledger {:?}: {}", path, e);
            return Err(e.into());
        }
        debug!("Position ledger saved to {:?}", path);
        Ok(())
    }
}
