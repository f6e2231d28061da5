//! Risk Manager
//!
//! Enforces per-trade and system limits:
//! - Order sizing from capital and approved size fraction
//! - Stop-loss / take-profit exits on open positions
//! - Maximum drawdown and daily loss limits
//! - Error-streak circuit breaker with a cooldown

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::position::{CloseReason, LedgerTotals, Position, Side};
use crate::state::SharedState;

/// Which limit paused trading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseCause {
    /// Lifts at the next UTC day
    Drawdown,
    /// Lifts at the next UTC day
    DailyLoss,
    /// Lifts after the configured cooldown
    ErrorStreak,
}

/// Risk metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskMetrics {
    /// Drawdown from the day's peak equity, in percent
    pub drawdown_pct: f64,
    /// Peak equity (high water mark) since the day began
    pub peak_equity: f64,
    /// Capital plus realized and unrealized P&L
    pub current_equity: f64,
    /// Realized P&L since the UTC day began
    pub realized_pnl_today: f64,
    /// Errors since the last clean round
    pub consecutive_errors: u64,
}

/// Risk check result
#[derive(Debug, Clone)]
pub struct RiskCheckResult {
    /// A limit is breached; trading is or stays paused
    pub should_pause: bool,
    /// A pause this manager imposed was lifted during the check
    pub resumed: bool,
    /// Reasons for the decision
    pub reasons: Vec<String>,
    pub metrics: RiskMetrics,
}

/// Daily window and the pause this manager owns
#[derive(Debug, Default)]
struct RiskWindow {
    day: Option<NaiveDate>,
    day_start_realized: f64,
    peak_equity: f64,
    pause: Option<PauseCause>,
    errors_clear_at: Option<Instant>,
}

/// Risk manager
pub struct RiskManager {
    /// Configuration
    config: Arc<AppConfig>,
    /// Shared state holding the pause flag and error counters
    state: Arc<SharedState>,
    window: Mutex<RiskWindow>,
}

impl RiskManager {
    /// Create a new risk manager
    pub fn new(config: Arc<AppConfig>, state: Arc<SharedState>) -> Self {
        Self {
            config,
            state,
            window: Mutex::new(RiskWindow::default()),
        }
    }

    /// Base-asset quantity for an approved size fraction at `price`.
    /// `None` when the result would not be a valid order.
    pub fn quantity_for(&self, size_fraction: f64, price: f64) -> Option<f64> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        let fraction = size_fraction.min(self.config.trading.max_size_fraction);
        let quantity = self.config.trading.capital_usd * fraction / price;
        (quantity.is_finite() && quantity > 0.0).then_some(quantity)
    }

    /// Exit reason if `price` crosses the position's stop or take level
    pub fn exit_for(&self, position: &Position, price: f64) -> Option<CloseReason> {
        let stop_hit = position.stop_loss.is_some_and(|stop| match position.side {
            Side::Long => price <= stop,
            Side::Short => price >= stop,
        });
        if stop_hit {
            warn!(
                "{}: stop loss hit at {} (stop {:?}, entry {})",
                position.symbol, price, position.stop_loss, position.entry_price
            );
            return Some(CloseReason::StopLoss);
        }

        let take_hit = position.take_profit.is_some_and(|take| match position.side {
            Side::Long => price >= take,
            Side::Short => price <= take,
        });
        if take_hit {
            info!(
                "{}: take profit hit at {} (target {:?}, entry {})",
                position.symbol, price, position.take_profit, position.entry_price
            );
            return Some(CloseReason::TakeProfit);
        }

        None
    }

    /// System-level checks run before each round
    pub fn check_all(&self, totals: &LedgerTotals) -> RiskCheckResult {
        self.check_at(totals, Utc::now())
    }

    /// Same as [`check_all`](Self::check_all) with an explicit wall clock
    pub fn check_at(&self, totals: &LedgerTotals, now: DateTime<Utc>) -> RiskCheckResult {
        let limits = &self.config.risk;
        let capital = self.config.trading.capital_usd;
        let equity = capital + totals.realized_pnl + totals.unrealized_pnl;
        let today = now.date_naive();

        let mut window = self.window.lock();
        let mut lifted = false;

        match window.day {
            None => {
                window.day = Some(today);
                window.day_start_realized = totals.realized_pnl;
                window.peak_equity = equity;
            }
            Some(day) if today > day => {
                info!("Daily risk reset for {}", today);
                window.day = Some(today);
                window.day_start_realized = totals.realized_pnl;
                window.peak_equity = equity;
                self.state.reset_errors();
                lifted |= window.pause.take().is_some();
                window.errors_clear_at = None;
            }
            Some(_) => {}
        }

        if window.pause == Some(PauseCause::ErrorStreak)
            && window.errors_clear_at.is_some_and(|at| Instant::now() >= at)
        {
            info!("Error cooldown elapsed");
            self.state.clear_consecutive_errors();
            window.pause = None;
            window.errors_clear_at = None;
            lifted = true;
        }
        if lifted {
            self.state.resume();
        }

        window.peak_equity = window.peak_equity.max(equity);
        let drawdown_pct = if window.peak_equity > 0.0 {
            (window.peak_equity - equity) / window.peak_equity * 100.0
        } else {
            0.0
        };
        let realized_today = totals.realized_pnl - window.day_start_realized;
        let consecutive_errors = self.state.consecutive_errors.load(Ordering::SeqCst);

        let mut reasons = Vec::new();
        let mut cause = None;
        if limits.max_drawdown_pct > 0.0 && drawdown_pct >= limits.max_drawdown_pct {
            reasons.push(format!("Max drawdown exceeded: {:.2}%", drawdown_pct));
            cause.get_or_insert(PauseCause::Drawdown);
        } else if limits.max_drawdown_pct > 0.0 && drawdown_pct >= limits.max_drawdown_pct * 0.8 {
            warn!("Drawdown warning: {:.2}%", drawdown_pct);
        }
        if limits.max_daily_loss_pct > 0.0 && -realized_today >= capital * limits.max_daily_loss_pct / 100.0 {
            reasons.push(format!("Daily loss limit: ${:.2}", realized_today));
            cause.get_or_insert(PauseCause::DailyLoss);
        }
        if consecutive_errors > limits.max_consecutive_errors {
            reasons.push(format!("High error count: {} in a row", consecutive_errors));
            cause.get_or_insert(PauseCause::ErrorStreak);
        }

        let should_pause = cause.is_some();
        if let Some(cause) = cause {
            if !self.state.is_paused() {
                self.state.pause(&reasons.join("; "));
                window.pause = Some(cause);
                if cause == PauseCause::ErrorStreak {
                    window.errors_clear_at =
                        Some(Instant::now() + Duration::from_secs(limits.error_cooldown_secs));
                }
            }
        } else {
            debug!("Risk checks passed");
        }

        RiskCheckResult {
            should_pause,
            resumed: lifted && !self.state.is_paused(),
            reasons,
            metrics: RiskMetrics {
                drawdown_pct,
                peak_equity: window.peak_equity,
                current_equity: equity,
                realized_pnl_today: realized_today,
                consecutive_errors,
            },
        }
    }

    /// The pause this manager imposed, if it is still in force
    pub fn pause_cause(&self) -> Option<PauseCause> {
        self.window.lock().pause
    }

    /// Clear error counters and any pause, then resume trading
    pub fn reset(&self) {
        self.state.reset_errors();
        {
            let mut window = self.window.lock();
            window.pause = None;
            window.errors_clear_at = None;
        }
        self.state.resume();
        info!("Risk manager reset, trading resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{Outcome, PositionStatus};
    use chrono::TimeZone;

    fn manager() -> RiskManager {
        RiskManager::new(Arc::new(AppConfig::paper_default()), Arc::new(SharedState::new()))
    }

    fn totals(realized: f64, unrealized: f64) -> LedgerTotals {
        LedgerTotals {
            realized_pnl: realized,
            unrealized_pnl: unrealized,
            open_positions: 0,
            closed_positions: 0,
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, 12, 0, 0).unwrap()
    }

    fn position(side: Side, stop: f64, take: f64) -> Position {
        Position {
            id: "p".to_string(),
            symbol: "BTC/USDT".to_string(),
            side,
            entry_price: 100.0,
            quantity: 1.0,
            initial_quantity: 1.0,
            entry_time: 0,
            consensus_id: "c".to_string(),
            supporting_evaluators: Vec::new(),
            degraded: false,
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            close_reason: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            mark_price: 100.0,
            outcome: Outcome::Pending,
            stop_loss: Some(stop),
            take_profit: Some(take),
            fills: Vec::new(),
        }
    }

    #[test]
    fn test_quantity_for() {
        let risk = manager();
        // 10_000 capital * 0.05 / 100
        assert_eq!(risk.quantity_for(0.05, 100.0), Some(5.0));
        // capped at max_size_fraction 0.10
        assert_eq!(risk.quantity_for(0.50, 100.0), Some(10.0));
        assert_eq!(risk.quantity_for(0.05, 0.0), None);
        assert_eq!(risk.quantity_for(0.0, 100.0), None);
    }

    #[test]
    fn test_long_exits() {
        let risk = manager();
        let long = position(Side::Long, 98.0, 104.0);
        assert_eq!(risk.exit_for(&long, 95.0), Some(CloseReason::StopLoss));
        assert_eq!(risk.exit_for(&long, 104.5), Some(CloseReason::TakeProfit));
        assert_eq!(risk.exit_for(&long, 101.0), None);
    }

    #[test]
    fn test_short_exits() {
        let risk = manager();
        let short = position(Side::Short, 102.0, 96.0);
        assert_eq!(risk.exit_for(&short, 103.0), Some(CloseReason::StopLoss));
        assert_eq!(risk.exit_for(&short, 95.0), Some(CloseReason::TakeProfit));
        assert_eq!(risk.exit_for(&short, 99.0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_breaker_lifts_after_cooldown() {
        let state = Arc::new(SharedState::new());
        let config = Arc::new(AppConfig::paper_default());
        let risk = RiskManager::new(config.clone(), state.clone());
        assert!(!risk.check_at(&totals(0.0, 0.0), day(1)).should_pause);

        for _ in 0..=config.risk.max_consecutive_errors {
            state.increment_error_count();
        }
        let check = risk.check_at(&totals(0.0, 0.0), day(1));
        assert!(check.should_pause);
        assert!(state.is_paused());
        assert_eq!(risk.pause_cause(), Some(PauseCause::ErrorStreak));

        // Still inside the cooldown
        let check = risk.check_at(&totals(0.0, 0.0), day(1));
        assert!(!check.resumed);
        assert!(state.is_paused());

        tokio::time::advance(Duration::from_secs(config.risk.error_cooldown_secs + 1)).await;
        let check = risk.check_at(&totals(0.0, 0.0), day(1));
        assert!(check.resumed);
        assert!(!check.should_pause);
        assert!(!state.is_paused());
        assert_eq!(state.consecutive_errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drawdown_pauses_until_next_day() {
        let state = Arc::new(SharedState::new());
        let risk = RiskManager::new(Arc::new(AppConfig::paper_default()), state.clone());

        risk.check_at(&totals(0.0, 0.0), day(1));
        // Peak 10_500, then equity 8_800: 16.2% below peak
        risk.check_at(&totals(0.0, 500.0), day(1));
        let check = risk.check_at(&totals(0.0, -1_200.0), day(1));
        assert!(check.should_pause);
        assert!(check.metrics.drawdown_pct > 15.0);
        assert_eq!(risk.pause_cause(), Some(PauseCause::Drawdown));

        let check = risk.check_at(&totals(0.0, -1_200.0), day(2));
        assert!(check.resumed);
        assert!(!state.is_paused());
        assert_eq!(check.metrics.drawdown_pct, 0.0);
    }

    #[test]
    fn test_daily_loss_counts_from_day_start() {
        let state = Arc::new(SharedState::new());
        let risk = RiskManager::new(Arc::new(AppConfig::paper_default()), state.clone());

        // Losses from before the first check are history, not today's loss
        assert!(!risk.check_at(&totals(-800.0, 0.0), day(1)).should_pause);

        let check = risk.check_at(&totals(-1_310.0, 0.0), day(1));
        assert!(check.should_pause);
        assert!((check.metrics.realized_pnl_today + 510.0).abs() < 1e-9);
        assert_eq!(risk.pause_cause(), Some(PauseCause::DailyLoss));

        assert!(risk.check_at(&totals(-1_310.0, 0.0), day(2)).resumed);
    }

    #[test]
    fn test_operator_pause_is_not_lifted() {
        let state = Arc::new(SharedState::new());
        let risk = RiskManager::new(Arc::new(AppConfig::paper_default()), state.clone());
        risk.check_at(&totals(0.0, 0.0), day(1));

        state.pause("maintenance");
        let check = risk.check_at(&totals(0.0, 0.0), day(2));
        assert!(!check.resumed);
        assert!(state.is_paused());

        risk.reset();
        assert!(!state.is_paused());
    }
}
