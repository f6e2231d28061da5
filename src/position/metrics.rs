//! Trade performance metrics over closed positions

use serde::{Deserialize, Serialize};

use super::{Outcome, Position};
use crate::utils::helpers::safe_div;

/// Performance metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Trades that ended on a stop
    pub stopped_out: u32,
    /// Win rate (0-1)
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_pnl: f64,
    /// Profit factor (gross_profit / gross_loss)
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Expectancy per trade
    pub expectancy: f64,
    pub avg_hold_hours: f64,
    /// Sharpe ratio over per-trade ROI
    pub sharpe_ratio: f64,
    /// Maximum drawdown of cumulative P&L (%)
    pub max_drawdown_pct: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    /// Current streak (positive = wins, negative = losses)
    pub current_streak: i32,
    pub longest_win_streak: u32,
    pub longest_loss_streak: u32,
}

pub fn calculate_metrics(closed: &[Position]) -> PerformanceMetrics {
    if closed.is_empty() {
        return PerformanceMetrics::default();
    }

    let pnls: Vec<f64> = closed.iter().map(|p| p.realized_pnl).collect();
    let wins: Vec<bool> = closed.iter().map(|p| p.outcome == Outcome::Correct).collect();

    let total_trades = closed.len() as u32;
    let winning_trades = wins.iter().filter(|w| **w).count() as u32;
    let losing_trades = total_trades - winning_trades;
    let stopped_out = closed.iter().filter(|p| p.outcome == Outcome::StoppedOut).count() as u32;
    let win_rate = winning_trades as f64 / total_trades as f64;

    let gross_profit: f64 = pnls.iter().filter(|p| **p > 0.0).sum();
    let gross_loss: f64 = pnls.iter().filter(|p| **p < 0.0).map(|p| p.abs()).sum();
    let net_pnl: f64 = pnls.iter().sum();

    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let avg_win = safe_div(gross_profit, winning_trades as f64);
    let avg_loss = safe_div(gross_loss, losing_trades as f64);

    // Expectancy = (Win% × Avg Win) - (Loss% × Avg Loss)
    let expectancy = (win_rate * avg_win) - ((1.0 - win_rate) * avg_loss);

    let avg_hold_hours = closed.iter().map(|p| p.hold_hours()).sum::<f64>() / total_trades as f64;
    let returns: Vec<f64> = closed.iter().map(|p| p.roi_pct() / 100.0).collect();
    let (current_streak, longest_win_streak, longest_loss_streak) = streaks(&wins);

    PerformanceMetrics {
        total_trades,
        winning_trades,
        losing_trades,
        stopped_out,
        win_rate,
        gross_profit,
        gross_loss,
        net_pnl,
        profit_factor,
        avg_win,
        avg_loss,
        expectancy,
        avg_hold_hours,
        sharpe_ratio: sharpe(&returns),
        max_drawdown_pct: max_drawdown_pct(&pnls),
        best_trade: pnls.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        worst_trade: pnls.iter().copied().fold(f64::INFINITY, f64::min),
        current_streak,
        longest_win_streak,
        longest_loss_streak,
    }
}

/// Annualized assuming ~100 trades per year
fn sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }

    (mean / std_dev) * 100.0_f64.sqrt()
}

fn max_drawdown_pct(pnls: &[f64]) -> f64 {
    let mut peak = 0.0_f64;
    let mut max_dd = 0.0_f64;
    let mut cumulative = 0.0;

    for pnl in pnls {
        cumulative += pnl;
        peak = peak.max(cumulative);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - cumulative) / peak * 100.0);
        }
    }
    max_dd
}

fn streaks(wins: &[bool]) -> (i32, u32, u32) {
    let mut longest_win = 0;
    let mut longest_loss = 0;
    let mut current_win = 0;
    let mut current_loss = 0;

    for win in wins {
        if *win {
            current_win += 1;
            current_loss = 0;
            longest_win = longest_win.max(current_win);
        } else {
            current_loss += 1;
            current_win = 0;
            longest_loss = longest_loss.max(current_loss);
        }
    }

    let current = match wins.last() {
        Some(true) => current_win as i32,
        Some(false) => -(current_loss as i32),
        None => 0,
    };
    (current, longest_win, longest_loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{PositionStatus, Side};

    fn closed(pnl: f64, outcome: Outcome) -> Position {
        Position {
            id: "p".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: Side::Long,
            entry_price: 100.0,
            quantity: 0.0,
            initial_quantity: 1.0,
            entry_time: 0,
            consensus_id: "c".to_string(),
            supporting_evaluators: Vec::new(),
            degraded: false,
            status: PositionStatus::Closed,
            exit_price: Some(100.0 + pnl),
            exit_time: Some(3_600_000),
            close_reason: None,
            realized_pnl: pnl,
            unrealized_pnl: 0.0,
            mark_price: 100.0 + pnl,
            outcome,
            stop_loss: None,
            take_profit: None,
            fills: Vec::new(),
        }
    }

    #[test]
    fn test_metrics_over_mixed_trades() {
        let trades = vec![
            closed(10.0, Outcome::Correct),
            closed(-5.0, Outcome::StoppedOut),
            closed(-5.0, Outcome::FalsePositive),
            closed(20.0, Outcome::Correct),
        ];
        let m = calculate_metrics(&trades);

        assert_eq!(m.total_trades, 4);
        assert_eq!(m.win_rate, 0.5);
        assert_eq!(m.stopped_out, 1);
        assert_eq!(m.profit_factor, 3.0);
        assert_eq!(m.net_pnl, 20.0);
        assert_eq!(m.expectancy, 5.0);
        assert_eq!(m.longest_loss_streak, 2);
        assert_eq!(m.current_streak, 1);
        assert!((m.max_drawdown_pct - 100.0).abs() < 1e-9);
        assert_eq!(m.avg_hold_hours, 1.0);
    }

    #[test]
    fn test_empty_history() {
        assert_eq!(calculate_metrics(&[]), PerformanceMetrics::default());
    }
}
