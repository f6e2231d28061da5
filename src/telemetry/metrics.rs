//! Prometheus metrics export

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::engines::volatility::Regime;

pub fn init_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    register_metrics();
    info!("Prometheus metrics server started on {}", addr);
    Ok(())
}

fn register_metrics() {
    // Cycle metrics
    describe_counter!("consensus_trader_cycles_total", "Trading cycles run");
    describe_counter!("consensus_trader_degraded_cycles_total", "Cycles decided on the technical score alone");
    describe_counter!("consensus_trader_decisions_total", "Consensus decisions by action");
    describe_counter!("consensus_trader_vetoes_total", "Risk vetoes, labelled by whether they were overridden");

    // Evaluator metrics
    describe_counter!("consensus_trader_abstentions_total", "Evaluator abstentions");
    describe_histogram!("consensus_trader_evaluator_latency_ms", "Evaluator response latency");
    describe_gauge!("consensus_trader_evaluator_weight", "Current evaluator weight");
    describe_gauge!("consensus_trader_backend_healthy", "Inference backend health (1 = healthy)");

    // Volatility metrics
    describe_gauge!("consensus_trader_volatility_reading", "Latest volatility index reading");
    describe_gauge!("consensus_trader_regime", "Volatility regime (0 low .. 3 panic)");
    describe_counter!("consensus_trader_regime_transitions_total", "Volatility regime changes");

    // Trade metrics
    describe_counter!("consensus_trader_trades_total", "Orders sent to the exchange");
    describe_counter!("consensus_trader_trades_failed", "Orders the exchange rejected");
    describe_counter!("consensus_trader_positions_closed_total", "Closed positions by outcome");
    describe_gauge!("consensus_trader_realized_pnl", "Total realized P&L in quote currency");
    describe_gauge!("consensus_trader_unrealized_pnl", "Current unrealized P&L in quote currency");

    describe_counter!("consensus_trader_errors_total", "Total number of errors");
}

pub fn record_cycle(symbol: &str) {
    counter!("consensus_trader_cycles_total", "symbol" => symbol.to_string()).increment(1);
}

pub fn record_degraded_cycle() {
    counter!("consensus_trader_degraded_cycles_total").increment(1);
}

pub fn record_consensus_decision(decision: &str) {
    counter!("consensus_trader_decisions_total", "decision" => decision.to_string()).increment(1);
}

pub fn record_veto(overridden: bool) {
    let label = if overridden { "overridden" } else { "upheld" };
    counter!("consensus_trader_vetoes_total", "result" => label).increment(1);
}

pub fn record_abstention(evaluator_id: &str) {
    counter!("consensus_trader_abstentions_total", "evaluator" => evaluator_id.to_string()).increment(1);
}

pub fn record_evaluator_latency(evaluator_id: &str, latency_ms: u64) {
    histogram!("consensus_trader_evaluator_latency_ms", "evaluator" => evaluator_id.to_string())
        .record(latency_ms as f64);
}

pub fn record_evaluator_weight(evaluator_id: &str, weight: f64) {
    gauge!("consensus_trader_evaluator_weight", "evaluator" => evaluator_id.to_string()).set(weight);
}

pub fn record_backend_health(healthy: bool) {
    gauge!("consensus_trader_backend_healthy").set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_regime(regime: Regime, reading: f64) {
    gauge!("consensus_trader_regime").set(regime.code() as f64);
    gauge!("consensus_trader_volatility_reading").set(reading);
}

pub fn record_regime_transition(from: Regime, to: Regime) {
    counter!(
        "consensus_trader_regime_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_trade_success() {
    counter!("consensus_trader_trades_total").increment(1);
}

pub fn record_trade_failure() {
    counter!("consensus_trader_trades_total").increment(1);
    counter!("consensus_trader_trades_failed").increment(1);
}

pub fn record_position_closed(outcome: &str) {
    counter!("consensus_trader_positions_closed_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_pnl(realized: f64, unrealized: f64) {
    gauge!("consensus_trader_realized_pnl").set(realized);
    gauge!("consensus_trader_unrealized_pnl").set(unrealized);
}

pub fn record_error() {
    counter!("consensus_trader_errors_total").increment(1);
}
