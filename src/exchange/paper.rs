//! Paper Exchange
//!
//! Dry-run venue for paper trading and tests:
//! - Quote balance and signed holdings per symbol
//! - Fills at the last snapshot price, with a flat fee
//! - Seeded random-walk prices for symbols without an explicit price
//! - A few indicators derived from the simulated history

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::ExchangeConnector;
use crate::engines::technical::indicators;
use crate::error::ExchangeError;
use crate::state::AtomicF64;
use crate::utils::helpers::{current_timestamp_millis, format_price};
use crate::utils::types::{Action, MarketSnapshot};

const RSI_PERIOD: usize = 14;
const SMA_PERIOD: usize = 50;
const VOLUME_PERIOD: usize = 20;

#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub initial_balance: f64,
    /// Fee charged on notional, e.g. 0.001 = 10 bps
    pub fee_rate: f64,
    /// Max relative move per tick; 0 freezes prices
    pub step_volatility: f64,
    pub initial_price: f64,
    /// Ticks generated when a symbol is first seen
    pub warmup_ticks: usize,
    pub history_len: usize,
    pub volatility_index: f64,
    pub seed: u64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            fee_rate: 0.001,
            step_volatility: 0.005,
            initial_price: 100.0,
            warmup_ticks: 60,
            history_len: 200,
            volatility_index: 20.0,
            seed: 42,
        }
    }
}

#[derive(Debug, Default)]
struct Book {
    quote_balance: f64,
    /// Positive = long, negative = short
    holdings: HashMap<String, f64>,
}

#[derive(Debug, Default)]
struct PriceSeries {
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
}

impl PriceSeries {
    fn push(&mut self, price: f64, volume: f64, cap: usize) {
        self.prices.push_back(price);
        self.volumes.push_back(volume);
        while self.prices.len() > cap {
            self.prices.pop_front();
            self.volumes.pop_front();
        }
    }

    fn last(&self) -> Option<f64> {
        self.prices.back().copied()
    }
}

pub struct PaperExchange {
    config: PaperConfig,
    book: Mutex<Book>,
    series: DashMap<String, PriceSeries>,
    rng: Mutex<StdRng>,
    volatility_index: AtomicF64,
    halted: AtomicBool,
    orders_placed: AtomicU64,
    orders_failed: AtomicU64,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        info!(
            "Paper exchange started with {:.2} quote balance (fee {:.4}, seed {})",
            config.initial_balance, config.fee_rate, config.seed
        );
        Self {
            book: Mutex::new(Book {
                quote_balance: config.initial_balance,
                holdings: HashMap::new(),
            }),
            series: DashMap::new(),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            volatility_index: AtomicF64::new(config.volatility_index),
            halted: AtomicBool::new(false),
            orders_placed: AtomicU64::new(0),
            orders_failed: AtomicU64::new(0),
            config,
        }
    }

    /// Pin the next price for `symbol`
    pub fn set_price(&self, symbol: &str, price: f64) {
        let cap = self.config.history_len;
        let mut series = self.series.entry(symbol.to_string()).or_default();
        let volume = series.volumes.back().copied().unwrap_or(100.0);
        series.push(price, volume, cap);
    }

    pub fn set_volatility_index(&self, reading: f64) {
        self.volatility_index.store(reading);
    }

    /// Simulate an outage: every call fails with `Unavailable`
    pub fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::SeqCst);
    }

    pub fn quote_balance(&self) -> f64 {
        self.book.lock().quote_balance
    }

    pub fn holding(&self, symbol: &str) -> f64 {
        self.book.lock().holdings.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.series.get(symbol).and_then(|s| s.last())
    }

    pub fn orders_placed(&self) -> u64 {
        self.orders_placed.load(Ordering::SeqCst)
    }

    pub fn orders_failed(&self) -> u64 {
        self.orders_failed.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), ExchangeError> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(ExchangeError::Unavailable("paper exchange halted".to_string()));
        }
        Ok(())
    }

    /// One random-walk step; seeds a warm-up history for new symbols
    fn tick(&self, symbol: &str) -> (f64, f64) {
        let cap = self.config.history_len;
        let mut rng = self.rng.lock();
        let mut series = self.series.entry(symbol.to_string()).or_default();

        if series.prices.is_empty() {
            let mut price = self.config.initial_price;
            for _ in 0..self.config.warmup_ticks {
                price = self.step(&mut rng, price);
                let volume = rng.random_range(50.0..150.0);
                series.push(price, volume, cap);
            }
            debug!("Paper exchange seeded {} ticks for {}", self.config.warmup_ticks, symbol);
        }

        let last = series.last().unwrap_or(self.config.initial_price);
        let price = self.step(&mut rng, last);
        let volume = rng.random_range(50.0..150.0);
        series.push(price, volume, cap);
        (price, volume)
    }

    fn step(&self, rng: &mut StdRng, price: f64) -> f64 {
        let vol = self.config.step_volatility;
        if vol <= 0.0 {
            return price;
        }
        (price * (1.0 + rng.random_range(-vol..vol))).max(f64::MIN_POSITIVE)
    }

    fn indicators(&self, symbol: &str) -> Vec<(&'static str, f64)> {
        let Some(series) = self.series.get(symbol) else {
            return Vec::new();
        };
        let prices: Vec<f64> = series.prices.iter().copied().collect();
        let volumes: Vec<f64> = series.volumes.iter().copied().collect();

        let mut out = Vec::new();
        if let Some(rsi) = rsi(&prices, RSI_PERIOD) {
            out.push((indicators::RSI, rsi));
        }
        if let Some(sma) = tail_mean(&prices, SMA_PERIOD) {
            out.push((indicators::SMA_50, sma));
        }
        if let (Some(last), Some(avg)) = (volumes.last(), tail_mean(&volumes, VOLUME_PERIOD)) {
            if avg > 0.0 {
                out.push((indicators::VOLUME_RATIO, last / avg));
            }
        }
        out
    }

    fn fail(&self, error: ExchangeError) -> ExchangeError {
        self.orders_failed.fetch_add(1, Ordering::SeqCst);
        warn!("Paper order failed: {}", error);
        error
    }
}

#[async_trait]
impl ExchangeConnector for PaperExchange {
    async fn get_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        self.check_available()?;
        let (price, volume) = self.tick(symbol);

        let mut snapshot = MarketSnapshot::new(symbol, price, volume, self.volatility_index.load());
        for (name, value) in self.indicators(symbol) {
            snapshot = snapshot.with_indicator(name, value);
        }
        snapshot.timestamp = current_timestamp_millis();
        Ok(snapshot)
    }

    async fn place_order(&self, symbol: &str, action: Action, quantity: f64) -> Result<f64, ExchangeError> {
        self.check_available()?;
        if !action.is_directional() {
            return Err(self.fail(ExchangeError::Rejected {
                symbol: symbol.to_string(),
                reason: "HOLD is not an order".to_string(),
            }));
        }
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(self.fail(ExchangeError::Rejected {
                symbol: symbol.to_string(),
                reason: format!("invalid quantity {}", quantity),
            }));
        }
        let price = self
            .last_price(symbol)
            .ok_or_else(|| self.fail(ExchangeError::NoMarketData(symbol.to_string())))?;

        let mut book = self.book.lock();
        let before = book.holdings.get(symbol).copied().unwrap_or(0.0);
        let signed = action.direction() * quantity;
        let after = before + signed;

        let fee = quantity * price * self.config.fee_rate;
        let added_exposure = (after.abs() - before.abs()).max(0.0) * price;
        if added_exposure + fee > book.quote_balance {
            let balance = book.quote_balance;
            drop(book);
            return Err(self.fail(ExchangeError::Rejected {
                symbol: symbol.to_string(),
                reason: format!(
                    "insufficient balance: need {:.2}, have {:.2}",
                    added_exposure + fee,
                    balance
                ),
            }));
        }

        book.quote_balance -= signed * price + fee;
        if after.abs() < 1e-12 {
            book.holdings.remove(symbol);
        } else {
            book.holdings.insert(symbol.to_string(), after);
        }
        let balance = book.quote_balance;
        drop(book);

        self.orders_placed.fetch_add(1, Ordering::SeqCst);
        info!(
            "[PAPER] {} {:.6} {} @ {} (fee {:.4}, balance {:.2})",
            action, quantity, symbol, format_price(price), fee, balance
        );
        Ok(price)
    }
}

fn tail_mean(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let tail = &values[values.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// Simple-average RSI over the last `period` changes
fn rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() <= period {
        return None;
    }
    let window = &prices[prices.len() - period - 1..];
    let (gains, losses) = window.windows(2).fold((0.0, 0.0), |(g, l), w| {
        let change = w[1] - w[0];
        if change > 0.0 {
            (g + change, l)
        } else {
            (g, l - change)
        }
    });
    if gains + losses == 0.0 {
        return Some(50.0);
    }
    if losses == 0.0 {
        return Some(100.0);
    }
    let rs = gains / losses;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frozen() -> PaperExchange {
        PaperExchange::new(PaperConfig {
            step_volatility: 0.0,
            fee_rate: 0.0,
            ..PaperConfig::default()
        })
    }

    #[tokio::test]
    async fn test_snapshot_uses_pinned_price() {
        let exchange = frozen();
        exchange.set_price("BTC/USDT", 250.0);
        exchange.set_volatility_index(14.0);

        let snapshot = exchange.get_snapshot("BTC/USDT").await.unwrap();
        assert_eq!(snapshot.price, 250.0);
        assert_eq!(snapshot.volatility_index, 14.0);
    }

    #[tokio::test]
    async fn test_new_symbol_gets_warmup_history() {
        let exchange = PaperExchange::new(PaperConfig::default());
        let snapshot = exchange.get_snapshot("ETH/USDT").await.unwrap();

        assert!(snapshot.price > 0.0);
        assert!(snapshot.indicator(indicators::RSI).is_some());
        assert!(snapshot.indicator(indicators::SMA_50).is_some());
        assert!(snapshot.indicator(indicators::VOLUME_RATIO).is_some());
    }

    #[tokio::test]
    async fn test_same_seed_same_path() {
        let a = PaperExchange::new(PaperConfig::default());
        let b = PaperExchange::new(PaperConfig::default());
        for _ in 0..5 {
            let pa = a.get_snapshot("SOL/USDT").await.unwrap().price;
            let pb = b.get_snapshot("SOL/USDT").await.unwrap().price;
            assert_eq!(pa, pb);
        }
    }

    #[tokio::test]
    async fn test_buy_then_sell_round_trip() {
        let exchange = frozen();
        exchange.set_price("BTC/USDT", 100.0);

        let fill = exchange.place_order("BTC/USDT", Action::Buy, 10.0).await.unwrap();
        assert_eq!(fill, 100.0);
        assert_eq!(exchange.quote_balance(), 9_000.0);
        assert_eq!(exchange.holding("BTC/USDT"), 10.0);

        exchange.set_price("BTC/USDT", 110.0);
        exchange.place_order("BTC/USDT", Action::Sell, 10.0).await.unwrap();
        assert_eq!(exchange.quote_balance(), 10_100.0);
        assert_eq!(exchange.holding("BTC/USDT"), 0.0);
        assert_eq!(exchange.orders_placed(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let exchange = frozen();
        exchange.set_price("BTC/USDT", 100.0);

        let err = exchange.place_order("BTC/USDT", Action::Buy, 1_000.0).await.unwrap_err();
        match err {
            ExchangeError::Rejected { reason, .. } => assert!(reason.contains("insufficient balance")),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(exchange.orders_failed(), 1);
        assert_eq!(exchange.quote_balance(), 10_000.0);
    }

    #[tokio::test]
    async fn test_order_without_market_data() {
        let exchange = frozen();
        let err = exchange.place_order("DOGE/USDT", Action::Buy, 1.0).await.unwrap_err();
        assert_eq!(err, ExchangeError::NoMarketData("DOGE/USDT".to_string()));
    }

    #[tokio::test]
    async fn test_halted_exchange_is_unavailable() {
        let exchange = frozen();
        exchange.set_halted(true);
        assert!(matches!(
            exchange.get_snapshot("BTC/USDT").await,
            Err(ExchangeError::Unavailable(_))
        ));
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&rising, 14), Some(100.0));

        let flat = vec![100.0; 20];
        assert_eq!(rsi(&flat, 14), Some(50.0));

        assert_eq!(rsi(&rising[..10], 14), None);
    }
}
