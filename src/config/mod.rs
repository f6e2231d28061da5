//! Configuration module
//!
//! Handles loading and validation of the application configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::engines::volatility::Regime;
use crate::evaluators::EvaluatorRole;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub trading: TradingConfig,
    #[serde(default)]
    pub volatility: VolatilityConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    pub evaluators: Vec<EvaluatorConfig>,
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub paper_trading: bool,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_yaml(&content)?;
        info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.trading.symbols.is_empty(), "at least one symbol is required");
        anyhow::ensure!(
            self.trading.base_size_fraction > 0.0
                && self.trading.base_size_fraction <= self.trading.max_size_fraction
                && self.trading.max_size_fraction <= 1.0,
            "size fractions must satisfy 0 < base_size_fraction <= max_size_fraction <= 1"
        );
        anyhow::ensure!(
            self.trading.stop_loss_pct >= 0.0 && self.trading.stop_loss_pct <= 50.0,
            "stop_loss_pct must be between 0 (disabled) and 50"
        );
        anyhow::ensure!(
            self.trading.take_profit_pct >= 0.0,
            "take_profit_pct must not be negative"
        );
        anyhow::ensure!(self.trading.capital_usd > 0.0, "capital_usd must be positive");

        self.volatility.validate()?;
        self.consensus.validate()?;
        self.rebalance.validate(self.evaluators.len())?;
        self.risk.validate()?;

        anyhow::ensure!(!self.evaluators.is_empty(), "at least one evaluator is required");
        let mut ids = HashSet::new();
        for evaluator in &self.evaluators {
            anyhow::ensure!(
                ids.insert(evaluator.id.as_str()),
                "duplicate evaluator id: {}",
                evaluator.id
            );
            anyhow::ensure!(
                evaluator.initial_weight > 0.0,
                "initial_weight of {} must be positive",
                evaluator.id
            );
        }
        let risk_count = self
            .evaluators
            .iter()
            .filter(|e| e.role == EvaluatorRole::Risk)
            .count();
        anyhow::ensure!(risk_count == 1, "exactly one risk evaluator is required, found {}", risk_count);

        Ok(())
    }

    /// Paper-trading config with the five standard roles on the heuristic backend
    pub fn paper_default() -> Self {
        let evaluator = |id: &str, role: EvaluatorRole, initial_weight: f64| EvaluatorConfig {
            id: id.to_string(),
            role,
            initial_weight,
            backend: BackendConfig::Heuristic,
        };

        Self {
            trading: TradingConfig {
                symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
                cycle_interval_secs: default_cycle_interval(),
                base_size_fraction: default_base_size_fraction(),
                max_size_fraction: default_max_size_fraction(),
                capital_usd: default_capital(),
                stop_loss_pct: default_stop_loss(),
                take_profit_pct: default_take_profit(),
            },
            volatility: VolatilityConfig::default(),
            consensus: ConsensusConfig::default(),
            evaluators: vec![
                evaluator("strategy", EvaluatorRole::Strategy, 0.25),
                evaluator("risk", EvaluatorRole::Risk, 0.30),
                evaluator("market", EvaluatorRole::Market, 0.20),
                evaluator("execution", EvaluatorRole::Execution, 0.15),
                evaluator("auditor", EvaluatorRole::Auditor, 0.10),
            ],
            rebalance: RebalanceConfig::default(),
            risk: RiskConfig::default(),
            persistence: PersistenceConfig::default(),
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
                json_logs: false,
                log_file: None,
                metrics_port: default_metrics_port(),
                enable_metrics: false,
                enable_alerts: false,
                alert_webhook: None,
            },
            paper_trading: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_base_size_fraction")]
    pub base_size_fraction: f64,
    #[serde(default = "default_max_size_fraction")]
    pub max_size_fraction: f64,
    #[serde(default = "default_capital")]
    pub capital_usd: f64,
    #[serde(default = "default_stop_loss")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_take_profit")]
    pub take_profit_pct: f64,
}

fn default_cycle_interval() -> u64 { 300 }
fn default_base_size_fraction() -> f64 { 0.05 }
fn default_max_size_fraction() -> f64 { 0.10 }
fn default_capital() -> f64 { 10_000.0 }
fn default_stop_loss() -> f64 { 2.0 }
fn default_take_profit() -> f64 { 4.0 }

/// One regime band; `upper_bound` is exclusive, `None` means unbounded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeBand {
    pub regime: Regime,
    pub upper_bound: Option<f64>,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityConfig {
    #[serde(default = "default_regime_bands")]
    pub bands: Vec<RegimeBand>,
    /// Reading used whenever the source fails
    #[serde(default = "default_volatility_reading")]
    pub default_reading: f64,
    /// Re-classify every N trading cycles
    #[serde(default = "default_refresh_every_cycles")]
    pub refresh_every_cycles: u64,
    #[serde(default)]
    pub source: VolatilitySourceConfig,
}

impl VolatilityConfig {
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.bands.is_empty(), "volatility bands must not be empty");
        anyhow::ensure!(self.refresh_every_cycles > 0, "refresh_every_cycles must be positive");

        for pair in self.bands.windows(2) {
            let (lower, upper) = (&pair[0], &pair[1]);
            let lower_bound = lower
                .upper_bound
                .ok_or_else(|| anyhow::anyhow!("only the last volatility band may be unbounded"))?;
            if let Some(upper_bound) = upper.upper_bound {
                anyhow::ensure!(
                    upper_bound > lower_bound,
                    "volatility band bounds must be strictly increasing"
                );
            }
            anyhow::ensure!(
                upper.threshold >= lower.threshold,
                "regime thresholds must rise with volatility"
            );
        }
        anyhow::ensure!(
            self.bands.iter().all(|b| b.threshold > 0.0 && b.threshold < 1.0),
            "regime thresholds must be in (0, 1)"
        );
        anyhow::ensure!(
            self.bands.last().map(|b| b.upper_bound.is_none()).unwrap_or(false),
            "the last volatility band must be unbounded"
        );
        Ok(())
    }
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            bands: default_regime_bands(),
            default_reading: default_volatility_reading(),
            refresh_every_cycles: default_refresh_every_cycles(),
            source: VolatilitySourceConfig::default(),
        }
    }
}

fn default_regime_bands() -> Vec<RegimeBand> {
    vec![
        RegimeBand { regime: Regime::Low, upper_bound: Some(12.0), threshold: 0.40 },
        RegimeBand { regime: Regime::Normal, upper_bound: Some(20.0), threshold: 0.45 },
        RegimeBand { regime: Regime::Elevated, upper_bound: Some(30.0), threshold: 0.55 },
        RegimeBand { regime: Regime::Panic, upper_bound: None, threshold: 0.70 },
    ]
}
fn default_volatility_reading() -> f64 { 20.0 }
fn default_refresh_every_cycles() -> u64 { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolatilitySourceConfig {
    /// Fixed reading, useful for paper trading
    Static { reading: f64 },
    /// JSON endpoint; `json_pointer` locates the scalar (RFC 6901)
    Http {
        url: String,
        json_pointer: String,
        #[serde(default = "default_source_timeout")]
        timeout_ms: u64,
    },
}

fn default_source_timeout() -> u64 { 5000 }

impl Default for VolatilitySourceConfig {
    fn default() -> Self {
        VolatilitySourceConfig::Static { reading: default_volatility_reading() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Budget for each evaluator call
    #[serde(default = "default_evaluator_timeout")]
    pub evaluator_timeout_ms: u64,
    /// Fan-in cutoff for the whole round
    #[serde(default = "default_global_deadline")]
    pub global_deadline_ms: u64,
    #[serde(default = "default_strong_band")]
    pub strong_band: f64,
    #[serde(default = "default_normal_band")]
    pub normal_band: f64,
    #[serde(default = "default_technical_weight")]
    pub technical_weight: f64,
    #[serde(default = "default_consensus_weight")]
    pub consensus_weight: f64,
    /// Size multiplier applied when a veto is overridden
    #[serde(default = "default_mediation_size_factor")]
    pub mediation_size_factor: f64,
    #[serde(default = "default_mediation_max_size")]
    pub mediation_max_size_fraction: f64,
    /// Decisions kept in memory for lookup by id
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl ConsensusConfig {
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.evaluator_timeout_ms > 0, "evaluator_timeout_ms must be positive");
        anyhow::ensure!(
            self.global_deadline_ms >= self.evaluator_timeout_ms,
            "global_deadline_ms must not be shorter than evaluator_timeout_ms"
        );
        anyhow::ensure!(
            self.normal_band > 0.0 && self.normal_band <= self.strong_band && self.strong_band <= 1.0,
            "consensus bands must satisfy 0 < normal_band <= strong_band <= 1"
        );
        anyhow::ensure!(
            self.technical_weight >= 0.0 && self.consensus_weight >= 0.0,
            "blend weights must be non-negative"
        );
        anyhow::ensure!(
            (self.technical_weight + self.consensus_weight - 1.0).abs() < 1e-9,
            "technical_weight + consensus_weight must equal 1.0"
        );
        anyhow::ensure!(
            self.mediation_size_factor > 0.0 && self.mediation_size_factor < 1.0,
            "mediation_size_factor must be in (0, 1)"
        );
        anyhow::ensure!(
            self.mediation_max_size_fraction > 0.0,
            "mediation_max_size_fraction must be positive"
        );
        anyhow::ensure!(self.history_size > 0, "history_size must be positive");
        Ok(())
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            evaluator_timeout_ms: default_evaluator_timeout(),
            global_deadline_ms: default_global_deadline(),
            strong_band: default_strong_band(),
            normal_band: default_normal_band(),
            technical_weight: default_technical_weight(),
            consensus_weight: default_consensus_weight(),
            mediation_size_factor: default_mediation_size_factor(),
            mediation_max_size_fraction: default_mediation_max_size(),
            history_size: default_history_size(),
        }
    }
}

fn default_evaluator_timeout() -> u64 { 30_000 }
fn default_global_deadline() -> u64 { 45_000 }
fn default_strong_band() -> f64 { 0.70 }
fn default_normal_band() -> f64 { 0.55 }
fn default_technical_weight() -> f64 { 0.4 }
fn default_consensus_weight() -> f64 { 0.6 }
fn default_mediation_size_factor() -> f64 { 0.5 }
fn default_mediation_max_size() -> f64 { 0.025 }
fn default_history_size() -> usize { 500 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    pub id: String,
    pub role: EvaluatorRole,
    #[serde(default = "default_initial_weight")]
    pub initial_weight: f64,
    #[serde(default)]
    pub backend: BackendConfig,
}

fn default_initial_weight() -> f64 { 0.20 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Local rule-based votes from snapshot indicators
    #[default]
    Heuristic,
    /// Ollama chat API
    Ollama {
        #[serde(default = "default_ollama_url")]
        url: String,
        model: String,
        #[serde(default = "default_temperature")]
        temperature: f64,
    },
}

fn default_ollama_url() -> String { "http://localhost:11434".to_string() }
fn default_temperature() -> f64 { 0.3 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    #[serde(default = "default_reward_multiplier")]
    pub reward_multiplier: f64,
    #[serde(default = "default_penalty_multiplier")]
    pub penalty_multiplier: f64,
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
    /// Outcomes kept for the rolling win rate
    #[serde(default = "default_rolling_window")]
    pub rolling_window: usize,
}

impl RebalanceConfig {
    pub fn validate(&self, evaluator_count: usize) -> Result<()> {
        anyhow::ensure!(self.reward_multiplier > 1.0, "reward_multiplier must be > 1");
        anyhow::ensure!(
            self.penalty_multiplier > 0.0 && self.penalty_multiplier < 1.0,
            "penalty_multiplier must be in (0, 1)"
        );
        anyhow::ensure!(
            self.min_weight > 0.0 && self.min_weight < self.max_weight && self.max_weight <= 1.0,
            "weight bounds must satisfy 0 < min_weight < max_weight <= 1"
        );
        let n = evaluator_count as f64;
        anyhow::ensure!(
            n * self.min_weight <= 1.0 + 1e-9 && n * self.max_weight >= 1.0 - 1e-9,
            "weight bounds [{}, {}] cannot sum to 1.0 across {} evaluators",
            self.min_weight,
            self.max_weight,
            evaluator_count
        );
        anyhow::ensure!(self.rolling_window > 0, "rolling_window must be positive");
        Ok(())
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            reward_multiplier: default_reward_multiplier(),
            penalty_multiplier: default_penalty_multiplier(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
            rolling_window: default_rolling_window(),
        }
    }
}

fn default_reward_multiplier() -> f64 { 1.10 }
fn default_penalty_multiplier() -> f64 { 0.90 }
fn default_min_weight() -> f64 { 0.10 }
fn default_max_weight() -> f64 { 0.40 }
fn default_rolling_window() -> usize { 20 }

/// System-level limits checked before every round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Equity drawdown from the day's peak, in percent of peak; 0 disables
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown_pct: f64,
    /// Realized loss since the UTC day began, in percent of capital; 0 disables
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss_pct: f64,
    /// Errors in a row before the breaker pauses trading
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u64,
    /// How long the error breaker keeps trading paused
    #[serde(default = "default_error_cooldown")]
    pub error_cooldown_secs: u64,
}

impl RiskConfig {
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (0.0..100.0).contains(&self.max_drawdown_pct),
            "max_drawdown_pct must be between 0 (disabled) and 100"
        );
        anyhow::ensure!(
            (0.0..100.0).contains(&self.max_daily_loss_pct),
            "max_daily_loss_pct must be between 0 (disabled) and 100"
        );
        anyhow::ensure!(self.max_consecutive_errors > 0, "max_consecutive_errors must be positive");
        Ok(())
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: default_max_drawdown(),
            max_daily_loss_pct: default_max_daily_loss(),
            max_consecutive_errors: default_max_consecutive_errors(),
            error_cooldown_secs: default_error_cooldown(),
        }
    }
}

fn default_max_drawdown() -> f64 { 15.0 }
fn default_max_daily_loss() -> f64 { 5.0 }
fn default_max_consecutive_errors() -> u64 { 10 }
fn default_error_cooldown() -> u64 { 300 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_weights_path")]
    pub weights_path: String,
    #[serde(default = "default_positions_path")]
    pub positions_path: String,
    /// Append-only JSON-lines journal of consensus results
    #[serde(default = "default_decisions_path")]
    pub decisions_path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            weights_path: default_weights_path(),
            positions_path: default_positions_path(),
            decisions_path: default_decisions_path(),
        }
    }
}

fn default_weights_path() -> String { "data/weights.json".to_string() }
fn default_positions_path() -> String { "data/positions.json".to_string() }
fn default_decisions_path() -> String { "data/decisions.jsonl".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    pub log_file: Option<String>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
    #[serde(default)]
    pub enable_alerts: bool,
    pub alert_webhook: Option<String>,
}

fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
paper_trading: true
trading:
  symbols: ["BTC/USDT"]
evaluators:
  - { id: strategy, role: strategy }
  - { id: risk, role: risk }
  - { id: market, role: market }
  - { id: execution, role: execution }
  - { id: auditor, role: auditor }
telemetry:
  log_level: info
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.evaluators.len(), 5);
        assert_eq!(config.consensus.strong_band, 0.70);
        assert_eq!(config.volatility.bands.len(), 4);
        assert_eq!(config.rebalance.min_weight, 0.10);
        assert!(matches!(config.evaluators[0].backend, BackendConfig::Heuristic));
    }

    #[test]
    fn test_paper_default_is_valid() {
        assert!(AppConfig::paper_default().validate().is_ok());
    }

    #[test]
    fn test_rejects_missing_risk_evaluator() {
        let mut config = AppConfig::paper_default();
        config.evaluators.retain(|e| e.role != EvaluatorRole::Risk);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unbalanced_blend() {
        let mut config = AppConfig::paper_default();
        config.consensus.technical_weight = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_infeasible_weight_bounds() {
        let mut config = AppConfig::paper_default();
        config.rebalance.max_weight = 0.15;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_risk_limits_default_and_validate() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.risk.max_drawdown_pct, 15.0);
        assert_eq!(config.risk.max_consecutive_errors, 10);
        assert_eq!(config.consensus.history_size, 500);

        let mut config = AppConfig::paper_default();
        config.risk.max_drawdown_pct = 0.0;
        assert!(config.validate().is_ok());
        config.risk.max_consecutive_errors = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_falling_thresholds() {
        let mut config = AppConfig::paper_default();
        config.volatility.bands[2].threshold = 0.30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parses_backend_and_source_variants() {
        let yaml = r#"
trading:
  symbols: ["ETH/USDT"]
volatility:
  source: { kind: http, url: "http://localhost:8080/vix", json_pointer: "/value" }
evaluators:
  - id: risk
    role: risk
    backend: { kind: ollama, model: "gemma3:latest" }
rebalance:
  max_weight: 1.0
telemetry:
  log_level: debug
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert!(matches!(config.volatility.source, VolatilitySourceConfig::Http { .. }));
        match &config.evaluators[0].backend {
            BackendConfig::Ollama { url, model, .. } => {
                assert_eq!(url, "http://localhost:11434");
                assert_eq!(model, "gemma3:latest");
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }
}
