//! Volatility Regime Classifier
//!
//! Maps a volatility-index reading to a regime and the acceptance threshold
//! that goes with it. The classification is cached and only refreshed every
//! `refresh_every_cycles` trading cycles; a failing source falls back to the
//! configured default reading instead of erroring.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{RegimeBand, VolatilityConfig, VolatilitySourceConfig};
use crate::network::event_bus::Event;
use crate::state::AtomicF64;
use crate::telemetry::metrics;

/// Market volatility regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Low,
    Normal,
    Elevated,
    Panic,
}

impl Regime {
    /// Numeric code for the regime gauge
    pub fn code(&self) -> u8 {
        match self {
            Regime::Low => 0,
            Regime::Normal => 1,
            Regime::Elevated => 2,
            Regime::Panic => 3,
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Regime::Low => write!(f, "LOW"),
            Regime::Normal => write!(f, "NORMAL"),
            Regime::Elevated => write!(f, "ELEVATED"),
            Regime::Panic => write!(f, "PANIC"),
        }
    }
}

/// Cached output of one classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub regime: Regime,
    pub threshold: f64,
    pub reading: f64,
    /// True when the source failed and the default reading was used
    pub fallback: bool,
    pub classified_at: i64,
}

/// Source of volatility-index readings
#[async_trait]
pub trait VolatilitySource: Send + Sync {
    async fn fetch_reading(&self) -> Result<f64>;

    fn name(&self) -> &str;
}

/// Fixed reading; can be moved by hand (paper trading, tests)
pub struct StaticVolatilitySource {
    reading: AtomicF64,
}

impl StaticVolatilitySource {
    pub fn new(reading: f64) -> Self {
        Self { reading: AtomicF64::new(reading) }
    }

    pub fn set(&self, reading: f64) {
        self.reading.store(reading);
    }
}

#[async_trait]
impl VolatilitySource for StaticVolatilitySource {
    async fn fetch_reading(&self) -> Result<f64> {
        Ok(self.reading.load())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// JSON endpoint returning the reading somewhere in its body
pub struct HttpVolatilitySource {
    client: reqwest::Client,
    url: url::Url,
    json_pointer: String,
}

impl HttpVolatilitySource {
    pub fn new(url: &str, json_pointer: &str, timeout_ms: u64) -> Result<Self> {
        let url = url::Url::parse(url).with_context(|| format!("Invalid volatility URL: {}", url))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("Failed to build volatility HTTP client")?;

        Ok(Self {
            client,
            url,
            json_pointer: json_pointer.to_string(),
        })
    }
}

#[async_trait]
impl VolatilitySource for HttpVolatilitySource {
    async fn fetch_reading(&self) -> Result<f64> {
        let body: serde_json::Value = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let value = body
            .pointer(&self.json_pointer)
            .ok_or_else(|| anyhow::anyhow!("{} not found in response", self.json_pointer))?;

        // Some feeds quote numbers as strings
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| anyhow::anyhow!("{} is not numeric: {}", self.json_pointer, value))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Build the source named in config
pub fn source_from_config(config: &VolatilitySourceConfig) -> Result<Arc<dyn VolatilitySource>> {
    Ok(match config {
        VolatilitySourceConfig::Static { reading } => Arc::new(StaticVolatilitySource::new(*reading)),
        VolatilitySourceConfig::Http { url, json_pointer, timeout_ms } => {
            Arc::new(HttpVolatilitySource::new(url, json_pointer, *timeout_ms)?)
        }
    })
}

/// Pure band lookup. Bands are ordered by exclusive upper bound; the last
/// band is unbounded.
pub fn classify_reading(bands: &[RegimeBand], reading: f64) -> (Regime, f64) {
    for band in bands {
        match band.upper_bound {
            Some(upper) if reading < upper => return (band.regime, band.threshold),
            None => return (band.regime, band.threshold),
            _ => continue,
        }
    }
    bands
        .last()
        .map(|b| (b.regime, b.threshold))
        .unwrap_or((Regime::Normal, 0.45))
}

pub struct VolatilityClassifier {
    config: VolatilityConfig,
    source: Arc<dyn VolatilitySource>,
    current: ArcSwap<Classification>,
    cycles: AtomicU64,
    events: Option<broadcast::Sender<Event>>,
}

impl VolatilityClassifier {
    pub fn new(config: VolatilityConfig, source: Arc<dyn VolatilitySource>) -> Self {
        let (regime, threshold) = classify_reading(&config.bands, config.default_reading);
        let initial = Classification {
            regime,
            threshold,
            reading: config.default_reading,
            fallback: true,
            classified_at: chrono::Utc::now().timestamp_millis(),
        };

        Self {
            config,
            source,
            current: ArcSwap::from_pointee(initial),
            cycles: AtomicU64::new(0),
            events: None,
        }
    }

    pub fn with_event_sender(mut self, sender: broadcast::Sender<Event>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Cached classification, without touching the source
    pub fn current(&self) -> Arc<Classification> {
        self.current.load_full()
    }

    /// Classification for the next trading cycle. Hits the source on the
    /// first call and then every `refresh_every_cycles` calls.
    pub async fn for_cycle(&self) -> Arc<Classification> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst);
        if cycle % self.config.refresh_every_cycles == 0 {
            self.refresh().await
        } else {
            self.current()
        }
    }

    /// Force a fresh reading from the source
    pub async fn refresh(&self) -> Arc<Classification> {
        let (reading, fallback) = match self.source.fetch_reading().await {
            Ok(reading) if reading.is_finite() && reading >= 0.0 => (reading, false),
            Ok(reading) => {
                warn!(
                    "Volatility source '{}' returned unusable reading {}, using default {}",
                    self.source.name(),
                    reading,
                    self.config.default_reading
                );
                (self.config.default_reading, true)
            }
            Err(e) => {
                warn!(
                    "Volatility source '{}' failed: {}, using default {}",
                    self.source.name(),
                    e,
                    self.config.default_reading
                );
                (self.config.default_reading, true)
            }
        };

        let (regime, threshold) = classify_reading(&self.config.bands, reading);
        let next = Arc::new(Classification {
            regime,
            threshold,
            reading,
            fallback,
            classified_at: chrono::Utc::now().timestamp_millis(),
        });

        let previous = self.current.swap(next.clone());
        metrics::record_regime(regime, reading);

        if previous.regime != regime {
            info!(
                "Volatility regime transition: {} -> {} (reading {:.2}, threshold {:.2})",
                previous.regime, regime, reading, threshold
            );
            metrics::record_regime_transition(previous.regime, regime);
            if let Some(events) = &self.events {
                let _ = events.send(Event::RegimeChanged {
                    from: previous.regime,
                    to: regime,
                    reading,
                    threshold,
                });
            }
        } else {
            debug!("Volatility regime {} unchanged (reading {:.2})", regime, reading);
        }

        next
    }
}
