//! Alert management for notifications

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::TelemetryConfig;
use crate::engines::volatility::Regime;
use crate::network::event_bus::{spawn_event_handler, Event, EventBus};
use crate::position::Outcome;
use crate::utils::helpers::format_usd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn emoji(&self) -> &str {
        match self {
            AlertLevel::Info => "ℹ️",
            AlertLevel::Warning => "⚠️",
            AlertLevel::Error => "❌",
            AlertLevel::Critical => "🚨",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Info, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Warning, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Error, title, message)
    }

    pub fn critical(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Critical, title, message)
    }

    /// Map a bus event to an operator alert. Routine events map to nothing.
    pub fn from_event(event: &Event) -> Option<Alert> {
        match event {
            Event::RegimeChanged { from, to, reading, threshold } => {
                let message = format!(
                    "{} -> {} (reading {:.2}), confidence threshold now {:.2}",
                    from, to, reading, threshold
                );
                let alert = if *to == Regime::Panic {
                    Alert::warning("Volatility regime change", message)
                } else {
                    Alert::info("Volatility regime change", message)
                };
                Some(alert.with_details(serde_json::json!({
                    "from": from,
                    "to": to,
                    "reading": reading,
                    "threshold": threshold,
                })))
            }
            Event::BackendHealthChanged { healthy: false, detail } => {
                Some(Alert::error("Inference backend unhealthy", detail.clone()))
            }
            Event::BackendHealthChanged { healthy: true, detail } => {
                Some(Alert::info("Inference backend recovered", detail.clone()))
            }
            Event::ExecutionFailed { symbol, reason } => Some(Alert::warning(
                "Order execution failed",
                format!("{}: {}", symbol, reason),
            )),
            Event::LedgerInvariantViolation { detail } => {
                Some(Alert::critical("Ledger invariant violation", detail.clone()))
            }
            Event::PositionClosed { position } if position.outcome == Outcome::StoppedOut => {
                Some(Alert::warning(
                    "Stop loss hit",
                    format!("{} {} closed for {}", position.side, position.symbol, format_usd(position.realized_pnl)),
                ))
            }
            Event::SystemPause { reason } => Some(Alert::warning("Trading paused", reason.clone())),
            _ => None,
        }
    }
}

pub struct AlertManager {
    enabled: bool,
    webhook_url: Option<String>,
    http_client: reqwest::Client,
}

impl AlertManager {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            enabled: config.enable_alerts,
            webhook_url: config.alert_webhook.clone(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn send(&self, alert: Alert) {
        if !self.enabled {
            return;
        }

        match alert.level {
            AlertLevel::Info => info!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Warning => warn!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Error => error!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Critical => error!("[CRITICAL] {}: {}", alert.title, alert.message),
        }

        if let Some(url) = &self.webhook_url {
            if let Err(e) = self.send_webhook(url, &alert).await {
                warn!("Failed to send webhook alert: {}", e);
            }
        }
    }

    async fn send_webhook(&self, url: &str, alert: &Alert) -> Result<()> {
        let payload = serde_json::json!({
            "text": format!("{} *{}*\n{}", alert.level.emoji(), alert.title, alert.message),
            "details": alert.details,
        });

        self.http_client
            .post(url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Forward alert-worthy bus events to the alert manager
pub fn spawn_alert_handler(bus: &EventBus, alerts: Arc<AlertManager>) -> tokio::task::JoinHandle<()> {
    spawn_event_handler(bus, "alerts", move |event| {
        let alerts = alerts.clone();
        async move {
            if let Some(alert) = Alert::from_event(&event) {
                alerts.send(alert).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regime_change_alert_levels() {
        let panic = Alert::from_event(&Event::RegimeChanged {
            from: Regime::Elevated,
            to: Regime::Panic,
            reading: 31.0,
            threshold: 0.70,
        })
        .unwrap();
        assert_eq!(panic.level, AlertLevel::Warning);
        assert!(panic.message.contains("0.70"));

        let calm = Alert::from_event(&Event::RegimeChanged {
            from: Regime::Normal,
            to: Regime::Low,
            reading: 11.0,
            threshold: 0.40,
        })
        .unwrap();
        assert_eq!(calm.level, AlertLevel::Info);
    }

    #[test]
    fn test_routine_events_do_not_alert() {
        assert!(Alert::from_event(&Event::Heartbeat { timestamp: 0 }).is_none());
        assert!(Alert::from_event(&Event::WeightsUpdated { weights: Vec::new() }).is_none());
    }

    #[test]
    fn test_ledger_violation_is_critical() {
        let alert = Alert::from_event(&Event::LedgerInvariantViolation {
            detail: "weights sum to 0.97".to_string(),
        })
        .unwrap();
        assert_eq!(alert.level, AlertLevel::Critical);
    }

    #[tokio::test]
    async fn test_disabled_manager_is_noop() {
        let config = TelemetryConfig {
            log_level: "info".to_string(),
            json_logs: false,
            log_file: None,
            metrics_port: 9090,
            enable_metrics: false,
            enable_alerts: false,
            alert_webhook: Some("http://127.0.0.1:1/unreachable".to_string()),
        };
        let manager = AlertManager::new(&config);
        assert!(!manager.is_enabled());
        manager.send(Alert::critical("test", "ignored")).await;
    }
}
