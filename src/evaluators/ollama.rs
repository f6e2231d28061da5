//! Ollama chat backend

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::backend::{parse_reply, BackendReply, InferenceBackend};
use super::{EvaluationRequest, EvaluatorRole};
use crate::error::EvaluatorError;

const REPLY_FORMAT: &str = "Respond in JSON with: decision (BUY, SELL, HOLD or REJECT), \
    confidence (0.0-1.0), reasoning, and optionally size_multiplier (0.0-1.0) and override_veto (bool).";

pub struct OllamaBackend {
    client: reqwest::Client,
    chat_url: url::Url,
    model: String,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str, model: &str, temperature: f64, timeout: Duration) -> Result<Self> {
        let chat_url = url::Url::parse(base_url)
            .and_then(|u| u.join("/api/chat"))
            .with_context(|| format!("Invalid Ollama URL: {}", base_url))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Ollama HTTP client")?;

        Ok(Self {
            client,
            chat_url,
            model: model.to_string(),
            temperature,
        })
    }

    fn user_prompt(request: &EvaluationRequest) -> String {
        let p = &request.proposal;
        let s = &request.snapshot;
        let indicators = serde_json::to_string(&s.indicators).unwrap_or_default();
        format!(
            "Proposal {} v{}: {} {} size {:.4} of capital.\n\
             Technical score {:.3}, regime {}, acceptance threshold {:.2}.\n\
             Price {}, volume {}, volatility index {:.2}.\n\
             Indicators: {}",
            p.id, p.version, p.action, p.symbol, p.size_fraction,
            p.technical_score, p.regime, p.threshold,
            s.price, s.volume, s.volatility_index,
            indicators
        )
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn infer(&self, role: EvaluatorRole, request: &EvaluationRequest) -> Result<BackendReply, EvaluatorError> {
        let body = json!({
            "model": self.model,
            "stream": false,
            "messages": [
                { "role": "system", "content": format!("{} {}", role.mandate(), REPLY_FORMAT) },
                { "role": "user", "content": Self::user_prompt(request) },
            ],
            "options": { "temperature": self.temperature, "top_p": 0.9 },
        });

        let response = self
            .client
            .post(self.chat_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| EvaluatorError::BackendUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EvaluatorError::BackendUnavailable(format!("HTTP {}: {}", status, text)));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| EvaluatorError::MalformedResponse(e.to_string()))?;
        let content = chat
            .message
            .map(|m| m.content)
            .ok_or_else(|| EvaluatorError::MalformedResponse("missing message content".to_string()))?;

        debug!("Ollama {} reply for {}: {}", self.model, role, content);
        Ok(parse_reply(&content, request.proposal.action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::volatility::Regime;
    use crate::utils::types::{Action, MarketSnapshot, TradeProposal};

    #[test]
    fn test_chat_url_is_joined() {
        let backend = OllamaBackend::new("http://localhost:11434", "gemma3", 0.3, Duration::from_secs(1)).unwrap();
        assert_eq!(backend.chat_url.as_str(), "http://localhost:11434/api/chat");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(OllamaBackend::new("not a url", "gemma3", 0.3, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let backend = OllamaBackend::new("http://127.0.0.1:1", "gemma3", 0.3, Duration::from_millis(500)).unwrap();
        let request = EvaluationRequest {
            proposal: TradeProposal::new("BTC/USDT", Action::Buy, 0.05, 0.5, 0.45, Regime::Normal),
            snapshot: MarketSnapshot::new("BTC/USDT", 100.0, 1.0, 15.0),
        };
        let err = backend.infer(EvaluatorRole::Strategy, &request).await.unwrap_err();
        assert!(matches!(err, EvaluatorError::BackendUnavailable(_)));
    }
}
