// =============================================================================
// ML Validation Client (C6) — fail-open gate in front of strategy-scored trades
// =============================================================================
//
// Only invoked for signals that reference an ML-assisted strategy. Every
// invocation appends a DecisionLog entry regardless of outcome, including the
// fail-open path, so the denial/allow history is auditable even when the
// scoring service itself is down.
// =============================================================================

use crate::datastore::{Datastore, DecisionLogRecord};
use crate::venue::Ticker;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};
use uuid::Uuid;

const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 70.0;

#[derive(Debug, Clone, Serialize)]
struct ScoreRequest<'a> {
    strategy_id: &'a str,
    action: &'a str,
    symbol: &'a str,
    last_price: f64,
    volume_24h: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScoreResponse {
    confidence: f64,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    feature_breakdown: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct MlVerdict {
    pub allow: bool,
    pub confidence: f64,
    pub reason: String,
    pub reasons: Vec<String>,
}

pub struct MlValidationClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    confidence_threshold: f64,
    datastore: Arc<dyn Datastore>,
}

impl MlValidationClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        confidence_threshold: f64,
        datastore: Arc<dyn Datastore>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            timeout,
            confidence_threshold: if confidence_threshold > 0.0 {
                confidence_threshold
            } else {
                DEFAULT_CONFIDENCE_THRESHOLD
            },
            datastore,
        }
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    /// Score a signal against the ML service and append a DecisionLog entry.
    /// Never returns an error: every failure mode maps to a fail-open verdict.
    #[instrument(skip(self, ticker), name = "ml_validation::validate", fields(strategy_id))]
    pub async fn validate(&self, strategy_id: Uuid, action: &str, symbol: &str, ticker: &Ticker) -> MlVerdict {
        let request = ScoreRequest {
            strategy_id: &strategy_id.to_string(),
            action,
            symbol,
            last_price: ticker.last_price,
            volume_24h: ticker.volume_24h,
        };

        let verdict = match self.score(&request).await {
            Ok(response) => {
                let allow = response.confidence >= self.confidence_threshold;
                MlVerdict {
                    allow,
                    confidence: response.confidence,
                    reason: if allow {
                        "scored-above-threshold".to_string()
                    } else {
                        "scored-below-threshold".to_string()
                    },
                    reasons: response.reasons,
                }
            }
            Err(err) => {
                warn!(error = %err, "ml validation unavailable, failing open");
                MlVerdict {
                    allow: true,
                    confidence: 0.0,
                    reason: "ml-unavailable".to_string(),
                    reasons: vec![err],
                }
            }
        };

        let log = DecisionLogRecord {
            id: Uuid::new_v4(),
            strategy_id: Some(strategy_id),
            created_at: Utc::now(),
            input_summary: format!("{action} {symbol} @ {}", ticker.last_price),
            ml_confidence: Some(verdict.confidence),
            ml_reasons: verdict.reasons.clone(),
            allowed: verdict.allow,
        };
        if let Err(err) = self.datastore.append_decision_log(log).await {
            warn!(error = %err, "failed to append decision log");
        }

        verdict
    }

    async fn score(&self, request: &ScoreRequest<'_>) -> Result<ScoreResponse, String> {
        let url = format!("{}/score", self.base_url);
        let resp = tokio::time::timeout(self.timeout, self.client.post(&url).json(request).send())
            .await
            .map_err(|_| "timeout".to_string())?
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("non-2xx response: {}", resp.status()));
        }

        resp.json::<ScoreResponse>().await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::InMemoryDatastore;

    #[tokio::test]
    async fn unreachable_service_fails_open_and_logs() {
        let ds = Arc::new(InMemoryDatastore::new());
        let client = MlValidationClient::new(
            "http://127.0.0.1:1",
            Duration::from_millis(200),
            70.0,
            ds.clone(),
        );
        let ticker = Ticker {
            last_price: 100.0,
            bid: None,
            ask: None,
            volume_24h: None,
        };
        let verdict = client.validate(Uuid::new_v4(), "buy", "BTCUSDT", &ticker).await;
        assert!(verdict.allow);
        assert_eq!(verdict.reason, "ml-unavailable");
    }

    #[test]
    fn zero_threshold_falls_back_to_default() {
        let ds = Arc::new(InMemoryDatastore::new());
        let client = MlValidationClient::new("http://localhost:1", Duration::from_secs(5), 0.0, ds);
        assert_eq!(client.confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD);
    }
}
