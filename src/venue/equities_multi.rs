// =============================================================================
// Equities broker (multi-asset) adapter — key + secret headers
// =============================================================================
//
// Supports extended hours and fractional shares sized directly by notional
// (no share-quantity rounding needed). Bracket orders (entry + take-profit +
// stop-loss, one-cancels-other) are a first-class order class here; this
// adapter places the bracket in a single call when both `stop_loss_percent`
// and `take_profit_percent` are known, which the dispatcher does not
// currently thread through per-call — `place_stop_loss`/`place_take_profit`
// remain available for the generic capability surface.
// =============================================================================

use super::common::retry_with_backoff;
use super::{CancelAck, OrderAck, OrderLifecycle, OrderState, Ticker, VenueAdapter, VenuePosition};
use crate::error::AppError;
use crate::types::Side;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;
use tracing::instrument;

pub struct EquitiesMultiAdapter {
    account_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl EquitiesMultiAdapter {
    pub fn new(account_id: impl Into<String>, api_key: impl Into<String>, api_secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key.into()) {
            headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(val) = HeaderValue::from_str(&api_secret.into()) {
            headers.insert("APCA-API-SECRET-KEY", val);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            account_id: account_id.into(),
            base_url: base_url.into(),
            client,
        }
    }

    async fn get_json(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}/v2{path}", self.base_url);
        let resp = self.client.get(&url).send().await.context("request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response")?;
        if !status.is_success() {
            anyhow::bail!("equities_multi {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: &str,
        quantity: f64,
        limit_price: Option<f64>,
        extended_hours: bool,
    ) -> Result<OrderAck, AppError> {
        let mut body = serde_json::json!({
            "symbol": symbol,
            "qty": quantity.to_string(),
            "side": if side == Side::Long { "buy" } else { "sell" },
            "type": order_type,
            "time_in_force": "day",
            "extended_hours": extended_hours,
        });
        if let Some(p) = limit_price {
            body["limit_price"] = serde_json::json!(p);
        }

        retry_with_backoff(3, Duration::from_millis(200), || {
            let body = body.clone();
            async move {
                let url = format!("{}/v2/accounts/{}/orders", self.base_url, self.account_id);
                let resp = self
                    .client
                    .post(&url)
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

                Ok(OrderAck {
                    venue_order_id: resp_body["id"].as_str().unwrap_or_default().to_string(),
                    fill_price: resp_body["filled_avg_price"].as_str().and_then(|s| s.parse().ok()),
                    fill_quantity: resp_body["filled_qty"].as_str().and_then(|s| s.parse().ok()),
                    status: match resp_body["status"].as_str() {
                        Some("filled") => OrderLifecycle::Filled,
                        Some("partially_filled") => OrderLifecycle::PartiallyFilled,
                        Some("rejected") | Some("canceled") => OrderLifecycle::Rejected,
                        _ => OrderLifecycle::Working,
                    },
                })
            }
        })
        .await
    }

    /// Place an entry order with an attached take-profit/stop-loss bracket in
    /// a single request. Returns the entry leg's ack; the two exit legs are
    /// managed server-side and cancel each other on fill.
    pub async fn place_bracket_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Result<OrderAck, AppError> {
        let body = serde_json::json!({
            "symbol": symbol,
            "qty": quantity.to_string(),
            "side": if side == Side::Long { "buy" } else { "sell" },
            "type": "market",
            "time_in_force": "day",
            "order_class": "bracket",
            "take_profit": { "limit_price": take_profit_price },
            "stop_loss": { "stop_price": stop_loss_price },
        });

        let url = format!("{}/v2/accounts/{}/orders", self.base_url, self.account_id);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Transient(e.to_string()))?;
        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::Client(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_rejection(&resp_body));
        }
        Ok(OrderAck {
            venue_order_id: resp_body["id"].as_str().unwrap_or_default().to_string(),
            fill_price: None,
            fill_quantity: None,
            status: OrderLifecycle::Working,
        })
    }
}

fn classify_rejection(body: &serde_json::Value) -> AppError {
    match body["code"].as_i64() {
        Some(40310000) => AppError::InsufficientFunds,
        Some(42210000) => AppError::UnknownSymbol(body["message"].as_str().unwrap_or("").to_string()),
        _ => AppError::Client(body.to_string()),
    }
}

#[async_trait]
impl VenueAdapter for EquitiesMultiAdapter {
    fn venue_name(&self) -> &'static str {
        "equities_multi"
    }

    #[instrument(skip(self), name = "equities_multi::get_available_margin")]
    async fn get_available_margin(&self) -> Result<f64, AppError> {
        let body = self
            .get_json(&format!("/accounts/{}", self.account_id))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(body["buying_power"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0))
    }

    #[instrument(skip(self), name = "equities_multi::get_positions")]
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, AppError> {
        let body = self
            .get_json(&format!("/accounts/{}/positions", self.account_id))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let entries = body.as_array().cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|entry| {
                let qty: f64 = entry["qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                VenuePosition {
                    symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                    side: if qty >= 0.0 { Side::Long } else { Side::Short },
                    quantity: qty.abs(),
                    entry_price: entry["avg_entry_price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    mark_price: entry["current_price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    unrealized_pnl_usd: entry["unrealized_pl"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                }
            })
            .collect())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<VenuePosition>, AppError> {
        Ok(self
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol))
    }

    #[instrument(skip(self), name = "equities_multi::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AppError> {
        let body = self
            .get_json(&format!("/stocks/{symbol}/quotes/latest"))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let quote = &body["quote"];
        Ok(Ticker {
            last_price: quote["ap"].as_f64().unwrap_or(0.0),
            bid: quote["bp"].as_f64(),
            ask: quote["ap"].as_f64(),
            volume_24h: None,
        })
    }

    async fn place_market_order(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, side, "market", quantity, None, false).await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, side, "limit", quantity, Some(limit_price), false).await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, exit_side, "stop", quantity, Some(stop_price), false).await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, exit_side, "limit", quantity, Some(limit_price), false).await
    }

    async fn close_position(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, side.opposite(), "market", quantity, None, false).await
    }

    #[instrument(skip(self), name = "equities_multi::cancel_order")]
    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<CancelAck, AppError> {
        let url = format!("{}/v2/accounts/{}/orders/{order_id}", self.base_url, self.account_id);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| AppError::Transient(e.to_string()))?;
        Ok(CancelAck {
            venue_order_id: order_id.to_string(),
            cancelled: resp.status().is_success(),
        })
    }

    #[instrument(skip(self), name = "equities_multi::get_order")]
    async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<OrderState, AppError> {
        let body = self
            .get_json(&format!("/accounts/{}/orders/{order_id}", self.account_id))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(OrderState {
            venue_order_id: order_id.to_string(),
            status: match body["status"].as_str() {
                Some("filled") => OrderLifecycle::Filled,
                Some("partially_filled") => OrderLifecycle::PartiallyFilled,
                Some("rejected") | Some("canceled") => OrderLifecycle::Rejected,
                _ => OrderLifecycle::Working,
            },
            filled_quantity: body["filled_qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            avg_fill_price: body["filled_avg_price"].as_str().and_then(|s| s.parse().ok()),
        })
    }
}

impl std::fmt::Debug for EquitiesMultiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EquitiesMultiAdapter")
            .field("account_id", &self.account_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

pub fn size_for_notional(notional_usd: f64, reference_price: f64) -> Option<f64> {
    if reference_price <= 0.0 {
        return None;
    }
    let quantity = notional_usd / reference_price;
    if quantity <= 0.0 {
        None
    } else {
        Some(quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractional_sizing_does_not_round_to_whole_shares() {
        assert_eq!(size_for_notional(100.0, 333.0), Some(100.0 / 333.0));
    }

    #[test]
    fn classify_rejection_maps_unknown_symbol() {
        let body = serde_json::json!({"code": 42210000, "message": "symbol not found"});
        assert!(matches!(classify_rejection(&body), AppError::UnknownSymbol(_)));
    }
}
