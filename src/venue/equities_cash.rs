// =============================================================================
// Equities broker (cash) adapter — bearer token, regular-hours only
// =============================================================================
//
// This venue accepts orders only during regular trading hours (09:30-16:00
// US/Eastern, Monday-Friday); outside that window every order submission
// fails fast with `MarketClosed` rather than being queued, since the account
// type here has no extended-hours entitlement.
// =============================================================================

use super::common::{retry_with_backoff, round_down_to_step};
use super::{CancelAck, OrderAck, OrderLifecycle, OrderState, Ticker, VenueAdapter, VenuePosition};
use crate::error::AppError;
use crate::types::Side;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{Datelike, Timelike, Utc};
use std::time::Duration;
use tracing::instrument;

const SHARE_STEP: f64 = 1.0;

pub struct EquitiesCashAdapter {
    account_id: String,
    bearer_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl EquitiesCashAdapter {
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

    /// Approximate regular-hours check in UTC (13:30-20:00, Mon-Fri), which
    /// covers US/Eastern 09:30-16:00 outside DST transition weeks. A
    /// production deployment would consult an authoritative market-calendar
    /// service instead of this fixed offset.
    fn market_is_open(&self) -> bool {
        let now = Utc::now();
        let weekday = now.weekday().num_days_from_monday();
        if weekday >= 5 {
            return false;
        }
        let minutes_of_day = now.hour() * 60 + now.minute();
        (13 * 60 + 30..20 * 60).contains(&minutes_of_day)
    }

    async fn authed_get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}/v2/accounts/{}{path}", self.base_url, self.account_id);
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
            anyhow::bail!("equities_cash {path} returned {status}: {body}");
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
    ) -> Result<OrderAck, AppError> {
        if !self.market_is_open() {
            return Err(AppError::MarketClosed);
        }

        let mut body = serde_json::json!({
            "symbol": symbol,
            "qty": quantity,
            "side": if side == Side::Long { "buy" } else { "sell" },
            "type": order_type,
            "time_in_force": "day",
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
}

fn classify_rejection(body: &serde_json::Value) -> AppError {
    match body["code"].as_i64() {
        Some(40310000) => AppError::InsufficientFunds,
        Some(42210000) => AppError::UnknownSymbol(body["message"].as_str().unwrap_or("").to_string()),
        _ => AppError::Client(body.to_string()),
    }
}

#[async_trait]
impl VenueAdapter for EquitiesCashAdapter {
    fn venue_name(&self) -> &'static str {
        "equities_cash"
    }

    #[instrument(skip(self), name = "equities_cash::get_available_margin")]
    async fn get_available_margin(&self) -> Result<f64, AppError> {
        let body = self
            .authed_get("")
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(body["cash"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0))
    }

    #[instrument(skip(self), name = "equities_cash::get_positions")]
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, AppError> {
        let body = self
            .authed_get("/positions")
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

    #[instrument(skip(self), name = "equities_cash::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AppError> {
        let body = self
            .authed_get(&format!("/quotes/{symbol}"))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(Ticker {
            last_price: body["last"].as_f64().unwrap_or(0.0),
            bid: body["bid"].as_f64(),
            ask: body["ask"].as_f64(),
            volume_24h: body["volume"].as_f64(),
        })
    }

    async fn place_market_order(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderAck, AppError> {
        let quantity = round_down_to_step(quantity, SHARE_STEP).ok_or(AppError::TooSmall)?;
        self.submit_order(symbol, side, "market", quantity, None).await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        let quantity = round_down_to_step(quantity, SHARE_STEP).ok_or(AppError::TooSmall)?;
        self.submit_order(symbol, side, "limit", quantity, Some(limit_price)).await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, exit_side, "stop", quantity, Some(stop_price)).await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, exit_side, "limit", quantity, Some(limit_price)).await
    }

    async fn close_position(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, side.opposite(), "market", quantity, None).await
    }

    #[instrument(skip(self), name = "equities_cash::cancel_order")]
    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<CancelAck, AppError> {
        let url = format!("{}/v2/accounts/{}/orders/{order_id}", self.base_url, self.account_id);
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| AppError::Transient(e.to_string()))?;
        Ok(CancelAck {
            venue_order_id: order_id.to_string(),
            cancelled: resp.status().is_success(),
        })
    }

    #[instrument(skip(self), name = "equities_cash::get_order")]
    async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<OrderState, AppError> {
        let body = self
            .authed_get(&format!("/orders/{order_id}"))
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

impl std::fmt::Debug for EquitiesCashAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EquitiesCashAdapter")
            .field("account_id", &self.account_id)
            .field("bearer_token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

pub fn size_for_notional(notional_usd: f64, reference_price: f64) -> Option<f64> {
    super::common::notional_to_quantity(notional_usd, reference_price, SHARE_STEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rejection_maps_insufficient_funds() {
        let body = serde_json::json!({"code": 40310000});
        assert!(matches!(classify_rejection(&body), AppError::InsufficientFunds));
    }

    #[test]
    fn sizes_round_to_whole_shares() {
        assert_eq!(size_for_notional(1000.0, 333.0), Some(3.0));
    }
}
