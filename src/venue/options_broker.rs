// =============================================================================
// Options broker adapter — OCC-encoded symbols, OTOCO entry+TP+SL
// =============================================================================
//
// Shares its account and credential shape with the equities-multi broker
// (same key+secret header auth) but trades listed options contracts. Symbols
// are OCC-encoded: `ROOT + YYMMDD + C/P + strike*1000 padded to 8 digits`,
// e.g. "AAPL240621C00195000". The gateway passes venue-specific `right` and
// `strike` hint fields through `Signal::extra`; this adapter is responsible
// for assembling the OCC symbol if the caller supplied an underlying +
// strike + expiry instead of a pre-encoded contract symbol.
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

const CONTRACT_MULTIPLIER: f64 = 100.0;

pub struct OptionsBrokerAdapter {
    account_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl OptionsBrokerAdapter {
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

    /// Assemble an OCC option symbol from its components.
    pub fn occ_symbol(underlying: &str, expiry_yymmdd: &str, right: char, strike: f64) -> String {
        let strike_thousandths = (strike * 1000.0).round() as u64;
        format!(
            "{:<6}{expiry_yymmdd}{right}{strike_thousandths:08}",
            underlying.to_uppercase()
        )
    }

    async fn get_json(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}/v2{path}", self.base_url);
        let resp = self.client.get(&url).send().await.context("request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response")?;
        if !status.is_success() {
            anyhow::bail!("options_broker {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn submit_order(
        &self,
        occ_symbol: &str,
        side: Side,
        order_type: &str,
        contracts: f64,
        limit_price: Option<f64>,
    ) -> Result<OrderAck, AppError> {
        let mut body = serde_json::json!({
            "symbol": occ_symbol,
            "qty": contracts.to_string(),
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

    /// Place an OTOCO order: entry triggers the take-profit leg, either exit
    /// leg cancels the other.
    pub async fn place_otoco_order(
        &self,
        occ_symbol: &str,
        side: Side,
        contracts: f64,
        take_profit_price: f64,
        stop_loss_price: f64,
    ) -> Result<OrderAck, AppError> {
        let body = serde_json::json!({
            "symbol": occ_symbol,
            "qty": contracts.to_string(),
            "side": if side == Side::Long { "buy" } else { "sell" },
            "type": "market",
            "time_in_force": "day",
            "order_class": "otoco",
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
impl VenueAdapter for OptionsBrokerAdapter {
    fn venue_name(&self) -> &'static str {
        "options_broker"
    }

    #[instrument(skip(self), name = "options_broker::get_available_margin")]
    async fn get_available_margin(&self) -> Result<f64, AppError> {
        let body = self
            .get_json(&format!("/accounts/{}", self.account_id))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(body["options_buying_power"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0))
    }

    #[instrument(skip(self), name = "options_broker::get_positions")]
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, AppError> {
        let body = self
            .get_json(&format!("/accounts/{}/positions", self.account_id))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let entries = body.as_array().cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter(|e| e["asset_class"].as_str() == Some("us_option"))
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

    #[instrument(skip(self), name = "options_broker::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AppError> {
        let body = self
            .get_json(&format!("/options/{symbol}/quotes/latest"))
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
        self.submit_order(symbol, side, "market", quantity, None).await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
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

    #[instrument(skip(self), name = "options_broker::cancel_order")]
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

    #[instrument(skip(self), name = "options_broker::get_order")]
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

impl std::fmt::Debug for OptionsBrokerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionsBrokerAdapter")
            .field("account_id", &self.account_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Contracts needed to commit `notional_usd`, given the option's premium.
pub fn size_for_notional(notional_usd: f64, premium: f64) -> Option<f64> {
    super::common::round_down_to_step(notional_usd / (premium * CONTRACT_MULTIPLIER), 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occ_symbol_pads_strike_to_eight_digits() {
        let sym = OptionsBrokerAdapter::occ_symbol("AAPL", "240621", 'C', 195.0);
        assert_eq!(sym, "AAPL  240621C00195000");
    }

    #[test]
    fn sizes_to_whole_contracts() {
        assert_eq!(size_for_notional(500.0, 2.5), Some(2.0));
    }
}
