// =============================================================================
// Perp DEX A adapter — API key + HMAC-SHA256 signed requests
// =============================================================================
//
// USDT-margined perpetuals. Leverage is set out-of-band on the account and is
// not a parameter of order placement here. Symbols are passed through as-is
// (e.g. "BTCUSDT"); this venue's native format matches the gateway's
// canonical symbol convention so no translation is needed.
// =============================================================================

use super::common::{notional_to_quantity, retry_with_backoff, LocalRateLimiter};
use super::{CancelAck, OrderAck, OrderLifecycle, OrderState, Ticker, VenueAdapter, VenuePosition};
use crate::error::AppError;
use crate::types::Side;
use anyhow::Context;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;
const QTY_STEP: f64 = 0.001;
const ORDERS_PER_10S_LIMIT: u32 = 10;

pub struct PerpDexAAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: LocalRateLimiter,
}

impl PerpDexAAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            headers.insert("X-API-KEY", val);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret: secret.into(),
            base_url: base_url.into(),
            client,
            rate_limiter: LocalRateLimiter::new(ORDERS_PER_10S_LIMIT),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn get_json(&self, path: &str, params: &str) -> anyhow::Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{path}?{qs}", self.base_url);
        let resp = self.client.get(&url).send().await.context("request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response")?;
        if !status.is_success() {
            anyhow::bail!("perp_dex_a {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        reduce_only: bool,
    ) -> Result<OrderAck, AppError> {
        if !self.rate_limiter.try_acquire() {
            return Err(AppError::Transient("perp_dex_a order rate limit".into()));
        }

        let side_str = match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let mut params =
            format!("symbol={symbol}&side={side_str}&type={order_type}&quantity={quantity}");
        if let Some(p) = price {
            params.push_str(&format!("&price={p}"));
        }
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }

        let result = retry_with_backoff(3, Duration::from_millis(200), || {
            let params = params.clone();
            async move {
                let qs = self.signed_query(&params);
                let url = format!("{}/v1/order?{qs}", self.base_url);
                let resp = self
                    .client
                    .post(&url)
                    .send()
                    .await
                    .map_err(|e| AppError::Transient(e.to_string()))?;
                let status = resp.status();
                let body: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| AppError::Client(e.to_string()))?;

                if status.as_u16() == 429 || status.is_server_error() {
                    return Err(AppError::Transient(format!("{status}: {body}")));
                }
                if !status.is_success() {
                    return Err(classify_rejection(&body));
                }
                Ok(body)
            }
        })
        .await?;

        Ok(OrderAck {
            venue_order_id: result["orderId"].to_string(),
            fill_price: result["avgPrice"].as_str().and_then(|s| s.parse().ok()),
            fill_quantity: result["executedQty"].as_str().and_then(|s| s.parse().ok()),
            status: match result["status"].as_str() {
                Some("FILLED") => OrderLifecycle::Filled,
                Some("PARTIALLY_FILLED") => OrderLifecycle::PartiallyFilled,
                Some("REJECTED") => OrderLifecycle::Rejected,
                _ => OrderLifecycle::Working,
            },
        })
    }
}

fn classify_rejection(body: &serde_json::Value) -> AppError {
    match body["code"].as_i64() {
        Some(-2019) => AppError::InsufficientFunds,
        Some(-1121) => AppError::UnknownSymbol(body["msg"].as_str().unwrap_or("").to_string()),
        _ => AppError::Client(body.to_string()),
    }
}

#[async_trait]
impl VenueAdapter for PerpDexAAdapter {
    fn venue_name(&self) -> &'static str {
        "perp_dex_a"
    }

    #[instrument(skip(self), name = "perp_dex_a::get_available_margin")]
    async fn get_available_margin(&self) -> Result<f64, AppError> {
        let account = self
            .get_json("/v1/account", "")
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(account["availableBalance"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0))
    }

    #[instrument(skip(self), name = "perp_dex_a::get_positions")]
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, AppError> {
        let body = self
            .get_json("/v1/positions", "")
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let entries = body.as_array().cloned().unwrap_or_default();
        let mut positions = Vec::new();
        for entry in entries {
            let qty: f64 = entry["positionAmt"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            if qty == 0.0 {
                continue;
            }
            positions.push(VenuePosition {
                symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                side: if qty > 0.0 { Side::Long } else { Side::Short },
                quantity: qty.abs(),
                entry_price: entry["entryPrice"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
                mark_price: entry["markPrice"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
                unrealized_pnl_usd: entry["unRealizedProfit"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
            });
        }
        debug!(count = positions.len(), "perp_dex_a positions fetched");
        Ok(positions)
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<VenuePosition>, AppError> {
        Ok(self
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol))
    }

    #[instrument(skip(self), name = "perp_dex_a::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AppError> {
        let body = self
            .get_json("/v1/ticker", &format!("symbol={symbol}"))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(Ticker {
            last_price: body["lastPrice"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            bid: body["bidPrice"].as_str().and_then(|s| s.parse().ok()),
            ask: body["askPrice"].as_str().and_then(|s| s.parse().ok()),
            volume_24h: body["volume"].as_str().and_then(|s| s.parse().ok()),
        })
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, side, "MARKET", quantity, None, false)
            .await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, side, "LIMIT", quantity, Some(limit_price), false)
            .await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, exit_side, "STOP_MARKET", quantity, Some(stop_price), true)
            .await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(
            symbol,
            exit_side,
            "TAKE_PROFIT_MARKET",
            quantity,
            Some(limit_price),
            true,
        )
        .await
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, side.opposite(), "MARKET", quantity, None, true)
            .await
    }

    #[instrument(skip(self), name = "perp_dex_a::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<CancelAck, AppError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/v1/order?{qs}", self.base_url);
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

    #[instrument(skip(self), name = "perp_dex_a::get_order")]
    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderState, AppError> {
        let body = self
            .get_json("/v1/order", &format!("symbol={symbol}&orderId={order_id}"))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(OrderState {
            venue_order_id: order_id.to_string(),
            status: match body["status"].as_str() {
                Some("FILLED") => OrderLifecycle::Filled,
                Some("PARTIALLY_FILLED") => OrderLifecycle::PartiallyFilled,
                Some("REJECTED") | Some("CANCELED") => OrderLifecycle::Rejected,
                _ => OrderLifecycle::Working,
            },
            filled_quantity: body["executedQty"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            avg_fill_price: body["avgPrice"].as_str().and_then(|s| s.parse().ok()),
        })
    }
}

impl std::fmt::Debug for PerpDexAAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerpDexAAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Convert an intended USD notional into a quantity sized for this venue.
pub fn size_for_notional(notional_usd: f64, reference_price: f64) -> Option<f64> {
    notional_to_quantity(notional_usd, reference_price, QTY_STEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_notional_to_step() {
        assert_eq!(size_for_notional(600.0, 50_000.0), Some(0.012));
    }

    #[test]
    fn tiny_notional_is_none() {
        assert_eq!(size_for_notional(0.01, 50_000.0), None);
    }

    #[test]
    fn classify_rejection_maps_insufficient_funds() {
        let body = serde_json::json!({"code": -2019, "msg": "Margin is insufficient"});
        assert!(matches!(classify_rejection(&body), AppError::InsufficientFunds));
    }

    #[test]
    fn classify_rejection_maps_unknown_symbol() {
        let body = serde_json::json!({"code": -1121, "msg": "Invalid symbol"});
        assert!(matches!(classify_rejection(&body), AppError::UnknownSymbol(_)));
    }
}
