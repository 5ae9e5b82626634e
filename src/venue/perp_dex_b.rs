// =============================================================================
// Perp DEX B adapter — account-indexed API key on an L2 rollup
// =============================================================================
//
// Authentication is scoped to a numeric account index rather than a global
// API key: every request carries both the account index and a session key
// issued for that index. Closes are reduce-only; this venue rejects an
// ordinary opposite-side order that would flip a position instead of
// reducing it, so `close_position` always passes `reduceOnly=true`.
// =============================================================================

use super::common::{notional_to_quantity, retry_with_backoff};
use super::{CancelAck, OrderAck, OrderLifecycle, OrderState, Ticker, VenueAdapter, VenuePosition};
use crate::error::AppError;
use crate::types::Side;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::instrument;

const QTY_STEP: f64 = 0.0001;

pub struct PerpDexBAdapter {
    account_index: u64,
    session_key: String,
    base_url: String,
    client: reqwest::Client,
    nonce: AtomicU64,
}

impl PerpDexBAdapter {
    pub fn new(account_index: u64, session_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            account_index,
            session_key: session_key.into(),
            base_url: base_url.into(),
            client,
            nonce: AtomicU64::new(1),
        }
    }

    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::SeqCst)
    }

    async fn authed_get(&self, path: &str, query: &str) -> anyhow::Result<serde_json::Value> {
        let url = format!(
            "{}{path}?accountIndex={}&{query}",
            self.base_url, self.account_index
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.session_key)
            .send()
            .await
            .context("request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response")?;
        if !status.is_success() {
            anyhow::bail!("perp_dex_b {path} returned {status}: {body}");
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
        let nonce = self.next_nonce();
        let mut body = serde_json::json!({
            "accountIndex": self.account_index,
            "nonce": nonce,
            "market": symbol,
            "side": if side == Side::Long { "buy" } else { "sell" },
            "type": order_type,
            "size": quantity,
            "reduceOnly": reduce_only,
        });
        if let Some(p) = price {
            body["price"] = serde_json::json!(p);
        }

        retry_with_backoff(3, Duration::from_millis(200), || {
            let body = body.clone();
            async move {
                let url = format!("{}/v2/orders", self.base_url);
                let resp = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.session_key)
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
                    venue_order_id: resp_body["orderId"].as_str().unwrap_or_default().to_string(),
                    fill_price: resp_body["avgFillPrice"].as_f64(),
                    fill_quantity: resp_body["filledSize"].as_f64(),
                    status: match resp_body["status"].as_str() {
                        Some("FILLED") => OrderLifecycle::Filled,
                        Some("PARTIAL") => OrderLifecycle::PartiallyFilled,
                        Some("REJECTED") => OrderLifecycle::Rejected,
                        _ => OrderLifecycle::Working,
                    },
                })
            }
        })
        .await
    }
}

fn classify_rejection(body: &serde_json::Value) -> AppError {
    match body["error"].as_str() {
        Some("INSUFFICIENT_MARGIN") => AppError::InsufficientFunds,
        Some("UNKNOWN_MARKET") => AppError::UnknownSymbol(body["market"].as_str().unwrap_or("").to_string()),
        _ => AppError::Client(body.to_string()),
    }
}

#[async_trait]
impl VenueAdapter for PerpDexBAdapter {
    fn venue_name(&self) -> &'static str {
        "perp_dex_b"
    }

    #[instrument(skip(self), name = "perp_dex_b::get_available_margin")]
    async fn get_available_margin(&self) -> Result<f64, AppError> {
        let body = self
            .authed_get("/v2/account", "")
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(body["freeCollateral"].as_f64().unwrap_or(0.0))
    }

    #[instrument(skip(self), name = "perp_dex_b::get_positions")]
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, AppError> {
        let body = self
            .authed_get("/v2/positions", "")
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let entries = body["positions"].as_array().cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let size = entry["size"].as_f64().unwrap_or(0.0);
                if size == 0.0 {
                    return None;
                }
                Some(VenuePosition {
                    symbol: entry["market"].as_str().unwrap_or_default().to_string(),
                    side: if size > 0.0 { Side::Long } else { Side::Short },
                    quantity: size.abs(),
                    entry_price: entry["entryPrice"].as_f64().unwrap_or(0.0),
                    mark_price: entry["markPrice"].as_f64().unwrap_or(0.0),
                    unrealized_pnl_usd: entry["unrealizedPnl"].as_f64().unwrap_or(0.0),
                })
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

    #[instrument(skip(self), name = "perp_dex_b::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AppError> {
        let body = self
            .authed_get("/v2/ticker", &format!("market={symbol}"))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(Ticker {
            last_price: body["last"].as_f64().unwrap_or(0.0),
            bid: body["bid"].as_f64(),
            ask: body["ask"].as_f64(),
            volume_24h: body["volume24h"].as_f64(),
        })
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, side, "market", quantity, None, false).await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, side, "limit", quantity, Some(limit_price), false)
            .await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, exit_side, "stop_market", quantity, Some(stop_price), true)
            .await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, exit_side, "take_profit_market", quantity, Some(limit_price), true)
            .await
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, side.opposite(), "market", quantity, None, true)
            .await
    }

    #[instrument(skip(self), name = "perp_dex_b::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<CancelAck, AppError> {
        let url = format!("{}/v2/orders/{order_id}?market={symbol}", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.session_key)
            .send()
            .await
            .map_err(|e| AppError::Transient(e.to_string()))?;
        Ok(CancelAck {
            venue_order_id: order_id.to_string(),
            cancelled: resp.status().is_success(),
        })
    }

    #[instrument(skip(self), name = "perp_dex_b::get_order")]
    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderState, AppError> {
        let body = self
            .authed_get(&format!("/v2/orders/{order_id}"), &format!("market={symbol}"))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(OrderState {
            venue_order_id: order_id.to_string(),
            status: match body["status"].as_str() {
                Some("FILLED") => OrderLifecycle::Filled,
                Some("PARTIAL") => OrderLifecycle::PartiallyFilled,
                Some("REJECTED") | Some("CANCELED") => OrderLifecycle::Rejected,
                _ => OrderLifecycle::Working,
            },
            filled_quantity: body["filledSize"].as_f64().unwrap_or(0.0),
            avg_fill_price: body["avgFillPrice"].as_f64(),
        })
    }
}

impl std::fmt::Debug for PerpDexBAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerpDexBAdapter")
            .field("account_index", &self.account_index)
            .field("session_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

pub fn size_for_notional(notional_usd: f64, reference_price: f64) -> Option<f64> {
    notional_to_quantity(notional_usd, reference_price, QTY_STEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_increments_monotonically() {
        let adapter = PerpDexBAdapter::new(1, "key", "http://localhost");
        let a = adapter.next_nonce();
        let b = adapter.next_nonce();
        assert!(b > a);
    }

    #[test]
    fn classify_rejection_maps_insufficient_margin() {
        let body = serde_json::json!({"error": "INSUFFICIENT_MARGIN"});
        assert!(matches!(classify_rejection(&body), AppError::InsufficientFunds));
    }
}
