// =============================================================================
// Perp DEX C adapter — wallet address + request signature
// =============================================================================
//
// Every write request is signed with the account's private key and carries a
// strictly increasing nonce. Because the venue rejects any request whose
// nonce is not exactly one greater than the last accepted nonce, signing and
// sending must be serialized — this adapter holds the signing key behind a
// `tokio::sync::Mutex` covering the sign-then-send critical section, unlike
// the other adapters here which need no such exclusion.
// =============================================================================

use super::common::{notional_to_quantity, retry_with_backoff};
use super::{CancelAck, OrderAck, OrderLifecycle, OrderState, Ticker, VenueAdapter, VenuePosition};
use crate::error::AppError;
use crate::types::Side;
use anyhow::Context;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

type HmacSha256 = Hmac<Sha256>;

const QTY_STEP: f64 = 0.001;

struct SigningState {
    next_nonce: u64,
}

pub struct PerpDexCAdapter {
    wallet_address: String,
    private_key: String,
    base_url: String,
    client: reqwest::Client,
    signing: Mutex<SigningState>,
}

impl PerpDexCAdapter {
    pub fn new(wallet_address: impl Into<String>, private_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            wallet_address: wallet_address.into(),
            private_key: private_key.into(),
            base_url: base_url.into(),
            client,
            signing: Mutex::new(SigningState { next_nonce: 1 }),
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.private_key.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn sign_and_send(&self, body: serde_json::Value) -> Result<serde_json::Value, AppError> {
        // Holding the lock across both signing and the network round-trip
        // guarantees nonces reach the venue in the order they were minted.
        let guard = self.signing.lock().await;
        let nonce = guard.next_nonce;
        let mut signed_body = body;
        signed_body["wallet"] = serde_json::json!(self.wallet_address);
        signed_body["nonce"] = serde_json::json!(nonce);
        let payload = signed_body.to_string();
        let signature = self.sign(&payload);
        signed_body["signature"] = serde_json::json!(signature);

        let url = format!("{}/v1/exchange", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&signed_body)
            .send()
            .await
            .map_err(|e| AppError::Transient(e.to_string()))?;
        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::Client(e.to_string()))?;

        if status.is_success() {
            // Only advance the nonce once the venue has accepted it; a
            // rejected request must be retried with the same nonce.
            drop(guard);
            let mut guard = self.signing.lock().await;
            guard.next_nonce = nonce + 1;
        } else if status.as_u16() == 429 || status.is_server_error() {
            return Err(AppError::Transient(format!("{status}: {resp_body}")));
        } else {
            return Err(classify_rejection(&resp_body));
        }

        Ok(resp_body)
    }

    async fn get_json(&self, path: &str, query: &str) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}{path}?wallet={}&{query}", self.base_url, self.wallet_address);
        let resp = self.client.get(&url).send().await.context("request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response")?;
        if !status.is_success() {
            anyhow::bail!("perp_dex_c {path} returned {status}: {body}");
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
        let mut body = serde_json::json!({
            "action": "order",
            "coin": symbol,
            "side": if side == Side::Long { "B" } else { "A" },
            "sz": quantity,
            "type": order_type,
            "reduceOnly": reduce_only,
        });
        if let Some(p) = price {
            body["limitPx"] = serde_json::json!(p);
        }

        let result =
            retry_with_backoff(3, Duration::from_millis(200), || self.sign_and_send(body.clone())).await?;

        Ok(OrderAck {
            venue_order_id: result["oid"].to_string(),
            fill_price: result["avgPx"].as_f64(),
            fill_quantity: result["totalSz"].as_f64(),
            status: match result["status"].as_str() {
                Some("filled") => OrderLifecycle::Filled,
                Some("partiallyFilled") => OrderLifecycle::PartiallyFilled,
                Some("rejected") => OrderLifecycle::Rejected,
                _ => OrderLifecycle::Working,
            },
        })
    }
}

fn classify_rejection(body: &serde_json::Value) -> AppError {
    match body["err"].as_str() {
        Some(msg) if msg.contains("margin") => AppError::InsufficientFunds,
        Some(msg) if msg.contains("coin") => AppError::UnknownSymbol(msg.to_string()),
        _ => AppError::Client(body.to_string()),
    }
}

#[async_trait]
impl VenueAdapter for PerpDexCAdapter {
    fn venue_name(&self) -> &'static str {
        "perp_dex_c"
    }

    #[instrument(skip(self), name = "perp_dex_c::get_available_margin")]
    async fn get_available_margin(&self) -> Result<f64, AppError> {
        let body = self
            .get_json("/v1/account_state", "")
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(body["withdrawable"].as_f64().unwrap_or(0.0))
    }

    #[instrument(skip(self), name = "perp_dex_c::get_positions")]
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, AppError> {
        let body = self
            .get_json("/v1/account_state", "")
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let entries = body["assetPositions"].as_array().cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let pos = &entry["position"];
                let size = pos["szi"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
                if size == 0.0 {
                    return None;
                }
                Some(VenuePosition {
                    symbol: pos["coin"].as_str().unwrap_or_default().to_string(),
                    side: if size > 0.0 { Side::Long } else { Side::Short },
                    quantity: size.abs(),
                    entry_price: pos["entryPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    mark_price: pos["markPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    unrealized_pnl_usd: pos["unrealizedPnl"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
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

    #[instrument(skip(self), name = "perp_dex_c::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AppError> {
        let body = self
            .get_json("/v1/mids", &format!("coin={symbol}"))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let last = body[symbol].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        Ok(Ticker {
            last_price: last,
            bid: None,
            ask: None,
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
        self.submit_order(symbol, exit_side, "stop", quantity, Some(stop_price), true)
            .await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, exit_side, "take_profit", quantity, Some(limit_price), true)
            .await
    }

    async fn close_position(&self, symbol: &str, side: Side, quantity: f64) -> Result<OrderAck, AppError> {
        self.submit_order(symbol, side.opposite(), "market", quantity, None, true)
            .await
    }

    #[instrument(skip(self), name = "perp_dex_c::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<CancelAck, AppError> {
        let body = serde_json::json!({"action": "cancel", "coin": symbol, "oid": order_id});
        let result = self.sign_and_send(body).await;
        Ok(CancelAck {
            venue_order_id: order_id.to_string(),
            cancelled: result.is_ok(),
        })
    }

    #[instrument(skip(self), name = "perp_dex_c::get_order")]
    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderState, AppError> {
        let body = self
            .get_json("/v1/order_status", &format!("coin={symbol}&oid={order_id}"))
            .await
            .map_err(crate::error::classify_adapter_error)?;
        Ok(OrderState {
            venue_order_id: order_id.to_string(),
            status: match body["status"].as_str() {
                Some("filled") => OrderLifecycle::Filled,
                Some("partiallyFilled") => OrderLifecycle::PartiallyFilled,
                Some("rejected") | Some("canceled") => OrderLifecycle::Rejected,
                _ => OrderLifecycle::Working,
            },
            filled_quantity: body["totalSz"].as_f64().unwrap_or(0.0),
            avg_fill_price: body["avgPx"].as_f64(),
        })
    }
}

impl std::fmt::Debug for PerpDexCAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerpDexCAdapter")
            .field("wallet_address", &self.wallet_address)
            .field("private_key", &"<redacted>")
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

    #[tokio::test]
    async fn nonce_does_not_advance_without_a_successful_send() {
        let adapter = PerpDexCAdapter::new("0xabc", "key", "http://127.0.0.1:1");
        let guard = adapter.signing.lock().await;
        assert_eq!(guard.next_nonce, 1);
    }

    #[test]
    fn classify_rejection_detects_margin_message() {
        let body = serde_json::json!({"err": "insufficient margin"});
        assert!(matches!(classify_rejection(&body), AppError::InsufficientFunds));
    }
}
