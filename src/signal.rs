// =============================================================================
// Signal — the canonical in-process representation of an incoming webhook
// =============================================================================

use crate::error::AppError;
use crate::types::{Action, OrderType, Venue};
use serde::Deserialize;
use uuid::Uuid;

/// Raw JSON body accepted at `POST /webhook`. Venue-specific hint fields are
/// captured opaquely in `extra` and handed to the adapter untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub secret: String,
    pub exchange: String,
    pub action: String,
    pub symbol: String,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub position_size_usd: Option<f64>,
    #[serde(default)]
    pub stop_loss_percent: Option<f64>,
    #[serde(default)]
    pub take_profit_percent: Option<f64>,
    #[serde(default)]
    pub strategy_id: Option<Uuid>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Where a signal originated: a direct webhook call, or a copy-trade fan-out
/// re-entry on behalf of a follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalSource {
    Direct,
    Copy { originator_trade_id: Uuid },
}

/// A validated, parsed signal ready for the dispatcher pipeline.
#[derive(Debug, Clone)]
pub struct Signal {
    pub venue: Venue,
    pub action: Action,
    pub symbol: String,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub position_size_usd: Option<f64>,
    pub stop_loss_percent: Option<f64>,
    pub take_profit_percent: Option<f64>,
    pub strategy_id: Option<Uuid>,
    pub strategy_name: Option<String>,
    pub source: SignalSource,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Signal {
    /// Parse and validate a raw webhook payload. Does not resolve the user or
    /// secret; that is the dispatcher's job (it needs the credential store).
    pub fn from_payload(payload: WebhookPayload) -> Result<Self, AppError> {
        if payload.secret.trim().is_empty() {
            return Err(AppError::BadRequest("secret is required".into()));
        }
        if payload.exchange.trim().is_empty() {
            return Err(AppError::BadRequest("exchange is required".into()));
        }
        if payload.symbol.trim().is_empty() {
            return Err(AppError::BadRequest("symbol is required".into()));
        }

        let venue = Venue::from_str_loose(&payload.exchange)
            .ok_or_else(|| AppError::UnsupportedVenue(payload.exchange.clone()))?;

        let action = parse_action(&payload.action)?;

        let order_type = match payload.order_type.as_deref() {
            None => OrderType::Market,
            Some(s) if s.eq_ignore_ascii_case("market") => OrderType::Market,
            Some(s) if s.eq_ignore_ascii_case("limit") => OrderType::Limit,
            Some(other) => {
                return Err(AppError::BadRequest(format!(
                    "unrecognized order_type: {other}"
                )))
            }
        };

        if order_type == OrderType::Limit && payload.price.is_none() {
            return Err(AppError::BadRequest(
                "price is required when order_type is limit".into(),
            ));
        }

        if let Some(size) = payload.position_size_usd {
            if size <= 0.0 {
                return Err(AppError::BadRequest(
                    "position_size_usd must be positive".into(),
                ));
            }
        }

        for (name, pct) in [
            ("stop_loss_percent", payload.stop_loss_percent),
            ("take_profit_percent", payload.take_profit_percent),
        ] {
            if let Some(pct) = pct {
                if pct <= 0.0 {
                    return Err(AppError::BadRequest(format!("{name} must be positive")));
                }
            }
        }

        Ok(Signal {
            venue,
            action,
            symbol: payload.symbol.trim().to_string(),
            order_type,
            limit_price: payload.price,
            position_size_usd: payload.position_size_usd,
            stop_loss_percent: payload.stop_loss_percent,
            take_profit_percent: payload.take_profit_percent,
            strategy_id: payload.strategy_id,
            strategy_name: payload.strategy,
            source: SignalSource::Direct,
            extra: payload.extra,
        })
    }
}

fn parse_action(raw: &str) -> Result<Action, AppError> {
    match raw.trim().to_lowercase().as_str() {
        "buy" => Ok(Action::Buy),
        "sell" => Ok(Action::Sell),
        "long" => Ok(Action::Long),
        "short" => Ok(Action::Short),
        "close" => Ok(Action::Close),
        other => Err(AppError::BadRequest(format!(
            "unrecognized action: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_payload() -> WebhookPayload {
        WebhookPayload {
            secret: "s1".into(),
            exchange: "perp_dex_a".into(),
            action: "buy".into(),
            symbol: "BTCUSDT".into(),
            user_id: None,
            order_type: None,
            price: None,
            position_size_usd: Some(600.0),
            stop_loss_percent: Some(2.0),
            take_profit_percent: Some(4.0),
            strategy_id: None,
            strategy: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn parses_valid_buy_signal() {
        let signal = Signal::from_payload(base_payload()).unwrap();
        assert_eq!(signal.venue, Venue::PerpDexA);
        assert_eq!(signal.action, Action::Buy);
        assert_eq!(signal.order_type, OrderType::Market);
    }

    #[test]
    fn rejects_empty_secret() {
        let mut payload = base_payload();
        payload.secret = "".into();
        assert!(matches!(
            Signal::from_payload(payload),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn rejects_unknown_venue() {
        let mut payload = base_payload();
        payload.exchange = "not_a_venue".into();
        assert!(matches!(
            Signal::from_payload(payload),
            Err(AppError::UnsupportedVenue(_))
        ));
    }

    #[test]
    fn limit_order_requires_price() {
        let mut payload = base_payload();
        payload.order_type = Some("limit".into());
        assert!(matches!(
            Signal::from_payload(payload),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn zero_stop_loss_percent_rejected() {
        let mut payload = base_payload();
        payload.stop_loss_percent = Some(0.0);
        assert!(matches!(
            Signal::from_payload(payload),
            Err(AppError::BadRequest(_))
        ));
    }
}
