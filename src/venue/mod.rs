// =============================================================================
// Venue Adapter — the uniform capability surface every venue implements
// =============================================================================
//
// The dispatcher never branches on venue identity beyond selecting which
// adapter to construct (see `factory`). Each adapter owns its own wire
// protocol, symbol normalization, and sizing conventions behind this trait.
// =============================================================================

pub mod common;
pub mod equities_cash;
pub mod equities_multi;
pub mod factory;
pub mod forex_broker;
pub mod options_broker;
pub mod perp_dex_a;
pub mod perp_dex_b;
pub mod perp_dex_c;
pub mod prediction_exchange;

use crate::error::AppError;
use crate::types::Side;
use async_trait::async_trait;
use std::fmt;

/// A position as reported directly by a venue (venue-native symbol, not the
/// gateway's canonical form).
#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl_usd: f64,
}

#[derive(Debug, Clone)]
pub struct Ticker {
    pub last_price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume_24h: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderLifecycle {
    Working,
    PartiallyFilled,
    Filled,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub venue_order_id: String,
    pub fill_price: Option<f64>,
    pub fill_quantity: Option<f64>,
    pub status: OrderLifecycle,
}

#[derive(Debug, Clone)]
pub struct CancelAck {
    pub venue_order_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct OrderState {
    pub venue_order_id: String,
    pub status: OrderLifecycle,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
}

/// Capability surface exposed by every venue integration.
///
/// Implementors are not required to be safe for concurrent use by multiple
/// callers; the Adapter Factory either hands out per-call instances or
/// serializes access internally (see `factory::AdapterFactory`).
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue_name(&self) -> &'static str;

    async fn get_available_margin(&self) -> Result<f64, AppError>;
    async fn get_positions(&self) -> Result<Vec<VenuePosition>, AppError>;
    async fn get_position(&self, symbol: &str) -> Result<Option<VenuePosition>, AppError>;
    async fn has_open_position(&self, symbol: &str) -> Result<bool, AppError> {
        Ok(self.get_position(symbol).await?.is_some())
    }
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AppError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, AppError>;
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError>;
    async fn place_stop_loss(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, AppError>;
    async fn place_take_profit(
        &self,
        symbol: &str,
        exit_side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Result<OrderAck, AppError>;
    async fn close_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, AppError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<CancelAck, AppError>;
    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderState, AppError>;
}

impl fmt::Debug for dyn VenueAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VenueAdapter({})", self.venue_name())
    }
}
