// =============================================================================
// Shared types used across the signal gateway
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Balance snapshot for a single asset as reported by a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// The set of venues this gateway knows how to dispatch to.
///
/// Dispatcher code must never match on this beyond selecting the adapter
/// (see `venue::factory`); per-venue quirks live inside the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    PerpDexA,
    PerpDexB,
    PerpDexC,
    ForexBroker,
    EquitiesCash,
    EquitiesMulti,
    OptionsBroker,
    PredictionExchange,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerpDexA => "perp_dex_a",
            Self::PerpDexB => "perp_dex_b",
            Self::PerpDexC => "perp_dex_c",
            Self::ForexBroker => "forex_broker",
            Self::EquitiesCash => "equities_cash",
            Self::EquitiesMulti => "equities_multi",
            Self::OptionsBroker => "options_broker",
            Self::PredictionExchange => "prediction_exchange",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        let normalised = s.trim().to_lowercase().replace(['-', ' '], "_");
        match normalised.as_str() {
            "perp_dex_a" | "perpdexa" => Some(Self::PerpDexA),
            "perp_dex_b" | "perpdexb" => Some(Self::PerpDexB),
            "perp_dex_c" | "perpdexc" => Some(Self::PerpDexC),
            "forex_broker" | "forex" | "fx" => Some(Self::ForexBroker),
            "equities_cash" | "equities" | "stocks" => Some(Self::EquitiesCash),
            "equities_multi" | "equities_multi_asset" => Some(Self::EquitiesMulti),
            "options_broker" | "options" => Some(Self::OptionsBroker),
            "prediction_exchange" | "prediction" | "predictit" => Some(Self::PredictionExchange),
            _ => None,
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which side of the market an order or position sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Action requested by an incoming webhook signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Long,
    Short,
    Close,
}

impl Action {
    /// Resolve the action into the position side it opens, if it opens one.
    pub fn opening_side(&self) -> Option<Side> {
        match self {
            Self::Buy | Self::Long => Some(Side::Long),
            Self::Sell | Self::Short => Some(Side::Short),
            Self::Close => None,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Order type requested for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl Default for OrderType {
    fn default() -> Self {
        Self::Market
    }
}

/// Sandbox vs production credential environment, per venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    Sandbox,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Sandbox
    }
}

/// Subscription tier; governs the monthly webhook quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl PlanTier {
    /// Monthly webhook quota for this tier. Zero means unlimited.
    pub fn monthly_webhook_quota(&self) -> u32 {
        match self {
            Self::Free => 50,
            Self::Basic => 500,
            Self::Pro => 5_000,
            Self::Enterprise => 0,
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Manual,
    AutoClose,
    Other,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TakeProfit => write!(f, "take_profit"),
            Self::StopLoss => write!(f, "stop_loss"),
            Self::Manual => write!(f, "manual"),
            Self::AutoClose => write!(f, "auto_close"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Lifecycle state of a copy-trading relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStatus {
    Active,
    Paused,
    Stopped,
}

/// Opaque identifier for a user, shared across every component.
pub type UserId = Uuid;
