// =============================================================================
// Error taxonomy — the closed set of failures visible at the dispatcher boundary
// =============================================================================
//
// Every fallible operation that can surface all the way to the HTTP response
// returns `Result<T, AppError>`. Internals that never cross that boundary
// (adapter plumbing, the reconciliation loop) use `anyhow::Result` and wrap
// into an `AppError` only at the point where a caller needs the taxonomy.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// The closed error taxonomy the dispatcher can emit.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("monthly webhook quota exceeded")]
    PlanQuotaExceeded {
        current: u32,
        limit: u32,
        reset_at: String,
    },

    #[error("weekly trade limit reached")]
    WeeklyTradeLimitReached {
        current: u32,
        limit: u32,
        reset_at: String,
    },

    #[error("weekly loss limit reached")]
    WeeklyLossLimitReached {
        current_usd: f64,
        limit_usd: f64,
        reset_at: String,
    },

    #[error("no credential configured for this venue")]
    NotConfigured,

    #[error("unsupported venue: {0}")]
    UnsupportedVenue(String),

    #[error("credential malformed for this venue")]
    CredentialMalformed,

    #[error("position already open for this symbol")]
    AlreadyOpen,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("market closed")]
    MarketClosed,

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("order size too small after rounding")]
    TooSmall,

    #[error("transient venue failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Client(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthFailed => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::PlanQuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::WeeklyTradeLimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::WeeklyLossLimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotConfigured => StatusCode::BAD_REQUEST,
            Self::UnsupportedVenue(_) => StatusCode::BAD_REQUEST,
            Self::CredentialMalformed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AlreadyOpen => StatusCode::CONFLICT,
            Self::InsufficientFunds
            | Self::MarketClosed
            | Self::UnknownSymbol(_)
            | Self::TooSmall => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::PlanQuotaExceeded {
                current,
                limit,
                reset_at,
            } => json!({
                "success": false,
                "error": self.to_string(),
                "limitType": "monthly_webhook_quota",
                "current": current,
                "limit": limit,
                "resetDate": reset_at,
            }),
            Self::WeeklyTradeLimitReached {
                current,
                limit,
                reset_at,
            } => json!({
                "success": false,
                "error": self.to_string(),
                "limitType": "max_trades_per_week",
                "current": current,
                "limit": limit,
                "resetDate": reset_at,
            }),
            Self::WeeklyLossLimitReached {
                current_usd,
                limit_usd,
                reset_at,
            } => json!({
                "success": false,
                "error": self.to_string(),
                "limitType": "max_loss_per_week",
                "current": current_usd,
                "limit": limit_usd,
                "resetDate": reset_at,
            }),
            other => json!({
                "success": false,
                "error": other.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

/// Classify an adapter-level `anyhow::Error` into the taxonomy's `Transient`
/// bucket. Adapters that can distinguish a more specific kind should return
/// `AppError` directly instead of routing through this helper.
pub fn classify_adapter_error(err: anyhow::Error) -> AppError {
    AppError::Transient(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_maps_to_400() {
        assert_eq!(
            AppError::BadRequest("missing field".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn already_open_maps_to_409() {
        assert_eq!(AppError::AlreadyOpen.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn transient_maps_to_503() {
        assert_eq!(
            AppError::Transient("timeout".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn too_small_maps_to_422() {
        assert_eq!(AppError::TooSmall.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
