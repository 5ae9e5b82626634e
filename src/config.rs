// =============================================================================
// Process configuration — loaded from the environment at startup
// =============================================================================

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

fn default_ml_service_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_ml_timeout_secs() -> u64 {
    5
}

fn default_max_trades_per_week() -> u32 {
    0
}

fn default_max_loss_per_week_usd() -> f64 {
    0.0
}

fn default_ml_confidence_threshold() -> f64 {
    70.0
}

fn default_copy_fanout_concurrency() -> usize {
    8
}

fn default_rate_limit_capacity() -> f64 {
    30.0
}

fn default_rate_limit_refill_per_sec() -> f64 {
    0.5
}

fn default_position_size_usd() -> f64 {
    100.0
}

/// Policy defaults applied when a `(user, venue)` has no explicit override.
/// A zero value means "no limit".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPolicyDefaults {
    #[serde(default = "default_max_trades_per_week")]
    pub max_trades_per_week: u32,
    #[serde(default = "default_max_loss_per_week_usd")]
    pub max_loss_per_week_usd: f64,
}

impl Default for RiskPolicyDefaults {
    fn default() -> Self {
        Self {
            max_trades_per_week: default_max_trades_per_week(),
            max_loss_per_week_usd: default_max_loss_per_week_usd(),
        }
    }
}

/// Top-level gateway configuration, assembled from environment variables at
/// process start. Unlike `RuntimeConfig` in the strategy-engine lineage this
/// repo descends from, this config has no hot-reload or on-disk persistence —
/// it is fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the external datastore (users, credentials, trades, ...).
    pub datastore_url: Option<String>,
    /// Service-role key used to authenticate against the datastore.
    pub datastore_service_key: Option<String>,
    /// Optional shared cache (enables cross-instance cache coherency).
    pub redis_url: Option<String>,
    /// Base URL of the optional ML validation service.
    pub ml_service_url: String,
    /// Timeout applied to every ML validation call.
    pub ml_timeout: Duration,
    /// Confidence threshold below which the ML gate denies, 0-100.
    pub ml_confidence_threshold: f64,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Deployment environment label, surfaced in health checks and logs.
    pub node_env: String,
    /// Legacy process-wide webhook secret fallback. See the Open Questions
    /// recorded in DESIGN.md before enabling this in a multi-tenant deployment.
    pub legacy_webhook_secret: Option<String>,
    /// Default risk policy applied absent a per-(user, venue) override.
    pub default_risk_policy: RiskPolicyDefaults,
    /// Bounded concurrency used when fanning a trade out to copy-trade followers.
    pub copy_fanout_concurrency: usize,
    /// Webhook ingress token bucket capacity, per user.
    pub rate_limit_capacity: f64,
    /// Webhook ingress token bucket refill rate, tokens per second, per user.
    pub rate_limit_refill_per_sec: f64,
    /// Global fallback notional (USD) used when a signal omits
    /// `position_size_usd` and no narrower default applies.
    pub default_position_size_usd: f64,
}

impl GatewayConfig {
    /// Load configuration from the process environment. Never fails: missing
    /// optional variables fall back to sensible defaults with a warning where
    /// the absence is operationally significant.
    pub fn load_from_env() -> Self {
        let datastore_url = std::env::var("SUPABASE_URL").ok();
        let datastore_service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY").ok();
        if datastore_url.is_none() || datastore_service_key.is_none() {
            warn!("SUPABASE_URL / SUPABASE_SERVICE_ROLE_KEY not set — datastore calls will fail until configured");
        }

        let redis_url = std::env::var("REDIS_URL").ok();

        let ml_service_url =
            std::env::var("ML_SERVICE_URL").unwrap_or_else(|_| default_ml_service_url());

        let ml_timeout_secs = std::env::var("ML_VALIDATION_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_else(default_ml_timeout_secs);

        let ml_confidence_threshold = std::env::var("ML_CONFIDENCE_THRESHOLD")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or_else(default_ml_confidence_threshold);

        let port = std::env::var("PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or_else(default_port);

        let node_env = std::env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string());

        let legacy_webhook_secret = std::env::var("WEBHOOK_SECRET").ok();
        if legacy_webhook_secret.is_some() {
            warn!(
                "WEBHOOK_SECRET legacy fallback is set — per-user secret resolution will fall back \
                 to this single process-wide secret on lookup miss, which weakens tenant isolation"
            );
        }

        let max_trades_per_week = std::env::var("DEFAULT_MAX_TRADES_PER_WEEK")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or_else(default_max_trades_per_week);

        let max_loss_per_week_usd = std::env::var("DEFAULT_MAX_LOSS_PER_WEEK_USD")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or_else(default_max_loss_per_week_usd);

        let copy_fanout_concurrency = std::env::var("COPY_FANOUT_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or_else(default_copy_fanout_concurrency);

        let rate_limit_capacity = std::env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or_else(default_rate_limit_capacity);

        let rate_limit_refill_per_sec = std::env::var("RATE_LIMIT_REFILL_PER_SEC")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or_else(default_rate_limit_refill_per_sec);

        let default_position_size_usd = std::env::var("DEFAULT_POSITION_SIZE_USD")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or_else(default_position_size_usd);

        Self {
            datastore_url,
            datastore_service_key,
            redis_url,
            ml_service_url,
            ml_timeout: Duration::from_secs(ml_timeout_secs),
            ml_confidence_threshold,
            port,
            node_env,
            legacy_webhook_secret,
            default_risk_policy: RiskPolicyDefaults {
                max_trades_per_week,
                max_loss_per_week_usd,
            },
            copy_fanout_concurrency,
            rate_limit_capacity,
            rate_limit_refill_per_sec,
            default_position_size_usd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_policy_defaults_have_no_limit() {
        let defaults = RiskPolicyDefaults::default();
        assert_eq!(defaults.max_trades_per_week, 0);
        assert_eq!(defaults.max_loss_per_week_usd, 0.0);
    }

    #[test]
    fn ml_timeout_defaults_to_five_seconds() {
        std::env::remove_var("ML_VALIDATION_TIMEOUT_SECS");
        let config = GatewayConfig::load_from_env();
        assert_eq!(config.ml_timeout, Duration::from_secs(5));
    }

    #[test]
    fn port_defaults_to_3000() {
        std::env::remove_var("PORT");
        let config = GatewayConfig::load_from_env();
        assert_eq!(config.port, 3000);
    }
}
