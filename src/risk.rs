// =============================================================================
// Risk & Quota Gate (C5) — three ordered checks, first failure wins
// =============================================================================
//
// 1. Monthly webhook quota (per user, per plan).
// 2. Weekly trade-count limit (per user, per venue).
// 3. Weekly realized-loss limit (per user, per venue, same window).
//
// Weekly counts are cached per `(user, venue, week_start)` and invalidated
// whenever a trade closes for that pair; a cache miss falls back to the
// datastore and repopulates. A notification is emitted on the first hit of a
// given limit within a window, debounced so repeated requests against an
// already-exhausted window don't spam the user.
// =============================================================================

use crate::cache::TtlCache;
use crate::config::RiskPolicyDefaults;
use crate::datastore::{Datastore, Notification};
use crate::error::AppError;
use crate::types::{PlanTier, UserId, Venue};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

const COUNTS_CACHE_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
struct WeeklyCounts {
    trades: u32,
    losses_usd: f64,
}

/// Start of the current ISO week (Monday 00:00:00 UTC).
pub fn current_iso_week_start() -> DateTime<Utc> {
    iso_week_start_of(Utc::now())
}

fn iso_week_start_of(at: DateTime<Utc>) -> DateTime<Utc> {
    let days_since_monday = at.weekday().num_days_from_monday() as i64;
    let date = (at - ChronoDuration::days(days_since_monday)).date_naive();
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is a valid time"))
}

/// Evaluates the gates defined in the component's ambient spec: monthly
/// webhook quota, then weekly trade count, then weekly realized loss, in
/// that order, against a datastore-backed set of counters.
pub struct RiskGate {
    datastore: Arc<dyn Datastore>,
    policy: RiskPolicyDefaults,
    counts: TtlCache<(UserId, Venue, DateTime<Utc>), WeeklyCounts>,
    notified: DashSet<(UserId, Venue, DateTime<Utc>, &'static str)>,
}

impl RiskGate {
    pub fn new(datastore: Arc<dyn Datastore>, policy: RiskPolicyDefaults) -> Self {
        Self {
            datastore,
            policy,
            counts: TtlCache::new(COUNTS_CACHE_TTL),
            notified: DashSet::new(),
        }
    }

    #[instrument(skip(self), name = "risk::check", fields(user_id = %user_id, venue = %venue))]
    pub async fn check(&self, user_id: UserId, venue: Venue, plan: PlanTier) -> Result<(), AppError> {
        self.check_monthly_quota(user_id, plan).await?;
        self.check_weekly_limits(user_id, venue).await?;
        Ok(())
    }

    async fn check_monthly_quota(&self, user_id: UserId, plan: PlanTier) -> Result<(), AppError> {
        let limit = plan.monthly_webhook_quota();
        if limit == 0 {
            return Ok(());
        }
        let current = self
            .datastore
            .count_webhooks_this_month(user_id)
            .await
            .map_err(crate::error::classify_adapter_error)?;
        if current >= limit {
            let reset_at = next_calendar_month_start();
            // Keyed per-user regardless of venue; use a fixed sentinel venue
            // so the debounce set doesn't fire once per venue for the same
            // monthly breach.
            self.notify_once(
                user_id,
                Venue::PerpDexA,
                reset_at,
                "monthly_webhook_quota",
                format!("Monthly webhook quota of {limit} reached."),
            )
            .await;
            return Err(AppError::PlanQuotaExceeded {
                current,
                limit,
                reset_at: reset_at.to_rfc3339(),
            });
        }
        Ok(())
    }

    async fn check_weekly_limits(&self, user_id: UserId, venue: Venue) -> Result<(), AppError> {
        if self.policy.max_trades_per_week == 0 && self.policy.max_loss_per_week_usd == 0.0 {
            return Ok(());
        }

        let week_start = current_iso_week_start();
        let counts = self.weekly_counts(user_id, venue, week_start).await?;
        let reset_at = week_start + ChronoDuration::weeks(1);

        if self.policy.max_trades_per_week > 0 && counts.trades >= self.policy.max_trades_per_week {
            self.notify_once(
                user_id,
                venue,
                reset_at,
                "max_trades_per_week",
                format!("Weekly trade limit of {} reached for {venue}.", self.policy.max_trades_per_week),
            )
            .await;
            return Err(AppError::WeeklyTradeLimitReached {
                current: counts.trades,
                limit: self.policy.max_trades_per_week,
                reset_at: reset_at.to_rfc3339(),
            });
        }

        if self.policy.max_loss_per_week_usd > 0.0 && counts.losses_usd >= self.policy.max_loss_per_week_usd {
            self.notify_once(
                user_id,
                venue,
                reset_at,
                "max_loss_per_week",
                format!("Weekly loss limit of ${:.2} reached for {venue}.", self.policy.max_loss_per_week_usd),
            )
            .await;
            return Err(AppError::WeeklyLossLimitReached {
                current_usd: counts.losses_usd,
                limit_usd: self.policy.max_loss_per_week_usd,
                reset_at: reset_at.to_rfc3339(),
            });
        }

        Ok(())
    }

    async fn weekly_counts(
        &self,
        user_id: UserId,
        venue: Venue,
        week_start: DateTime<Utc>,
    ) -> Result<WeeklyCounts, AppError> {
        if let Some(cached) = self.counts.get(&(user_id, venue, week_start)) {
            return Ok(cached);
        }
        let trades = self
            .datastore
            .count_trades_this_week(user_id, venue)
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let losses_usd = self
            .datastore
            .sum_losses_this_week(user_id, venue)
            .await
            .map_err(crate::error::classify_adapter_error)?;
        let counts = WeeklyCounts { trades, losses_usd };
        self.counts.put((user_id, venue, week_start), counts);
        Ok(counts)
    }

    /// Drop the cached weekly counts for `(user, venue)`. Called on every
    /// trade close so the next check observes the updated count/loss sum.
    pub fn invalidate_weekly_counts(&self, user_id: UserId, venue: Venue) {
        self.counts.invalidate(&(user_id, venue, current_iso_week_start()));
    }

    async fn notify_once(
        &self,
        user_id: UserId,
        venue: Venue,
        window_end: DateTime<Utc>,
        kind: &'static str,
        message: String,
    ) {
        if !self.notified.insert((user_id, venue, window_end, kind)) {
            return;
        }
        let _ = self
            .datastore
            .append_notification(Notification {
                id: Uuid::new_v4(),
                user_id,
                created_at: Utc::now(),
                kind: kind.to_string(),
                message,
            })
            .await;
    }
}

fn next_calendar_month_start() -> DateTime<Utc> {
    let now = Utc::now();
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month is unambiguous")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{CompletedTradeRecord, InMemoryDatastore};
    use crate::types::{ExitReason, Side};

    fn policy(max_trades: u32, max_loss: f64) -> RiskPolicyDefaults {
        RiskPolicyDefaults {
            max_trades_per_week: max_trades,
            max_loss_per_week_usd: max_loss,
        }
    }

    fn sample_trade(user_id: UserId, venue: Venue, realized_pnl_usd: f64) -> CompletedTradeRecord {
        CompletedTradeRecord {
            id: Uuid::new_v4(),
            user_id,
            venue,
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: 1.0,
            entry_price: 100.0,
            exit_price: 90.0,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            exit_reason: ExitReason::StopLoss,
            realized_pnl_usd,
            realized_pnl_pct: realized_pnl_usd / 100.0,
            strategy_id: None,
        }
    }

    #[test]
    fn iso_week_start_lands_on_monday_midnight() {
        let tuesday = Utc.with_ymd_and_hms(2026, 7, 28, 15, 30, 0).unwrap();
        let start = iso_week_start_of(tuesday);
        assert_eq!(start.weekday().num_days_from_monday(), 0);
        assert_eq!(start.hour(), 0);
    }

    #[tokio::test]
    async fn zero_policy_means_unlimited() {
        let ds = Arc::new(InMemoryDatastore::new());
        let gate = RiskGate::new(ds, policy(0, 0.0));
        gate.check(Uuid::nil(), Venue::PerpDexA, PlanTier::Free)
            .await
            .expect("no webhooks recorded yet and weekly policy is unlimited");
    }

    #[tokio::test]
    async fn weekly_trade_limit_trips_after_threshold() {
        let ds = Arc::new(InMemoryDatastore::new());
        for _ in 0..3 {
            ds.append_completed_trade(sample_trade(Uuid::nil(), Venue::PerpDexA, -5.0))
                .await
                .unwrap();
        }
        let gate = RiskGate::new(ds, policy(3, 0.0));
        let err = gate
            .check(Uuid::nil(), Venue::PerpDexA, PlanTier::Pro)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::WeeklyTradeLimitReached { current: 3, limit: 3, .. }));
    }

    #[tokio::test]
    async fn weekly_loss_limit_trips_on_absolute_sum() {
        let ds = Arc::new(InMemoryDatastore::new());
        ds.append_completed_trade(sample_trade(Uuid::nil(), Venue::ForexBroker, -150.0))
            .await
            .unwrap();
        let gate = RiskGate::new(ds, policy(0, 100.0));
        let err = gate
            .check(Uuid::nil(), Venue::ForexBroker, PlanTier::Pro)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::WeeklyLossLimitReached { .. }));
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_datastore_read() {
        let ds = Arc::new(InMemoryDatastore::new());
        let gate = RiskGate::new(ds.clone(), policy(1, 0.0));
        gate.check(Uuid::nil(), Venue::PerpDexA, PlanTier::Pro)
            .await
            .expect("zero trades yet");
        ds.append_completed_trade(sample_trade(Uuid::nil(), Venue::PerpDexA, -1.0))
            .await
            .unwrap();
        gate.invalidate_weekly_counts(Uuid::nil(), Venue::PerpDexA);
        let err = gate
            .check(Uuid::nil(), Venue::PerpDexA, PlanTier::Pro)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::WeeklyTradeLimitReached { .. }));
    }

    #[tokio::test]
    async fn notification_is_debounced_within_the_same_window() {
        let ds = Arc::new(InMemoryDatastore::new());
        for _ in 0..2 {
            ds.append_completed_trade(sample_trade(Uuid::nil(), Venue::PerpDexA, -1.0))
                .await
                .unwrap();
        }
        let gate = RiskGate::new(ds.clone(), policy(2, 0.0));
        let _ = gate.check(Uuid::nil(), Venue::PerpDexA, PlanTier::Pro).await;
        let _ = gate.check(Uuid::nil(), Venue::PerpDexA, PlanTier::Pro).await;
        assert_eq!(ds.notifications_snapshot().len(), 1);
    }
}
