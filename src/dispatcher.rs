// =============================================================================
// Webhook Dispatcher (C7) — the one component with a public wire-level surface
// =============================================================================
//
// `handle_webhook` is the entry point for a direct `POST /webhook` call; it
// resolves the secret to a user, then hands off to `dispatch_for_user`, which
// runs the rest of the pipeline (rate limit, quota/risk, ML, adapter
// resolution, action dispatch, fan-out, audit). `dispatch_for_user` is also
// the copy-trading re-entry point, so a follower's synthetic signal passes
// through exactly the same gates a direct webhook would.
//
// Steps 1-7 of the pipeline run strictly serially on the request's task.
// Copy-trading fan-out (step 8) and the audit sink (step 9) are fire-and-
// forget: the response is returned as soon as step 7 completes.
// =============================================================================

use crate::audit::AuditSink;
use crate::config::GatewayConfig;
use crate::copy_trading::{CopyFanout, OriginatorTrade};
use crate::credentials::CredentialStore;
use crate::datastore::{CompletedTradeRecord, Datastore, User};
use crate::error::{classify_adapter_error, AppError};
use crate::ml_validation::MlValidationClient;
use crate::position_engine::{PositionKey, PositionRecord, PositionTracker};
use crate::rate_limit::RateLimiter;
use crate::risk::RiskGate;
use crate::signal::{Signal, SignalSource, WebhookPayload};
use crate::types::{ExitReason, OrderType, Side, Venue};
use crate::venue::common::notional_to_quantity;
use crate::venue::factory::AdapterFactory;
use crate::venue::VenueAdapter;
use chrono::Utc;
use std::sync::{Arc, Weak};
use tracing::{instrument, warn};
use uuid::Uuid;

/// Quantity rounding step used when the dispatcher converts a USD notional
/// into base-asset units generically, ahead of any venue-specific rounding
/// the adapter itself applies when placing the order.
const GENERIC_QTY_STEP: f64 = 0.0001;

#[derive(Debug, Clone)]
pub struct OpenedTrade {
    pub symbol: String,
    pub venue: Venue,
    pub quantity: f64,
    pub entry_price: f64,
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub symbol: String,
    pub venue: Venue,
    pub quantity: f64,
    pub exit_price: f64,
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Opened(OpenedTrade),
    Closed(ClosedTrade),
    MlBlocked {
        confidence: f64,
        threshold: f64,
        reasons: Vec<String>,
    },
}

pub struct Dispatcher {
    credentials: Arc<CredentialStore>,
    adapters: Arc<AdapterFactory>,
    tracker: Arc<PositionTracker>,
    risk: Arc<RiskGate>,
    rate_limiter: RateLimiter,
    ml: Option<Arc<MlValidationClient>>,
    audit: Arc<AuditSink>,
    datastore: Arc<dyn Datastore>,
    default_position_size_usd: f64,
    copy: CopyFanout,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        credentials: Arc<CredentialStore>,
        adapters: Arc<AdapterFactory>,
        tracker: Arc<PositionTracker>,
        risk: Arc<RiskGate>,
        ml: Option<Arc<MlValidationClient>>,
        audit: Arc<AuditSink>,
        datastore: Arc<dyn Datastore>,
        config: &GatewayConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Dispatcher>| Self {
            credentials,
            adapters,
            tracker,
            risk,
            rate_limiter: RateLimiter::new(config.rate_limit_capacity, config.rate_limit_refill_per_sec),
            ml,
            audit,
            datastore: datastore.clone(),
            default_position_size_usd: config.default_position_size_usd,
            copy: CopyFanout::new(weak.clone(), datastore, config.copy_fanout_concurrency),
        })
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Entry point for a direct `POST /webhook` request: payload shape check,
    /// secret resolution, then hand off to the shared pipeline. The monthly
    /// webhook counter increments only once the pipeline actually executes a
    /// trade (I-5: "counter increments on success only") — a request
    /// rejected by the rate limiter, a gate, ML, or the adapter must not
    /// consume a slot of the user's quota.
    #[instrument(skip(self, payload), name = "dispatcher::handle_webhook")]
    pub async fn handle_webhook(&self, payload: WebhookPayload) -> Result<DispatchOutcome, AppError> {
        let secret = payload.secret.clone();
        let user_id_hint = payload.user_id;
        let signal = Signal::from_payload(payload)?;

        let user = self
            .credentials
            .lookup_user_by_secret(&secret)
            .await
            .map_err(classify_adapter_error)?
            .ok_or(AppError::AuthFailed)?;

        if let Some(hint) = user_id_hint {
            if hint != user.id {
                return Err(AppError::AuthFailed);
            }
        }

        let outcome = self.dispatch_for_user(&user, signal).await?;

        if matches!(outcome, DispatchOutcome::Opened(_) | DispatchOutcome::Closed(_)) {
            if let Err(err) = self.datastore.record_webhook_accepted(user.id).await {
                warn!(user_id = %user.id, error = %err, "failed to record accepted webhook, continuing");
            }
        }

        Ok(outcome)
    }

    /// Runs the pipeline from the rate limiter onward. This is also the
    /// copy-trading re-entry point: a follower's synthetic signal passes
    /// through the same rate/quota/risk/ML gates a direct webhook would,
    /// but does not count toward the follower's webhook quota (that counter
    /// tracks external webhook acceptance, not internal re-dispatch).
    #[instrument(skip(self, signal), name = "dispatcher::dispatch_for_user", fields(user_id = %user.id, venue = ?signal.venue, symbol = %signal.symbol))]
    pub async fn dispatch_for_user(&self, user: &User, signal: Signal) -> Result<DispatchOutcome, AppError> {
        if !self.rate_limiter.check(user.id) {
            return Err(AppError::RateLimited);
        }

        self.risk.check(user.id, signal.venue, user.plan).await?;

        let adapter = self.adapters.get_adapter(user.id, signal.venue).await?;

        if signal.action.is_close() {
            return self.dispatch_close(user, &signal, adapter.as_ref()).await;
        }

        let side = signal
            .action
            .opening_side()
            .expect("close is handled above; every other action opens a side");

        let ticker = adapter.get_ticker(&signal.symbol).await?;

        if let Some(strategy_id) = signal.strategy_id {
            if let Some(ml) = &self.ml {
                let verdict = ml
                    .validate(strategy_id, &signal.action.to_string(), &signal.symbol, &ticker)
                    .await;
                if !verdict.allow {
                    return Ok(DispatchOutcome::MlBlocked {
                        confidence: verdict.confidence,
                        threshold: ml.confidence_threshold(),
                        reasons: verdict.reasons,
                    });
                }
            }
        }

        self.dispatch_open(user, &signal, adapter.as_ref(), side, ticker.last_price)
            .await
    }

    async fn dispatch_open(
        &self,
        user: &User,
        signal: &Signal,
        adapter: &dyn VenueAdapter,
        side: Side,
        last_price: f64,
    ) -> Result<DispatchOutcome, AppError> {
        let key = PositionKey::new(user.id, signal.venue, signal.symbol.clone());
        // Claim the slot before placing the order so the presence check and
        // the reservation are one atomic map operation: two concurrent opens
        // on the same (user, venue, symbol) can never both pass this check
        // the way a separate `has()` then `open()` could straddling the
        // order-placement await. The guard releases the claim automatically
        // if anything below returns early with `?`; `commit()` disarms it
        // once `self.tracker.open` has finalized the slot.
        if !self.tracker.try_reserve(key.clone()) {
            return Err(AppError::AlreadyOpen);
        }
        let mut reservation = ReservationGuard::new(&self.tracker, key.clone());

        let notional = signal.position_size_usd.unwrap_or(self.default_position_size_usd);
        let quantity =
            notional_to_quantity(notional, last_price, GENERIC_QTY_STEP).ok_or(AppError::TooSmall)?;

        let ack = match (signal.order_type, signal.limit_price) {
            (OrderType::Limit, Some(price)) => {
                adapter.place_limit_order(&signal.symbol, side, quantity, price).await?
            }
            _ => adapter.place_market_order(&signal.symbol, side, quantity).await?,
        };

        let entry_price = ack.fill_price.unwrap_or(last_price);
        let filled_quantity = ack.fill_quantity.unwrap_or(quantity);

        let (stop_loss_price, stop_loss_order_id) = match signal.stop_loss_percent {
            Some(pct) => {
                let price = bracket_price(side, entry_price, pct, true);
                match adapter
                    .place_stop_loss(&signal.symbol, side.opposite(), filled_quantity, price)
                    .await
                {
                    Ok(ack) => (Some(price), Some(ack.venue_order_id)),
                    Err(err) => {
                        warn!(error = %err, "stop-loss placement failed, position opened without a resting stop");
                        (Some(price), None)
                    }
                }
            }
            None => (None, None),
        };

        let (take_profit_price, take_profit_order_id) = match signal.take_profit_percent {
            Some(pct) => {
                let price = bracket_price(side, entry_price, pct, false);
                match adapter
                    .place_take_profit(&signal.symbol, side.opposite(), filled_quantity, price)
                    .await
                {
                    Ok(ack) => (Some(price), Some(ack.venue_order_id)),
                    Err(err) => {
                        warn!(error = %err, "take-profit placement failed, position opened without a resting target");
                        (Some(price), None)
                    }
                }
            }
            None => (None, None),
        };

        self.tracker.open(
            key,
            PositionRecord {
                side,
                quantity: filled_quantity,
                entry_price,
                opened_at: Utc::now(),
                stop_loss_price,
                take_profit_price,
                entry_order_id: Some(ack.venue_order_id.clone()),
                stop_loss_order_id,
                take_profit_order_id,
                mark_price: entry_price,
                unrealized_pnl_usd: 0.0,
                synced: false,
            },
        );
        reservation.commit();

        // A copy-trade's own successful open must not itself trigger another
        // round of fan-out: it is a follower's trade, not an originator's,
        // and re-entering `spawn_fan_out` here would re-dispatch to every
        // follower again for each follower that opens (§4.9 only fans out
        // "after a successful *originator* trade").
        if matches!(&signal.source, SignalSource::Direct) {
            self.copy.spawn_fan_out(OriginatorTrade {
                originator_trade_id: Uuid::new_v4(),
                venue: signal.venue,
                symbol: signal.symbol.clone(),
                side,
                order_type: signal.order_type,
                limit_price: signal.limit_price,
                notional_usd: notional,
                stop_loss_percent: signal.stop_loss_percent,
                take_profit_percent: signal.take_profit_percent,
                strategy_id: signal.strategy_id,
            });
        }

        Ok(DispatchOutcome::Opened(OpenedTrade {
            symbol: signal.symbol.clone(),
            venue: signal.venue,
            quantity: filled_quantity,
            entry_price,
            order_id: ack.venue_order_id,
        }))
    }

    async fn dispatch_close(
        &self,
        user: &User,
        signal: &Signal,
        adapter: &dyn VenueAdapter,
    ) -> Result<DispatchOutcome, AppError> {
        let key = PositionKey::new(user.id, signal.venue, signal.symbol.clone());
        let record = self
            .tracker
            .get(&key)
            .ok_or_else(|| AppError::BadRequest(format!("no open position for {}", signal.symbol)))?;

        let ack = adapter
            .close_position(&signal.symbol, record.side, record.quantity)
            .await?;
        let exit_price = ack.fill_price.unwrap_or(record.mark_price);

        self.tracker.close(&key);

        let realized_pnl_usd = record.side.sign() * (exit_price - record.entry_price) * record.quantity;
        let realized_pnl_pct = if record.entry_price > 0.0 {
            record.side.sign() * ((exit_price - record.entry_price) / record.entry_price) * 100.0
        } else {
            0.0
        };

        self.audit.record_completed_trade(CompletedTradeRecord {
            id: Uuid::new_v4(),
            user_id: user.id,
            venue: signal.venue,
            symbol: signal.symbol.clone(),
            side: record.side,
            quantity: record.quantity,
            entry_price: record.entry_price,
            exit_price,
            opened_at: record.opened_at,
            closed_at: Utc::now(),
            exit_reason: ExitReason::Manual,
            realized_pnl_usd,
            realized_pnl_pct,
            strategy_id: signal.strategy_id,
        });

        self.risk.invalidate_weekly_counts(user.id, signal.venue);

        Ok(DispatchOutcome::Closed(ClosedTrade {
            symbol: signal.symbol.clone(),
            venue: signal.venue,
            quantity: record.quantity,
            exit_price,
            order_id: ack.venue_order_id,
        }))
    }
}

/// RAII handle on a `PositionTracker` reservation. Releases the claim on
/// drop unless `commit()` is called, so any early return (via `?`) between
/// `try_reserve` and the final `tracker.open` gives the slot back instead of
/// leaking a permanently-reserved position.
struct ReservationGuard<'a> {
    tracker: &'a PositionTracker,
    key: PositionKey,
    committed: bool,
}

impl<'a> ReservationGuard<'a> {
    fn new(tracker: &'a PositionTracker, key: PositionKey) -> Self {
        Self {
            tracker,
            key,
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.tracker.release_reservation(&self.key);
        }
    }
}

fn bracket_price(side: Side, entry_price: f64, pct: f64, is_stop_loss: bool) -> f64 {
    let frac = pct / 100.0;
    match (side, is_stop_loss) {
        (Side::Long, true) => entry_price * (1.0 - frac),
        (Side::Long, false) => entry_price * (1.0 + frac),
        (Side::Short, true) => entry_price * (1.0 + frac),
        (Side::Short, false) => entry_price * (1.0 - frac),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_stop_loss_is_below_entry() {
        assert_eq!(bracket_price(Side::Long, 100.0, 2.0, true), 98.0);
    }

    #[test]
    fn long_take_profit_is_above_entry() {
        assert_eq!(bracket_price(Side::Long, 100.0, 4.0, false), 104.0);
    }

    #[test]
    fn short_stop_loss_is_above_entry() {
        assert_eq!(bracket_price(Side::Short, 100.0, 2.0, true), 102.0);
    }

    #[test]
    fn short_take_profit_is_below_entry() {
        assert_eq!(bracket_price(Side::Short, 100.0, 4.0, false), 96.0);
    }
}
