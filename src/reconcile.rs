// =============================================================================
// Reconciliation Loop (C8) — periodic mark-price refresh + drift closeout
// =============================================================================
//
// Every tick refreshes mark price and unrealized P&L for every tracked
// position. Every tenth tick additionally diffs the tracker against each
// `(user, venue)`'s venue-reported positions and closes out anything that
// vanished on the venue side, classifying the exit reason by proximity to
// the stored stop-loss/take-profit price. Per-position failures are isolated
// so one bad adapter call never halts the sweep.
// =============================================================================

use crate::audit::AuditSink;
use crate::datastore::CompletedTradeRecord;
use crate::position_engine::{PositionKey, PositionTracker};
use crate::risk::RiskGate;
use crate::types::{ExitReason, UserId, Venue};
use crate::venue::factory::AdapterFactory;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const FULL_RECONCILE_EVERY_N_SWEEPS: u32 = 10;
/// A venue-reported exit price within this fraction of the stored SL/TP
/// price is attributed to that bracket rather than classified `AutoClose`.
const EXIT_PRICE_TOLERANCE_PCT: f64 = 0.01;

#[derive(Debug, Clone, Default)]
pub struct ReconcileResult {
    pub positions_refreshed: u32,
    pub positions_closed: u32,
    pub failures: u32,
}

pub struct ReconciliationLoop {
    tracker: Arc<PositionTracker>,
    adapters: Arc<AdapterFactory>,
    risk: Arc<RiskGate>,
    audit: Arc<AuditSink>,
    sweep_count: std::sync::atomic::AtomicU32,
}

impl ReconciliationLoop {
    pub fn new(
        tracker: Arc<PositionTracker>,
        adapters: Arc<AdapterFactory>,
        risk: Arc<RiskGate>,
        audit: Arc<AuditSink>,
    ) -> Self {
        Self {
            tracker,
            adapters,
            risk,
            audit,
            sweep_count: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Run forever on `SWEEP_INTERVAL`, until `shutdown` resolves. The
    /// in-flight sweep is always allowed to finish before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = self.sweep_once().await;
                    debug!(?result, "reconciliation sweep completed");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciliation loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    #[instrument(skip(self), name = "reconcile::sweep")]
    pub async fn sweep_once(&self) -> ReconcileResult {
        let mut result = ReconcileResult::default();
        let snapshot = self.tracker.all();

        for (key, record) in &snapshot {
            let adapter = match self.adapters.get_adapter(key.user_id, key.venue).await {
                Ok(a) => a,
                Err(err) => {
                    warn!(user_id = %key.user_id, venue = %key.venue, error = %err, "reconcile: adapter unavailable");
                    result.failures += 1;
                    continue;
                }
            };
            match adapter.get_ticker(&key.symbol).await {
                Ok(ticker) => {
                    self.tracker.update_mark_price(key, ticker.last_price);
                    result.positions_refreshed += 1;
                }
                Err(err) => {
                    warn!(symbol = %key.symbol, error = %err, "reconcile: ticker refresh failed");
                    result.failures += 1;
                }
            }
            let _ = record;
        }

        let sweep_number = self
            .sweep_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if sweep_number % FULL_RECONCILE_EVERY_N_SWEEPS == 0 {
            let closed = self.full_reconcile(&snapshot).await;
            result.positions_closed += closed;
        }

        result
    }

    /// Diff every distinct `(user, venue)` pair present in `snapshot` against
    /// venue truth and close out anything the venue no longer reports.
    async fn full_reconcile(&self, snapshot: &[(PositionKey, crate::position_engine::PositionRecord)]) -> u32 {
        let mut pairs: HashSet<(UserId, Venue)> = HashSet::new();
        for (key, _) in snapshot {
            pairs.insert((key.user_id, key.venue));
        }

        let mut closed = 0;
        for (user_id, venue) in pairs {
            match self.reconcile_pair(user_id, venue, snapshot).await {
                Ok(n) => closed += n,
                Err(err) => warn!(%user_id, %venue, error = %err, "reconcile: full sweep failed for pair"),
            }
        }
        closed
    }

    async fn reconcile_pair(
        &self,
        user_id: UserId,
        venue: Venue,
        snapshot: &[(PositionKey, crate::position_engine::PositionRecord)],
    ) -> anyhow::Result<u32> {
        let adapter = self.adapters.get_adapter(user_id, venue).await?;
        let venue_positions = adapter.get_positions().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        let live_symbols: HashSet<&str> = venue_positions
            .iter()
            .filter(|p| p.quantity > 0.0)
            .map(|p| p.symbol.as_str())
            .collect();

        let mut closed = 0;
        for (key, record) in snapshot {
            if key.user_id != user_id || key.venue != venue {
                continue;
            }
            if live_symbols.contains(key.symbol.as_str()) {
                continue;
            }

            let exit_price = match adapter.get_ticker(&key.symbol).await {
                Ok(t) => t.last_price,
                Err(_) => record.mark_price,
            };
            let exit_reason = classify_exit_reason(exit_price, record.stop_loss_price, record.take_profit_price);
            let realized_pnl_usd = record.side.sign() * (exit_price - record.entry_price) * record.quantity;
            let realized_pnl_pct = if record.entry_price > 0.0 {
                record.side.sign() * ((exit_price - record.entry_price) / record.entry_price) * 100.0
            } else {
                0.0
            };

            self.audit.record_completed_trade(CompletedTradeRecord {
                id: Uuid::new_v4(),
                user_id,
                venue,
                symbol: key.symbol.clone(),
                side: record.side,
                quantity: record.quantity,
                entry_price: record.entry_price,
                exit_price,
                opened_at: record.opened_at,
                closed_at: Utc::now(),
                exit_reason,
                realized_pnl_usd,
                realized_pnl_pct,
                strategy_id: None,
            });

            self.tracker.close(key);
            self.risk.invalidate_weekly_counts(user_id, venue);
            info!(%user_id, %venue, symbol = %key.symbol, ?exit_reason, realized_pnl_usd, "position closed out-of-band by reconciliation");
            closed += 1;
        }

        Ok(closed)
    }
}

fn classify_exit_reason(exit_price: f64, stop_loss: Option<f64>, take_profit: Option<f64>) -> ExitReason {
    if let Some(sl) = stop_loss {
        if within_tolerance(exit_price, sl) {
            return ExitReason::StopLoss;
        }
    }
    if let Some(tp) = take_profit {
        if within_tolerance(exit_price, tp) {
            return ExitReason::TakeProfit;
        }
    }
    ExitReason::AutoClose
}

fn within_tolerance(price: f64, reference: f64) -> bool {
    if reference <= 0.0 {
        return false;
    }
    ((price - reference) / reference).abs() <= EXIT_PRICE_TOLERANCE_PCT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_within_one_percent_of_stop_loss_classifies_as_stop_loss() {
        assert_eq!(classify_exit_reason(48995.0, Some(49000.0), Some(52000.0)), ExitReason::StopLoss);
    }

    #[test]
    fn price_near_take_profit_classifies_as_take_profit() {
        assert_eq!(classify_exit_reason(51900.0, Some(49000.0), Some(52000.0)), ExitReason::TakeProfit);
    }

    #[test]
    fn price_far_from_either_bracket_classifies_as_auto_close() {
        assert_eq!(classify_exit_reason(50500.0, Some(49000.0), Some(52000.0)), ExitReason::AutoClose);
    }

    #[test]
    fn missing_brackets_classify_as_auto_close() {
        assert_eq!(classify_exit_reason(50500.0, None, None), ExitReason::AutoClose);
    }
}
