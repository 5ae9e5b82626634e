// =============================================================================
// Copy-Trading Fan-Out (C9) — mirror a successful trade onto active followers
// =============================================================================
//
// Runs entirely after the originator's response has already been returned:
// the dispatcher spawns `spawn_fan_out` and moves on. Each follower re-enters
// the dispatcher's own pipeline as a synthetic signal, so the follower's
// quota/risk/ML gates apply exactly as they would to a direct webhook.
// A follower whose drawdown has already tripped its stop is paused and
// skipped rather than traded into further loss. Concurrency across followers
// is bounded by a semaphore sized from configuration, to avoid bursting a
// shared downstream adapter far harder than a single webhook would.
// =============================================================================

use crate::datastore::{CopiedTradeRecord, CopyRelationship, Datastore};
use crate::dispatcher::{Dispatcher, DispatchOutcome};
use crate::signal::{Signal, SignalSource};
use crate::types::{Action, OrderType, Side, UserId, Venue};
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Everything the fan-out needs from the trade that triggered it, captured
/// at the moment it succeeded so the background task doesn't need to borrow
/// back into the request path.
#[derive(Debug, Clone)]
pub struct OriginatorTrade {
    pub originator_trade_id: Uuid,
    pub venue: Venue,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub notional_usd: f64,
    pub stop_loss_percent: Option<f64>,
    pub take_profit_percent: Option<f64>,
    pub strategy_id: Option<Uuid>,
}

pub struct CopyFanout {
    dispatcher: Weak<Dispatcher>,
    datastore: Arc<dyn Datastore>,
    semaphore: Arc<Semaphore>,
}

impl CopyFanout {
    pub fn new(dispatcher: Weak<Dispatcher>, datastore: Arc<dyn Datastore>, concurrency: usize) -> Self {
        Self {
            dispatcher,
            datastore,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Spawns the fan-out in the background and returns immediately. A no-op
    /// if the originating signal carried no strategy id, since copy
    /// relationships are keyed on originator strategy.
    pub fn spawn_fan_out(&self, trade: OriginatorTrade) {
        let Some(strategy_id) = trade.strategy_id else {
            return;
        };
        let dispatcher = self.dispatcher.clone();
        let datastore = self.datastore.clone();
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            run_fan_out(dispatcher, datastore, semaphore, strategy_id, trade).await;
        });
    }
}

#[instrument(skip(dispatcher, datastore, semaphore, trade), name = "copy_trading::fan_out", fields(strategy_id = %strategy_id))]
async fn run_fan_out(
    dispatcher: Weak<Dispatcher>,
    datastore: Arc<dyn Datastore>,
    semaphore: Arc<Semaphore>,
    strategy_id: Uuid,
    trade: OriginatorTrade,
) {
    let relationships = match datastore.list_active_copy_relationships(strategy_id).await {
        Ok(r) => r,
        Err(err) => {
            warn!(error = %err, "copy-trading: failed to list active relationships");
            return;
        }
    };

    let mut handles = Vec::with_capacity(relationships.len());
    for relationship in relationships {
        let dispatcher = dispatcher.clone();
        let datastore = datastore.clone();
        let semaphore = semaphore.clone();
        let trade = trade.clone();
        handles.push(tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            fan_out_to_follower(dispatcher, datastore, relationship, trade).await;
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
}

async fn fan_out_to_follower(
    dispatcher: Weak<Dispatcher>,
    datastore: Arc<dyn Datastore>,
    relationship: CopyRelationship,
    trade: OriginatorTrade,
) {
    if relationship.current_drawdown_pct >= relationship.max_drawdown_stop_pct {
        if let Err(err) = datastore.pause_copy_relationship(relationship.id).await {
            warn!(relationship_id = %relationship.id, error = %err, "copy-trading: failed to pause relationship past its drawdown stop");
        }
        return;
    }

    let Some(dispatcher) = dispatcher.upgrade() else {
        return;
    };

    let follower_user = match dispatcher.credentials().get_user_by_id(relationship.follower_user_id).await {
        Ok(Some(user)) if user.active => user,
        Ok(_) => {
            warn!(relationship_id = %relationship.id, "copy-trading: follower user missing or inactive, skipping");
            return;
        }
        Err(err) => {
            warn!(relationship_id = %relationship.id, error = %err, "copy-trading: follower lookup failed");
            return;
        }
    };

    let follower_notional = trade.notional_usd * relationship.allocation_pct / 100.0;

    let synthetic = Signal {
        venue: trade.venue,
        action: action_for_side(trade.side),
        symbol: trade.symbol.clone(),
        order_type: trade.order_type,
        limit_price: trade.limit_price,
        position_size_usd: Some(follower_notional),
        stop_loss_percent: trade.stop_loss_percent,
        take_profit_percent: trade.take_profit_percent,
        strategy_id: trade.strategy_id,
        strategy_name: None,
        source: SignalSource::Copy {
            originator_trade_id: trade.originator_trade_id,
        },
        extra: Default::default(),
    };

    match dispatcher.dispatch_for_user(&follower_user, synthetic).await {
        Ok(DispatchOutcome::Opened(opened)) => {
            let copied = CopiedTradeRecord {
                id: Uuid::new_v4(),
                copy_relationship_id: relationship.id,
                originator_trade_id: trade.originator_trade_id,
                follower_trade_id: Uuid::new_v4(),
                symbol: opened.symbol,
                side: trade.side,
                originator_notional_usd: trade.notional_usd,
                follower_notional_usd: follower_notional,
            };
            if let Err(err) = datastore.append_copied_trade(copied).await {
                warn!(relationship_id = %relationship.id, error = %err, "copy-trading: failed to record copied trade");
            }
        }
        Ok(_) => {}
        Err(err) => {
            warn!(
                relationship_id = %relationship.id,
                follower_user_id = %relationship.follower_user_id,
                error = %err,
                "copy-trading: fan-out failed for follower"
            );
        }
    }
}

fn action_for_side(side: Side) -> Action {
    match side {
        Side::Long => Action::Long,
        Side::Short => Action::Short,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CopyStatus;

    fn sample_relationship(drawdown: f64, stop: f64) -> CopyRelationship {
        CopyRelationship {
            id: Uuid::new_v4(),
            follower_user_id: Uuid::new_v4(),
            originator_strategy_id: Uuid::new_v4(),
            allocation_pct: 25.0,
            max_drawdown_stop_pct: stop,
            current_drawdown_pct: drawdown,
            status: CopyStatus::Active,
        }
    }

    #[test]
    fn action_for_side_maps_long_and_short() {
        assert_eq!(action_for_side(Side::Long), Action::Long);
        assert_eq!(action_for_side(Side::Short), Action::Short);
    }

    #[tokio::test]
    async fn drawdown_past_stop_pauses_the_relationship() {
        let datastore: Arc<dyn Datastore> = Arc::new(crate::datastore::InMemoryDatastore::new());
        let relationship = sample_relationship(20.0, 15.0);
        datastore
            .pause_copy_relationship(relationship.id)
            .await
            .expect("in-memory datastore never fails");
        // The relationship id is not tracked by the in-memory store unless
        // inserted first; this just exercises the pause path directly since
        // `fan_out_to_follower` needs a live `Dispatcher` to drive further.
        assert!(relationship.current_drawdown_pct >= relationship.max_drawdown_stop_pct);
    }
}
