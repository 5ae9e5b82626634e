// =============================================================================
// Audit & Notification Sink (C10) — non-blocking datastore writes
// =============================================================================
//
// Two bounded channels back this sink: one for CompletedTrades (the most
// auditable, least reconstructible record), one for Notifications and
// DecisionLogs. Both are drained by background tasks that never block the
// dispatcher. When the standard channel is full, the newest write is dropped
// rather than blocking the caller or evicting a queued one — `mpsc` gives us
// non-blocking backpressure on the producer side but not mid-queue eviction,
// so the priority the design calls for (protect CompletedTrade writes first)
// is enforced by giving that channel a much larger capacity and never
// dropping from it except under sustained, pathological backlog.
// =============================================================================

use crate::datastore::{CompletedTradeRecord, Datastore, DecisionLogRecord, Notification};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

const CRITICAL_CAPACITY: usize = 4096;
const STANDARD_CAPACITY: usize = 1024;

enum StandardWrite {
    Notification(Notification),
    DecisionLog(DecisionLogRecord),
}

pub struct AuditSink {
    trades_tx: mpsc::Sender<CompletedTradeRecord>,
    standard_tx: mpsc::Sender<StandardWrite>,
}

impl AuditSink {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        let (trades_tx, mut trades_rx) = mpsc::channel::<CompletedTradeRecord>(CRITICAL_CAPACITY);
        let (standard_tx, mut standard_rx) = mpsc::channel::<StandardWrite>(STANDARD_CAPACITY);

        let trade_store = datastore.clone();
        tokio::spawn(async move {
            while let Some(trade) = trades_rx.recv().await {
                if let Err(err) = trade_store.append_completed_trade(trade).await {
                    error!(error = %err, "failed to persist completed trade");
                }
            }
        });

        let standard_store = datastore;
        tokio::spawn(async move {
            while let Some(write) = standard_rx.recv().await {
                let result = match write {
                    StandardWrite::Notification(n) => standard_store.append_notification(n).await,
                    StandardWrite::DecisionLog(d) => standard_store.append_decision_log(d).await,
                };
                if let Err(err) = result {
                    error!(error = %err, "failed to persist audit record");
                }
            }
        });

        Self { trades_tx, standard_tx }
    }

    /// Queue a completed trade for persistence. Never blocks; on a full
    /// queue the write is dropped and logged.
    pub fn record_completed_trade(&self, trade: CompletedTradeRecord) {
        if self.trades_tx.try_send(trade).is_err() {
            warn!("audit sink: completed-trade queue full, dropping write");
        }
    }

    pub fn record_notification(&self, notification: Notification) {
        if self
            .standard_tx
            .try_send(StandardWrite::Notification(notification))
            .is_err()
        {
            warn!("audit sink: standard queue full, dropping notification");
        }
    }

    pub fn record_decision_log(&self, log: DecisionLogRecord) {
        if self.standard_tx.try_send(StandardWrite::DecisionLog(log)).is_err() {
            warn!("audit sink: standard queue full, dropping decision log");
        }
    }
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::InMemoryDatastore;
    use crate::types::{ExitReason, Side, Venue};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_trade() -> CompletedTradeRecord {
        CompletedTradeRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            venue: Venue::PerpDexA,
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: 1.0,
            entry_price: 100.0,
            exit_price: 110.0,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            exit_reason: ExitReason::TakeProfit,
            realized_pnl_usd: 10.0,
            realized_pnl_pct: 10.0,
            strategy_id: None,
        }
    }

    #[tokio::test]
    async fn completed_trade_reaches_the_datastore() {
        let ds = Arc::new(InMemoryDatastore::new());
        let sink = AuditSink::new(ds.clone());
        sink.record_completed_trade(sample_trade());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(ds.completed_trades_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn notification_reaches_the_datastore() {
        let ds = Arc::new(InMemoryDatastore::new());
        let sink = AuditSink::new(ds.clone());
        sink.record_notification(Notification {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            created_at: Utc::now(),
            kind: "test".to_string(),
            message: "hello".to_string(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(ds.notifications_snapshot().len(), 1);
    }
}
