// =============================================================================
// Position Tracker (C4) — one open record per (user, venue, symbol)
// =============================================================================
//
// Backed by `dashmap` rather than a single `RwLock<Vec<_>>` so lookups for
// unrelated keys never contend with each other: under concurrent webhook
// traffic across many users this is the difference between one lock per
// request and one lock for the whole tracker.
// =============================================================================

use crate::types::{Side, UserId, Venue};
use crate::venue::VenueAdapter;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub user_id: UserId,
    pub venue: Venue,
    pub symbol: String,
}

impl PositionKey {
    pub fn new(user_id: UserId, venue: Venue, symbol: impl Into<String>) -> Self {
        Self {
            user_id,
            venue,
            symbol: symbol.into(),
        }
    }
}

/// A tracked open position. Mirrors the Position entity; mutated only by
/// price refresh and by close.
#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub entry_order_id: Option<String>,
    pub stop_loss_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    pub mark_price: f64,
    pub unrealized_pnl_usd: f64,
    /// True if this record was adopted during reconciliation rather than
    /// opened through the dispatcher (so its order ids are unknown).
    pub synced: bool,
}

impl PositionRecord {
    fn refresh_pnl(&mut self, mark_price: f64) {
        self.mark_price = mark_price;
        self.unrealized_pnl_usd = self.side.sign() * (mark_price - self.entry_price) * self.quantity;
    }
}

/// A tracker slot is either held open by a finalized position, or merely
/// claimed while a request is still placing the entry order. The claim
/// exists so the presence check and the eventual insert are a single atomic
/// map operation rather than two, straddling an `await`.
#[derive(Debug, Clone)]
enum Slot {
    Reserved,
    Open(PositionRecord),
}

pub struct PositionTracker {
    positions: DashMap<PositionKey, Slot>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
        }
    }

    pub fn has(&self, key: &PositionKey) -> bool {
        self.positions.contains_key(key)
    }

    pub fn get(&self, key: &PositionKey) -> Option<PositionRecord> {
        match self.positions.get(key)?.value() {
            Slot::Open(record) => Some(record.clone()),
            Slot::Reserved => None,
        }
    }

    /// Atomically claim `key` ahead of placing an entry order. Returns
    /// `false` if the slot is already reserved or open, in which case the
    /// caller must fail with `AlreadyOpen` rather than proceed — this is the
    /// single map operation that makes check-then-open safe under
    /// concurrent requests for the same `(user, venue, symbol)`.
    pub fn try_reserve(&self, key: PositionKey) -> bool {
        match self.positions.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Slot::Reserved);
                true
            }
        }
    }

    /// Give up a claim taken by `try_reserve` without finalizing it, e.g.
    /// because order placement failed. No-op if the slot was already
    /// finalized or released.
    pub fn release_reservation(&self, key: &PositionKey) {
        self.positions.remove_if(key, |_, slot| matches!(slot, Slot::Reserved));
    }

    /// Finalize a reservation taken by `try_reserve` with the now-open
    /// position's record.
    #[instrument(skip(self, record), name = "position_tracker::open")]
    pub fn open(&self, key: PositionKey, record: PositionRecord) {
        info!(user_id = %key.user_id, venue = %key.venue, symbol = %key.symbol, "position opened");
        self.positions.insert(key, Slot::Open(record));
    }

    /// Refresh mark price and unrealized P&L for an existing record.
    pub fn update_mark_price(&self, key: &PositionKey, mark_price: f64) {
        if let Some(mut entry) = self.positions.get_mut(key) {
            if let Slot::Open(record) = entry.value_mut() {
                record.refresh_pnl(mark_price);
            }
        }
    }

    pub fn close(&self, key: &PositionKey) -> Option<PositionRecord> {
        match self.positions.remove(key) {
            Some((_, Slot::Open(record))) => Some(record),
            _ => None,
        }
    }

    pub fn all(&self) -> Vec<(PositionKey, PositionRecord)> {
        self.positions
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Open(record) => Some((entry.key().clone(), record.clone())),
                Slot::Reserved => None,
            })
            .collect()
    }

    /// Replace the subset of positions for `(user, venue)` with the
    /// adapter's view of truth. Positions the venue no longer reports are
    /// dropped; positions the venue reports that weren't tracked are
    /// adopted with `synced = true`.
    #[instrument(skip(self, adapter), name = "position_tracker::sync_from_venue")]
    pub async fn sync_from_venue(
        &self,
        adapter: &dyn VenueAdapter,
        user_id: UserId,
        venue: Venue,
    ) -> anyhow::Result<()> {
        let venue_positions = adapter
            .get_positions()
            .await
            .map_err(|e| anyhow::anyhow!("sync_from_venue: {e}"))?;

        let tracked_symbols: Vec<String> = self
            .positions
            .iter()
            .filter(|e| {
                e.key().user_id == user_id && e.key().venue == venue && matches!(e.value(), Slot::Open(_))
            })
            .map(|e| e.key().symbol.clone())
            .collect();

        let venue_symbols: std::collections::HashSet<&str> =
            venue_positions.iter().map(|p| p.symbol.as_str()).collect();

        for symbol in tracked_symbols {
            if !venue_symbols.contains(symbol.as_str()) {
                self.positions.remove(&PositionKey::new(user_id, venue, symbol));
            }
        }

        for vp in venue_positions {
            if vp.quantity <= 0.0 {
                continue;
            }
            let key = PositionKey::new(user_id, venue, vp.symbol.clone());
            if self.positions.contains_key(&key) {
                self.update_mark_price(&key, vp.mark_price);
                continue;
            }
            self.positions.insert(
                key,
                Slot::Open(PositionRecord {
                    side: vp.side,
                    quantity: vp.quantity,
                    entry_price: vp.entry_price,
                    opened_at: Utc::now(),
                    stop_loss_price: None,
                    take_profit_price: None,
                    entry_order_id: None,
                    stop_loss_order_id: None,
                    take_profit_order_id: None,
                    mark_price: vp.mark_price,
                    unrealized_pnl_usd: vp.unrealized_pnl_usd,
                    synced: true,
                }),
            );
        }

        Ok(())
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("open_positions", &self.positions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_record(entry_price: f64) -> PositionRecord {
        PositionRecord {
            side: Side::Long,
            quantity: 1.0,
            entry_price,
            opened_at: Utc::now(),
            stop_loss_price: Some(entry_price * 0.98),
            take_profit_price: Some(entry_price * 1.04),
            entry_order_id: Some("ord-1".to_string()),
            stop_loss_order_id: None,
            take_profit_order_id: None,
            mark_price: entry_price,
            unrealized_pnl_usd: 0.0,
            synced: false,
        }
    }

    #[test]
    fn open_then_has_then_get_roundtrips() {
        let tracker = PositionTracker::new();
        let key = PositionKey::new(Uuid::nil(), Venue::PerpDexA, "BTCUSDT");
        assert!(!tracker.has(&key));
        tracker.open(key.clone(), sample_record(100.0));
        assert!(tracker.has(&key));
        assert_eq!(tracker.get(&key).unwrap().entry_price, 100.0);
    }

    #[test]
    fn update_mark_price_recomputes_unrealized_pnl() {
        let tracker = PositionTracker::new();
        let key = PositionKey::new(Uuid::nil(), Venue::PerpDexA, "BTCUSDT");
        tracker.open(key.clone(), sample_record(100.0));
        tracker.update_mark_price(&key, 110.0);
        assert_eq!(tracker.get(&key).unwrap().unrealized_pnl_usd, 10.0);
    }

    #[test]
    fn close_removes_and_returns_the_record() {
        let tracker = PositionTracker::new();
        let key = PositionKey::new(Uuid::nil(), Venue::PerpDexA, "BTCUSDT");
        tracker.open(key.clone(), sample_record(100.0));
        let removed = tracker.close(&key);
        assert!(removed.is_some());
        assert!(!tracker.has(&key));
        assert!(tracker.close(&key).is_none());
    }

    #[test]
    fn all_snapshots_every_tracked_position() {
        let tracker = PositionTracker::new();
        tracker.open(PositionKey::new(Uuid::nil(), Venue::PerpDexA, "BTCUSDT"), sample_record(100.0));
        tracker.open(PositionKey::new(Uuid::nil(), Venue::ForexBroker, "EURUSD"), sample_record(1.1));
        assert_eq!(tracker.all().len(), 2);
    }

    #[test]
    fn second_reservation_on_the_same_key_fails() {
        let tracker = PositionTracker::new();
        let key = PositionKey::new(Uuid::nil(), Venue::PerpDexA, "BTCUSDT");
        assert!(tracker.try_reserve(key.clone()));
        assert!(!tracker.try_reserve(key.clone()));
    }

    #[test]
    fn reservation_blocks_has_but_not_get() {
        let tracker = PositionTracker::new();
        let key = PositionKey::new(Uuid::nil(), Venue::PerpDexA, "BTCUSDT");
        tracker.try_reserve(key.clone());
        assert!(tracker.has(&key));
        assert!(tracker.get(&key).is_none());
    }

    #[test]
    fn released_reservation_can_be_reclaimed() {
        let tracker = PositionTracker::new();
        let key = PositionKey::new(Uuid::nil(), Venue::PerpDexA, "BTCUSDT");
        tracker.try_reserve(key.clone());
        tracker.release_reservation(&key);
        assert!(!tracker.has(&key));
        assert!(tracker.try_reserve(key));
    }

    #[test]
    fn open_finalizes_a_reservation() {
        let tracker = PositionTracker::new();
        let key = PositionKey::new(Uuid::nil(), Venue::PerpDexA, "BTCUSDT");
        tracker.try_reserve(key.clone());
        tracker.open(key.clone(), sample_record(100.0));
        assert_eq!(tracker.get(&key).unwrap().entry_price, 100.0);
        tracker.release_reservation(&key);
        assert!(tracker.has(&key), "release must not touch a finalized Open slot");
    }
}
