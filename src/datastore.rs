// =============================================================================
// Datastore — the external persistence boundary
// =============================================================================
//
// Everything the gateway reads or writes that outlives a single process lives
// behind this trait: users, venue credentials, completed trades, decision
// logs, notifications, and copy-trading relationships. A production binary
// supplies a Postgres-backed implementation; this crate ships only the
// in-memory fake used by tests and by `InMemoryDatastore::demo()` for local
// smoke-testing.
// =============================================================================

use crate::types::{CopyStatus, ExitReason, PlanTier, Side, UserId, Venue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub webhook_secret: String,
    pub plan: PlanTier,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct VenueCredential {
    pub user_id: UserId,
    pub venue: Venue,
    pub environment: crate::types::Environment,
    pub fields: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CompletedTradeRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub venue: Venue,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub realized_pnl_usd: f64,
    pub realized_pnl_pct: f64,
    pub strategy_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct DecisionLogRecord {
    pub id: Uuid,
    pub strategy_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub input_summary: String,
    pub ml_confidence: Option<f64>,
    pub ml_reasons: Vec<String>,
    pub allowed: bool,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct CopyRelationship {
    pub id: Uuid,
    pub follower_user_id: UserId,
    pub originator_strategy_id: Uuid,
    pub allocation_pct: f64,
    pub max_drawdown_stop_pct: f64,
    pub current_drawdown_pct: f64,
    pub status: CopyStatus,
}

#[derive(Debug, Clone)]
pub struct CopiedTradeRecord {
    pub id: Uuid,
    pub copy_relationship_id: Uuid,
    pub originator_trade_id: Uuid,
    pub follower_trade_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub originator_notional_usd: f64,
    pub follower_notional_usd: f64,
}

/// The external persistence boundary. Implementations are free to be
/// eventually consistent on reads; the components that consume this trait
/// layer their own TTL caches on top (see `cache::TtlCache`).
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn find_user_by_secret(&self, secret: &str) -> anyhow::Result<Option<User>>;
    async fn find_user_by_id(&self, user_id: UserId) -> anyhow::Result<Option<User>>;
    async fn get_venue_credential(
        &self,
        user_id: UserId,
        venue: Venue,
    ) -> anyhow::Result<Option<VenueCredential>>;

    async fn count_webhooks_this_month(&self, user_id: UserId) -> anyhow::Result<u32>;
    async fn record_webhook_accepted(&self, user_id: UserId) -> anyhow::Result<()>;

    async fn count_trades_this_week(&self, user_id: UserId, venue: Venue) -> anyhow::Result<u32>;
    async fn sum_losses_this_week(&self, user_id: UserId, venue: Venue) -> anyhow::Result<f64>;

    async fn append_completed_trade(&self, trade: CompletedTradeRecord) -> anyhow::Result<()>;
    async fn append_decision_log(&self, entry: DecisionLogRecord) -> anyhow::Result<()>;
    async fn append_notification(&self, notification: Notification) -> anyhow::Result<()>;

    async fn list_active_copy_relationships(
        &self,
        originator_strategy_id: Uuid,
    ) -> anyhow::Result<Vec<CopyRelationship>>;
    async fn append_copied_trade(&self, copied: CopiedTradeRecord) -> anyhow::Result<()>;
    async fn pause_copy_relationship(&self, id: Uuid) -> anyhow::Result<()>;
}

/// In-memory `Datastore` used by tests and local smoke-testing. Not intended
/// for production use: nothing survives process restart.
#[derive(Default)]
pub struct InMemoryDatastore {
    users: RwLock<HashMap<UserId, User>>,
    secrets: RwLock<HashMap<String, UserId>>,
    credentials: RwLock<HashMap<(UserId, Venue), VenueCredential>>,
    webhook_counts: RwLock<HashMap<UserId, u32>>,
    completed_trades: RwLock<Vec<CompletedTradeRecord>>,
    decision_logs: RwLock<Vec<DecisionLogRecord>>,
    notifications: RwLock<Vec<Notification>>,
    copy_relationships: RwLock<HashMap<Uuid, CopyRelationship>>,
    copied_trades: RwLock<Vec<CopiedTradeRecord>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: User) {
        self.secrets
            .write()
            .insert(user.webhook_secret.clone(), user.id);
        self.users.write().insert(user.id, user);
    }

    pub fn insert_credential(&self, credential: VenueCredential) {
        self.credentials
            .write()
            .insert((credential.user_id, credential.venue), credential);
    }

    pub fn insert_copy_relationship(&self, relationship: CopyRelationship) {
        self.copy_relationships
            .write()
            .insert(relationship.id, relationship);
    }

    pub fn completed_trades_snapshot(&self) -> Vec<CompletedTradeRecord> {
        self.completed_trades.read().clone()
    }

    pub fn notifications_snapshot(&self) -> Vec<Notification> {
        self.notifications.read().clone()
    }

    pub fn copied_trades_snapshot(&self) -> Vec<CopiedTradeRecord> {
        self.copied_trades.read().clone()
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn find_user_by_secret(&self, secret: &str) -> anyhow::Result<Option<User>> {
        let Some(user_id) = self.secrets.read().get(secret).copied() else {
            return Ok(None);
        };
        Ok(self.users.read().get(&user_id).cloned())
    }

    async fn find_user_by_id(&self, user_id: UserId) -> anyhow::Result<Option<User>> {
        Ok(self.users.read().get(&user_id).cloned())
    }

    async fn get_venue_credential(
        &self,
        user_id: UserId,
        venue: Venue,
    ) -> anyhow::Result<Option<VenueCredential>> {
        Ok(self.credentials.read().get(&(user_id, venue)).cloned())
    }

    async fn count_webhooks_this_month(&self, user_id: UserId) -> anyhow::Result<u32> {
        Ok(self.webhook_counts.read().get(&user_id).copied().unwrap_or(0))
    }

    async fn record_webhook_accepted(&self, user_id: UserId) -> anyhow::Result<()> {
        *self.webhook_counts.write().entry(user_id).or_insert(0) += 1;
        Ok(())
    }

    async fn count_trades_this_week(&self, user_id: UserId, venue: Venue) -> anyhow::Result<u32> {
        let week_start = crate::risk::current_iso_week_start();
        Ok(self
            .completed_trades
            .read()
            .iter()
            .filter(|t| t.user_id == user_id && t.venue == venue && t.closed_at >= week_start)
            .count() as u32)
    }

    async fn sum_losses_this_week(&self, user_id: UserId, venue: Venue) -> anyhow::Result<f64> {
        let week_start = crate::risk::current_iso_week_start();
        Ok(self
            .completed_trades
            .read()
            .iter()
            .filter(|t| {
                t.user_id == user_id
                    && t.venue == venue
                    && t.closed_at >= week_start
                    && t.realized_pnl_usd < 0.0
            })
            .map(|t| t.realized_pnl_usd.abs())
            .sum())
    }

    async fn append_completed_trade(&self, trade: CompletedTradeRecord) -> anyhow::Result<()> {
        self.completed_trades.write().push(trade);
        Ok(())
    }

    async fn append_decision_log(&self, entry: DecisionLogRecord) -> anyhow::Result<()> {
        self.decision_logs.write().push(entry);
        Ok(())
    }

    async fn append_notification(&self, notification: Notification) -> anyhow::Result<()> {
        self.notifications.write().push(notification);
        Ok(())
    }

    async fn list_active_copy_relationships(
        &self,
        originator_strategy_id: Uuid,
    ) -> anyhow::Result<Vec<CopyRelationship>> {
        Ok(self
            .copy_relationships
            .read()
            .values()
            .filter(|r| {
                r.originator_strategy_id == originator_strategy_id
                    && r.status == CopyStatus::Active
            })
            .cloned()
            .collect())
    }

    async fn append_copied_trade(&self, copied: CopiedTradeRecord) -> anyhow::Result<()> {
        self.copied_trades.write().push(copied);
        Ok(())
    }

    async fn pause_copy_relationship(&self, id: Uuid) -> anyhow::Result<()> {
        if let Some(r) = self.copy_relationships.write().get_mut(&id) {
            r.status = CopyStatus::Paused;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Environment;

    fn sample_user() -> User {
        User {
            id: Uuid::new_v4(),
            webhook_secret: "s1".into(),
            plan: PlanTier::Basic,
            active: true,
        }
    }

    #[tokio::test]
    async fn find_user_by_secret_roundtrips() {
        let store = InMemoryDatastore::new();
        let user = sample_user();
        store.insert_user(user.clone());
        let found = store.find_user_by_secret("s1").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
    }

    #[tokio::test]
    async fn unknown_secret_returns_none() {
        let store = InMemoryDatastore::new();
        assert!(store.find_user_by_secret("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn webhook_counter_increments() {
        let store = InMemoryDatastore::new();
        let user = sample_user();
        store.insert_user(user.clone());
        store.record_webhook_accepted(user.id).await.unwrap();
        store.record_webhook_accepted(user.id).await.unwrap();
        assert_eq!(store.count_webhooks_this_month(user.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn credential_lookup_roundtrips() {
        let store = InMemoryDatastore::new();
        let user = sample_user();
        store.insert_credential(VenueCredential {
            user_id: user.id,
            venue: Venue::PerpDexA,
            environment: Environment::Sandbox,
            fields: HashMap::from([("api_key".to_string(), "k".to_string())]),
        });
        let found = store
            .get_venue_credential(user.id, Venue::PerpDexA)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.fields.get("api_key").unwrap(), "k");
    }
}
