// =============================================================================
// Shared application state — the handles every Axum route needs
// =============================================================================
//
// Everything here is already internally synchronised (`Arc`-wrapped, or a
// `dashmap`/`parking_lot`-backed component), so the state itself carries no
// lock of its own. Cloning an `AppState` is just bumping a handful of `Arc`
// reference counts.
// =============================================================================

use crate::audit::AuditSink;
use crate::config::GatewayConfig;
use crate::credentials::CredentialStore;
use crate::datastore::Datastore;
use crate::dispatcher::Dispatcher;
use crate::ml_validation::MlValidationClient;
use crate::position_engine::PositionTracker;
use crate::reconcile::ReconciliationLoop;
use crate::risk::RiskGate;
use crate::venue::factory::AdapterFactory;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct AppState {
    pub config: GatewayConfig,
    pub datastore: Arc<dyn Datastore>,
    pub credentials: Arc<CredentialStore>,
    pub adapters: Arc<AdapterFactory>,
    pub tracker: Arc<PositionTracker>,
    pub risk: Arc<RiskGate>,
    pub ml: Option<Arc<MlValidationClient>>,
    pub audit: Arc<AuditSink>,
    pub reconcile: Arc<ReconciliationLoop>,
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}
