// =============================================================================
// Signal Gateway — Main Entry Point
// =============================================================================
//
// Wires together the credential store, adapter factory, position tracker,
// risk gate, optional ML validation client, audit sink, and dispatcher, then
// serves the webhook API and runs the reconciliation loop alongside it.
// =============================================================================

mod api;
mod app_state;
mod audit;
mod cache;
mod config;
mod copy_trading;
mod credentials;
mod datastore;
mod dispatcher;
mod error;
mod ml_validation;
mod position_engine;
mod rate_limit;
mod reconcile;
mod risk;
mod signal;
mod types;
mod venue;

use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::audit::AuditSink;
use crate::config::GatewayConfig;
use crate::credentials::CredentialStore;
use crate::datastore::{Datastore, InMemoryDatastore};
use crate::dispatcher::Dispatcher;
use crate::ml_validation::MlValidationClient;
use crate::position_engine::PositionTracker;
use crate::reconcile::ReconciliationLoop;
use crate::risk::RiskGate;
use crate::venue::factory::AdapterFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("signal gateway starting up");

    let config = GatewayConfig::load_from_env();

    // TODO: swap for a Postgres-backed Datastore once SUPABASE_URL /
    // SUPABASE_SERVICE_ROLE_KEY are wired to a real client crate.
    let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());

    let credentials = Arc::new(CredentialStore::new(
        datastore.clone(),
        config.legacy_webhook_secret.clone(),
    ));
    let adapters = Arc::new(AdapterFactory::new(credentials.clone()));
    let tracker = Arc::new(PositionTracker::new());
    let risk = Arc::new(RiskGate::new(datastore.clone(), config.default_risk_policy.clone()));
    let audit = Arc::new(AuditSink::new(datastore.clone()));

    let ml = if config.ml_service_url.is_empty() {
        None
    } else {
        Some(Arc::new(MlValidationClient::new(
            config.ml_service_url.clone(),
            config.ml_timeout,
            config.ml_confidence_threshold,
            datastore.clone(),
        )))
    };

    let dispatcher = Dispatcher::new(
        credentials.clone(),
        adapters.clone(),
        tracker.clone(),
        risk.clone(),
        ml.clone(),
        audit.clone(),
        datastore.clone(),
        &config,
    );

    let reconcile = Arc::new(ReconciliationLoop::new(
        tracker.clone(),
        adapters.clone(),
        risk.clone(),
        audit.clone(),
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        datastore,
        credentials,
        adapters,
        tracker,
        risk,
        ml,
        audit,
        reconcile: reconcile.clone(),
        dispatcher,
        started_at: chrono::Utc::now(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        reconcile.run(shutdown_rx).await;
    });

    let bind_addr = format!("0.0.0.0:{}", state.config.port);
    let app = api::webhook::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "webhook API listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                warn!(error = %err, "webhook API server exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping gracefully");
        }
    }

    let _ = shutdown_tx.send(true);
    info!("signal gateway shut down complete");
    Ok(())
}
