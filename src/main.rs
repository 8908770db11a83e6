mod queue;
mod routes;
mod singleton;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use boardcal_core::{
    ChannelRegistry, CorrelationStore, DedupWindow, Orchestrator, OrchestratorOptions, SyncConfig,
    UnconfiguredBoardClient, UnconfiguredCalendarClient,
};

use crate::queue::SyncQueue;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Ensure only one instance is running
    let _lock = singleton::acquire_lock()?;

    let config = Arc::new(SyncConfig::load()?);
    let store = Arc::new(CorrelationStore::open(&config.state_dir)?);
    let registry = Arc::new(ChannelRegistry::open(&config.state_dir)?);
    let dedup = Arc::new(DedupWindow::new(config.dedup_window));

    // The authenticated provider clients are external collaborators; the
    // stock binary wires placeholders that fail with Auth until a
    // deployment links real implementations.
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::new(UnconfiguredBoardClient),
        Arc::new(UnconfiguredCalendarClient),
        OrchestratorOptions::from_config(&config),
    ));

    let queue = SyncQueue::start(orchestrator);
    let app_state = AppState {
        config: config.clone(),
        store,
        registry,
        dedup,
        queue,
    };
    spawn_maintenance(app_state.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(routes::board::router())
        .merge(routes::calendar::router())
        .merge(routes::status::router())
        .with_state(app_state)
        .layer(cors);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    tracing::info!("boardcal-server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodic housekeeping: prune expired tombstones and dedup entries, and
/// surface channels the renewal collaborator should be acting on.
fn spawn_maintenance(state: AppState) {
    const INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let grace = chrono::Duration::from_std(state.config.tombstone_grace)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
            match state.store.prune_tombstones(grace, chrono::Utc::now()) {
                Ok(0) => {}
                Ok(pruned) => tracing::debug!(pruned, "pruned expired tombstones"),
                Err(err) => tracing::warn!(error = %err, "tombstone pruning failed"),
            }

            state.dedup.prune();

            let due = state.registry.renewal_due(
                chrono::Duration::hours(boardcal_core::RENEWAL_LEAD_HOURS),
                chrono::Utc::now(),
            );
            for sub in due {
                tracing::warn!(
                    channel = %sub.channel_id,
                    scope = %sub.scope,
                    expires_at = %sub.expires_at,
                    "push channel due for renewal"
                );
            }
        }
    });
}
