// =============================================================================
// Horus Nexus — Main Entry Point
// =============================================================================
//
// Copy-trading dispatcher core: the Eye observes the captain's live fills,
// the Brain resolves intents against the client roster, the Smart Entry
// Engine plans liquidity-aware waves for risky entries, and the Fleet fans
// concrete orders out to every client's exchange account.
//
// Each subsystem runs as an independent task wrapped in a restart loop; only
// an Eye authentication failure is terminal for its task.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod api;
mod app_state;
mod brain;
mod bus;
mod config;
mod dedup;
mod eye;
mod fleet;
mod gateway;
mod market_data;
mod registry;
mod smart_entry;
mod soldier;
mod symbol;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::AlertPublisher;
use crate::app_state::AppState;
use crate::brain::Brain;
use crate::bus::{Bus, RedisBus};
use crate::config::EngineConfig;
use crate::eye::Eye;
use crate::fleet::FleetExecutor;
use crate::registry::{ClientRegistry, FileRegistry};
use crate::smart_entry::SmartEntryEngine;
use crate::soldier::SoldierRegistry;

/// Delay before restarting a failed subsystem loop.
const RESTART_DELAY_SECS: u64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Horus Nexus — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EngineConfig::from_env();
    info!(config = ?config, "configuration assembled");

    // ── 2. Client registry ───────────────────────────────────────────────
    let registry: Arc<dyn ClientRegistry> = match FileRegistry::load(&config.clients_file) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            warn!(error = %e, "client roster unavailable — starting with an empty registry");
            Arc::new(FileRegistry::empty())
        }
    };

    // ── 3. Bus ───────────────────────────────────────────────────────────
    let bus: Arc<dyn Bus> = Arc::new(RedisBus::connect(&config.redis_url).await?);

    // ── 4. Shared state & alert feed ─────────────────────────────────────
    let state = Arc::new(AppState::new());
    let alerts = Arc::new(AlertPublisher::new(
        bus.clone(),
        registry.clone(),
        state.clone(),
    ));

    // ── 5. Brain ─────────────────────────────────────────────────────────
    {
        let brain = Arc::new(Brain::new(bus.clone(), registry.clone(), state.clone()));
        tokio::spawn(async move {
            loop {
                if let Err(e) = brain.run().await {
                    error!(error = %e, "brain loop error — restarting");
                }
                tokio::time::sleep(std::time::Duration::from_secs(RESTART_DELAY_SECS)).await;
            }
        });
    }

    // ── 6. Smart entry engine ────────────────────────────────────────────
    {
        let engine = Arc::new(SmartEntryEngine::new(
            bus.clone(),
            registry.clone(),
            state.clone(),
            alerts.clone(),
        ));
        tokio::spawn(async move {
            loop {
                if let Err(e) = engine.run().await {
                    error!(error = %e, "smart entry loop error — restarting");
                }
                tokio::time::sleep(std::time::Duration::from_secs(RESTART_DELAY_SECS)).await;
            }
        });
    }

    // ── 7. Fleet executor ────────────────────────────────────────────────
    {
        let fleet = Arc::new(FleetExecutor::new(
            bus.clone(),
            registry.clone(),
            Arc::new(SoldierRegistry::with_defaults()),
            state.clone(),
            alerts.clone(),
        ));
        tokio::spawn(async move {
            loop {
                if let Err(e) = fleet.run().await {
                    error!(error = %e, "fleet loop error — restarting");
                }
                tokio::time::sleep(std::time::Duration::from_secs(RESTART_DELAY_SECS)).await;
            }
        });
    }

    // ── 8. Eye ───────────────────────────────────────────────────────────
    match config.captain.clone() {
        Some(creds) => {
            let eye = Eye::new(bus.clone(), state.clone(), creds, config.okx_ws_url.clone());
            tokio::spawn(async move {
                // Eye::run only returns on an authentication failure, which
                // is terminal for this task; the process supervisor owns the
                // restart from here.
                if let Err(e) = eye.run().await {
                    error!(error = %e, "eye terminated");
                }
            });
        }
        None => {
            warn!("captain credentials absent — eye disabled, console signals only");
        }
    }

    // ── 9. Operational API ───────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");
    info!("Horus Nexus shut down complete.");
    Ok(())
}
