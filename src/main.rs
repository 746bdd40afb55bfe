// =============================================================================
// TraderTerminal Core — Main Entry Point
// =============================================================================
//
// Boot order: environment -> config -> persistence replay -> router task ->
// fill pumps -> maintenance loop -> HTTP server -> graceful shutdown.
//
// The engine carries no credentials in its environment surface; secrets are
// resolved through the credential store (TT_CREDENTIALS_FILE plus TT_CRED_*
// overrides).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alert;
mod api;
mod broker;
mod clock;
mod config;
mod credentials;
mod events;
mod funded;
mod ingress;
mod orders;
mod persist;
mod quotes;
mod router;
mod sim;
mod state;
mod tracker;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::BrokerAdapter;
use crate::config::EngineConfig;
use crate::persist::PersistentStore;
use crate::state::CoreState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        TraderTerminal Core — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Configuration ─────────────────────────────────────────────────
    let config_path =
        std::env::var("TT_CONFIG").unwrap_or_else(|_| "engine_config.json".into());
    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load engine config, using defaults");
        EngineConfig::default()
    });

    info!(
        groups = config.account_groups.len(),
        paper_accounts = config.paper_accounts.len(),
        "account-group routing table loaded"
    );

    // ── 3. Persistence & state rebuild ───────────────────────────────────
    let data_dir = std::env::var("TT_DATA_DIR").unwrap_or_else(|_| "data".into());
    let persist = PersistentStore::open(&data_dir, config.persistence.clone())?;

    let state = CoreState::new(config, persist);
    if let Err(e) = state.replay() {
        error!(error = %e, "startup replay failed — continuing with partial state");
    }

    // ── 4. Router task ───────────────────────────────────────────────────
    let router_rx = state
        .take_router_rx()
        .expect("router receiver available at startup");
    {
        let router_state = state.clone();
        tokio::spawn(async move {
            router::run_router(router_state, router_rx).await;
        });
    }

    // ── 5. Fill pumps (one per account subscription) ─────────────────────
    spawn_fill_pumps(&state).await;

    // ── 6. Maintenance loop ──────────────────────────────────────────────
    let api_ctx = api::ApiContext::new(state.clone());
    {
        let ctx = api_ctx.clone();
        let maint_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                maint_state.dedupe.cleanup(chrono::Utc::now());
                maint_state.persist.try_recover();
                ctx.limiter.cleanup();
            }
        });
    }

    // ── 7. HTTP server ───────────────────────────────────────────────────
    let bind_addr = std::env::var("TT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let app = api::rest::router(api_ctx);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "HTTP server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            error!(error = %e, "HTTP server failed");
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    state.shutdown().await;
    if let Err(e) = state.config.read().save(&config_path) {
        warn!(error = %e, "failed to save engine config on shutdown");
    }
    server.abort();

    info!("TraderTerminal core shut down complete");
    Ok(())
}

/// Subscribe to every account's fill stream and funnel fills into the shared
/// fill path. The simulator's stream lives for the process; HTTP adapters
/// reconnect internally.
async fn spawn_fill_pumps(state: &Arc<CoreState>) {
    let (paper_ids, live_targets): (Vec<String>, Vec<(String, String)>) = {
        let config = state.config.read();
        let paper = config.paper_accounts.iter().map(|a| a.id.clone()).collect();
        let live = config
            .account_groups
            .iter()
            .filter(|g| g.backend != sim::SIMULATOR_BACKEND)
            .map(|g| (g.backend.clone(), g.account_id().to_string()))
            .collect();
        (paper, live)
    };

    for account_id in paper_ids {
        match state.sim.subscribe_fills(&account_id, None).await {
            Ok(mut rx) => {
                let pump_state = state.clone();
                tokio::spawn(async move {
                    while let Some(fill) = rx.recv().await {
                        pump_state.handle_fill(&fill);
                    }
                });
                info!(account = %account_id, backend = "simulator", "fill pump started");
            }
            Err(e) => error!(account = %account_id, error = %e, "fill subscription failed"),
        }
    }

    for (backend, account_id) in live_targets {
        let Some(adapter) = state.adapters.get(&backend) else {
            continue;
        };
        match adapter.subscribe_fills(&account_id, None).await {
            Ok(mut rx) => {
                let pump_state = state.clone();
                let pump_account = account_id.clone();
                tokio::spawn(async move {
                    while let Some(fill) = rx.recv().await {
                        pump_state.handle_fill(&fill);
                    }
                    warn!(account = %pump_account, "live fill pump ended");
                });
                info!(account = %account_id, backend = %backend, "fill pump started");
            }
            Err(e) => {
                warn!(
                    account = %account_id,
                    backend = %backend,
                    error = %e,
                    "fill subscription unavailable — feed will reject traffic"
                );
            }
        }
    }
}
