// =============================================================================
// Meridian Market-Data Hub — Main Entry Point
// =============================================================================
//
// A local high-availability hub: supervises several upstream brokerage
// feeds, classifies their health, hard-restarts the sick ones, elects one
// source per contract, and republishes a single cleansed tick stream on a
// LAN pub/sub socket — with a WebSocket event feed and an HTTP control
// API on the side. Any single upstream may die without interrupting the
// downstream stream.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod api;
mod app_state;
mod bus;
mod config;
mod egress;
mod errors;
mod events;
mod gateway;
mod health;
mod logbridge;
mod recovery;
mod store;
mod supervisor;
mod types;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::aggregator::QuoteAggregator;
use crate::api::ApiContext;
use crate::app_state::HubState;
use crate::bus::EventBus;
use crate::config::HubConfig;
use crate::egress::TickEgress;
use crate::health::HealthMonitor;
use crate::recovery::{RecoveryController, RecoveryParams};
use crate::store::AccountStore;
use crate::supervisor::{GatewaySupervisor, SupervisorCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment, bus, logging ─────────────────────────────────────
    let _ = dotenv::dotenv();

    let config = HubConfig::from_env();
    let bus = EventBus::new(config.bus_capacity);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(logbridge::BusLogLayer::new(bus.clone()))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Market-Data Hub — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    config.log_summary();

    // ── 2. Durable store ─────────────────────────────────────────────────
    let store = Arc::new(AccountStore::open(&config.account_store_url, bus.clone())?);

    // ── 3. Channels and shared state ─────────────────────────────────────
    let (supervisor_tx, supervisor_rx) = tokio::sync::mpsc::channel(256);
    let (recovery_tx, recovery_rx) = tokio::sync::mpsc::channel(64);
    let (aggregator_tx, aggregator_rx) = tokio::sync::mpsc::channel(256);
    let (gateway_tx, gateway_rx) = tokio::sync::mpsc::channel(2048);
    let (egress_tx, egress_rx) = tokio::sync::mpsc::channel(config.egress_queue_depth);

    let recovery_params = RecoveryParams::from_config(&config);
    let state = Arc::new(HubState::new(
        config,
        bus,
        supervisor_tx.clone(),
        recovery_tx,
        aggregator_tx,
    ));

    // ── 4. Core components ───────────────────────────────────────────────
    let supervisor = GatewaySupervisor::new(
        state.clone(),
        store.clone(),
        supervisor_rx,
        gateway_tx,
        gateway_rx,
    );
    tokio::spawn(supervisor.run());

    tokio::spawn(HealthMonitor::new(state.clone()).run());

    tokio::spawn(
        RecoveryController::new(
            state.clone(),
            recovery_params,
            recovery_rx,
            supervisor_tx.clone(),
        )
        .run(),
    );

    tokio::spawn(
        QuoteAggregator::new(state.clone(), store.clone(), aggregator_rx, egress_tx).run(),
    );

    tokio::spawn(TickEgress::new(state.clone(), egress_rx).run());

    // ── 5. HTTP + WebSocket servers ──────────────────────────────────────
    let ctx = ApiContext {
        state: state.clone(),
        store,
    };
    let (http_bind, ws_bind) = {
        let config = state.config.read();
        (config.http_bind.clone(), config.ws_bind.clone())
    };

    let app = api::rest::router(ctx.clone());
    let http_addr = http_bind.clone();
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&http_addr)
            .await
            .expect("failed to bind control API");
        info!(addr = %http_addr, "control API listening");
        axum::serve(listener, app).await.expect("control API failed");
    });

    // A distinct WS bind gets its own listener with only the /ws route.
    if ws_bind != http_bind {
        let ws_app = axum::Router::new()
            .route("/ws", axum::routing::get(api::ws::ws_handler))
            .with_state(ctx);
        let ws_addr = ws_bind.clone();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(&ws_addr)
                .await
                .expect("failed to bind websocket server");
            info!(addr = %ws_addr, "websocket server listening");
            axum::serve(listener, ws_app)
                .await
                .expect("websocket server failed");
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    // New control actions are refused from here on.
    state.accepting_actions.store(false, Ordering::Relaxed);

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    if supervisor_tx
        .send(SupervisorCommand::Shutdown { reply: reply_tx })
        .await
        .is_ok()
    {
        match tokio::time::timeout(std::time::Duration::from_secs(10), reply_rx).await {
            Ok(_) => info!("all gateway sessions stopped"),
            Err(_) => error!("session teardown timed out"),
        }
    }

    // Bounded grace for in-flight bus consumers, then exit.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    info!("Meridian hub shut down complete.");
    Ok(())
}
