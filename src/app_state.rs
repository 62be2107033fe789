// =============================================================================
// Central Shared State — Meridian market-data hub
// =============================================================================
//
// Ties the components together. Mutable maps are partitioned by owner: the
// Supervisor writes `sessions`, the Health Monitor writes `health`, the
// Aggregator writes `bindings`, the Recovery Controller writes `recovery`.
// Everyone else only reads the resulting snapshots. Counters are plain
// atomics. Cross-component requests go through the command senders, never
// through direct calls.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::aggregator::AggregatorCommand;
use crate::bus::EventBus;
use crate::config::HubConfig;
use crate::recovery::RecoveryCommand;
use crate::supervisor::SupervisorCommand;
use crate::types::{ConnectionState, GatewayKind, HealthState, SessionState};

// =============================================================================
// Snapshot types (the read-only view other components and clients get)
// =============================================================================

/// Observable state of one gateway session. Written only by the Supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub account_id: String,
    pub gateway_type: GatewayKind,
    pub state: SessionState,
    pub transport: ConnectionState,
    pub connect_time: Option<DateTime<Utc>>,
    pub last_tick_time: Option<DateTime<Utc>>,
    pub subscribed_symbols: Vec<String>,
}

/// Health classification of one session. Written only by the Health Monitor.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub account_id: String,
    pub status: HealthState,
    pub last_transition_at: DateTime<Utc>,
    pub canary_last_tick_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_reason: String,
}

/// One contract binding. Written only by the Aggregator.
#[derive(Debug, Clone, Serialize)]
pub struct BindingSnapshot {
    pub symbol: String,
    pub gateway_type: GatewayKind,
    pub preferred_priority_order: Vec<String>,
    pub current_source: Option<String>,
    pub pending_migration: bool,
    pub forwarded: u64,
    pub filtered: u64,
}

/// One recovery cycle. Written only by the Recovery Controller.
#[derive(Debug, Clone, Serialize)]
pub struct RecoverySnapshot {
    pub account_id: String,
    pub phase: String,
    pub restart_attempts: u32,
    pub permanently_failed: bool,
}

/// Aggregate counters for the `/health` endpoint and egress metrics.
#[derive(Debug, Default)]
pub struct HubCounters {
    pub ticks_ingressed: AtomicU64,
    pub ticks_egressed: AtomicU64,
    pub ticks_rejected: AtomicU64,
    pub ticks_filtered: AtomicU64,
    pub egress_dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub ticks_ingressed: u64,
    pub ticks_egressed: u64,
    pub ticks_rejected: u64,
    pub ticks_filtered: u64,
    pub egress_dropped: u64,
}

impl HubCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            ticks_ingressed: self.ticks_ingressed.load(Ordering::Relaxed),
            ticks_egressed: self.ticks_egressed.load(Ordering::Relaxed),
            ticks_rejected: self.ticks_rejected.load(Ordering::Relaxed),
            ticks_filtered: self.ticks_filtered.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
        }
    }
}

/// The full snapshot served by `GET /health` and the WebSocket `connection`
/// message.
#[derive(Debug, Clone, Serialize)]
pub struct HubSnapshot {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub server_time: i64,
    pub sessions: Vec<SessionSnapshot>,
    pub health: Vec<HealthSnapshot>,
    pub bindings: Vec<BindingSnapshot>,
    pub recovery: Vec<RecoverySnapshot>,
    pub counters: CounterSnapshot,
}

// =============================================================================
// HubState
// =============================================================================

/// Shared application state, wrapped in `Arc` at startup.
pub struct HubState {
    pub config: RwLock<HubConfig>,
    pub bus: EventBus,

    // ── Command channels (the only write path into other components) ────
    pub supervisor_tx: mpsc::Sender<SupervisorCommand>,
    pub recovery_tx: mpsc::Sender<RecoveryCommand>,
    pub aggregator_tx: mpsc::Sender<AggregatorCommand>,

    // ── Owner-partitioned snapshot maps ─────────────────────────────────
    pub sessions: RwLock<HashMap<String, SessionSnapshot>>,
    pub health: RwLock<HashMap<String, HealthSnapshot>>,
    pub bindings: RwLock<HashMap<String, BindingSnapshot>>,
    pub recovery: RwLock<HashMap<String, RecoverySnapshot>>,

    pub counters: HubCounters,

    /// Cleared during shutdown so the Control API stops accepting actions.
    pub accepting_actions: AtomicBool,

    pub start_time: std::time::Instant,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        bus: EventBus,
        supervisor_tx: mpsc::Sender<SupervisorCommand>,
        recovery_tx: mpsc::Sender<RecoveryCommand>,
        aggregator_tx: mpsc::Sender<AggregatorCommand>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            bus,
            supervisor_tx,
            recovery_tx,
            aggregator_tx,
            sessions: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            recovery: RwLock::new(HashMap::new()),
            counters: HubCounters::default(),
            accepting_actions: AtomicBool::new(true),
            start_time: std::time::Instant::now(),
        }
    }

    /// Health of one account, if classified.
    pub fn health_of(&self, account_id: &str) -> Option<HealthState> {
        self.health.read().get(account_id).map(|h| h.status)
    }

    /// Session snapshot of one account, if a session exists.
    pub fn session_of(&self, account_id: &str) -> Option<SessionSnapshot> {
        self.sessions.read().get(account_id).cloned()
    }

    /// Build the complete snapshot for `/health` and WS connect. Always
    /// succeeds, even with subsystems degraded — that is the point.
    pub fn build_snapshot(&self) -> HubSnapshot {
        let mut sessions: Vec<SessionSnapshot> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.account_id.cmp(&b.account_id));

        let mut health: Vec<HealthSnapshot> = self.health.read().values().cloned().collect();
        health.sort_by(|a, b| a.account_id.cmp(&b.account_id));

        let mut bindings: Vec<BindingSnapshot> = self.bindings.read().values().cloned().collect();
        bindings.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let mut recovery: Vec<RecoverySnapshot> = self.recovery.read().values().cloned().collect();
        recovery.sort_by(|a, b| a.account_id.cmp(&b.account_id));

        HubSnapshot {
            status: "ok",
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: Utc::now().timestamp_millis(),
            sessions,
            health,
            bindings,
            recovery,
            counters: self.counters.snapshot(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_state() -> std::sync::Arc<HubState> {
        let (sup_tx, _sup_rx) = mpsc::channel(8);
        let (rec_tx, _rec_rx) = mpsc::channel(8);
        let (agg_tx, _agg_rx) = mpsc::channel(8);
        std::sync::Arc::new(HubState::new(
            HubConfig::default(),
            EventBus::new(64),
            sup_tx,
            rec_tx,
            agg_tx,
        ))
    }

    #[tokio::test]
    async fn snapshot_is_sorted_and_complete() {
        let state = test_state();
        state.sessions.write().insert(
            "b".into(),
            SessionSnapshot {
                account_id: "b".into(),
                gateway_type: GatewayKind::Ctp,
                state: SessionState::Connected,
                transport: ConnectionState::Connected,
                connect_time: None,
                last_tick_time: None,
                subscribed_symbols: vec![],
            },
        );
        state.sessions.write().insert(
            "a".into(),
            SessionSnapshot {
                account_id: "a".into(),
                gateway_type: GatewayKind::Sopt,
                state: SessionState::Connecting,
                transport: ConnectionState::Connecting,
                connect_time: None,
                last_tick_time: None,
                subscribed_symbols: vec![],
            },
        );
        state.counters.ticks_ingressed.fetch_add(3, Ordering::Relaxed);

        let snap = state.build_snapshot();
        assert_eq!(snap.status, "ok");
        assert_eq!(snap.sessions.len(), 2);
        assert_eq!(snap.sessions[0].account_id, "a");
        assert_eq!(snap.counters.ticks_ingressed, 3);
        // Snapshot must serialize cleanly for WS clients.
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["sessions"][1]["state"], "CONNECTED");
    }
}
