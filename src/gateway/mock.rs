// =============================================================================
// Mock Gateway — deterministic synthetic feed
// =============================================================================
//
// Enabled globally by GATEWAY_MOCK or per-account with gateway_type MOCK.
// Emits a deterministic price walk for every subscribed symbol so tests
// and local development never depend on a live vendor bridge. Failure
// injection knobs in the account settings drive the recovery and failover
// tests:
//
//   tick_interval_ms   cadence of synthetic ticks (default 200)
//   base_price         center of the price walk (default 4500.0)
//   connect_delay_ms   simulated connect latency (default 0)
//   fail_after_ticks   die with a synthetic error after N ticks
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::store::Account;
use crate::types::{ConnectionState, RawTick};

use super::{setting_f64, setting_u64, GatewayEvent, GatewayEventKind, UpstreamGateway};

#[derive(Debug, Clone)]
struct MockSettings {
    tick_interval_ms: u64,
    base_price: f64,
    connect_delay_ms: u64,
    fail_after_ticks: Option<u64>,
}

impl MockSettings {
    fn from_value(settings: &serde_json::Value) -> Self {
        Self {
            tick_interval_ms: setting_u64(settings, "tick_interval_ms").unwrap_or(200),
            base_price: setting_f64(settings, "base_price").unwrap_or(4500.0),
            connect_delay_ms: setting_u64(settings, "connect_delay_ms").unwrap_or(0),
            fail_after_ticks: setting_u64(settings, "fail_after_ticks"),
        }
    }
}

pub struct MockGateway {
    account_id: String,
    settings: MockSettings,
    events: mpsc::Sender<GatewayEvent>,
    state: Arc<RwLock<ConnectionState>>,
    subscribed: Arc<RwLock<BTreeSet<String>>>,
    task: Option<JoinHandle<()>>,
}

impl MockGateway {
    pub fn new(account: &Account, events: mpsc::Sender<GatewayEvent>) -> Self {
        Self {
            account_id: account.id.clone(),
            settings: MockSettings::from_value(&account.settings),
            events,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            subscribed: Arc::new(RwLock::new(BTreeSet::new())),
            task: None,
        }
    }

    async fn emit_state(
        events: &mpsc::Sender<GatewayEvent>,
        state_slot: &Arc<RwLock<ConnectionState>>,
        account_id: &str,
        state: ConnectionState,
    ) {
        *state_slot.write() = state;
        let _ = events
            .send(GatewayEvent {
                account_id: account_id.to_string(),
                kind: GatewayEventKind::State {
                    state,
                    detail: None,
                },
            })
            .await;
    }
}

#[async_trait]
impl UpstreamGateway for MockGateway {
    async fn connect(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }

        let account_id = self.account_id.clone();
        let settings = self.settings.clone();
        let events = self.events.clone();
        let state = self.state.clone();
        let subscribed = self.subscribed.clone();

        self.task = Some(tokio::spawn(async move {
            Self::emit_state(&events, &state, &account_id, ConnectionState::Connecting).await;
            if settings.connect_delay_ms > 0 {
                tokio::time::sleep(tokio::time::Duration::from_millis(settings.connect_delay_ms))
                    .await;
            }
            Self::emit_state(&events, &state, &account_id, ConnectionState::Connected).await;

            let mut sequence: u64 = 0;
            let mut ticker = tokio::time::interval(tokio::time::Duration::from_millis(
                settings.tick_interval_ms.max(1),
            ));
            loop {
                ticker.tick().await;
                let symbols: Vec<String> = subscribed.read().iter().cloned().collect();
                for symbol in symbols {
                    sequence += 1;
                    if let Some(limit) = settings.fail_after_ticks {
                        if sequence > limit {
                            debug!(account_id = %account_id, "mock feed reached failure point");
                            let _ = events
                                .send(GatewayEvent {
                                    account_id: account_id.clone(),
                                    kind: GatewayEventKind::Error {
                                        code: 1001,
                                        message: "synthetic feed failure".into(),
                                    },
                                })
                                .await;
                            Self::emit_state(&events, &state, &account_id, ConnectionState::Error)
                                .await;
                            return;
                        }
                    }
                    let raw = synth_tick(&symbol, settings.base_price, sequence);
                    if events
                        .send(GatewayEvent {
                            account_id: account_id.clone(),
                            kind: GatewayEventKind::Tick(raw),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }));
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Self::emit_state(
            &self.events,
            &self.state,
            &self.account_id,
            ConnectionState::Disconnected,
        )
        .await;
    }

    async fn subscribe(&mut self, symbols: &BTreeSet<String>) -> Result<()> {
        self.subscribed.write().extend(symbols.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&mut self, symbols: &BTreeSet<String>) -> Result<()> {
        let mut set = self.subscribed.write();
        for symbol in symbols {
            set.remove(symbol);
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Deterministic price walk: a triangle wave around the base price with a
/// cycling volume. No randomness, so tests can assert exact values.
fn synth_tick(symbol: &str, base_price: f64, sequence: u64) -> RawTick {
    let phase = (sequence % 21) as f64 - 10.0;
    let last_price = base_price + phase * 0.5;
    RawTick {
        symbol: symbol.to_string(),
        exchange: "SHFE".to_string(),
        last_price,
        last_volume: (sequence % 5 + 1) as i64,
        bid_price: last_price - 0.5,
        bid_volume: 10,
        ask_price: last_price + 0.5,
        ask_volume: 10,
        exchange_time: chrono::Utc::now().timestamp_millis(),
    }
}
