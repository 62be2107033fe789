// =============================================================================
// Vendor Bridge Transport — JSON-over-WebSocket feed client
// =============================================================================
//
// Both CTP and SOPT feeds reach the hub through a vendor bridge process
// speaking a small JSON protocol: the client sends a login frame and
// subscribe/unsubscribe frames; the bridge pushes `status`, `tick`, and
// `error` frames. The per-vendor differences (login payload, raw tick
// field names) live in a `VendorProfile`; this file owns the transport
// loop, reconnection, and re-subscription.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::types::{ConnectionState, RawTick};

use super::{GatewayEvent, GatewayEventKind, UpstreamGateway};

/// Delay between reconnect attempts of the transport loop.
const RECONNECT_DELAY_SECS: u64 = 5;

/// Per-vendor parameterization of the bridge protocol.
#[derive(Clone)]
pub struct VendorProfile {
    pub vendor_name: &'static str,
    /// WebSocket URL of the market-data bridge.
    pub url: String,
    /// Login frame sent immediately after the transport opens.
    pub login: serde_json::Value,
    /// Exchange code used when the raw frame omits one.
    pub default_exchange: &'static str,
    /// Maps one bridge `tick` frame to the canonical raw tick.
    pub map_tick: fn(&serde_json::Value, &str) -> Option<RawTick>,
}

enum BridgeCmd {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// WebSocket adaptor for one upstream account.
pub struct BridgeGateway {
    account_id: String,
    profile: VendorProfile,
    events: mpsc::Sender<GatewayEvent>,
    state: Arc<RwLock<ConnectionState>>,
    subscribed: Arc<RwLock<BTreeSet<String>>>,
    cmd_tx: Option<mpsc::UnboundedSender<BridgeCmd>>,
    task: Option<JoinHandle<()>>,
}

impl BridgeGateway {
    pub fn new(
        account_id: String,
        profile: VendorProfile,
        events: mpsc::Sender<GatewayEvent>,
    ) -> Self {
        Self {
            account_id,
            profile,
            events,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            subscribed: Arc::new(RwLock::new(BTreeSet::new())),
            cmd_tx: None,
            task: None,
        }
    }

    async fn emit_state(
        events: &mpsc::Sender<GatewayEvent>,
        state_slot: &Arc<RwLock<ConnectionState>>,
        account_id: &str,
        state: ConnectionState,
        detail: Option<String>,
    ) {
        *state_slot.write() = state;
        let _ = events
            .send(GatewayEvent {
                account_id: account_id.to_string(),
                kind: GatewayEventKind::State { state, detail },
            })
            .await;
    }
}

#[async_trait]
impl UpstreamGateway for BridgeGateway {
    async fn connect(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.cmd_tx = Some(cmd_tx);

        let account_id = self.account_id.clone();
        let profile = self.profile.clone();
        let events = self.events.clone();
        let state = self.state.clone();
        let subscribed = self.subscribed.clone();

        self.task = Some(tokio::spawn(run_transport(
            account_id, profile, events, state, subscribed, cmd_rx,
        )));
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.cmd_tx = None;
        Self::emit_state(
            &self.events,
            &self.state,
            &self.account_id,
            ConnectionState::Disconnected,
            None,
        )
        .await;
    }

    async fn subscribe(&mut self, symbols: &BTreeSet<String>) -> Result<()> {
        if symbols.is_empty() {
            return Ok(());
        }
        let fresh: Vec<String> = {
            let mut set = self.subscribed.write();
            symbols
                .iter()
                .filter(|s| set.insert((*s).clone()))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(BridgeCmd::Subscribe(fresh));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, symbols: &BTreeSet<String>) -> Result<()> {
        if symbols.is_empty() {
            return Ok(());
        }
        let removed: Vec<String> = {
            let mut set = self.subscribed.write();
            symbols
                .iter()
                .filter(|s| set.remove(*s))
                .cloned()
                .collect()
        };
        if removed.is_empty() {
            return Ok(());
        }
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(BridgeCmd::Unsubscribe(removed));
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }
}

impl Drop for BridgeGateway {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The transport loop. Connects, logs in, re-subscribes, then pumps frames
/// until the connection dies; reconnects after a fixed delay. Runs until
/// aborted by `disconnect`.
async fn run_transport(
    account_id: String,
    profile: VendorProfile,
    events: mpsc::Sender<GatewayEvent>,
    state: Arc<RwLock<ConnectionState>>,
    subscribed: Arc<RwLock<BTreeSet<String>>>,
    mut cmd_rx: mpsc::UnboundedReceiver<BridgeCmd>,
) {
    loop {
        BridgeGateway::emit_state(
            &events,
            &state,
            &account_id,
            ConnectionState::Connecting,
            None,
        )
        .await;

        let ws = match connect_async(&profile.url).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!(
                    account_id = %account_id,
                    vendor = profile.vendor_name,
                    error = %e,
                    "bridge connect failed"
                );
                BridgeGateway::emit_state(
                    &events,
                    &state,
                    &account_id,
                    ConnectionState::Error,
                    Some(format!("connect failed: {e}")),
                )
                .await;
                tokio::time::sleep(tokio::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                continue;
            }
        };

        info!(account_id = %account_id, vendor = profile.vendor_name, url = %profile.url, "bridge connected");
        let (mut write, mut read) = ws.split();

        // Login, then replay the subscription set so a reconnect restores
        // the exact same stream.
        if write
            .send(Message::Text(profile.login.to_string()))
            .await
            .is_err()
        {
            BridgeGateway::emit_state(
                &events,
                &state,
                &account_id,
                ConnectionState::Error,
                Some("login send failed".into()),
            )
            .await;
            tokio::time::sleep(tokio::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            continue;
        }
        let symbols: Vec<String> = subscribed.read().iter().cloned().collect();
        if !symbols.is_empty() {
            let frame = serde_json::json!({"type": "subscribe", "symbols": symbols});
            let _ = write.send(Message::Text(frame.to_string())).await;
        }

        BridgeGateway::emit_state(&events, &state, &account_id, ConnectionState::Connected, None)
            .await;

        // Frame pump.
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(BridgeCmd::Subscribe(symbols)) => {
                            let frame = serde_json::json!({"type": "subscribe", "symbols": symbols});
                            if write.send(Message::Text(frame.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Some(BridgeCmd::Unsubscribe(symbols)) => {
                            let frame = serde_json::json!({"type": "unsubscribe", "symbols": symbols});
                            if write.send(Message::Text(frame.to_string())).await.is_err() {
                                break;
                            }
                        }
                        // The adaptor was dropped; stop the transport.
                        None => return,
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            handle_frame(&account_id, &profile, &events, &text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(account_id = %account_id, "bridge stream closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(account_id = %account_id, error = %e, "bridge read error");
                            let _ = events.send(GatewayEvent {
                                account_id: account_id.clone(),
                                kind: GatewayEventKind::Error {
                                    code: 0,
                                    message: format!("transport: {e}"),
                                },
                            }).await;
                            break;
                        }
                    }
                }
            }
        }

        BridgeGateway::emit_state(
            &events,
            &state,
            &account_id,
            ConnectionState::Disconnected,
            None,
        )
        .await;
        tokio::time::sleep(tokio::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

async fn handle_frame(
    account_id: &str,
    profile: &VendorProfile,
    events: &mpsc::Sender<GatewayEvent>,
    text: &str,
) {
    let frame: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(account_id = %account_id, error = %e, "unparseable bridge frame");
            return;
        }
    };

    match frame.get("type").and_then(|t| t.as_str()) {
        Some("tick") => {
            if let Some(raw) = (profile.map_tick)(&frame, profile.default_exchange) {
                let _ = events
                    .send(GatewayEvent {
                        account_id: account_id.to_string(),
                        kind: GatewayEventKind::Tick(raw),
                    })
                    .await;
            } else {
                debug!(account_id = %account_id, "tick frame missing required fields");
            }
        }
        Some("error") => {
            let code = frame.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            let message = frame
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("bridge error")
                .to_string();
            let _ = events
                .send(GatewayEvent {
                    account_id: account_id.to_string(),
                    kind: GatewayEventKind::Error { code, message },
                })
                .await;
        }
        // Status frames are informational; the transport loop already
        // derives connection state from the socket itself.
        Some("status") => {
            debug!(account_id = %account_id, frame = %text, "bridge status");
        }
        _ => {}
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ctp;
    use crate::store::{Account, AccountDraft};
    use crate::types::GatewayKind;
    use chrono::Utc;

    fn account(settings: serde_json::Value) -> Account {
        let draft = AccountDraft {
            id: "a1".into(),
            gateway_type: GatewayKind::Ctp,
            settings,
            priority: 1,
            enabled: true,
            description: None,
        };
        Account {
            id: draft.id,
            gateway_type: draft.gateway_type,
            settings: draft.settings,
            priority: draft.priority,
            enabled: draft.enabled,
            description: draft.description,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_on_set_semantics() {
        let settings = serde_json::json!({
            "md_address": "ws://127.0.0.1:1",
            "broker_id": "9999",
            "user_id": "u",
            "password": "p",
        });
        let (tx, _rx) = mpsc::channel(8);
        let mut gw = BridgeGateway::new("a1".into(), ctp::profile(&account(settings)).unwrap(), tx);

        let symbols: BTreeSet<String> = ["rb2601".to_string()].into_iter().collect();
        gw.subscribe(&symbols).await.unwrap();
        gw.subscribe(&symbols).await.unwrap();
        assert_eq!(gw.subscribed.read().len(), 1);

        gw.unsubscribe(&symbols).await.unwrap();
        gw.unsubscribe(&symbols).await.unwrap();
        assert!(gw.subscribed.read().is_empty());
    }

    #[tokio::test]
    async fn empty_subscription_is_a_noop() {
        let settings = serde_json::json!({"md_address": "ws://127.0.0.1:1"});
        let (tx, _rx) = mpsc::channel(8);
        let mut gw = BridgeGateway::new("a1".into(), ctp::profile(&account(settings)).unwrap(), tx);
        gw.subscribe(&BTreeSet::new()).await.unwrap();
        assert!(gw.subscribed.read().is_empty());
        assert_eq!(gw.state(), ConnectionState::Disconnected);
    }
}
