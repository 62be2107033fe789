// =============================================================================
// Upstream Gateway Adaptors
// =============================================================================
//
// A narrow, uniform surface over the vendor feeds. Nothing vendor-shaped
// leaks past this module: adaptors push `GatewayEvent`s (state changes,
// raw ticks, errors) into the Supervisor's channel and accept
// connect/disconnect/subscribe/unsubscribe calls. An adaptor instance is
// disposable — `disconnect` tears its transport task down and the whole
// struct can be dropped and rebuilt, which is the primitive hard restart
// relies on.
// =============================================================================

pub mod bridge;
pub mod ctp;
pub mod mock;
pub mod sopt;

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::HubError;
use crate::store::Account;
use crate::types::{ConnectionState, GatewayKind, RawTick};

/// Payload of an adaptor-side event.
#[derive(Debug, Clone)]
pub enum GatewayEventKind {
    State {
        state: ConnectionState,
        detail: Option<String>,
    },
    Tick(RawTick),
    Error {
        code: i64,
        message: String,
    },
}

/// An event from one adaptor, tagged with its owning account.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub account_id: String,
    pub kind: GatewayEventKind,
}

/// The uniform adaptor interface. Subscribe/unsubscribe are idempotent on
/// set semantics; `connect` is asynchronous — success is signalled by a
/// `State` event, not by the return value.
#[async_trait]
pub trait UpstreamGateway: Send {
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self);
    async fn subscribe(&mut self, symbols: &BTreeSet<String>) -> Result<()>;
    async fn unsubscribe(&mut self, symbols: &BTreeSet<String>) -> Result<()>;
    fn state(&self) -> ConnectionState;
}

/// Build the adaptor for an account. `force_mock` (GATEWAY_MOCK) swaps in
/// the deterministic synthetic adaptor regardless of the account's type.
pub fn build(
    account: &Account,
    force_mock: bool,
    events: mpsc::Sender<GatewayEvent>,
) -> Result<Box<dyn UpstreamGateway>, HubError> {
    let kind = if force_mock {
        GatewayKind::Mock
    } else {
        account.gateway_type
    };
    match kind {
        GatewayKind::Ctp => Ok(Box::new(bridge::BridgeGateway::new(
            account.id.clone(),
            ctp::profile(account)?,
            events,
        ))),
        GatewayKind::Sopt => Ok(Box::new(bridge::BridgeGateway::new(
            account.id.clone(),
            sopt::profile(account)?,
            events,
        ))),
        GatewayKind::Mock => Ok(Box::new(mock::MockGateway::new(account, events))),
    }
}

// ── Settings helpers ─────────────────────────────────────────────────────

pub(crate) fn setting_str(settings: &serde_json::Value, key: &str) -> Option<String> {
    settings.get(key).and_then(|v| v.as_str()).map(String::from)
}

pub(crate) fn setting_u64(settings: &serde_json::Value, key: &str) -> Option<u64> {
    settings.get(key).and_then(|v| v.as_u64())
}

pub(crate) fn setting_f64(settings: &serde_json::Value, key: &str) -> Option<f64> {
    settings.get(key).and_then(|v| v.as_f64())
}
