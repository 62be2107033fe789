// =============================================================================
// WebSocket Broadcaster — event fan-out for the dashboard
// =============================================================================
//
// Each client gets a uuid, a `connection` message carrying the full hub
// snapshot, and then every bus event as one JSON frame (typed by
// `event_type`). The per-connection bus subscription is lossy: a client
// that cannot keep up sheds its oldest events, never the publisher's
// time. A token window additionally caps the forwarding rate.
//
// Heartbeat: server ping on an interval, close when no pong arrives
// inside the timeout. Clients may also speak JSON-level ping/pong.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info};
use uuid::Uuid;

use crate::aggregator::AggregatorCommand;
use crate::app_state::HubState;
use crate::bus::TopicFilter;
use crate::types::GatewayKind;

use super::ApiContext;

// =============================================================================
// Client messages
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    Pong,
    /// Resend the current snapshot (e.g. after the client shed events).
    Snapshot,
    /// Dynamic binding request for additional contracts.
    Subscribe {
        #[serde(default)]
        symbols: Vec<String>,
        #[serde(default)]
        gateway_type: Option<GatewayKind>,
    },
}

// =============================================================================
// Rate limiting
// =============================================================================

/// One-second token window. `admit` returns how long to wait when the
/// budget is spent; `None` means the event may go out now.
struct RateWindow {
    started: Instant,
    sent: u32,
    max: u32,
}

impl RateWindow {
    fn new(max: u32) -> Self {
        Self {
            started: Instant::now(),
            sent: 0,
            max: max.max(1),
        }
    }

    fn admit(&mut self) -> Option<Duration> {
        if self.started.elapsed() >= Duration::from_secs(1) {
            self.started = Instant::now();
            self.sent = 0;
        }
        if self.sent >= self.max {
            return Some(Duration::from_secs(1).saturating_sub(self.started.elapsed()));
        }
        self.sent += 1;
        None
    }
}

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ApiContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, ctx.state))
}

// =============================================================================
// Connection loop
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<HubState>) {
    let client_id = Uuid::new_v4();
    info!(client_id = %client_id, "websocket client connected");

    let (ping_every, pong_timeout, max_events) = {
        let config = state.config.read();
        (
            Duration::from_secs(config.ws_ping_interval_sec.max(1)),
            Duration::from_secs(config.ws_pong_timeout_sec),
            config.ws_max_events_per_sec,
        )
    };

    let (mut sender, mut receiver) = socket.split();
    let mut sub = state.bus.subscribe(TopicFilter::All);

    if send_snapshot(&mut sender, &state, client_id, sub.dropped())
        .await
        .is_err()
    {
        return;
    }

    let mut window = RateWindow::new(max_events);
    let mut ping_ticker = interval(ping_every);
    ping_ticker.tick().await; // immediate first tick; the snapshot just went out
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            ev = sub.recv() => {
                let Some(ev) = ev else { break };
                // Over-budget: wait the window out. The bus subscription
                // buffers meanwhile and sheds oldest beyond its ring.
                while let Some(wait) = window.admit() {
                    tokio::time::sleep(wait).await;
                }
                match serde_json::to_string(&ev) {
                    Ok(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "event serialization failed"),
                }
            }
            _ = ping_ticker.tick() => {
                if last_pong.elapsed() > ping_every + pong_timeout {
                    info!(client_id = %client_id, "pong timeout, closing websocket");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_message(&text, &state, &mut sender, client_id, &mut last_pong, sub.dropped())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client_id = %client_id, error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    info!(
        client_id = %client_id,
        shed_events = sub.dropped(),
        "websocket client disconnected"
    );
}

async fn handle_client_message<S>(
    text: &str,
    state: &Arc<HubState>,
    sender: &mut S,
    client_id: Uuid,
    last_pong: &mut Instant,
    shed: u64,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(client_id = %client_id, error = %e, "unparseable client message");
            return Ok(());
        }
    };

    match msg {
        ClientMessage::Ping => {
            let pong = serde_json::json!({
                "event_type": "pong",
                "timestamp": Utc::now(),
            });
            sender.send(Message::Text(pong.to_string())).await?;
        }
        ClientMessage::Pong => {
            *last_pong = Instant::now();
        }
        ClientMessage::Snapshot => {
            send_snapshot(sender, state, client_id, shed).await?;
        }
        ClientMessage::Subscribe {
            symbols,
            gateway_type,
        } => {
            if !symbols.is_empty() {
                debug!(client_id = %client_id, count = symbols.len(), "dynamic subscription");
                let _ = state
                    .aggregator_tx
                    .send(AggregatorCommand::EnsureBinding {
                        symbols,
                        gateway_type: gateway_type.unwrap_or(GatewayKind::Ctp),
                    })
                    .await;
            }
        }
    }
    Ok(())
}

async fn send_snapshot<S>(
    sender: &mut S,
    state: &Arc<HubState>,
    client_id: Uuid,
    shed: u64,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let message = serde_json::json!({
        "event_type": "connection",
        "timestamp": Utc::now(),
        "client_id": client_id,
        "shed_events": shed,
        "snapshot": state.build_snapshot(),
    });
    sender.send(Message::Text(message.to_string())).await
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_by_type_tag() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"snapshot"}"#).unwrap(),
            ClientMessage::Snapshot
        ));
        match serde_json::from_str::<ClientMessage>(
            r#"{"type":"subscribe","symbols":["rb2601"],"gateway_type":"CTP"}"#,
        )
        .unwrap()
        {
            ClientMessage::Subscribe {
                symbols,
                gateway_type,
            } => {
                assert_eq!(symbols, vec!["rb2601"]);
                assert_eq!(gateway_type, Some(GatewayKind::Ctp));
            }
            _ => panic!("expected subscribe"),
        }
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"order"}"#).is_err());
    }

    #[test]
    fn rate_window_admits_up_to_budget_then_blocks() {
        let mut window = RateWindow::new(3);
        assert!(window.admit().is_none());
        assert!(window.admit().is_none());
        assert!(window.admit().is_none());
        let wait = window.admit().expect("budget exhausted");
        assert!(wait <= Duration::from_secs(1));

        // A stale window resets the budget.
        window.started = Instant::now()
            .checked_sub(Duration::from_secs(2))
            .unwrap();
        assert!(window.admit().is_none());
        assert_eq!(window.sent, 1);
    }
}
