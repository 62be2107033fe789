// =============================================================================
// Tick Egress — binary pub/sub publisher for strategy clients
// =============================================================================
//
// A TCP publisher socket. Every forwarded tick is serialized once as a
// MessagePack payload (named fields, `v` version header, scaled-integer
// prices) and fanned out to all connected subscribers as a two-part
// length-prefixed frame:
//
//   [u16 topic_len][UTF-8 symbol][u32 payload_len][msgpack payload]
//
// Subscribers filter client-side by topic prefix. Fan-out rides an
// internal broadcast channel: a slow connection lags and loses oldest
// frames on its own receiver; the hot path never blocks. Egress failures
// never stop ingress or aggregation — the listener rebinds with bounded
// backoff while the rest of the hub keeps running.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::app_state::HubState;
use crate::events::LogLevel;
use crate::types::Tick;

/// Frame ring per connection; a subscriber further behind than this loses
/// oldest frames.
const FRAME_RING_CAPACITY: usize = 1024;

/// Cadence of the metrics `SystemLog` event.
const METRICS_INTERVAL_SECS: u64 = 30;

/// Listener rebind backoff bounds, seconds.
const REBIND_BACKOFF_MIN: u64 = 1;
const REBIND_BACKOFF_MAX: u64 = 60;

pub struct TickEgress {
    state: Arc<HubState>,
    rx: mpsc::Receiver<Tick>,
    frames: broadcast::Sender<Arc<Vec<u8>>>,
    frames_published: u64,
    serialize_micros_total: u64,
}

impl TickEgress {
    pub fn new(state: Arc<HubState>, rx: mpsc::Receiver<Tick>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_RING_CAPACITY);
        Self {
            state,
            rx,
            frames,
            frames_published: 0,
            serialize_micros_total: 0,
        }
    }

    pub async fn run(mut self) {
        let bind = self.state.config.read().tick_egress_bind.clone();
        let connections = Arc::new(std::sync::atomic::AtomicU64::new(0));
        tokio::spawn(accept_loop(
            bind.clone(),
            self.frames.clone(),
            self.state.clone(),
            connections.clone(),
        ));
        info!(bind = %bind, "tick egress started");

        let mut metrics_ticker = tokio::time::interval(tokio::time::Duration::from_secs(
            METRICS_INTERVAL_SECS,
        ));

        loop {
            tokio::select! {
                tick = self.rx.recv() => {
                    match tick {
                        Some(tick) => self.publish_frame(&tick),
                        None => return,
                    }
                }
                _ = metrics_ticker.tick() => {
                    self.emit_metrics(&connections);
                }
            }
        }
    }

    /// Serialize once, broadcast to every connection.
    fn publish_frame(&mut self, tick: &Tick) {
        let started = std::time::Instant::now();
        let frame = match encode_frame(tick) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(symbol = %tick.symbol, error = %e, "tick serialization failed");
                return;
            }
        };
        self.serialize_micros_total += started.elapsed().as_micros() as u64;
        self.frames_published += 1;
        let _ = self.frames.send(Arc::new(frame));
    }

    fn emit_metrics(&self, connections: &Arc<std::sync::atomic::AtomicU64>) {
        let published = self.frames_published;
        let avg_serialize_micros = if published > 0 {
            self.serialize_micros_total / published
        } else {
            0
        };
        let dropped = self.state.counters.egress_dropped.load(Ordering::Relaxed);
        let conns = connections.load(Ordering::Relaxed);

        debug!(published, conns, dropped, avg_serialize_micros, "egress metrics");
        self.state.bus.publish(crate::events::EventKind::SystemLog {
            level: LogLevel::Info,
            source: "egress".into(),
            message: format!(
                "egress: {published} frames published, {conns} subscribers, {dropped} dropped"
            ),
            metadata: Some(serde_json::json!({
                "frames_published": published,
                "connections": conns,
                "dropped": dropped,
                "avg_serialize_micros": avg_serialize_micros,
            })),
        });
    }
}

/// Bind, accept, rebind on failure with bounded backoff.
async fn accept_loop(
    bind: String,
    frames: broadcast::Sender<Arc<Vec<u8>>>,
    state: Arc<HubState>,
    connections: Arc<std::sync::atomic::AtomicU64>,
) {
    let mut backoff = REBIND_BACKOFF_MIN;
    loop {
        match TcpListener::bind(&bind).await {
            Ok(listener) => {
                info!(bind = %bind, "egress publisher listening");
                backoff = REBIND_BACKOFF_MIN;
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "egress subscriber connected");
                            let rx = frames.subscribe();
                            let state = state.clone();
                            let connections = connections.clone();
                            connections.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(async move {
                                serve_subscriber(stream, rx, &state).await;
                                connections.fetch_sub(1, Ordering::Relaxed);
                                debug!(peer = %peer, "egress subscriber disconnected");
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "egress accept failed, rebinding");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(bind = %bind, error = %e, backoff_secs = backoff, "egress bind failed");
                state.bus.log(
                    LogLevel::Warn,
                    "egress",
                    format!("bind {bind} failed: {e}; retrying in {backoff}s"),
                );
            }
        }
        tokio::time::sleep(tokio::time::Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(REBIND_BACKOFF_MAX);
    }
}

async fn serve_subscriber(
    mut stream: tokio::net::TcpStream,
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    state: &HubState,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                state.counters.egress_dropped.fetch_add(n, Ordering::Relaxed);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Two-part frame: topic bytes then versioned msgpack payload.
pub fn encode_frame(tick: &Tick) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(tick).context("msgpack encode")?;
    let topic = tick.symbol.as_bytes();
    let mut frame = Vec::with_capacity(2 + topic.len() + 4 + payload.len());
    frame.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    frame.extend_from_slice(topic);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Split a frame back into `(topic, payload)`. Used by tests and by the
/// reference strategy client.
pub fn decode_frame(frame: &[u8]) -> Result<(String, Tick)> {
    anyhow::ensure!(frame.len() >= 6, "frame too short");
    let topic_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    anyhow::ensure!(frame.len() >= 2 + topic_len + 4, "truncated topic");
    let topic = std::str::from_utf8(&frame[2..2 + topic_len])
        .context("topic not utf8")?
        .to_string();
    let payload_start = 2 + topic_len + 4;
    let payload_len = u32::from_be_bytes([
        frame[2 + topic_len],
        frame[3 + topic_len],
        frame[4 + topic_len],
        frame[5 + topic_len],
    ]) as usize;
    anyhow::ensure!(frame.len() == payload_start + payload_len, "truncated payload");
    let tick: Tick =
        rmp_serde::from_slice(&frame[payload_start..]).context("msgpack decode")?;
    Ok((topic, tick))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawTick;

    fn sample_tick() -> Tick {
        let raw = RawTick {
            symbol: "rb2601".into(),
            exchange: "SHFE".into(),
            last_price: 4500.0,
            last_volume: 3,
            bid_price: 4499.5,
            bid_volume: 10,
            ask_price: 4500.5,
            ask_volume: 7,
            exchange_time: 1_700_000_000_000,
        };
        Tick::from_raw(&raw, "A1", 1_700_000_000_050)
    }

    #[test]
    fn frame_roundtrip_preserves_tick() {
        let tick = sample_tick();
        let frame = encode_frame(&tick).unwrap();
        let (topic, decoded) = decode_frame(&frame).unwrap();
        assert_eq!(topic, "rb2601");
        assert_eq!(decoded, tick);
        assert_eq!(decoded.v, 1);
        assert_eq!(decoded.source_account_id, "A1");
    }

    #[test]
    fn topic_prefix_is_the_raw_symbol_bytes() {
        let tick = sample_tick();
        let frame = encode_frame(&tick).unwrap();
        let topic_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(topic_len, 6);
        assert_eq!(&frame[2..8], b"rb2601");
    }

    #[test]
    fn payload_carries_named_fields_with_version_header() {
        let tick = sample_tick();
        let frame = encode_frame(&tick).unwrap();
        let topic_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let payload = &frame[2 + topic_len + 4..];
        // Decoding into a generic value proves the fields are named, which
        // is what keeps the schema stable for non-Rust subscribers.
        let value: serde_json::Value = rmp_serde::from_slice(payload).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["symbol"], "rb2601");
        assert_eq!(value["last_price"], 45_000_000i64);
        assert_eq!(value["source_account_id"], "A1");
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest_frames_only() {
        let (frames, _) = broadcast::channel::<Arc<Vec<u8>>>(4);
        let mut rx = frames.subscribe();
        for i in 0u32..20 {
            let _ = frames.send(Arc::new(i.to_be_bytes().to_vec()));
        }
        // First recv reports the lag, then delivery resumes from the
        // oldest retained frame.
        let err = rx.try_recv().unwrap_err();
        assert!(matches!(err, broadcast::error::TryRecvError::Lagged(_)));
        let frame = rx.try_recv().unwrap();
        let n = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert!(n >= 16);
    }

    #[tokio::test]
    async fn end_to_end_over_tcp() {
        use tokio::io::AsyncReadExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames, _) = broadcast::channel::<Arc<Vec<u8>>>(16);

        let (sup_tx, _sup_rx) = mpsc::channel(8);
        let (rec_tx, _rec_rx) = mpsc::channel(8);
        let (agg_tx, _agg_rx) = mpsc::channel(8);
        let state = Arc::new(HubState::new(
            crate::config::HubConfig::default(),
            crate::bus::EventBus::new(16),
            sup_tx,
            rec_tx,
            agg_tx,
        ));
        let accept_state = state.clone();
        let accept_frames = frames.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let rx = accept_frames.subscribe();
            serve_subscriber(stream, rx, &accept_state).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        // Give the accept side a beat to subscribe before publishing.
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let tick = sample_tick();
        let frame = encode_frame(&tick).unwrap();
        frames.send(Arc::new(frame.clone())).unwrap();

        let mut received = vec![0u8; frame.len()];
        tokio::time::timeout(
            tokio::time::Duration::from_secs(2),
            client.read_exact(&mut received),
        )
        .await
        .expect("frame in time")
        .unwrap();
        let (topic, decoded) = decode_frame(&received).unwrap();
        assert_eq!(topic, "rb2601");
        assert_eq!(decoded, tick);
    }
}
