// =============================================================================
// Health Monitor — per-gateway status classification
// =============================================================================
//
// Two independent signals feed the classification: the transport state the
// Supervisor mirrors into the session snapshot, and data-plane liveness of
// the canary contracts (observed as ingress ticks). The deterministic
// table lives in `classify`; everything around it is debounce plumbing so
// a flapping gateway does not spray transitions at the rest of the hub.
//
// Only this component writes the health map.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::app_state::{HealthSnapshot, HubState};
use crate::bus::{Subscription, TopicFilter};
use crate::events::{topics, EventKind, LogLevel};
use crate::types::{ConnectionState, GatewayKind, HealthState};

struct Committed {
    status: HealthState,
    consecutive_failures: u32,
}

struct Candidate {
    status: HealthState,
    since: Instant,
}

pub struct HealthMonitor {
    state: Arc<HubState>,
    sub: Subscription,
    canary_last: HashMap<String, DateTime<Utc>>,
    committed: HashMap<String, Committed>,
    candidates: HashMap<String, Candidate>,
    transport_only_warned: HashSet<GatewayKind>,
}

impl HealthMonitor {
    pub fn new(state: Arc<HubState>) -> Self {
        let sub = state.bus.subscribe(TopicFilter::Topics(vec![
            topics::GATEWAY_STATE,
            topics::TICK_INGRESS,
        ]));
        Self {
            state,
            sub,
            canary_last: HashMap::new(),
            committed: HashMap::new(),
            candidates: HashMap::new(),
            transport_only_warned: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        let interval_ms = self.state.config.read().health_interval_ms;
        info!(interval_ms, "health monitor started");
        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_millis(interval_ms.max(50)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate_all();
                }
                ev = self.sub.recv() => {
                    match ev {
                        Some(ev) => self.ingest(ev.kind),
                        None => return,
                    }
                }
            }
        }
    }

    fn ingest(&mut self, kind: EventKind) {
        match kind {
            EventKind::GatewayStateChanged { account_id, .. } => {
                self.evaluate_account(&account_id);
            }
            EventKind::TickIngressed { tick } => {
                let account_id = tick.source_account_id.clone();
                let Some(session) = self.state.session_of(&account_id) else {
                    return;
                };
                let is_canary = self
                    .state
                    .config
                    .read()
                    .canary_symbols(session.gateway_type)
                    .contains(&tick.symbol);
                if is_canary {
                    self.canary_last.insert(account_id.clone(), Utc::now());
                    self.state.bus.publish(EventKind::CanaryTickObserved {
                        account_id: account_id.clone(),
                        symbol: tick.symbol,
                    });
                    self.evaluate_account(&account_id);
                }
            }
            _ => {}
        }
    }

    fn evaluate_all(&mut self) {
        let account_ids: Vec<String> = self.state.sessions.read().keys().cloned().collect();

        // Sessions that disappeared take their health entries with them.
        let gone: Vec<String> = self
            .committed
            .keys()
            .filter(|id| !account_ids.contains(id))
            .cloned()
            .collect();
        for id in gone {
            self.committed.remove(&id);
            self.candidates.remove(&id);
            self.canary_last.remove(&id);
            self.state.health.write().remove(&id);
        }

        for account_id in account_ids {
            self.evaluate_account(&account_id);
        }
    }

    fn evaluate_account(&mut self, account_id: &str) {
        let Some(session) = self.state.session_of(account_id) else {
            return;
        };

        let (threshold_secs, canary_set_empty) = {
            let config = self.state.config.read();
            (
                config.canary_threshold_sec as i64,
                config.canary_symbols(session.gateway_type).is_empty(),
            )
        };

        if canary_set_empty && !self.transport_only_warned.contains(&session.gateway_type) {
            self.transport_only_warned.insert(session.gateway_type);
            warn!(
                gateway_type = %session.gateway_type,
                "no canary symbols configured, degrading to transport-only health"
            );
            self.state.bus.log(
                LogLevel::Warn,
                "health",
                format!(
                    "no canary symbols for {}; transport-only health in effect",
                    session.gateway_type
                ),
            );
        }

        // A session with no canary tick yet measures freshness from its
        // connect time, so it has a full threshold window to produce one.
        let baseline = self
            .canary_last
            .get(account_id)
            .copied()
            .or(session.connect_time);
        let canary_fresh = baseline
            .map(|t| (Utc::now() - t).num_seconds() <= threshold_secs)
            .unwrap_or(false);

        let (status, reason) = classify(session.transport, canary_fresh, canary_set_empty);
        self.apply(account_id, status, reason);
    }

    /// Debounced commit: the candidate must hold for the configured window
    /// before it replaces the committed status. The very first
    /// classification of a session commits immediately.
    fn apply(&mut self, account_id: &str, status: HealthState, reason: &str) {
        let debounce_ms = self.state.config.read().health_debounce_ms;
        let committed_status = self.committed.get(account_id).map(|c| c.status);

        let previous = match committed_status {
            None => {
                self.commit(account_id, status, reason, HealthState::Disconnected);
                return;
            }
            Some(current) if current == status => {
                self.candidates.remove(account_id);
                return;
            }
            Some(current) => current,
        };

        let candidate_matches =
            matches!(self.candidates.get(account_id), Some(c) if c.status == status);
        if !candidate_matches {
            self.candidates.insert(
                account_id.to_string(),
                Candidate {
                    status,
                    since: Instant::now(),
                },
            );
        }
        let held_ms = self
            .candidates
            .get(account_id)
            .map(|c| c.since.elapsed().as_millis() as u64)
            .unwrap_or(0);
        if held_ms >= debounce_ms {
            self.candidates.remove(account_id);
            self.commit(account_id, status, reason, previous);
        }
    }

    fn commit(
        &mut self,
        account_id: &str,
        status: HealthState,
        reason: &str,
        previous: HealthState,
    ) {
        let now = Utc::now();
        let consecutive_failures = {
            let prior = self
                .committed
                .get(account_id)
                .map(|c| c.consecutive_failures)
                .unwrap_or(0);
            match status {
                HealthState::Unhealthy => prior + 1,
                HealthState::Healthy => 0,
                _ => prior,
            }
        };

        self.committed.insert(
            account_id.to_string(),
            Committed {
                status,
                consecutive_failures,
            },
        );
        self.state.health.write().insert(
            account_id.to_string(),
            HealthSnapshot {
                account_id: account_id.to_string(),
                status,
                last_transition_at: now,
                canary_last_tick_at: self.canary_last.get(account_id).copied(),
                consecutive_failures,
                last_reason: reason.to_string(),
            },
        );

        debug!(account_id = %account_id, %status, reason, "health transition committed");
        self.state.bus.publish(EventKind::HealthStatusChanged {
            account_id: account_id.to_string(),
            status,
            previous,
            reason: reason.to_string(),
        });
    }
}

/// The deterministic classification table.
fn classify(
    transport: ConnectionState,
    canary_fresh: bool,
    transport_only: bool,
) -> (HealthState, &'static str) {
    match transport {
        ConnectionState::Connected if transport_only => (HealthState::Healthy, "transport_only"),
        ConnectionState::Connected if canary_fresh => (HealthState::Healthy, "ok"),
        ConnectionState::Connected => (HealthState::Unhealthy, "canary_stale"),
        ConnectionState::Connecting => (HealthState::Recovering, "transport_connecting"),
        ConnectionState::Disconnected => (HealthState::Disconnected, "transport_disconnected"),
        ConnectionState::Error => (HealthState::Unhealthy, "transport_error"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::SessionSnapshot;
    use crate::bus::EventBus;
    use crate::config::HubConfig;
    use crate::types::SessionState;
    use tokio::sync::mpsc;

    fn state_with(config: HubConfig) -> Arc<HubState> {
        let (sup_tx, _sup_rx) = mpsc::channel(8);
        let (rec_tx, _rec_rx) = mpsc::channel(8);
        let (agg_tx, _agg_rx) = mpsc::channel(8);
        Arc::new(HubState::new(
            config,
            EventBus::new(256),
            sup_tx,
            rec_tx,
            agg_tx,
        ))
    }

    fn insert_session(
        state: &HubState,
        account_id: &str,
        transport: ConnectionState,
        connect_time: Option<DateTime<Utc>>,
    ) {
        state.sessions.write().insert(
            account_id.to_string(),
            SessionSnapshot {
                account_id: account_id.to_string(),
                gateway_type: GatewayKind::Ctp,
                state: SessionState::Connected,
                transport,
                connect_time,
                last_tick_time: None,
                subscribed_symbols: vec!["rb2601".into()],
            },
        );
    }

    #[test]
    fn classification_table_is_deterministic() {
        assert_eq!(
            classify(ConnectionState::Connected, true, false),
            (HealthState::Healthy, "ok")
        );
        assert_eq!(
            classify(ConnectionState::Connected, false, false),
            (HealthState::Unhealthy, "canary_stale")
        );
        assert_eq!(
            classify(ConnectionState::Connecting, false, false),
            (HealthState::Recovering, "transport_connecting")
        );
        assert_eq!(
            classify(ConnectionState::Disconnected, true, false),
            (HealthState::Disconnected, "transport_disconnected")
        );
        assert_eq!(
            classify(ConnectionState::Error, true, false),
            (HealthState::Unhealthy, "transport_error")
        );
        // Transport-only mode ignores the canary entirely.
        assert_eq!(
            classify(ConnectionState::Connected, false, true),
            (HealthState::Healthy, "transport_only")
        );
    }

    #[tokio::test]
    async fn first_classification_commits_immediately() {
        let state = state_with(HubConfig::default());
        let mut events = state
            .bus
            .subscribe(TopicFilter::Topics(vec![topics::HEALTH_STATUS]));
        let mut monitor = HealthMonitor::new(state.clone());

        insert_session(&state, "a1", ConnectionState::Connected, Some(Utc::now()));
        monitor.evaluate_account("a1");

        assert_eq!(state.health_of("a1"), Some(HealthState::Healthy));
        match events.try_recv().unwrap().kind {
            EventKind::HealthStatusChanged {
                status, previous, ..
            } => {
                assert_eq!(status, HealthState::Healthy);
                assert_eq!(previous, HealthState::Disconnected);
            }
            _ => panic!("expected health event"),
        }
    }

    #[tokio::test]
    async fn debounce_holds_transitions_until_window_elapses() {
        let state = state_with(HubConfig::default()); // 3s debounce
        let mut monitor = HealthMonitor::new(state.clone());

        insert_session(&state, "a1", ConnectionState::Connected, Some(Utc::now()));
        monitor.evaluate_account("a1");
        assert_eq!(state.health_of("a1"), Some(HealthState::Healthy));

        // Transport drops: the candidate must not commit inside the window.
        insert_session(&state, "a1", ConnectionState::Error, Some(Utc::now()));
        monitor.evaluate_account("a1");
        assert_eq!(state.health_of("a1"), Some(HealthState::Healthy));

        // Age the candidate past the window and re-evaluate.
        let aged = Instant::now()
            .checked_sub(std::time::Duration::from_secs(4))
            .unwrap();
        monitor.candidates.get_mut("a1").unwrap().since = aged;
        monitor.evaluate_account("a1");
        assert_eq!(state.health_of("a1"), Some(HealthState::Unhealthy));
        let snap = state.health.read().get("a1").cloned().unwrap();
        assert_eq!(snap.last_reason, "transport_error");
        assert_eq!(snap.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn flapping_candidate_restarts_the_window() {
        let state = state_with(HubConfig::default());
        let mut monitor = HealthMonitor::new(state.clone());

        insert_session(&state, "a1", ConnectionState::Connected, Some(Utc::now()));
        monitor.evaluate_account("a1");

        insert_session(&state, "a1", ConnectionState::Error, Some(Utc::now()));
        monitor.evaluate_account("a1");
        // Back to healthy before the window elapsed: candidate cleared.
        insert_session(&state, "a1", ConnectionState::Connected, Some(Utc::now()));
        monitor.evaluate_account("a1");
        assert!(monitor.candidates.get("a1").is_none());
        assert_eq!(state.health_of("a1"), Some(HealthState::Healthy));
    }

    #[tokio::test]
    async fn stale_canary_marks_connected_gateway_unhealthy() {
        let mut config = HubConfig::default();
        config.health_debounce_ms = 0;
        config.canary_threshold_sec = 60;
        let state = state_with(config);
        let mut monitor = HealthMonitor::new(state.clone());

        // Connected for longer than the threshold with no canary tick.
        let long_ago = Utc::now() - chrono::Duration::seconds(120);
        insert_session(&state, "a1", ConnectionState::Connected, Some(long_ago));
        monitor.evaluate_account("a1");
        assert_eq!(state.health_of("a1"), Some(HealthState::Unhealthy));
        assert_eq!(
            state.health.read().get("a1").unwrap().last_reason,
            "canary_stale"
        );

        // A canary tick restores health.
        monitor.canary_last.insert("a1".into(), Utc::now());
        monitor.evaluate_account("a1");
        assert_eq!(state.health_of("a1"), Some(HealthState::Healthy));
    }

    #[tokio::test]
    async fn canary_tick_ingest_publishes_observation() {
        let mut config = HubConfig::default();
        config.health_debounce_ms = 0;
        let state = state_with(config);
        let mut events = state
            .bus
            .subscribe(TopicFilter::Topics(vec![topics::CANARY_TICK]));
        let mut monitor = HealthMonitor::new(state.clone());
        insert_session(&state, "a1", ConnectionState::Connected, Some(Utc::now()));

        let raw = crate::types::RawTick {
            symbol: "rb2601".into(),
            exchange: "SHFE".into(),
            last_price: 4500.0,
            last_volume: 1,
            bid_price: 4499.0,
            bid_volume: 1,
            ask_price: 4501.0,
            ask_volume: 1,
            exchange_time: Utc::now().timestamp_millis(),
        };
        let tick = crate::types::Tick::from_raw(&raw, "a1", Utc::now().timestamp_millis());
        monitor.ingest(EventKind::TickIngressed { tick });

        match events.try_recv().unwrap().kind {
            EventKind::CanaryTickObserved { account_id, symbol } => {
                assert_eq!(account_id, "a1");
                assert_eq!(symbol, "rb2601");
            }
            _ => panic!("expected canary observation"),
        }
        assert!(monitor.canary_last.contains_key("a1"));
    }

    #[tokio::test]
    async fn removed_session_drops_health_entry() {
        let mut config = HubConfig::default();
        config.health_debounce_ms = 0;
        let state = state_with(config);
        let mut monitor = HealthMonitor::new(state.clone());
        insert_session(&state, "a1", ConnectionState::Connected, Some(Utc::now()));
        monitor.evaluate_all();
        assert!(state.health_of("a1").is_some());

        state.sessions.write().remove("a1");
        monitor.evaluate_all();
        assert!(state.health_of("a1").is_none());
    }
}
