// =============================================================================
// Recovery Controller — cooldown / restart / observe cycles
// =============================================================================
//
// Consumes health transitions only; it never reads the Health Monitor's
// internals and it drives the Supervisor exclusively through the same
// command channel the Control API uses. At most one active cycle per
// account. The cycle:
//
//   UNHEALTHY -> cooldown (min * 2^attempts, clamped) -> hard restart ->
//   observation window -> HEALTHY (completed, attempts reset) or timeout
//   (failed, re-enter cooldown). After max attempts the account is parked
//   as permanently failed until an operator restart resets the counter.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::app_state::{HubState, RecoverySnapshot};
use crate::bus::{Subscription, TopicFilter};
use crate::events::{topics, EventKind, LogLevel, RecoveryPhaseKind};
use crate::supervisor::SupervisorCommand;
use crate::types::HealthState;

/// Requests accepted by the controller.
pub enum RecoveryCommand {
    /// Operator reset: zero the attempt counter and leave the parked state.
    ResetAttempts { account_id: String },
}

/// Timer resolution of the cycle state machine.
const POLL_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Idle,
    CoolingDown { until: Instant },
    Observing { until: Instant },
    PermanentlyFailed,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CoolingDown { .. } => "cooling_down",
            Self::Observing { .. } => "observing",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }
}

struct Cycle {
    phase: Phase,
    attempts: u32,
}

/// Tunables, split out of `HubConfig` so tests can run sub-second cycles.
#[derive(Debug, Clone)]
pub struct RecoveryParams {
    pub cooldown_min: Duration,
    pub cooldown_max: Duration,
    pub observation: Duration,
    pub max_attempts: u32,
}

impl RecoveryParams {
    pub fn from_config(config: &crate::config::HubConfig) -> Self {
        Self {
            cooldown_min: Duration::from_secs(config.cooldown_min_sec),
            cooldown_max: Duration::from_secs(config.cooldown_max_sec),
            observation: Duration::from_secs(config.recovery_observation_sec),
            max_attempts: config.max_restart_attempts,
        }
    }
}

pub struct RecoveryController {
    state: Arc<HubState>,
    params: RecoveryParams,
    sub: Subscription,
    cmd_rx: mpsc::Receiver<RecoveryCommand>,
    supervisor_tx: mpsc::Sender<SupervisorCommand>,
    cycles: HashMap<String, Cycle>,
}

impl RecoveryController {
    pub fn new(
        state: Arc<HubState>,
        params: RecoveryParams,
        cmd_rx: mpsc::Receiver<RecoveryCommand>,
        supervisor_tx: mpsc::Sender<SupervisorCommand>,
    ) -> Self {
        let sub = state
            .bus
            .subscribe(TopicFilter::Topics(vec![topics::HEALTH_STATUS]));
        Self {
            state,
            params,
            sub,
            cmd_rx,
            supervisor_tx,
            cycles: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        info!(
            cooldown_min_secs = self.params.cooldown_min.as_secs(),
            max_attempts = self.params.max_attempts,
            "recovery controller started"
        );
        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_millis(POLL_INTERVAL_MS));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_timers().await;
                }
                ev = self.sub.recv() => {
                    match ev {
                        Some(ev) => {
                            if let EventKind::HealthStatusChanged { account_id, status, .. } = ev.kind {
                                self.on_health(&account_id, status);
                            }
                        }
                        None => return,
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(RecoveryCommand::ResetAttempts { account_id }) => {
                            self.reset(&account_id);
                        }
                        None => return,
                    }
                }
            }
        }
    }

    // ── Health transitions ──────────────────────────────────────────────

    fn on_health(&mut self, account_id: &str, status: HealthState) {
        let params = self.params.clone();
        let transition = {
            let cycle = self.cycles.entry(account_id.to_string()).or_insert(Cycle {
                phase: Phase::Idle,
                attempts: 0,
            });

            match (status, &cycle.phase) {
                (HealthState::Unhealthy, Phase::Idle) => {
                    let attempt = cycle.attempts;
                    let cooldown = cooldown_for(attempt, &params);
                    cycle.phase = Phase::CoolingDown {
                        until: Instant::now() + cooldown,
                    };
                    info!(
                        account_id = %account_id,
                        cooldown_secs = cooldown.as_secs_f64(),
                        attempt,
                        "gateway unhealthy, cooldown started"
                    );
                    Some((RecoveryPhaseKind::CooldownStarted, attempt))
                }
                (HealthState::Healthy, Phase::CoolingDown { .. }) => {
                    cycle.attempts = 0;
                    cycle.phase = Phase::Idle;
                    info!(account_id = %account_id, "recovered during cooldown, cycle aborted");
                    Some((RecoveryPhaseKind::Aborted, 0))
                }
                (HealthState::Healthy, Phase::Observing { .. }) => {
                    let attempt = cycle.attempts;
                    cycle.attempts = 0;
                    cycle.phase = Phase::Idle;
                    info!(account_id = %account_id, attempt, "recovery completed");
                    Some((RecoveryPhaseKind::Completed, attempt))
                }
                _ => None,
            }
        };
        if let Some((phase, attempt)) = transition {
            self.publish_phase(account_id, phase, attempt);
        }
        self.mirror(account_id);
    }

    // ── Timers ──────────────────────────────────────────────────────────

    async fn poll_timers(&mut self) {
        // Sessions that no longer exist take their cycles with them.
        let live: Vec<String> = self.state.sessions.read().keys().cloned().collect();
        let gone: Vec<String> = self
            .cycles
            .keys()
            .filter(|id| !live.contains(id))
            .cloned()
            .collect();
        for id in gone {
            self.cycles.remove(&id);
            self.state.recovery.write().remove(&id);
        }

        let now = Instant::now();
        let due: Vec<(String, Phase)> = self
            .cycles
            .iter()
            .filter_map(|(id, cycle)| match cycle.phase {
                Phase::CoolingDown { until } if now >= until => {
                    Some((id.clone(), cycle.phase.clone()))
                }
                Phase::Observing { until } if now >= until => {
                    Some((id.clone(), cycle.phase.clone()))
                }
                _ => None,
            })
            .collect();

        for (account_id, phase) in due {
            match phase {
                Phase::CoolingDown { .. } => self.cooldown_expired(&account_id).await,
                Phase::Observing { .. } => self.observation_expired(&account_id),
                _ => {}
            }
            self.mirror(&account_id);
        }
    }

    async fn cooldown_expired(&mut self, account_id: &str) {
        // A healthy flip may have raced the timer; never restart a healthy
        // gateway.
        if self.state.health_of(account_id) == Some(HealthState::Healthy) {
            if let Some(cycle) = self.cycles.get_mut(account_id) {
                cycle.attempts = 0;
                cycle.phase = Phase::Idle;
            }
            self.publish_phase(account_id, RecoveryPhaseKind::Aborted, 0);
            return;
        }

        let Some(cycle) = self.cycles.get_mut(account_id) else {
            return;
        };
        cycle.attempts += 1;
        let attempt = cycle.attempts;
        cycle.phase = Phase::Observing {
            until: Instant::now() + self.params.observation,
        };

        warn!(account_id = %account_id, attempt, "cooldown expired, issuing hard restart");
        self.publish_phase(account_id, RecoveryPhaseKind::Restarting, attempt);
        let _ = self
            .supervisor_tx
            .send(SupervisorCommand::Restart {
                account_id: account_id.to_string(),
                reply: None,
            })
            .await;
    }

    fn observation_expired(&mut self, account_id: &str) {
        let Some(cycle) = self.cycles.get_mut(account_id) else {
            return;
        };
        let attempt = cycle.attempts;
        warn!(account_id = %account_id, attempt, "restart did not restore health");
        self.publish_phase(account_id, RecoveryPhaseKind::Failed, attempt);

        if attempt >= self.params.max_attempts {
            if let Some(cycle) = self.cycles.get_mut(account_id) {
                cycle.phase = Phase::PermanentlyFailed;
            }
            error!(
                account_id = %account_id,
                attempts = attempt,
                "max restart attempts exhausted, parking account"
            );
            self.state.bus.log(
                LogLevel::Error,
                "recovery",
                format!(
                    "account '{account_id}' permanently failed after {attempt} restart attempts; \
                     operator restart required"
                ),
            );
            self.publish_phase(account_id, RecoveryPhaseKind::PermanentlyFailed, attempt);
        } else {
            let cooldown = cooldown_for(attempt, &self.params);
            if let Some(cycle) = self.cycles.get_mut(account_id) {
                cycle.phase = Phase::CoolingDown {
                    until: Instant::now() + cooldown,
                };
            }
            self.publish_phase(account_id, RecoveryPhaseKind::CooldownStarted, attempt);
        }
    }

    // ── Operator reset ──────────────────────────────────────────────────

    fn reset(&mut self, account_id: &str) {
        if let Some(cycle) = self.cycles.get_mut(account_id) {
            info!(account_id = %account_id, "recovery attempts reset by operator");
            cycle.attempts = 0;
            cycle.phase = Phase::Idle;
            self.mirror(account_id);
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn publish_phase(&self, account_id: &str, phase: RecoveryPhaseKind, attempt: u32) {
        self.state.bus.publish(EventKind::RecoveryPhase {
            account_id: account_id.to_string(),
            phase,
            attempt,
        });
    }

    fn mirror(&self, account_id: &str) {
        if let Some(cycle) = self.cycles.get(account_id) {
            self.state.recovery.write().insert(
                account_id.to_string(),
                RecoverySnapshot {
                    account_id: account_id.to_string(),
                    phase: cycle.phase.name().to_string(),
                    restart_attempts: cycle.attempts,
                    permanently_failed: cycle.phase == Phase::PermanentlyFailed,
                },
            );
        }
    }
}

/// `min * 2^attempts`, clamped to `[min, max]`.
fn cooldown_for(attempts: u32, params: &RecoveryParams) -> Duration {
    let factor = 2u64.saturating_pow(attempts.min(32));
    let cooldown = params
        .cooldown_min
        .saturating_mul(factor.min(u32::MAX as u64) as u32);
    cooldown.clamp(params.cooldown_min, params.cooldown_max)
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
    use crate::types::{ConnectionState, GatewayKind, SessionState};
    use chrono::Utc;
    use tokio::time::{timeout, Duration as TokioDuration};

    fn params_fast() -> RecoveryParams {
        RecoveryParams {
            cooldown_min: Duration::from_millis(40),
            cooldown_max: Duration::from_millis(400),
            observation: Duration::from_millis(80),
            max_attempts: 2,
        }
    }

    struct Harness {
        state: Arc<HubState>,
        rec_tx: mpsc::Sender<RecoveryCommand>,
        sup_rx: mpsc::Receiver<SupervisorCommand>,
    }

    fn harness(params: RecoveryParams) -> Harness {
        let bus = EventBus::new(256);
        let (sup_tx, sup_rx) = mpsc::channel(32);
        let (rec_tx, rec_rx) = mpsc::channel(8);
        let (agg_tx, _agg_rx) = mpsc::channel(8);
        let state = Arc::new(HubState::new(
            HubConfig::default(),
            bus,
            sup_tx.clone(),
            rec_tx.clone(),
            agg_tx,
        ));
        // A live session so the cycle is not garbage-collected.
        state.sessions.write().insert(
            "a1".into(),
            SessionSnapshot {
                account_id: "a1".into(),
                gateway_type: GatewayKind::Mock,
                state: SessionState::Connected,
                transport: ConnectionState::Connected,
                connect_time: Some(Utc::now()),
                last_tick_time: None,
                subscribed_symbols: vec![],
            },
        );

        let controller = RecoveryController::new(state.clone(), params, rec_rx, sup_tx);
        tokio::spawn(controller.run());
        Harness {
            state,
            rec_tx,
            sup_rx,
        }
    }

    fn set_health(state: &HubState, account_id: &str, status: HealthState) {
        state.health.write().insert(
            account_id.to_string(),
            crate::app_state::HealthSnapshot {
                account_id: account_id.to_string(),
                status,
                last_transition_at: Utc::now(),
                canary_last_tick_at: None,
                consecutive_failures: 0,
                last_reason: "test".into(),
            },
        );
        state.bus.publish(EventKind::HealthStatusChanged {
            account_id: account_id.to_string(),
            status,
            previous: HealthState::Healthy,
            reason: "test".into(),
        });
    }

    #[test]
    fn cooldown_backoff_doubles_and_clamps() {
        let params = RecoveryParams {
            cooldown_min: Duration::from_secs(5),
            cooldown_max: Duration::from_secs(300),
            observation: Duration::from_secs(30),
            max_attempts: 5,
        };
        assert_eq!(cooldown_for(0, &params), Duration::from_secs(5));
        assert_eq!(cooldown_for(1, &params), Duration::from_secs(10));
        assert_eq!(cooldown_for(3, &params), Duration::from_secs(40));
        assert_eq!(cooldown_for(10, &params), Duration::from_secs(300));
        assert_eq!(cooldown_for(32, &params), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn unhealthy_triggers_restart_after_cooldown() {
        let mut h = harness(params_fast());
        set_health(&h.state, "a1", HealthState::Unhealthy);

        let cmd = timeout(TokioDuration::from_secs(2), h.sup_rx.recv())
            .await
            .expect("restart issued")
            .unwrap();
        match cmd {
            SupervisorCommand::Restart { account_id, .. } => assert_eq!(account_id, "a1"),
            _ => panic!("expected restart"),
        }
        let snap = h.state.recovery.read().get("a1").cloned().unwrap();
        assert_eq!(snap.restart_attempts, 1);
    }

    #[tokio::test]
    async fn healthy_during_cooldown_aborts_cycle() {
        let mut h = harness(RecoveryParams {
            cooldown_min: Duration::from_millis(500),
            ..params_fast()
        });
        set_health(&h.state, "a1", HealthState::Unhealthy);
        tokio::time::sleep(TokioDuration::from_millis(50)).await;
        set_health(&h.state, "a1", HealthState::Healthy);

        // No restart may arrive.
        let res = timeout(TokioDuration::from_millis(800), h.sup_rx.recv()).await;
        assert!(res.is_err(), "restart must not be issued after abort");
        let snap = h.state.recovery.read().get("a1").cloned().unwrap();
        assert_eq!(snap.restart_attempts, 0);
        assert_eq!(snap.phase, "idle");
    }

    #[tokio::test]
    async fn healthy_during_observation_completes_and_resets() {
        let mut h = harness(params_fast());
        let mut phases = h
            .state
            .bus
            .subscribe(TopicFilter::Topics(vec![topics::RECOVERY_PHASE]));
        set_health(&h.state, "a1", HealthState::Unhealthy);

        // Wait for the restart, then report health restored.
        let _ = timeout(TokioDuration::from_secs(2), h.sup_rx.recv())
            .await
            .expect("restart issued");
        set_health(&h.state, "a1", HealthState::Healthy);

        let mut completed_attempt = None;
        for _ in 0..10 {
            let Some(ev) = timeout(TokioDuration::from_secs(1), phases.recv())
                .await
                .ok()
                .flatten()
            else {
                break;
            };
            if let EventKind::RecoveryPhase {
                phase: RecoveryPhaseKind::Completed,
                attempt,
                ..
            } = ev.kind
            {
                completed_attempt = Some(attempt);
                break;
            }
        }
        assert_eq!(completed_attempt, Some(1));
        let snap = h.state.recovery.read().get("a1").cloned().unwrap();
        assert_eq!(snap.restart_attempts, 0);
    }

    #[tokio::test]
    async fn attempts_are_bounded_then_parked_until_reset() {
        let mut h = harness(params_fast());
        let mut phases = h
            .state
            .bus
            .subscribe(TopicFilter::Topics(vec![topics::RECOVERY_PHASE]));
        set_health(&h.state, "a1", HealthState::Unhealthy);

        // Let the cycle burn through both attempts (health never restored).
        let mut restarts = 0;
        let mut parked = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !parked {
            tokio::select! {
                cmd = h.sup_rx.recv() => {
                    if matches!(cmd, Some(SupervisorCommand::Restart { .. })) {
                        restarts += 1;
                    }
                }
                ev = phases.recv() => {
                    if let Some(ev) = ev {
                        if matches!(ev.kind, EventKind::RecoveryPhase { phase: RecoveryPhaseKind::PermanentlyFailed, .. }) {
                            parked = true;
                        }
                    }
                }
                _ = tokio::time::sleep(TokioDuration::from_millis(100)) => {}
            }
        }
        assert!(parked, "cycle must park after max attempts");
        assert_eq!(restarts, 2, "restart attempts bounded by max_attempts");
        let snap = h.state.recovery.read().get("a1").cloned().unwrap();
        assert!(snap.permanently_failed);

        // Operator reset returns the cycle to idle.
        h.rec_tx
            .send(RecoveryCommand::ResetAttempts {
                account_id: "a1".into(),
            })
            .await
            .unwrap();
        for _ in 0..50 {
            if h.state.recovery.read().get("a1").map(|s| s.phase.clone())
                == Some("idle".to_string())
            {
                break;
            }
            tokio::time::sleep(TokioDuration::from_millis(20)).await;
        }
        let snap = h.state.recovery.read().get("a1").cloned().unwrap();
        assert_eq!(snap.restart_attempts, 0);
        assert!(!snap.permanently_failed);
    }
}
