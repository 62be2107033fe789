// =============================================================================
// Gateway Supervisor — session lifecycle and tick ingress
// =============================================================================
//
// The single owner of every `GatewaySession`. All lifecycle requests —
// from the Control API, the Recovery Controller, and the Aggregator alike
// — arrive on one command channel, so there is never more than one writer
// of session state. Adaptor callbacks (state, tick, error) arrive on a
// second channel shared by all adaptors, tagged with the account id.
//
// Ticks are validated and stamped here, then published on the bus as
// `TickIngressed`; everything downstream (health canary, aggregation,
// egress, dashboard) works off that event.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::app_state::{HubState, SessionSnapshot};
use crate::bus::{Subscription, TopicFilter};
use crate::errors::HubError;
use crate::events::{topics, AccountChange, EventKind, LogLevel};
use crate::gateway::{self, GatewayEvent, GatewayEventKind, UpstreamGateway};
use crate::store::{Account, AccountStore};
use crate::types::{ConnectionState, RawTick, SessionState, Tick};

/// Error codes from a bridge that indicate a rejected login or revoked
/// account; these stop the session instead of letting recovery thrash.
const PERMANENT_ERROR_CODES: [i64; 2] = [401, 403];

type Ack = oneshot::Sender<Result<(), HubError>>;

/// Requests accepted by the Supervisor. Every caller goes through this
/// channel; replies are optional oneshot acks.
pub enum SupervisorCommand {
    Start {
        account_id: String,
        reply: Option<Ack>,
    },
    Stop {
        account_id: String,
        reply: Option<Ack>,
    },
    Restart {
        account_id: String,
        reply: Option<Ack>,
    },
    Subscribe {
        account_id: String,
        symbols: BTreeSet<String>,
    },
    Unsubscribe {
        account_id: String,
        symbols: BTreeSet<String>,
    },
    Migrate {
        symbols: BTreeSet<String>,
        from: Option<String>,
        to: String,
        reply: Option<Ack>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct SessionEntry {
    account: Account,
    adaptor: Box<dyn UpstreamGateway>,
    state: SessionState,
    transport: ConnectionState,
    connect_time: Option<DateTime<Utc>>,
    last_tick_time: Option<DateTime<Utc>>,
    subscribed: BTreeSet<String>,
}

pub struct GatewaySupervisor {
    state: Arc<HubState>,
    store: Arc<AccountStore>,
    cmd_rx: mpsc::Receiver<SupervisorCommand>,
    gw_tx: mpsc::Sender<GatewayEvent>,
    gw_rx: mpsc::Receiver<GatewayEvent>,
    account_events: Subscription,
    sessions: HashMap<String, SessionEntry>,
}

impl GatewaySupervisor {
    pub fn new(
        state: Arc<HubState>,
        store: Arc<AccountStore>,
        cmd_rx: mpsc::Receiver<SupervisorCommand>,
        gw_tx: mpsc::Sender<GatewayEvent>,
        gw_rx: mpsc::Receiver<GatewayEvent>,
    ) -> Self {
        let account_events = state
            .bus
            .subscribe(TopicFilter::Topics(vec![topics::ACCOUNT_MUTATED]));
        Self {
            state,
            store,
            cmd_rx,
            gw_tx,
            gw_rx,
            account_events,
            sessions: HashMap::new(),
        }
    }

    /// Run the supervisor loop. Starts every enabled account, then serves
    /// commands and adaptor events until `Shutdown`.
    pub async fn run(mut self) {
        match self.store.list_enabled() {
            Ok(accounts) => {
                info!(count = accounts.len(), "starting enabled gateway accounts");
                for account in accounts {
                    if let Err(e) = self.start_session(&account.id).await {
                        error!(account_id = %account.id, error = %e, "failed to start gateway");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "account store unavailable at startup");
                self.state
                    .bus
                    .log(LogLevel::Error, "supervisor", format!("store unavailable: {e}"));
            }
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(SupervisorCommand::Shutdown { reply }) => {
                            self.shutdown_all().await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => return,
                    }
                }
                ev = self.gw_rx.recv() => {
                    match ev {
                        Some(ev) => self.handle_gateway_event(ev).await,
                        None => return,
                    }
                }
                ev = self.account_events.recv() => {
                    if let Some(ev) = ev {
                        self.handle_account_mutation(ev.kind).await;
                    }
                }
            }
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Start { account_id, reply } => {
                let result = self.start_session(&account_id).await;
                ack(reply, result);
            }
            SupervisorCommand::Stop { account_id, reply } => {
                let result = self.stop_session(&account_id).await;
                ack(reply, result);
            }
            SupervisorCommand::Restart { account_id, reply } => {
                let result = self.restart_session(&account_id).await;
                ack(reply, result);
            }
            SupervisorCommand::Subscribe {
                account_id,
                symbols,
            } => {
                if let Err(e) = self.subscribe_session(&account_id, symbols).await {
                    debug!(account_id = %account_id, error = %e, "subscribe skipped");
                }
            }
            SupervisorCommand::Unsubscribe {
                account_id,
                symbols,
            } => {
                if let Err(e) = self.unsubscribe_session(&account_id, symbols).await {
                    debug!(account_id = %account_id, error = %e, "unsubscribe skipped");
                }
            }
            SupervisorCommand::Migrate {
                symbols,
                from,
                to,
                reply,
            } => {
                let result = self.migrate_subscriptions(symbols, from, to).await;
                ack(reply, result);
            }
            SupervisorCommand::Shutdown { .. } => unreachable!("handled by run loop"),
        }
    }

    /// Idempotent: a live session for the account means success.
    async fn start_session(&mut self, account_id: &str) -> Result<(), HubError> {
        if self.sessions.contains_key(account_id) {
            debug!(account_id = %account_id, "start: session already live");
            return Ok(());
        }

        let account = self.store.get(account_id)?;
        if !account.enabled {
            return Err(HubError::Validation(format!(
                "account '{account_id}' is disabled"
            )));
        }

        let force_mock = self.state.config.read().gateway_mock;
        let mut adaptor = gateway::build(&account, force_mock, self.gw_tx.clone())?;

        // The canary contracts for this gateway type are always part of the
        // session's subscription set; data-plane liveness depends on them.
        let mut subscribed = BTreeSet::new();
        for symbol in self.state.config.read().canary_symbols(account.gateway_type) {
            subscribed.insert(symbol.clone());
        }
        adaptor
            .subscribe(&subscribed)
            .await
            .map_err(|e| HubError::Transient(format!("subscribe: {e}")))?;
        adaptor
            .connect()
            .await
            .map_err(|e| HubError::Transient(format!("connect: {e}")))?;

        let entry = SessionEntry {
            account,
            adaptor,
            state: SessionState::Connecting,
            transport: ConnectionState::Connecting,
            connect_time: None,
            last_tick_time: None,
            subscribed,
        };
        self.publish_session_state(account_id, SessionState::Connecting, None);
        self.sessions.insert(account_id.to_string(), entry);
        self.mirror(account_id);
        info!(account_id = %account_id, "gateway session starting");
        Ok(())
    }

    async fn stop_session(&mut self, account_id: &str) -> Result<(), HubError> {
        let mut entry = self
            .sessions
            .remove(account_id)
            .ok_or_else(|| HubError::NotFound(format!("no session for '{account_id}'")))?;

        entry.state = SessionState::Terminating;
        self.publish_session_state(account_id, SessionState::Terminating, None);
        entry.adaptor.disconnect().await;
        self.publish_session_state(account_id, SessionState::Disconnected, None);
        self.state.sessions.write().remove(account_id);
        info!(account_id = %account_id, "gateway session stopped");
        Ok(())
    }

    /// Hard restart: tear the adaptor down and replace it with a fresh
    /// instance, preserving the subscription set.
    async fn restart_session(&mut self, account_id: &str) -> Result<(), HubError> {
        let carried_symbols = match self.sessions.remove(account_id) {
            Some(mut entry) => {
                entry.state = SessionState::Terminating;
                self.publish_session_state(account_id, SessionState::Terminating, None);
                entry.adaptor.disconnect().await;
                entry.subscribed
            }
            None => BTreeSet::new(),
        };
        self.state.sessions.write().remove(account_id);

        self.start_session(account_id).await?;
        if !carried_symbols.is_empty() {
            self.subscribe_session(account_id, carried_symbols).await?;
        }
        info!(account_id = %account_id, "gateway session hard-restarted");
        Ok(())
    }

    async fn subscribe_session(
        &mut self,
        account_id: &str,
        symbols: BTreeSet<String>,
    ) -> Result<(), HubError> {
        if symbols.is_empty() {
            return Ok(());
        }
        let entry = self
            .sessions
            .get_mut(account_id)
            .ok_or_else(|| HubError::NotFound(format!("no session for '{account_id}'")))?;
        entry.subscribed.extend(symbols.iter().cloned());
        entry
            .adaptor
            .subscribe(&symbols)
            .await
            .map_err(|e| HubError::Transient(format!("subscribe: {e}")))?;
        self.mirror(account_id);
        Ok(())
    }

    async fn unsubscribe_session(
        &mut self,
        account_id: &str,
        symbols: BTreeSet<String>,
    ) -> Result<(), HubError> {
        if symbols.is_empty() {
            return Ok(());
        }
        let entry = self
            .sessions
            .get_mut(account_id)
            .ok_or_else(|| HubError::NotFound(format!("no session for '{account_id}'")))?;
        for symbol in &symbols {
            entry.subscribed.remove(symbol);
        }
        entry
            .adaptor
            .unsubscribe(&symbols)
            .await
            .map_err(|e| HubError::Transient(format!("unsubscribe: {e}")))?;
        self.mirror(account_id);
        Ok(())
    }

    /// Subscribe on the target, verify it is connected, then unsubscribe
    /// the source — in that order, so no tick gap opens. A dead source is
    /// skipped.
    async fn migrate_subscriptions(
        &mut self,
        symbols: BTreeSet<String>,
        from: Option<String>,
        to: String,
    ) -> Result<(), HubError> {
        if symbols.is_empty() {
            return Ok(());
        }
        if from.as_deref() == Some(to.as_str()) {
            return Ok(());
        }

        self.subscribe_session(&to, symbols.clone()).await?;
        let target = self
            .sessions
            .get(&to)
            .ok_or_else(|| HubError::NotFound(format!("no session for '{to}'")))?;
        if target.transport != ConnectionState::Connected {
            return Err(HubError::Transient(format!(
                "migration target '{to}' is not connected"
            )));
        }

        if let Some(from_id) = &from {
            let source_alive = self
                .sessions
                .get(from_id)
                .map(|s| {
                    !matches!(
                        s.transport,
                        ConnectionState::Disconnected | ConnectionState::Error
                    )
                })
                .unwrap_or(false);
            if source_alive {
                self.unsubscribe_session(from_id, symbols.clone()).await?;
            } else {
                debug!(from = %from_id, "migration source dead, unsubscribe skipped");
            }
        }

        self.state.bus.publish(EventKind::ContractMigrated {
            symbols: symbols.into_iter().collect(),
            from,
            to,
        });
        Ok(())
    }

    async fn shutdown_all(&mut self) {
        info!(count = self.sessions.len(), "stopping all gateway sessions");
        let entries: Vec<(String, SessionEntry)> = self.sessions.drain().collect();
        for (account_id, _) in &entries {
            self.publish_session_state(account_id, SessionState::Terminating, None);
        }
        join_all(entries.into_iter().map(|(_, mut entry)| async move {
            entry.adaptor.disconnect().await;
        }))
        .await;
        self.state.sessions.write().clear();
    }

    // ── Adaptor events ──────────────────────────────────────────────────

    async fn handle_gateway_event(&mut self, ev: GatewayEvent) {
        match ev.kind {
            GatewayEventKind::State { state, detail } => {
                self.handle_transport_state(&ev.account_id, state, detail);
            }
            GatewayEventKind::Tick(raw) => {
                self.handle_raw_tick(&ev.account_id, raw);
            }
            GatewayEventKind::Error { code, message } => {
                self.handle_adaptor_error(&ev.account_id, code, message).await;
            }
        }
    }

    fn handle_transport_state(
        &mut self,
        account_id: &str,
        transport: ConnectionState,
        detail: Option<String>,
    ) {
        let Some(entry) = self.sessions.get_mut(account_id) else {
            // Late event from a torn-down adaptor.
            debug!(account_id = %account_id, ?transport, "transport event for absent session");
            return;
        };

        entry.transport = transport;
        let session_state = match transport {
            ConnectionState::Connecting => SessionState::Connecting,
            ConnectionState::Connected => SessionState::Connected,
            ConnectionState::Disconnected => SessionState::Disconnected,
            ConnectionState::Error => SessionState::Disconnected,
        };
        if transport == ConnectionState::Connected && entry.connect_time.is_none() {
            entry.connect_time = Some(Utc::now());
        }

        if entry.state != session_state {
            entry.state = session_state;
            self.publish_session_state(account_id, session_state, detail);
        }
        self.mirror(account_id);
    }

    fn handle_raw_tick(&mut self, account_id: &str, raw: RawTick) {
        let Some(entry) = self.sessions.get_mut(account_id) else {
            return;
        };

        let now = Utc::now();
        let skew_ms = self.state.config.read().max_clock_skew_sec as i64 * 1000;
        if let Err(reason) = validate_raw_tick(&raw, now.timestamp_millis(), skew_ms) {
            self.state.counters.ticks_rejected.fetch_add(1, Ordering::Relaxed);
            // The bus event below is the authoritative record of a reject.
            debug!(
                account_id = %account_id,
                symbol = %raw.symbol,
                reason,
                "tick rejected"
            );
            self.state.bus.log(
                LogLevel::Warn,
                "supervisor",
                format!("tick rejected from '{account_id}' ({}): {reason}", raw.symbol),
            );
            return;
        }

        entry.last_tick_time = Some(now);
        if let Some(snap) = self.state.sessions.write().get_mut(account_id) {
            snap.last_tick_time = Some(now);
        }
        let tick = Tick::from_raw(&raw, account_id, now.timestamp_millis());
        self.state.counters.ticks_ingressed.fetch_add(1, Ordering::Relaxed);
        self.state.bus.publish(EventKind::TickIngressed { tick });
    }

    async fn handle_adaptor_error(&mut self, account_id: &str, code: i64, message: String) {
        self.state.bus.log(
            LogLevel::Error,
            "gateway",
            format!("'{account_id}' error {code}: {message}"),
        );
        if PERMANENT_ERROR_CODES.contains(&code) {
            // Authentication rejected; retrying cannot help. Stop the
            // session and leave the rest of the hub running.
            error!(account_id = %account_id, code, "permanent gateway error, stopping session");
            let _ = self.stop_session(account_id).await;
        }
    }

    // ── Account mutations ───────────────────────────────────────────────

    async fn handle_account_mutation(&mut self, kind: EventKind) {
        let EventKind::AccountMutated {
            account_id,
            change,
            enabled,
            settings_changed,
            ..
        } = kind
        else {
            return;
        };

        let has_session = self.sessions.contains_key(&account_id);
        let result = match change {
            AccountChange::Created if enabled => self.start_session(&account_id).await,
            AccountChange::Deleted if has_session => self.stop_session(&account_id).await,
            AccountChange::Updated => {
                if !enabled && has_session {
                    self.stop_session(&account_id).await
                } else if enabled && !has_session {
                    self.start_session(&account_id).await
                } else if enabled && settings_changed {
                    self.restart_session(&account_id).await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!(account_id = %account_id, error = %e, "failed to apply account mutation");
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn publish_session_state(
        &self,
        account_id: &str,
        state: SessionState,
        detail: Option<String>,
    ) {
        self.state.bus.publish(EventKind::GatewayStateChanged {
            account_id: account_id.to_string(),
            state,
            detail,
        });
    }

    fn mirror(&self, account_id: &str) {
        if let Some(entry) = self.sessions.get(account_id) {
            self.state.sessions.write().insert(
                account_id.to_string(),
                SessionSnapshot {
                    account_id: account_id.to_string(),
                    gateway_type: entry.account.gateway_type,
                    state: entry.state,
                    transport: entry.transport,
                    connect_time: entry.connect_time,
                    last_tick_time: entry.last_tick_time,
                    subscribed_symbols: entry.subscribed.iter().cloned().collect(),
                },
            );
        }
    }
}

fn ack(reply: Option<Ack>, result: Result<(), HubError>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    } else if let Err(e) = result {
        warn!(error = %e, "unacked supervisor command failed");
    }
}

/// Ingress validation per the canonical tick invariants.
fn validate_raw_tick(raw: &RawTick, now_ms: i64, skew_ms: i64) -> Result<(), &'static str> {
    if raw.symbol.is_empty() {
        return Err("empty symbol");
    }
    if raw.last_price <= 0.0 {
        return Err("non-positive last_price");
    }
    if raw.last_volume < 0 {
        return Err("negative last_volume");
    }
    if raw.exchange_time > now_ms + skew_ms {
        return Err("exchange_time in the future");
    }
    Ok(())
}
