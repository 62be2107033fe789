// =============================================================================
// Quote Aggregation Engine — per-symbol source election and forwarding
// =============================================================================
//
// Owns one `ContractBinding` per subscribed symbol. Election picks the
// first account in `(priority, id)` order whose session is healthy;
// failover migrates the subscription through the Supervisor and flips the
// forwarding filter. Warm standby keeps every eligible connected account
// subscribed, so the backup's stream is already flowing when the filter
// flips — duplicates during the overlap are suppressed by the
// source-equality check plus a last-tick identity check.
//
// The forwarding path is deliberately cheap: one map lookup, one health
// read, one channel try_send.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::app_state::{BindingSnapshot, HubState};
use crate::bus::{Subscription, TopicFilter};
use crate::events::{topics, EventKind, LogLevel};
use crate::store::{Account, AccountStore};
use crate::supervisor::SupervisorCommand;
use crate::types::{GatewayKind, HealthState, Tick};

/// Requests accepted by the engine.
pub enum AggregatorCommand {
    /// Make sure bindings exist for `symbols` (dynamic subscription from a
    /// WS client or the Control API). Empty lists are a legal no-op.
    EnsureBinding {
        symbols: Vec<String>,
        gateway_type: GatewayKind,
    },
}

/// How long an election waits for the Supervisor to ack a migration.
const MIGRATE_ACK_TIMEOUT_MS: u64 = 2000;

struct Binding {
    symbol: String,
    gateway_type: GatewayKind,
    preferred: Vec<String>,
    current: Option<String>,
    pending_migration: bool,
    last_identity: Option<(i64, i64, i64)>,
    forwarded: u64,
    filtered: u64,
    no_source_logged: bool,
}

pub struct QuoteAggregator {
    state: Arc<HubState>,
    store: Arc<AccountStore>,
    sub: Subscription,
    cmd_rx: mpsc::Receiver<AggregatorCommand>,
    egress_tx: mpsc::Sender<Tick>,
    bindings: HashMap<String, Binding>,
}

impl QuoteAggregator {
    pub fn new(
        state: Arc<HubState>,
        store: Arc<AccountStore>,
        cmd_rx: mpsc::Receiver<AggregatorCommand>,
        egress_tx: mpsc::Sender<Tick>,
    ) -> Self {
        let sub = state.bus.subscribe(TopicFilter::Topics(vec![
            topics::HEALTH_STATUS,
            topics::TICK_INGRESS,
            topics::ACCOUNT_MUTATED,
        ]));
        Self {
            state,
            store,
            sub,
            cmd_rx,
            egress_tx,
            bindings: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        self.seed_from_config();
        self.refresh_preferred();
        self.elect_all().await;
        info!(bindings = self.bindings.len(), "quote aggregator started");

        loop {
            tokio::select! {
                ev = self.sub.recv() => {
                    match ev {
                        Some(ev) => match ev.kind {
                            EventKind::TickIngressed { tick } => self.forward(tick),
                            EventKind::HealthStatusChanged { .. } => self.elect_all().await,
                            EventKind::AccountMutated { .. } => {
                                self.refresh_preferred();
                                self.elect_all().await;
                            }
                            _ => {}
                        },
                        None => return,
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(AggregatorCommand::EnsureBinding { symbols, gateway_type }) => {
                            self.ensure_bindings(symbols, gateway_type);
                            self.refresh_preferred();
                            self.elect_all().await;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    // ── Binding management ──────────────────────────────────────────────

    /// The configured universe plus the canary contracts of each type.
    fn seed_from_config(&mut self) {
        let (ctp, sopt) = {
            let config = self.state.config.read();
            let mut ctp = config.symbols_ctp.clone();
            ctp.extend(config.canary_symbols_ctp.iter().cloned());
            let mut sopt = config.symbols_sopt.clone();
            sopt.extend(config.canary_symbols_sopt.iter().cloned());
            (ctp, sopt)
        };
        self.ensure_bindings(ctp, GatewayKind::Ctp);
        self.ensure_bindings(sopt, GatewayKind::Sopt);
    }

    fn ensure_bindings(&mut self, symbols: Vec<String>, gateway_type: GatewayKind) {
        for symbol in symbols {
            if symbol.is_empty() || self.bindings.contains_key(&symbol) {
                continue;
            }
            self.bindings.insert(
                symbol.clone(),
                Binding {
                    symbol,
                    gateway_type,
                    preferred: Vec::new(),
                    current: None,
                    pending_migration: false,
                    last_identity: None,
                    forwarded: 0,
                    filtered: 0,
                    no_source_logged: false,
                },
            );
        }
    }

    /// Rebuild every binding's preference order from the store. The store
    /// already returns `(gateway_type, priority, id)` order; ties inside a
    /// priority level resolve by id.
    fn refresh_preferred(&mut self) {
        let accounts = match self.store.list_enabled() {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "store unavailable, keeping stale preference order");
                return;
            }
        };
        let allow_cross = self.state.config.read().allow_cross_type_failover;

        for binding in self.bindings.values_mut() {
            let mut preferred: Vec<String> = accounts
                .iter()
                .filter(|a| kind_matches(binding.gateway_type, a.gateway_type))
                .map(|a| a.id.clone())
                .collect();
            preferred.sort_by_key(|id| sort_key(&accounts, id));
            if allow_cross {
                let mut others: Vec<String> = accounts
                    .iter()
                    .filter(|a| !kind_matches(binding.gateway_type, a.gateway_type))
                    .map(|a| a.id.clone())
                    .collect();
                others.sort_by_key(|id| sort_key(&accounts, id));
                preferred.extend(others);
            }
            binding.preferred = preferred;
        }
    }

    // ── Election ────────────────────────────────────────────────────────

    async fn elect_all(&mut self) {
        let symbols: Vec<String> = self.bindings.keys().cloned().collect();
        for symbol in symbols {
            self.elect(&symbol).await;
        }
    }

    async fn elect(&mut self, symbol: &str) {
        let (preferred, current, gateway_type) = {
            let Some(binding) = self.bindings.get(symbol) else {
                return;
            };
            (
                binding.preferred.clone(),
                binding.current.clone(),
                binding.gateway_type,
            )
        };

        // Warm standby: every preferred account with a live session keeps
        // the symbol subscribed, so failover never waits on a subscribe
        // round-trip upstream.
        for account_id in &preferred {
            if self.state.session_of(account_id).is_some() {
                let _ = self
                    .state
                    .supervisor_tx
                    .send(SupervisorCommand::Subscribe {
                        account_id: account_id.clone(),
                        symbols: [symbol.to_string()].into_iter().collect(),
                    })
                    .await;
            }
        }

        let elected = preferred
            .iter()
            .find(|id| self.state.health_of(id) == Some(HealthState::Healthy))
            .cloned();

        if elected == current {
            return;
        }

        match elected {
            Some(to) => {
                self.set_pending(symbol, true);
                let started = Instant::now();
                let migrated = self.migrate(symbol, current.clone(), &to).await;
                match migrated {
                    Ok(()) => {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        info!(
                            symbol = %symbol,
                            from = current.as_deref().unwrap_or("-"),
                            to = %to,
                            duration_ms,
                            "failover executed"
                        );
                        if let Some(binding) = self.bindings.get_mut(symbol) {
                            binding.current = Some(to.clone());
                            binding.pending_migration = false;
                            binding.no_source_logged = false;
                        }
                        self.state.bus.publish(EventKind::FailoverExecuted {
                            symbol: symbol.to_string(),
                            from: current,
                            to,
                            duration_ms,
                        });
                    }
                    Err(e) => {
                        // Leave the binding as it was; the next health event
                        // re-runs election.
                        warn!(symbol = %symbol, to = %to, error = %e, "migration failed");
                        self.set_pending(symbol, false);
                    }
                }
                self.mirror(symbol);
            }
            None => {
                let should_log = {
                    let Some(binding) = self.bindings.get_mut(symbol) else {
                        return;
                    };
                    binding.current = None;
                    let first = !binding.no_source_logged;
                    binding.no_source_logged = true;
                    first
                };
                if should_log {
                    warn!(symbol = %symbol, gateway_type = %gateway_type, "no source available");
                    self.state.bus.log(
                        LogLevel::Warn,
                        "aggregator",
                        format!("no_source_available for '{symbol}'"),
                    );
                }
                self.mirror(symbol);
            }
        }
    }

    async fn migrate(
        &self,
        symbol: &str,
        from: Option<String>,
        to: &str,
    ) -> Result<(), crate::errors::HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.state
            .supervisor_tx
            .send(SupervisorCommand::Migrate {
                symbols: [symbol.to_string()].into_iter().collect(),
                from,
                to: to.to_string(),
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| crate::errors::HubError::DependencyUnavailable("supervisor gone".into()))?;

        match tokio::time::timeout(
            tokio::time::Duration::from_millis(MIGRATE_ACK_TIMEOUT_MS),
            reply_rx,
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(crate::errors::HubError::Transient(
                "supervisor dropped migration ack".into(),
            )),
            Err(_) => Err(crate::errors::HubError::Transient(
                "migration ack timed out".into(),
            )),
        }
    }

    // ── Forwarding ──────────────────────────────────────────────────────

    /// First-arrival-from-current-source filter. Anything not from the
    /// elected healthy source is dropped here, which is also what
    /// deduplicates the overlap window during migration.
    fn forward(&mut self, tick: Tick) {
        let Some(binding) = self.bindings.get_mut(&tick.symbol) else {
            return;
        };

        let from_current = binding.current.as_deref() == Some(tick.source_account_id.as_str());
        if !from_current {
            binding.filtered += 1;
            self.state.counters.ticks_filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // The elected source must still be healthy at the instant of
        // forwarding; a tick racing a health downgrade is dropped.
        if self.state.health_of(&tick.source_account_id) != Some(HealthState::Healthy) {
            binding.filtered += 1;
            self.state.counters.ticks_filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let identity = tick.identity();
        if binding.last_identity == Some(identity) {
            binding.filtered += 1;
            self.state.counters.ticks_filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        binding.last_identity = Some(identity);
        binding.forwarded += 1;

        self.state.counters.ticks_egressed.fetch_add(1, Ordering::Relaxed);
        if self.egress_tx.try_send(tick.clone()).is_err() {
            self.state.counters.egress_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %tick.symbol, "egress queue full, tick dropped");
        }
        let forwarded = binding.forwarded;
        let filtered = binding.filtered;
        let symbol = tick.symbol.clone();
        self.state.bus.publish(EventKind::TickEgressed { tick });

        // Keep the snapshot counters fresh without recloning the binding.
        if let Some(snap) = self.state.bindings.write().get_mut(&symbol) {
            snap.forwarded = forwarded;
            snap.filtered = filtered;
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn set_pending(&mut self, symbol: &str, pending: bool) {
        if let Some(binding) = self.bindings.get_mut(symbol) {
            binding.pending_migration = pending;
        }
        self.mirror(symbol);
    }

    fn mirror(&self, symbol: &str) {
        if let Some(binding) = self.bindings.get(symbol) {
            self.state.bindings.write().insert(
                symbol.to_string(),
                BindingSnapshot {
                    symbol: binding.symbol.clone(),
                    gateway_type: binding.gateway_type,
                    preferred_priority_order: binding.preferred.clone(),
                    current_source: binding.current.clone(),
                    pending_migration: binding.pending_migration,
                    forwarded: binding.forwarded,
                    filtered: binding.filtered,
                },
            );
        }
    }
}

/// Mock sessions stand in for any vendor, so they are eligible for every
/// binding type; otherwise types must match exactly.
fn kind_matches(binding: GatewayKind, account: GatewayKind) -> bool {
    binding == account || account == GatewayKind::Mock
}

fn sort_key(accounts: &[Account], id: &str) -> (i64, String) {
    accounts
        .iter()
        .find(|a| a.id == id)
        .map(|a| (a.priority, a.id.clone()))
        .unwrap_or((i64::MAX, id.to_string()))
}
