// =============================================================================
// Typed bus events
// =============================================================================
//
// Every cross-component fact travels as one of these variants. Events are
// immutable after publication and carry a wall-clock timestamp plus a
// correlation id for tracing a control action or failover across
// components. Serialization uses an `event_type` tag so WebSocket clients
// can dispatch without knowing the Rust enum.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{GatewayKind, HealthState, SessionState, Tick};

/// Bus topics. Subscriptions filter on these; `*` is expressed as
/// [`crate::bus::TopicFilter::All`].
pub mod topics {
    pub const GATEWAY_STATE: &str = "gateway.state";
    pub const HEALTH_STATUS: &str = "health.status";
    pub const CANARY_TICK: &str = "canary.tick";
    pub const RECOVERY_PHASE: &str = "recovery.phase";
    pub const FAILOVER: &str = "failover.executed";
    pub const CONTRACT_MIGRATED: &str = "contract.migrated";
    pub const TICK_INGRESS: &str = "tick.ingress";
    pub const TICK_EGRESS: &str = "tick.egress";
    pub const SYSTEM_LOG: &str = "system.log";
    pub const CONTROL_REQUESTED: &str = "control.requested";
    pub const CONTROL_COMPLETED: &str = "control.completed";
    pub const ACCOUNT_MUTATED: &str = "account.mutated";
}

/// Severity of a [`EventKind::SystemLog`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Phase markers published by the Recovery Controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhaseKind {
    CooldownStarted,
    Aborted,
    Restarting,
    Completed,
    Failed,
    PermanentlyFailed,
}

/// How an account row changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountChange {
    Created,
    Updated,
    Deleted,
}

/// Outcome of a control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Completed,
    Accepted,
    Failed,
}

/// The tagged variant set. Field names here are the wire contract for
/// WebSocket dashboard clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    GatewayStateChanged {
        account_id: String,
        state: SessionState,
        detail: Option<String>,
    },
    HealthStatusChanged {
        account_id: String,
        status: HealthState,
        previous: HealthState,
        reason: String,
    },
    CanaryTickObserved {
        account_id: String,
        symbol: String,
    },
    RecoveryPhase {
        account_id: String,
        phase: RecoveryPhaseKind,
        attempt: u32,
    },
    FailoverExecuted {
        symbol: String,
        from: Option<String>,
        to: String,
        duration_ms: u64,
    },
    ContractMigrated {
        symbols: Vec<String>,
        from: Option<String>,
        to: String,
    },
    TickIngressed {
        tick: Tick,
    },
    TickEgressed {
        tick: Tick,
    },
    SystemLog {
        level: LogLevel,
        source: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    ControlActionRequested {
        action: String,
        account_id: String,
    },
    ControlActionCompleted {
        action: String,
        account_id: String,
        status: ActionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    AccountMutated {
        account_id: String,
        change: AccountChange,
        gateway_type: GatewayKind,
        enabled: bool,
        settings_changed: bool,
    },
}

impl EventKind {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::GatewayStateChanged { .. } => topics::GATEWAY_STATE,
            Self::HealthStatusChanged { .. } => topics::HEALTH_STATUS,
            Self::CanaryTickObserved { .. } => topics::CANARY_TICK,
            Self::RecoveryPhase { .. } => topics::RECOVERY_PHASE,
            Self::FailoverExecuted { .. } => topics::FAILOVER,
            Self::ContractMigrated { .. } => topics::CONTRACT_MIGRATED,
            Self::TickIngressed { .. } => topics::TICK_INGRESS,
            Self::TickEgressed { .. } => topics::TICK_EGRESS,
            Self::SystemLog { .. } => topics::SYSTEM_LOG,
            Self::ControlActionRequested { .. } => topics::CONTROL_REQUESTED,
            Self::ControlActionCompleted { .. } => topics::CONTROL_COMPLETED,
            Self::AccountMutated { .. } => topics::ACCOUNT_MUTATED,
        }
    }
}

/// A published event: immutable payload plus correlation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
            kind,
        }
    }

    /// Build an event correlated with an earlier one (control action
    /// request → completion, failover → migration).
    pub fn correlated(kind: EventKind, correlation_id: Uuid) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id,
            kind,
        }
    }

    pub fn topic(&self) -> &'static str {
        self.kind.topic()
    }
}
