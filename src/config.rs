// =============================================================================
// Hub Configuration — environment-driven settings with serde defaults
// =============================================================================
//
// Every tunable lives here. Values come from three layers, later wins:
// serde defaults, an optional JSON config file, environment variables.
// Persistence uses an atomic tmp + rename write so a crash never leaves a
// corrupt file behind. All fields carry `#[serde(default)]` so adding new
// fields never breaks loading an older file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_account_store_url() -> String {
    "meridian_accounts.db".to_string()
}

fn default_http_bind() -> String {
    "0.0.0.0:8700".to_string()
}

fn default_tick_egress_bind() -> String {
    "0.0.0.0:8710".to_string()
}

fn default_health_interval_ms() -> u64 {
    1000
}

fn default_health_debounce_ms() -> u64 {
    3000
}

fn default_canary_threshold_sec() -> u64 {
    60
}

fn default_cooldown_min_sec() -> u64 {
    5
}

fn default_cooldown_max_sec() -> u64 {
    300
}

fn default_max_restart_attempts() -> u32 {
    5
}

fn default_recovery_observation_sec() -> u64 {
    30
}

fn default_ws_ping_interval_sec() -> u64 {
    30
}

fn default_ws_pong_timeout_sec() -> u64 {
    10
}

fn default_ws_max_events_per_sec() -> u32 {
    100
}

fn default_canary_symbols_ctp() -> Vec<String> {
    vec!["rb2601".to_string()]
}

fn default_canary_symbols_sopt() -> Vec<String> {
    vec!["au2512".to_string()]
}

fn default_max_clock_skew_sec() -> u64 {
    10
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_egress_queue_depth() -> usize {
    4096
}

fn default_control_ack_timeout_ms() -> u64 {
    5000
}

// =============================================================================
// HubConfig
// =============================================================================

/// Top-level configuration for the Meridian hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    // --- Storage & binds -----------------------------------------------------

    /// SQLite path (or `sqlite://` URL) for the account store.
    #[serde(default = "default_account_store_url")]
    pub account_store_url: String,

    /// Bind address for the Control API (and `/ws` when `ws_bind` matches).
    #[serde(default = "default_http_bind")]
    pub http_bind: String,

    /// Bind address for the WebSocket endpoint. When equal to `http_bind`
    /// (the default) a single server serves both.
    #[serde(default = "default_http_bind")]
    pub ws_bind: String,

    /// Bind address for the binary tick publisher socket.
    #[serde(default = "default_tick_egress_bind")]
    pub tick_egress_bind: String,

    // --- Health monitoring ---------------------------------------------------

    /// Periodic health evaluation interval.
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// Time a candidate status must hold before a transition commits.
    #[serde(default = "default_health_debounce_ms")]
    pub health_debounce_ms: u64,

    /// Canary tick age beyond which a CONNECTED gateway is unhealthy.
    #[serde(default = "default_canary_threshold_sec")]
    pub canary_threshold_sec: u64,

    /// Canary contract set per gateway type. An empty set degrades that
    /// type to transport-only health.
    #[serde(default = "default_canary_symbols_ctp")]
    pub canary_symbols_ctp: Vec<String>,

    #[serde(default = "default_canary_symbols_sopt")]
    pub canary_symbols_sopt: Vec<String>,

    // --- Recovery ------------------------------------------------------------

    /// Cooldown backoff base and clamp: `T = min * 2^attempts`, clamped to
    /// `[min, max]`.
    #[serde(default = "default_cooldown_min_sec")]
    pub cooldown_min_sec: u64,

    #[serde(default = "default_cooldown_max_sec")]
    pub cooldown_max_sec: u64,

    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,

    /// How long to wait for HEALTHY after a restart before declaring the
    /// attempt failed.
    #[serde(default = "default_recovery_observation_sec")]
    pub recovery_observation_sec: u64,

    // --- WebSocket broadcaster ----------------------------------------------

    #[serde(default = "default_ws_ping_interval_sec")]
    pub ws_ping_interval_sec: u64,

    #[serde(default = "default_ws_pong_timeout_sec")]
    pub ws_pong_timeout_sec: u64,

    /// Per-connection forwarding budget; beyond it the connection's bus
    /// buffer sheds oldest events.
    #[serde(default = "default_ws_max_events_per_sec")]
    pub ws_max_events_per_sec: u32,

    // --- Aggregation ---------------------------------------------------------

    /// Contract universe subscribed at startup, per gateway type.
    #[serde(default)]
    pub symbols_ctp: Vec<String>,

    #[serde(default)]
    pub symbols_sopt: Vec<String>,

    /// Allow electing a source of a different gateway type when no
    /// same-type account is healthy.
    #[serde(default)]
    pub allow_cross_type_failover: bool,

    // --- Ingress validation --------------------------------------------------

    /// Ticks with `exchange_time` further in the future than this are
    /// rejected.
    #[serde(default = "default_max_clock_skew_sec")]
    pub max_clock_skew_sec: u64,

    // --- Plumbing ------------------------------------------------------------

    /// Replace every adaptor with the deterministic mock (GATEWAY_MOCK).
    #[serde(default)]
    pub gateway_mock: bool,

    /// Event bus ring capacity per subscriber.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Aggregator → egress channel depth.
    #[serde(default = "default_egress_queue_depth")]
    pub egress_queue_depth: usize,

    /// How long a control handler waits for a command ack before answering
    /// 202 Accepted.
    #[serde(default = "default_control_ack_timeout_ms")]
    pub control_ack_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("default config deserializes")
    }
}

impl HubConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read hub config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse hub config from {}", path.display()))?;
        Ok(config)
    }

    /// Persist the configuration with an atomic tmp + rename write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise hub config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        Ok(())
    }

    /// Build the effective config: defaults, then an optional config file,
    /// then environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = match std::env::var("HUB_CONFIG") {
            Ok(path) => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config file, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        };
        config.apply_env();
        config
    }

    /// Apply environment variable overrides in place.
    pub fn apply_env(&mut self) {
        env_string("ACCOUNT_STORE_URL", &mut self.account_store_url);
        env_string("HTTP_BIND", &mut self.http_bind);
        // WS defaults to the HTTP bind unless overridden.
        self.ws_bind = self.http_bind.clone();
        env_string("WS_BIND", &mut self.ws_bind);
        env_string("TICK_EGRESS_BIND", &mut self.tick_egress_bind);

        env_parse("HEALTH_INTERVAL_MS", &mut self.health_interval_ms);
        env_parse("HEALTH_DEBOUNCE_MS", &mut self.health_debounce_ms);
        env_parse("CANARY_THRESHOLD_SEC", &mut self.canary_threshold_sec);
        env_parse("COOLDOWN_MIN_SEC", &mut self.cooldown_min_sec);
        env_parse("COOLDOWN_MAX_SEC", &mut self.cooldown_max_sec);
        env_parse("MAX_RESTART_ATTEMPTS", &mut self.max_restart_attempts);
        env_parse("RECOVERY_OBSERVATION_SEC", &mut self.recovery_observation_sec);
        env_parse("WS_PING_INTERVAL_SEC", &mut self.ws_ping_interval_sec);
        env_parse("WS_PONG_TIMEOUT_SEC", &mut self.ws_pong_timeout_sec);
        env_parse("WS_MAX_EVENTS_PER_SEC", &mut self.ws_max_events_per_sec);
        env_parse("MAX_CLOCK_SKEW_SEC", &mut self.max_clock_skew_sec);

        env_list("CANARY_SYMBOLS_CTP", &mut self.canary_symbols_ctp);
        env_list("CANARY_SYMBOLS_SOPT", &mut self.canary_symbols_sopt);
        env_list("HUB_SYMBOLS_CTP", &mut self.symbols_ctp);
        env_list("HUB_SYMBOLS_SOPT", &mut self.symbols_sopt);

        env_flag("ALLOW_CROSS_TYPE_FAILOVER", &mut self.allow_cross_type_failover);
        env_flag("GATEWAY_MOCK", &mut self.gateway_mock);
    }

    /// Canary contract set for a gateway type.
    pub fn canary_symbols(&self, kind: crate::types::GatewayKind) -> &[String] {
        use crate::types::GatewayKind;
        match kind {
            GatewayKind::Ctp | GatewayKind::Mock => &self.canary_symbols_ctp,
            GatewayKind::Sopt => &self.canary_symbols_sopt,
        }
    }

    /// Log the effective configuration at startup (binds and tunables only,
    /// never account settings).
    pub fn log_summary(&self) {
        info!(
            http_bind = %self.http_bind,
            ws_bind = %self.ws_bind,
            egress_bind = %self.tick_egress_bind,
            store = %self.account_store_url,
            health_interval_ms = self.health_interval_ms,
            canary_threshold_sec = self.canary_threshold_sec,
            max_restart_attempts = self.max_restart_attempts,
            gateway_mock = self.gateway_mock,
            "hub configuration"
        );
    }
}

fn env_string(key: &str, slot: &mut String) {
    if let Ok(val) = std::env::var(key) {
        if !val.trim().is_empty() {
            *slot = val.trim().to_string();
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(val) = std::env::var(key) {
        if let Ok(parsed) = val.trim().parse::<T>() {
            *slot = parsed;
        }
    }
}

fn env_list(key: &str, slot: &mut Vec<String>) {
    if let Ok(val) = std::env::var(key) {
        let items: Vec<String> = val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        *slot = items;
    }
}

fn env_flag(key: &str, slot: &mut bool) {
    if let Ok(val) = std::env::var(key) {
        let v = val.trim().to_lowercase();
        *slot = matches!(v.as_str(), "1" | "true" | "yes" | "on");
    }
}
