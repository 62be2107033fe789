// =============================================================================
// Shared types used across the Meridian market-data hub
// =============================================================================

use serde::{Deserialize, Serialize};

/// Fixed-point price scale: 4 decimal places.
///
/// Prices cross every boundary (bus, egress, API) as scaled integers so that
/// downstream consumers in other languages never see rounding drift. Floats
/// exist only at the vendor parse boundary.
pub const PRICE_SCALE: i64 = 10_000;

/// Convert a vendor float price to the scaled integer representation.
pub fn scale_price(price: f64) -> i64 {
    (price * PRICE_SCALE as f64).round() as i64
}

/// Convert a scaled integer price back to a float (display only).
pub fn unscale_price(price: i64) -> f64 {
    price as f64 / PRICE_SCALE as f64
}

/// Which vendor family an upstream account belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GatewayKind {
    Ctp,
    Sopt,
    Mock,
}

impl GatewayKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "CTP" => Some(Self::Ctp),
            "SOPT" => Some(Self::Sopt),
            "MOCK" => Some(Self::Mock),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ctp => "CTP",
            Self::Sopt => "SOPT",
            Self::Mock => "MOCK",
        }
    }
}

impl std::fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport-level state reported by an upstream adaptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Lifecycle state of a supervised gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Terminating,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Terminating => write!(f, "TERMINATING"),
        }
    }
}

/// Health classification for a gateway session, computed by the Health
/// Monitor from transport state plus canary data-plane liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Recovering,
    Disconnected,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Unhealthy => write!(f, "UNHEALTHY"),
            Self::Recovering => write!(f, "RECOVERING"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

// =============================================================================
// Ticks
// =============================================================================

/// A tick as mapped out of a vendor message, before validation and stamping.
///
/// Prices are still floats here; the adaptor boundary is the only place they
/// exist in that form.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTick {
    pub symbol: String,
    pub exchange: String,
    pub last_price: f64,
    pub last_volume: i64,
    pub bid_price: f64,
    pub bid_volume: i64,
    pub ask_price: f64,
    pub ask_volume: i64,
    /// Exchange timestamp, milliseconds since the UNIX epoch.
    pub exchange_time: i64,
}

fn default_tick_version() -> u8 {
    1
}

/// The cleansed, canonical tick that flows through the bus and out the
/// binary egress. Field ordering is stable; `v` versions the wire schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    #[serde(default = "default_tick_version")]
    pub v: u8,
    pub symbol: String,
    pub exchange: String,
    /// Scaled by [`PRICE_SCALE`].
    pub last_price: i64,
    pub last_volume: i64,
    pub bid_price: i64,
    pub bid_volume: i64,
    pub ask_price: i64,
    pub ask_volume: i64,
    pub source_account_id: String,
    /// Milliseconds since the UNIX epoch.
    pub exchange_time: i64,
    pub ingress_time: i64,
}

impl Tick {
    /// Build the canonical tick from a raw vendor tick, stamping the source
    /// account and ingress time. Does not validate; see the Supervisor.
    pub fn from_raw(raw: &RawTick, source_account_id: &str, ingress_time: i64) -> Self {
        Self {
            v: 1,
            symbol: raw.symbol.clone(),
            exchange: raw.exchange.clone(),
            last_price: scale_price(raw.last_price),
            last_volume: raw.last_volume,
            bid_price: scale_price(raw.bid_price),
            bid_volume: raw.bid_volume,
            ask_price: scale_price(raw.ask_price),
            ask_volume: raw.ask_volume,
            source_account_id: source_account_id.to_string(),
            exchange_time: raw.exchange_time,
            ingress_time,
        }
    }

    /// Identity tuple used by the aggregation engine to suppress duplicate
    /// publications inside the migration window.
    pub fn identity(&self) -> (i64, i64, i64) {
        (self.exchange_time, self.last_price, self.last_volume)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_scaling_roundtrip() {
        assert_eq!(scale_price(4500.0), 45_000_000);
        assert_eq!(scale_price(0.1234), 1234);
        assert!((unscale_price(45_000_000) - 4500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn gateway_kind_parse_is_case_insensitive() {
        assert_eq!(GatewayKind::parse("ctp"), Some(GatewayKind::Ctp));
        assert_eq!(GatewayKind::parse("SOPT"), Some(GatewayKind::Sopt));
        assert_eq!(GatewayKind::parse("Mock"), Some(GatewayKind::Mock));
        assert_eq!(GatewayKind::parse("xtp"), None);
    }

    #[test]
    fn status_enums_serialize_as_canonical_uppercase() {
        assert_eq!(
            serde_json::to_string(&HealthState::Healthy).unwrap(),
            "\"HEALTHY\""
        );
        assert_eq!(
            serde_json::to_string(&SessionState::Terminating).unwrap(),
            "\"TERMINATING\""
        );
        assert_eq!(
            serde_json::to_string(&ConnectionState::Error).unwrap(),
            "\"ERROR\""
        );
    }

    #[test]
    fn tick_from_raw_scales_and_stamps() {
        let raw = RawTick {
            symbol: "rb2601".into(),
            exchange: "SHFE".into(),
            last_price: 4500.5,
            last_volume: 3,
            bid_price: 4500.0,
            bid_volume: 10,
            ask_price: 4501.0,
            ask_volume: 7,
            exchange_time: 1_700_000_000_000,
        };
        let tick = Tick::from_raw(&raw, "A1", 1_700_000_000_050);
        assert_eq!(tick.v, 1);
        assert_eq!(tick.last_price, 45_005_000);
        assert_eq!(tick.source_account_id, "A1");
        assert_eq!(tick.ingress_time, 1_700_000_000_050);
        assert_eq!(tick.identity(), (1_700_000_000_000, 45_005_000, 3));
    }
}
