// =============================================================================
// SOPT stock-options feed profile
// =============================================================================
//
// The SOPT bridge is a newer generation and already normalizes frames to
// snake_case fields. Defaults differ from CTP: options trade on SSE.
// =============================================================================

use crate::errors::HubError;
use crate::store::Account;
use crate::types::RawTick;

use super::bridge::VendorProfile;
use super::setting_str;

pub fn profile(account: &Account) -> Result<VendorProfile, HubError> {
    let url = setting_str(&account.settings, "md_address").ok_or_else(|| {
        HubError::Permanent(format!("account '{}': missing md_address", account.id))
    })?;

    let login = serde_json::json!({
        "type": "login",
        "vendor": "sopt",
        "user_id": setting_str(&account.settings, "user_id").unwrap_or_default(),
        "password": setting_str(&account.settings, "password").unwrap_or_default(),
    });

    Ok(VendorProfile {
        vendor_name: "sopt",
        url,
        login,
        default_exchange: "SSE",
        map_tick,
    })
}

fn map_tick(frame: &serde_json::Value, default_exchange: &str) -> Option<RawTick> {
    let data = frame.get("data")?;
    Some(RawTick {
        symbol: data.get("symbol")?.as_str()?.to_string(),
        exchange: data
            .get("exchange")
            .and_then(|e| e.as_str())
            .unwrap_or(default_exchange)
            .to_string(),
        last_price: data.get("last_price")?.as_f64()?,
        last_volume: data.get("volume").and_then(|v| v.as_i64()).unwrap_or(0),
        bid_price: data
            .get("bid_price")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        bid_volume: data.get("bid_volume").and_then(|v| v.as_i64()).unwrap_or(0),
        ask_price: data
            .get("ask_price")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        ask_volume: data.get("ask_volume").and_then(|v| v.as_i64()).unwrap_or(0),
        exchange_time: frame
            .get("ts")
            .and_then(|t| t.as_i64())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_sopt_frame_with_default_exchange() {
        let frame = serde_json::json!({
            "type": "tick",
            "ts": 1_700_000_000_000i64,
            "data": {
                "symbol": "au2512",
                "last_price": 612.5,
                "volume": 2,
                "bid_price": 612.0,
                "bid_volume": 4,
                "ask_price": 613.0,
                "ask_volume": 6,
            }
        });
        let raw = map_tick(&frame, "SSE").unwrap();
        assert_eq!(raw.symbol, "au2512");
        assert_eq!(raw.exchange, "SSE");
        assert_eq!(raw.last_price, 612.5);
        assert_eq!(raw.ask_volume, 6);
    }
}
