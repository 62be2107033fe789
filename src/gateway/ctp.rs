// =============================================================================
// CTP futures feed profile
// =============================================================================
//
// The CTP bridge relays the vendor's market-data frames with their native
// PascalCase field names (`InstrumentID`, `LastPrice`, `BidPrice1`, ...).
// This profile supplies the CTP login payload and maps those frames to
// the canonical raw tick.
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
        "vendor": "ctp",
        "broker_id": setting_str(&account.settings, "broker_id").unwrap_or_default(),
        "user_id": setting_str(&account.settings, "user_id").unwrap_or_default(),
        "password": setting_str(&account.settings, "password").unwrap_or_default(),
    });

    Ok(VendorProfile {
        vendor_name: "ctp",
        url,
        login,
        default_exchange: "SHFE",
        map_tick,
    })
}

fn map_tick(frame: &serde_json::Value, default_exchange: &str) -> Option<RawTick> {
    let data = frame.get("data")?;
    Some(RawTick {
        symbol: data.get("InstrumentID")?.as_str()?.to_string(),
        exchange: data
            .get("ExchangeID")
            .and_then(|e| e.as_str())
            .unwrap_or(default_exchange)
            .to_string(),
        last_price: data.get("LastPrice")?.as_f64()?,
        last_volume: data.get("Volume").and_then(|v| v.as_i64()).unwrap_or(0),
        bid_price: data
            .get("BidPrice1")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        bid_volume: data
            .get("BidVolume1")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        ask_price: data
            .get("AskPrice1")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        ask_volume: data
            .get("AskVolume1")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        exchange_time: frame
            .get("ts")
            .and_then(|t| t.as_i64())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
    })
}
