//! Market-cap extraction from loosely shaped provider payloads.
//!
//! Providers disagree on field names, so each logical quantity has an ordered
//! list of accepted synonyms. Extraction is always "first present, numeric,
//! finite candidate wins".

use serde_json::Value as JsonValue;

pub const MARKET_CAP_FIELDS: &[&str] = &["marketCap", "market_cap", "marketcap", "mc", "mcap"];
pub const PRICE_FIELDS: &[&str] = &["price", "priceUsd", "price_usd", "value"];
pub const CIRCULATING_SUPPLY_FIELDS: &[&str] =
    &["circulatingSupply", "circulating_supply", "circSupply"];
pub const TOTAL_SUPPLY_FIELDS: &[&str] = &["totalSupply", "total_supply", "supply"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Derivation {
    Direct,
    PriceTimesCirculating,
    PriceTimesTotal,
}

/// Objects to probe, innermost `data` first, then the top level.
fn scopes(payload: &JsonValue) -> Vec<&JsonValue> {
    let mut out = Vec::with_capacity(3);
    if let Some(data) = payload.get("data").filter(|d| d.is_object()) {
        if let Some(inner) = data.get("data").filter(|d| d.is_object()) {
            out.push(inner);
        }
        out.push(data);
    }
    if payload.is_object() {
        out.push(payload);
    }
    out
}

/// Numbers and numeric strings; anything non-finite or negative is rejected.
pub fn as_number(v: &JsonValue) -> Option<f64> {
    let n = match v {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (n.is_finite() && n >= 0.0).then_some(n)
}

pub fn first_number(obj: &JsonValue, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|k| obj.get(*k).and_then(as_number))
}

fn first_in_scopes(scopes: &[&JsonValue], names: &[&str]) -> Option<f64> {
    scopes.iter().find_map(|s| first_number(s, names))
}

pub fn round_market_cap(mc: f64) -> Option<u64> {
    if !mc.is_finite() || mc < 0.0 || mc > u64::MAX as f64 {
        return None;
    }
    Some(mc.round() as u64)
}

/// Derive a market cap: direct fields first, then price × circulating supply,
/// then price × total supply.
pub fn market_cap(payload: &JsonValue) -> Option<(u64, Derivation)> {
    let scopes = scopes(payload);

    if let Some(mc) = first_in_scopes(&scopes, MARKET_CAP_FIELDS).and_then(round_market_cap) {
        return Some((mc, Derivation::Direct));
    }

    let price = first_in_scopes(&scopes, PRICE_FIELDS)?;
    if let Some(supply) = first_in_scopes(&scopes, CIRCULATING_SUPPLY_FIELDS) {
        if let Some(mc) = round_market_cap(price * supply) {
            return Some((mc, Derivation::PriceTimesCirculating));
        }
    }
    let supply = first_in_scopes(&scopes, TOTAL_SUPPLY_FIELDS)?;
    round_market_cap(price * supply).map(|mc| (mc, Derivation::PriceTimesTotal))
}

pub fn price(payload: &JsonValue) -> Option<f64> {
    first_in_scopes(&scopes(payload), PRICE_FIELDS)
}

/// Supply from a Solana `getTokenSupply` JSON-RPC response.
pub fn rpc_token_supply(payload: &JsonValue) -> Option<f64> {
    let value = payload.get("result")?.get("value")?;
    if let Some(s) = value.get("uiAmountString").and_then(as_number) {
        return Some(s);
    }
    if let Some(s) = value.get("uiAmount").and_then(as_number) {
        return Some(s);
    }
    // Raw integer amount scaled by decimals.
    let raw = value.get("amount").and_then(as_number)?;
    let decimals = value.get("decimals").and_then(|d| d.as_u64()).unwrap_or(0);
    let scaled = raw / 10f64.powi(decimals.min(30) as i32);
    scaled.is_finite().then_some(scaled)
}

/// Dexscreener `/latest/dex/tokens`: the pair with the deepest USD liquidity
/// wins; its `marketCap`, else its `fdv`.
pub fn dexscreener_market_cap(payload: &JsonValue) -> Option<u64> {
    let pairs = payload.get("pairs")?.as_array()?;
    let liquidity = |p: &JsonValue| {
        p.get("liquidity")
            .and_then(|l| l.get("usd"))
            .and_then(as_number)
            .unwrap_or(0.0)
    };
    let best = pairs.iter().max_by(|a, b| {
        liquidity(a)
            .partial_cmp(&liquidity(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    })?;
    best.get("marketCap")
        .and_then(as_number)
        .or_else(|| best.get("fdv").and_then(as_number))
        .and_then(round_market_cap)
}
