//! Turning raw device JSON into typed field values.
//!
//! Nothing in here fails: anything that cannot be read as the expected kind
//! of value becomes absent (`None`), and callers publish partial snapshots.

use crate::models::device::{Conversion, FieldKey, Value};
use crate::utils::round_to;
use log::debug;
use serde_json::Value as Json;

/// Substrings the device puts into a payload instead of a measurement when it
/// hits an internal or password ("MIMA") fault.
const SENTINELS: [&str; 2] = ["ERROR", "MIMA"];

/// Pull the value for `key` out of a response body.
///
/// Devices are inconsistent about echoing the requested key, so a single-key
/// object is unwrapped whatever its key. A multi-key object without `key`
/// yields `None`. Scalars are returned as they are.
pub fn extract<'a>(body: &'a Json, key: &str) -> Option<&'a Json> {
    match body {
        Json::Object(map) => match map.get(key) {
            Some(v) => Some(v),
            None if map.len() == 1 => map.values().next(),
            None => None,
        },
        other => Some(other),
    }
}

/// Direct lookup used against the batch endpoint, where several registers
/// share one object and unwrapping a lone key would misattribute it.
pub fn lookup<'a>(body: &'a Json, key: &str) -> Option<&'a Json> {
    body.as_object().and_then(|map| map.get(key))
}

pub fn is_sentinel(text: &str) -> bool {
    let upper = text.to_ascii_uppercase();
    SENTINELS.iter().any(|s| upper.contains(s))
}

/// Drop nulls and device error sentinels.
pub fn normalize(raw: &Json) -> Option<&Json> {
    match raw {
        Json::Null => None,
        Json::String(s) if is_sentinel(s) => None,
        other => Some(other),
    }
}

/// Best-effort numeric reading of a raw value.
pub fn coerce_number(raw: &Json) -> Option<f64> {
    let n = match raw {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn coerce_text(raw: &Json) -> Option<String> {
    match raw {
        Json::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn scale(raw: f64, divisor: f64, decimals: u32) -> f64 {
    round_to(raw / divisor, decimals)
}

/// Apply the conversion table entry of `key` to a numeric reading.
pub fn convert(key: FieldKey, raw: f64) -> Option<f64> {
    match key.conversion() {
        Conversion::Scaled { divisor, decimals, .. } => Some(scale(raw, divisor, decimals)),
        Conversion::Text => None,
    }
}

pub fn tenths_to_celsius(raw: f64) -> f64 {
    scale(raw, 10.0, 1)
}

pub fn tenths_to_volts(raw: f64) -> f64 {
    scale(raw, 10.0, 2)
}

pub fn millibar_to_bar(raw: f64) -> f64 {
    scale(raw, 1000.0, 3)
}

pub fn milliliters_to_liters(raw: f64) -> f64 {
    scale(raw, 1000.0, 3)
}

/// Conductivity in µS/cm to degrees of German hardness.
pub fn uscm_to_hardness(raw: f64) -> f64 {
    scale(raw, 30.0, 2)
}

/// Full pipeline for one register: sentinel filter, coercion, conversion.
pub fn normalize_field(key: FieldKey, raw: Option<&Json>) -> Option<Value> {
    let raw = raw?;
    let Some(clean) = normalize(raw) else {
        if !raw.is_null() {
            debug!("Normalize: {} carried device sentinel {}", key, raw);
        }
        return None;
    };
    match key.conversion() {
        Conversion::Scaled { divisor, decimals, .. } => {
            coerce_number(clean).map(|n| Value::Number(scale(n, divisor, decimals)))
        }
        Conversion::Text => coerce_text(clean).map(Value::Text),
    }
}
