use log::debug;
use serde_json::{Map, Value};

use crate::models::{ParameterValue, ValueFormat};

/// A single `param`/value pair carried by an update notification
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterUpdate {
    pub param: String,
    pub value: ParameterValue,
}

/// Extract the value from a params object.
///
/// The keys are tried in the order `val`, `pct`, `str` and the first usable
/// one wins. Values wrapped in a one element array are unwrapped.
pub fn decode_value(params: &Map<String, Value>) -> Option<ParameterValue> {
    for format in [ValueFormat::Value, ValueFormat::Percentage, ValueFormat::Text] {
        if let Some(raw) = params.get(format.key()) {
            if let Some(v) = decode_field(format, unwrap_single(raw)) {
                return Some(v);
            }
        }
    }
    return None;
}

fn unwrap_single(raw: &Value) -> &Value {
    match raw {
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    }
}

fn decode_field(format: ValueFormat, raw: &Value) -> Option<ParameterValue> {
    match format {
        ValueFormat::Value => as_number(raw).map(ParameterValue::Value),
        ValueFormat::Percentage => as_number(raw).map(ParameterValue::Percentage),
        ValueFormat::Text => match raw {
            Value::String(s) => Some(ParameterValue::Text(s.clone())),
            Value::Number(n) => Some(ParameterValue::Text(n.to_string())),
            Value::Bool(b) => Some(ParameterValue::Text(b.to_string())),
            _ => None,
        },
    }
}

fn as_number(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Turn the `params` of an update into parameter updates. `params` is either
/// one object or an array of them, entries without name or value are skipped.
pub fn decode_updates(params: &Value) -> Vec<ParameterUpdate> {
    let mut updates = Vec::new();
    let entries: Vec<&Value> = match params {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    for entry in entries {
        let obj = match entry.as_object() {
            Some(o) => o,
            None => {
                debug!("Skipping update entry that is no object: {entry}");
                continue;
            }
        };

        let param = match obj.get("param").and_then(|p| p.as_str()) {
            Some(p) => p,
            None => {
                debug!("Skipping update entry without param: {entry}");
                continue;
            }
        };

        match decode_value(obj) {
            Some(value) => updates.push(ParameterUpdate { param: param.to_string(), value }),
            None => debug!("Skipping update for {param} without a usable value"),
        }
    }

    return updates;
}

/// Interpret the `result` of a response as a parameter value.
///
/// Bare numbers are read as `preferred` when that asks for a percentage,
/// otherwise as a plain value.
pub fn decode_result(result: &Value, preferred: Option<ValueFormat>) -> Option<ParameterValue> {
    match result {
        Value::Number(n) => {
            let v = n.as_f64()?;
            if preferred == Some(ValueFormat::Percentage) {
                Some(ParameterValue::Percentage(v))
            } else {
                Some(ParameterValue::Value(v))
            }
        }
        Value::String(s) => Some(ParameterValue::Text(s.clone())),
        Value::Bool(b) => Some(ParameterValue::Value(if *b { 1.0 } else { 0.0 })),
        Value::Object(obj) => {
            if let Some(format) = preferred {
                if let Some(v) = obj.get(format.key()).and_then(|raw| decode_field(format, unwrap_single(raw))) {
                    return Some(v);
                }
            }
            decode_value(obj)
        }
        Value::Array(items) => items.iter().find_map(|item| decode_result(item, preferred)),
        Value::Null => None,
    }
}
