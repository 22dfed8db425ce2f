//! JSON bridge: `json_parse` / `json_dumps` natives and the value
//! conversions shared with the plugin wire protocol.
//!
//! Mapping: null↔null, bool↔bool, int↔number (no fractional part),
//! float↔number, string↔string, array↔array, map↔object. Bytes are
//! carried as hex-encoded strings; integer map keys become their decimal
//! string form on the JSON side.

use std::collections::HashMap;

use noxy_core::value::{MapKey, Value};
use serde_json::{json, Map as JsonMap, Number, Value as Json};

/// Convert a Noxy value to JSON. Callables, channels, wait groups, and
/// references have no JSON form.
pub fn value_to_json(value: &Value) -> Result<Json, String> {
    match value {
        Value::Null => Ok(Json::Null),
        Value::Bool(b) => Ok(json!(b)),
        Value::Int(n) => Ok(json!(n)),
        Value::Float(x) => Number::from_f64(*x)
            .map(Json::Number)
            .ok_or_else(|| "cannot serialize a non-finite float to JSON".to_string()),
        Value::Str(s) => Ok(json!(&**s)),
        Value::Bytes(data) => Ok(json!(hex::encode(
            &*data.lock().expect("bytes lock poisoned")
        ))),
        Value::Array(items) => {
            let items = items.lock().expect("array lock poisoned");
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                out.push(value_to_json(item)?);
            }
            Ok(Json::Array(out))
        }
        Value::Map(entries) => {
            let entries = entries.lock().expect("map lock poisoned");
            // Sort keys for canonical output.
            let mut keys: Vec<&MapKey> = entries.keys().collect();
            keys.sort_by_key(|k| k.to_string());
            let mut out = JsonMap::new();
            for key in keys {
                out.insert(key.to_string(), value_to_json(&entries[key])?);
            }
            Ok(Json::Object(out))
        }
        Value::Instance(inst) => {
            let fields = inst.fields.lock().expect("instance field lock poisoned");
            let mut out = JsonMap::new();
            // Declaration order keeps output stable.
            for name in &inst.shape.fields {
                if let Some(field) = fields.get(name) {
                    out.insert(name.clone(), value_to_json(field)?);
                }
            }
            Ok(Json::Object(out))
        }
        other => Err(format!("cannot serialize {} to JSON", other.type_name())),
    }
}

/// Convert JSON into a Noxy value. Whole numbers that fit i64 become
/// ints; everything else numeric becomes a float.
pub fn json_to_value(json: &Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::string(s.as_str()),
        Json::Array(items) => Value::array(items.iter().map(json_to_value).collect()),
        Json::Object(entries) => {
            let mut map = HashMap::new();
            for (key, value) in entries {
                map.insert(MapKey::Str(key.as_str().into()), json_to_value(value));
            }
            Value::map(map)
        }
    }
}

pub fn parse(text: &str) -> Result<Value, String> {
    let json: Json =
        serde_json::from_str(text).map_err(|e| format!("json_parse: {}", e))?;
    Ok(json_to_value(&json))
}

pub fn dumps(value: &Value) -> Result<String, String> {
    let json = value_to_json(value)?;
    serde_json::to_string(&json).map_err(|e| format!("json_dumps: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_canonicalizes() {
        let source = r#"{"b": [1, 2.5, null], "a": "x"}"#;
        let value = parse(source).unwrap();
        let dumped = dumps(&value).unwrap();
        // Keys sorted, whitespace normalized.
        assert_eq!(dumped, r#"{"a":"x","b":[1,2.5,null]}"#);
        // A second round trip is a fixed point.
        assert_eq!(dumps(&parse(&dumped).unwrap()).unwrap(), dumped);
    }

    #[test]
    fn test_integer_vs_float() {
        assert_eq!(parse("42").unwrap(), Value::Int(42));
        assert_eq!(parse("42.5").unwrap(), Value::Float(42.5));
    }

    #[test]
    fn test_bytes_as_hex() {
        let dumped = dumps(&Value::bytes(vec![0xab, 0xcd])).unwrap();
        assert_eq!(dumped, "\"abcd\"");
    }

    #[test]
    fn test_unserializable() {
        assert!(dumps(&Value::Native("print".into())).is_err());
    }

    #[test]
    fn test_parse_error() {
        assert!(parse("{not json").is_err());
    }
}
