//! JSON-safe projection between interpreter values and `serde_json`.

use rhai::Dynamic;

/// Project an interpreter value into JSON. Primitives are preserved,
/// arrays and maps recurse, blobs become arrays of byte values, and
/// anything else falls back to its display representation.
pub fn dynamic_to_json(value: &Dynamic) -> serde_json::Value {
    if value.is_unit() {
        return serde_json::Value::Null;
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return serde_json::Value::Bool(b);
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return serde_json::Value::Number(i.into());
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        return serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null);
    }
    if let Some(c) = value.clone().try_cast::<char>() {
        return serde_json::Value::String(c.to_string());
    }
    if let Some(s) = value.clone().try_cast::<rhai::ImmutableString>() {
        return serde_json::Value::String(s.to_string());
    }
    if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        return serde_json::Value::Array(arr.iter().map(dynamic_to_json).collect());
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        return serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        );
    }
    if let Some(blob) = value.clone().try_cast::<rhai::Blob>() {
        return serde_json::Value::Array(
            blob.into_iter()
                .map(|b| serde_json::Value::Number(b.into()))
                .collect(),
        );
    }
    serde_json::Value::String(value.to_string())
}

/// Lift a JSON value into the interpreter.
pub fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else {
                Dynamic::from(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Dynamic::from(s.clone()),
        serde_json::Value::Array(items) => {
            let arr: rhai::Array = items.iter().map(json_to_dynamic).collect();
            Dynamic::from_array(arr)
        }
        serde_json::Value::Object(entries) => {
            let mut map = rhai::Map::new();
            for (k, v) in entries {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from_map(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_survive_projection() {
        assert_eq!(dynamic_to_json(&Dynamic::UNIT), serde_json::Value::Null);
        assert_eq!(dynamic_to_json(&Dynamic::from(true)), serde_json::json!(true));
        assert_eq!(dynamic_to_json(&Dynamic::from(42i64)), serde_json::json!(42));
        assert_eq!(dynamic_to_json(&Dynamic::from(1.5f64)), serde_json::json!(1.5));
        assert_eq!(
            dynamic_to_json(&Dynamic::from("hi".to_string())),
            serde_json::json!("hi")
        );
    }

    #[test]
    fn containers_recurse() {
        let json = serde_json::json!({"k": [1, "two", {"nested": true}]});
        let round = dynamic_to_json(&json_to_dynamic(&json));
        assert_eq!(round, json);
    }

    #[test]
    fn blobs_become_byte_arrays() {
        let blob: rhai::Blob = vec![0, 127, 255];
        assert_eq!(
            dynamic_to_json(&Dynamic::from_blob(blob)),
            serde_json::json!([0, 127, 255])
        );
    }

    #[test]
    fn unknown_types_fall_back_to_display() {
        #[derive(Clone)]
        struct Opaque;
        impl std::fmt::Display for Opaque {
            fn fmt(&self, _: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                Ok(())
            }
        }
        let v = Dynamic::from(Opaque);
        assert!(dynamic_to_json(&v).is_string());
    }
}
