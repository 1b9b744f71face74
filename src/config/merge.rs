//! Layering of configuration documents
//!
//! Each layer is a JSON value. Tables are combined key by key; any other
//! value in a later layer (arrays and null included) takes the place of the
//! earlier one.

use serde_json::Value;

/// Lay `overlay` over `base`.
///
/// Keys present only in `base` survive; keys present in both are merged
/// recursively when both sides are tables and replaced otherwise.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }

        (_, overlay) => overlay,
    }
}

/// Fold `layers` from lowest to highest precedence.
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}
