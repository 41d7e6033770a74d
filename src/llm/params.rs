//! Per-provider request body customization.

use serde_json::{Map, Value};

/// Merge `overlay` into `target`. Objects merge key by key at every depth;
/// any other value replaces what was there.
pub fn deep_merge(target: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Apply a provider's extra and excluded parameters to a request body.
pub fn customize_body(
    body: &mut Map<String, Value>,
    extra_params: &Map<String, Value>,
    exclude_params: &[String],
) {
    deep_merge(body, extra_params);
    for key in exclude_params {
        body.remove(key);
    }
}
