//! Config validation - warns about unknown fields

use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

/// Keys understood by [`Config`](super::Config).
const CONFIG_KEYS: &[&str] = &[
    "gotapi_if_host",
    "gotapi_if_port",
    "allowed_address_list",
    "allowed_origin_list",
    "ws_connection_limit",
    "ws_access_token_timeout",
    "ws_verify_access_token",
    "plugin_response_timeout",
    "http_request_timeout",
    "authorization_timeout",
    "enforce_client_scope",
    "gotapi_server_app_id",
    "plugins",
];

/// Validate JSON config and warn about unknown fields.
pub fn warn_unknown_fields(content: &str, config_name: &str) {
    let Ok(value) = serde_json::from_str::<Value>(content) else {
        return;
    };

    let expected: HashSet<&str> = CONFIG_KEYS.iter().copied().collect();
    for key in find_unknown_keys(&value, &expected) {
        warn!("Unknown config field in {config_name}: {key}");
    }
}

/// Top-level keys of `value` missing from `expected`, in document order.
fn find_unknown_keys(value: &Value, expected: &HashSet<&str>) -> Vec<String> {
    let Value::Object(obj) = value else {
        return Vec::new();
    };

    obj.keys()
        .filter(|key| !expected.contains(key.as_str()))
        .cloned()
        .collect()
}
