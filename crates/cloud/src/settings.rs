// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Settings resolution and diffing.
//!
//! Device settings arrive as a flat JSON object in `core_status_update`;
//! App settings resolve user overrides over developer defaults.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::persist::AppSetting;

/// Resolve an App's effective settings: the user's override wins, the
/// developer default fills the rest. Shape: `[{key, value}, ...]`.
pub fn effective_app_settings(
    defaults: &[AppSetting],
    overrides: &HashMap<String, Value>,
) -> Value {
    let mut out = Vec::with_capacity(defaults.len());
    let mut seen: Vec<&str> = Vec::with_capacity(defaults.len());
    for setting in defaults {
        let value = overrides.get(&setting.key).unwrap_or(&setting.default_value);
        out.push(json!({ "key": setting.key, "value": value }));
        seen.push(&setting.key);
    }
    // Overrides for keys the developer never declared still reach the App.
    for (key, value) in overrides {
        if !seen.contains(&key.as_str()) {
            out.push(json!({ "key": key, "value": value }));
        }
    }
    Value::Array(out)
}

/// Keys whose value differs between two flat settings objects, including
/// keys present on only one side.
pub fn changed_keys(prev: &Value, next: &Value) -> Vec<String> {
    let empty = Map::new();
    let prev = prev.as_object().unwrap_or(&empty);
    let next = next.as_object().unwrap_or(&empty);

    let mut changed: Vec<String> = Vec::new();
    for (key, value) in next {
        if prev.get(key) != Some(value) {
            changed.push(key.clone());
        }
    }
    for key in prev.keys() {
        if !next.contains_key(key) {
            changed.push(key.clone());
        }
    }
    changed.sort();
    changed.dedup();
    changed
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
