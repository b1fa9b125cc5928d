//! Template context building
//!
//! Turns instance-data JSON into the variables a `## template: jinja` part
//! sees. Keys with `-` or `.` also get an underscore alias, and the members
//! of versioned sections (`v1`, `v2`, ...) are copied to the top level.

use serde_json::{Map, Value};

/// Build the template context from instance data
pub fn build_context(instance_data: &Value) -> Value {
    match instance_data {
        Value::Object(map) => Value::Object(convert(map)),
        _ => Value::Object(Map::new()),
    }
}

fn convert(map: &Map<String, Value>) -> Map<String, Value> {
    let mut result = Map::new();
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    for key in keys {
        let value = match &map[key] {
            Value::Object(inner) => Value::Object(convert(inner)),
            other => other.clone(),
        };

        if is_versioned_section(key)
            && let Value::Object(inner) = &value
        {
            for (k, v) in inner {
                result.insert(k.clone(), v.clone());
            }
        }

        if let Some(alias) = variable_alias(key) {
            result.insert(alias, value.clone());
        }
        result.insert(key.clone(), value);
    }
    result
}

/// `v1`, `v2`, ...
fn is_versioned_section(key: &str) -> bool {
    key.strip_prefix('v')
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

/// Jinja-safe spelling of a key, None when it is already safe
fn variable_alias(key: &str) -> Option<String> {
    if key.contains(['-', '.', '/']) {
        Some(key.replace(['-', '.', '/'], "_"))
    } else {
        None
    }
}
