//! instance-data.json
//!
//! A JSON view of what the datasource discovered, written for templates and
//! for tools that want to inspect the instance. Keys listed in
//! `sensitive_keys` are redacted in the world-readable copy; the full
//! document goes to a root-only sibling.

use crate::datasources::{Datasource, DatasourceHostname};
use crate::state::CloudPaths;
use crate::{CloudInitError, util};
use serde_json::{Map, Value, json};
use tracing::debug;

pub const REDACT_SENSITIVE_VALUE: &str = "redacted for non-root user";

/// Top-level keys never written to the world-readable copy
const DEFAULT_SENSITIVE_KEYS: &[&str] = &["merged_cfg", "security-credentials", "userdata", "user-data"];

/// Build the full instance-data document
pub fn build_instance_data(
    ds: &dyn Datasource,
    distro: &str,
    merged_cfg: &serde_yaml::Value,
) -> Result<Value, CloudInitError> {
    let metadata = ds.metadata();
    let field = |key: &str| metadata.get(key).cloned().unwrap_or(Value::Null);
    let hostname = ds
        .get_hostname(false, true)
        .map(|DatasourceHostname { hostname, .. }| Value::String(hostname))
        .unwrap_or(Value::Null);
    let data = ds.data();

    let v1 = json!({
        "cloud_name": non_empty(&data.cloud_name),
        "platform": non_empty(&data.platform),
        "subplatform": non_empty(&data.source),
        "instance_id": ds.instance_id(),
        "local_hostname": hostname,
        "region": field("region"),
        "availability_zone": field("availability-zone"),
        "distro": distro,
        "public_ssh_keys": ds.public_ssh_keys(),
        "dsmode": data.dsmode.to_string(),
    });

    Ok(json!({
        "v1": v1,
        "ds": { "meta_data": metadata },
        "merged_cfg": serde_json::to_value(merged_cfg)?,
        "sensitive_keys": DEFAULT_SENSITIVE_KEYS,
    }))
}

fn non_empty(s: &str) -> Value {
    if s.is_empty() {
        Value::String("unknown".into())
    } else {
        Value::String(s.to_string())
    }
}

/// Replace every sensitive key, at any depth, with the redaction marker
pub fn redact_sensitive(data: &Value) -> Value {
    let keys: Vec<String> = data
        .get("sensitive_keys")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();

    fn walk(value: &Value, keys: &[String]) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    if keys.iter().any(|s| s == k) {
                        out.insert(k.clone(), Value::String(REDACT_SENSITIVE_VALUE.into()));
                    } else {
                        out.insert(k.clone(), walk(v, keys));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|i| walk(i, keys)).collect()),
            other => other.clone(),
        }
    }

    let mut redacted = walk(data, &keys);
    // The key list itself stays readable
    if let Some(map) = redacted.as_object_mut()
        && let Some(list) = data.get("sensitive_keys")
    {
        map.insert("sensitive_keys".into(), list.clone());
    }
    redacted
}

/// Write both instance-data files into the run directory
pub async fn persist_instance_data(
    paths: &CloudPaths,
    ds: &dyn Datasource,
    distro: &str,
    merged_cfg: &serde_yaml::Value,
) -> Result<Value, CloudInitError> {
    let data = build_instance_data(ds, distro, merged_cfg)?;

    util::write_file(
        paths.instance_data_sensitive(),
        serde_json::to_vec_pretty(&data)?,
        0o600,
    )
    .await?;
    util::write_file(
        paths.instance_data(),
        serde_json::to_vec_pretty(&redact_sensitive(&data))?,
        0o644,
    )
    .await?;

    debug!("Persisted instance data to {}", paths.instance_data().display());
    Ok(data)
}
