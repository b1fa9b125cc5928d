//! Network configuration selection and application
//!
//! The config comes from the datasource, then the system `network` key.
//! Any source saying `config: disabled` turns networking configuration off.
//! Version 2 configs are written as a netplan file under the target root;
//! the applied config is always recorded as `network-config.json` in the run
//! directory.

use crate::{CloudInitError, datasources::Datasource, state::CloudPaths, util};
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

/// Netplan file written for version 2 configs
pub const NETPLAN_FILE: &str = "/etc/netplan/50-cloud-init.yaml";

const NETPLAN_HEADER: &str = "# This file is generated from information provided by the datasource. Changes
# to it will not persist across an instance reboot.
";

/// Where the network config was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkConfigSource {
    Datasource,
    SystemCfg,
    Fallback,
}

impl fmt::Display for NetworkConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Datasource => "ds",
            Self::SystemCfg => "system_cfg",
            Self::Fallback => "fallback",
        })
    }
}

/// True for `{config: disabled}`
pub fn is_disabled(cfg: &Value) -> bool {
    cfg.get("config").and_then(Value::as_str) == Some("disabled")
}

/// Pick the network config to apply
///
/// Returns `(None, source)` when `source` disabled networking and
/// `(None, Fallback)` when nothing provides a config.
pub fn find_networking_config(
    ds: Option<&dyn Datasource>,
    sys_cfg: &serde_yaml::Value,
) -> (Option<Value>, NetworkConfigSource) {
    let system = sys_cfg
        .get("network")
        .and_then(|v| serde_json::to_value(v).ok())
        .filter(|v| !v.is_null());

    let candidates = [
        (
            ds.and_then(|d| d.network_config().cloned()),
            NetworkConfigSource::Datasource,
        ),
        (system, NetworkConfigSource::SystemCfg),
    ];

    for (cfg, source) in candidates {
        let Some(cfg) = cfg else {
            continue;
        };
        if is_disabled(&cfg) {
            debug!("network config disabled by {}", source);
            return (None, source);
        }
        info!("network config found in {}", source);
        return (Some(cfg), source);
    }
    (None, NetworkConfigSource::Fallback)
}

/// `version` of a network config; a bare `network:` wrapper is looked through
pub fn config_version(cfg: &Value) -> Option<u64> {
    let inner = cfg.get("network").unwrap_or(cfg);
    inner.get("version").and_then(Value::as_u64)
}

/// Render `cfg` for the target system and record it
pub async fn apply_network_config(paths: &CloudPaths, cfg: &Value) -> Result<(), CloudInitError> {
    let inner = cfg.get("network").unwrap_or(cfg);
    match config_version(cfg) {
        Some(2) => {
            let doc = serde_json::json!({ "network": inner });
            let yaml = serde_yaml::to_string(&doc)?;
            let path = paths.target(NETPLAN_FILE);
            util::write_file(&path, format!("{}{}", NETPLAN_HEADER, yaml), 0o600).await?;
            info!("Wrote network config to {}", path.display());
        }
        Some(version) => warn!(
            "No renderer available for network config version {}; recording only",
            version
        ),
        None => {
            return Err(CloudInitError::InvalidData(
                "network config has no version".to_string(),
            ));
        }
    }

    util::write_file(
        paths.network_config_json(),
        serde_json::to_vec_pretty(inner)?,
        0o600,
    )
    .await
}
