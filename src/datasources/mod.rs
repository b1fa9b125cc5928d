//! Datasource interface and implementations
//!
//! A datasource discovers the environment the instance runs in and supplies
//! metadata, raw user-data, raw vendor-data, network config and
//! datasource-scoped config. Once resolved it is snapshotted to disk so the
//! later stages of the same boot reuse it without probing again.

pub mod ec2;
pub mod mock;
pub mod nocloud;
pub mod none;
pub mod resolver;

pub use resolver::{DatasourceRegistry, find_source};

use crate::{CloudInitError, state::CloudPaths};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Instance id used when metadata carries none
pub const DEFAULT_INSTANCE_ID: &str = "iid-datasource";

/// Which boot stage a datasource's data is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DsMode {
    Local,
    #[default]
    Net,
    Disabled,
}

impl DsMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "net" | "network" => Some(Self::Net),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for DsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Net => "net",
            Self::Disabled => "disabled",
        })
    }
}

/// Resources a datasource needs before it can be detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dependency {
    Filesystem,
    Network,
}

/// Everything a datasource learned from `get_data`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasourceData {
    /// Instance metadata; must carry `instance-id`
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, with = "opt_b64")]
    pub userdata_raw: Option<Vec<u8>>,
    #[serde(default, with = "opt_b64")]
    pub vendordata_raw: Option<Vec<u8>>,
    #[serde(default)]
    pub network_config: Option<Value>,
    /// Config the datasource contributes to the merged cfg
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub dsmode: DsMode,
    /// Where the data came from, e.g. a seed directory or metadata URL
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub cloud_name: String,
    #[serde(default)]
    pub platform: String,
}

/// Hostname reported by a datasource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasourceHostname {
    pub hostname: String,
    /// True when the datasource fell back to a default
    pub is_default: bool,
}

/// Construction arguments shared by every datasource
#[derive(Debug, Clone)]
pub struct DatasourceContext {
    pub sys_cfg: serde_yaml::Value,
    pub distro: String,
    pub paths: CloudPaths,
}

impl DatasourceContext {
    /// `sys_cfg['datasource'][name]`, or Null
    pub fn ds_cfg(&self, name: &str) -> serde_yaml::Value {
        self.sys_cfg
            .get("datasource")
            .and_then(|d| d.get(name))
            .cloned()
            .unwrap_or(serde_yaml::Value::Null)
    }
}

/// Trait for instance datasources
///
/// Implementations only provide probing (`get_data`) and storage for the
/// discovered [`DatasourceData`]; every accessor has a default built on it.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Short name as written in `datasource_list` (e.g. "NoCloud", "Ec2")
    fn name(&self) -> &'static str;

    /// Inspect the environment and populate data. Ok(false) means not here.
    async fn get_data(&mut self) -> Result<bool, CloudInitError>;

    fn data(&self) -> &DatasourceData;

    fn data_mut(&mut self) -> &mut DatasourceData;

    /// Whether data cached by a previous stage still describes this instance
    ///
    /// Only consulted when restoring with `existing = check`.
    async fn check_instance_id(&self, _cached: &DatasourceData) -> bool {
        false
    }

    /// Re-hydrate from a cached snapshot
    fn restore(&mut self, data: DatasourceData) {
        *self.data_mut() = data;
    }

    fn dsmode(&self) -> DsMode {
        self.data().dsmode
    }

    fn metadata(&self) -> &Value {
        &self.data().metadata
    }

    fn userdata_raw(&self) -> Option<&[u8]> {
        self.data().userdata_raw.as_deref()
    }

    fn vendordata_raw(&self) -> Option<&[u8]> {
        self.data().vendordata_raw.as_deref()
    }

    fn network_config(&self) -> Option<&Value> {
        self.data().network_config.as_ref()
    }

    /// Config contributed to the merged cfg, as YAML
    fn config_obj(&self) -> Option<serde_yaml::Value> {
        self.data()
            .config
            .as_ref()
            .and_then(|c| serde_yaml::to_value(c).ok())
    }

    fn instance_id(&self) -> String {
        self.metadata()
            .get("instance-id")
            .and_then(value_to_string)
            .unwrap_or_else(|| DEFAULT_INSTANCE_ID.to_string())
    }

    /// Hostname from metadata
    ///
    /// With `metadata_only` a missing hostname yields None instead of the
    /// `localhost` default.
    fn get_hostname(&self, fqdn: bool, metadata_only: bool) -> Option<DatasourceHostname> {
        let found = self
            .metadata()
            .get("local-hostname")
            .or_else(|| self.metadata().get("hostname"))
            .and_then(value_to_string)
            .filter(|h| !h.is_empty());

        let (full, is_default) = match found {
            Some(h) => (h, false),
            None if metadata_only => return None,
            None => ("localhost.localdomain".to_string(), true),
        };

        let hostname = if fqdn || full.parse::<std::net::IpAddr>().is_ok() {
            full
        } else {
            full.split('.').next().unwrap_or(&full).to_string()
        };
        Some(DatasourceHostname {
            hostname,
            is_default,
        })
    }

    /// SSH keys from `public-keys`, which may be a string, list or map
    fn public_ssh_keys(&self) -> Vec<String> {
        fn collect(value: &Value, out: &mut Vec<String>) {
            match value {
                Value::String(s) => out.extend(
                    s.lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(String::from),
                ),
                Value::Array(items) => items.iter().for_each(|i| collect(i, out)),
                Value::Object(map) => map.values().for_each(|v| collect(v, out)),
                _ => {}
            }
        }

        let mut keys = Vec::new();
        if let Some(v) = self.metadata().get("public-keys") {
            collect(v, &mut keys);
        }
        keys
    }

    /// Human description recorded in the instance `datasource` file
    fn description(&self) -> String {
        let source = &self.data().source;
        if source.is_empty() {
            format!("DataSource{}", self.name())
        } else {
            format!("DataSource{} [{}]", self.name(), source)
        }
    }

    fn snapshot(&self) -> DatasourceSnapshot {
        DatasourceSnapshot {
            dsname: self.name().to_string(),
            data: self.data().clone(),
        }
    }
}

/// On-disk form of a resolved datasource (`instances/<id>/obj.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceSnapshot {
    pub dsname: String,
    pub data: DatasourceData,
}

/// Render a scalar metadata value as a string
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse YAML metadata into JSON-compatible form
pub fn yaml_to_json(text: &str) -> Result<Value, CloudInitError> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text)?;
    if yaml.is_null() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(serde_json::to_value(yaml)?)
}

/// Optional byte payloads stored as base64 strings in the snapshot
mod opt_b64 {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&BASE64.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
