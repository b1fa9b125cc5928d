//! Cloud-config parsing, layering and merging
//!
//! Configuration is handled as an untyped YAML tree (`serde_yaml::Value`):
//! it arrives from many sources, is merged with user-selected strategies,
//! and modules read only the keys they own. Typed views exist for the few
//! shapes several modules share.

pub mod cmdline;
pub mod defaults;
pub mod jsonp;
pub mod loader;
pub mod merge;

pub use loader::{ConfigMerger, fetch_base_config};

use crate::CloudInitError;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// First line of a cloud-config document
pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config";

/// Parse a cloud-config document into a mapping
///
/// The `#cloud-config` header line is optional. An empty document yields an
/// empty mapping; any other non-mapping document is an error.
pub fn parse_cloud_config(text: &str) -> Result<Value, CloudInitError> {
    let value: Value = serde_yaml::from_str(text)?;
    match value {
        Value::Null => Ok(Value::Mapping(Mapping::new())),
        Value::Mapping(_) => Ok(value),
        other => Err(CloudInitError::Config(format!(
            "cloud-config is not a mapping: {}",
            type_name(&other)
        ))),
    }
}

/// Check if this looks like a cloud-config (starts with #cloud-config)
pub fn is_cloud_config(data: &str) -> bool {
    data.trim_start().starts_with(CLOUD_CONFIG_HEADER)
}

/// Serialize a config mapping back into a `#cloud-config` document
pub fn to_cloud_config(cfg: &Value, comment: Option<&str>) -> Result<String, CloudInitError> {
    let mut out = String::from(CLOUD_CONFIG_HEADER);
    out.push('\n');
    if let Some(comment) = comment {
        for line in comment.lines() {
            out.push_str("# ");
            out.push_str(line);
            out.push('\n');
        }
    }
    if cfg.as_mapping().is_some_and(|m| !m.is_empty()) {
        out.push_str(&serde_yaml::to_string(cfg)?);
    }
    Ok(out)
}

/// Look up a dotted path such as `features.error_on_user_data_failure`
pub fn get_path<'a>(cfg: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(cfg, |node, key| node.get(key))
}

pub fn get_bool(cfg: &Value, path: &str, default: bool) -> bool {
    match get_path(cfg, path) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => true,
            "false" | "no" | "off" | "0" => false,
            _ => default,
        },
        Some(Value::Number(n)) => n.as_i64().map_or(default, |n| n != 0),
        _ => default,
    }
}

pub fn get_str<'a>(cfg: &'a Value, path: &str) -> Option<&'a str> {
    get_path(cfg, path).and_then(Value::as_str)
}

/// A list of strings; a bare string becomes a one-element list
pub fn get_str_list(cfg: &Value, path: &str) -> Vec<String> {
    match get_path(cfg, path) {
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}

/// File to write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileConfig {
    pub path: String,
    #[serde(default)]
    pub content: String,
    pub encoding: Option<String>,
    pub owner: Option<String>,
    pub permissions: Option<FilePermissions>,
    pub append: Option<bool>,
    pub defer: Option<bool>,
}

/// Permissions given either as a YAML integer (`0o644`, `420`) or an
/// octal string (`'0644'`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilePermissions {
    Mode(u32),
    Octal(String),
}

impl FilePermissions {
    pub fn mode(&self) -> Result<u32, CloudInitError> {
        match self {
            Self::Mode(m) => Ok(*m),
            Self::Octal(s) => {
                let digits = s.trim();
                let digits = digits
                    .strip_prefix("0o")
                    .or_else(|| digits.strip_prefix("0O"))
                    .unwrap_or(digits);
                u32::from_str_radix(digits, 8).map_err(|_| {
                    CloudInitError::InvalidData(format!("invalid permissions: {s}"))
                })
            }
        }
    }
}

/// Command to run (can be string or list of args)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunCmd {
    /// Shell command as string
    Shell(String),
    /// Command with arguments
    Args(Vec<String>),
}

impl RunCmd {
    /// Render as a line of a shell script
    pub fn to_shell_line(&self) -> String {
        match self {
            Self::Shell(s) => s.clone(),
            Self::Args(args) => args
                .iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Single-quote a word for POSIX sh
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
