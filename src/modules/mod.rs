//! Configuration modules
//!
//! Each module handles one aspect of instance configuration. Modules are
//! compiled in and looked up by short name from the `cloud_*_modules`
//! lists; the runner in [`crate::stages::modules`] decides which of them
//! run and how often.

pub mod bootcmd;
pub mod final_message;
pub mod hostname;
pub mod runcmd;
pub mod scripts;
pub mod timezone;
pub mod write_files;

use crate::{CloudInitError, cloud::Cloud, state::Frequency};
use async_trait::async_trait;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Distro list entry meaning "verified everywhere"
pub const ALL_DISTROS: &str = "all";

/// Static description of a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMeta {
    pub id: &'static str,
    /// Default frequency, overridable per module spec
    pub frequency: Frequency,
    /// Distros the module is verified on
    pub distros: &'static [&'static str],
    /// Config keys that make the module applicable; empty means always
    pub activate_by_schema_keys: &'static [&'static str],
}

/// Trait for configuration modules
#[async_trait]
pub trait Module: Send + Sync {
    fn meta(&self) -> ModuleMeta;

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &Cloud,
        args: &[String],
    ) -> Result<(), CloudInitError>;
}

/// Short name as used for lookups and semaphores
///
/// `cc_write_files`, `write-files` and `write_files` are the same module.
pub fn canonical_name(name: &str) -> String {
    let name = name.trim();
    name.strip_prefix("cc_")
        .unwrap_or(name)
        .replace('-', "_")
}

/// Compiled-in modules by short name
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(bootcmd::Bootcmd);
        registry.register(write_files::WriteFiles);
        registry.register(write_files::WriteFilesDeferred);
        registry.register(hostname::SetHostname);
        registry.register(hostname::UpdateHostname);
        registry.register(runcmd::Runcmd);
        registry.register(timezone::Timezone);
        registry.register(scripts::ScriptsPerOnce);
        registry.register(scripts::ScriptsPerBoot);
        registry.register(scripts::ScriptsPerInstance);
        registry.register(scripts::ScriptsUser);
        registry.register(scripts::ScriptsVendor);
        registry.register(final_message::FinalMessage);
        registry
    }

    /// Register under the module's `meta().id`, replacing any previous one
    pub fn register<M: Module + 'static>(&mut self, module: M) {
        let id = canonical_name(module.meta().id);
        self.modules.insert(id, Arc::new(module));
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(&canonical_name(name)).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }
}

/// One entry of a `cloud_*_modules` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSpec {
    /// `- write_files`
    Bare(String),
    /// `- [write_files, always, arg...]`
    Positional {
        name: String,
        frequency: Option<String>,
        args: Vec<String>,
    },
    /// `- {name: write_files, frequency: always, args: [...]}`
    Named {
        name: String,
        frequency: Option<String>,
        args: Vec<String>,
    },
}

impl ModuleSpec {
    /// Normalize one list entry
    pub fn parse(entry: &Value) -> Result<Self, CloudInitError> {
        match entry {
            Value::String(name) => Ok(Self::Bare(name.trim().to_string())),
            Value::Sequence(items) => {
                let Some(name) = items.first().and_then(scalar) else {
                    return Err(CloudInitError::InvalidModule(format!("{:?}", entry)));
                };
                let frequency = items.get(1).and_then(scalar);
                let args = items.iter().skip(2).flat_map(flatten_args).collect();
                Ok(Self::Positional {
                    name,
                    frequency,
                    args,
                })
            }
            Value::Mapping(map) => {
                let field = |keys: &[&str]| keys.iter().find_map(|k| map.get(*k));
                let Some(name) = field(&["name", "mod"]).and_then(scalar) else {
                    return Err(CloudInitError::InvalidModule(format!("{:?}", entry)));
                };
                let frequency = field(&["frequency", "freq"]).and_then(scalar);
                let args = field(&["args"]).map(flatten_args).unwrap_or_default();
                Ok(Self::Named {
                    name,
                    frequency,
                    args,
                })
            }
            other => Err(CloudInitError::InvalidModule(format!("{:?}", other))),
        }
    }

    /// Spec for one ad-hoc module, as built by `single`
    pub fn single(name: &str, frequency: Option<Frequency>, args: Vec<String>) -> Self {
        Self::Named {
            name: name.to_string(),
            frequency: frequency.map(|f| f.as_str().to_string()),
            args,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Bare(name) | Self::Positional { name, .. } | Self::Named { name, .. } => name,
        }
    }

    /// Frequency override; an unknown value is discarded with a warning
    pub fn frequency(&self) -> Option<Frequency> {
        let raw = match self {
            Self::Bare(_) => None,
            Self::Positional { frequency, .. } | Self::Named { frequency, .. } => {
                frequency.as_deref()
            }
        }?;
        match raw.parse() {
            Ok(freq) => Some(freq),
            Err(_) => {
                warn!(
                    "Ignoring invalid frequency '{}' for module {}",
                    raw,
                    self.name()
                );
                None
            }
        }
    }

    pub fn args(&self) -> &[String] {
        match self {
            Self::Bare(_) => &[],
            Self::Positional { args, .. } | Self::Named { args, .. } => args,
        }
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn flatten_args(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(items) => items.iter().filter_map(scalar).collect(),
        other => scalar(other).into_iter().collect(),
    }
}

/// Module specs from the `section` list of `cfg`
///
/// Malformed entries are logged and skipped.
pub fn read_module_specs(cfg: &Value, section: &str) -> Vec<ModuleSpec> {
    let Some(entries) = cfg.get(section) else {
        return Vec::new();
    };
    let Some(entries) = entries.as_sequence() else {
        warn!("Module list '{}' is not a list, ignoring it", section);
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match ModuleSpec::parse(entry) {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!("Skipping malformed entry in {}: {}", section, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_parse_shapes() {
        assert_eq!(
            ModuleSpec::parse(&yaml("write-files")).unwrap(),
            ModuleSpec::Bare("write-files".into())
        );

        let positional = ModuleSpec::parse(&yaml("[runcmd, always, a, [b, c]]")).unwrap();
        assert_eq!(positional.name(), "runcmd");
        assert_eq!(positional.frequency(), Some(Frequency::PerAlways));
        assert_eq!(positional.args(), ["a", "b", "c"]);

        let named = ModuleSpec::parse(&yaml("{name: timezone, frequency: once, args: [UTC]}")).unwrap();
        assert!(matches!(named, ModuleSpec::Named { .. }));
        assert_eq!(named.frequency(), Some(Frequency::PerOnce));
        assert_eq!(named.args(), ["UTC"]);

        let legacy = ModuleSpec::parse(&yaml("{mod: timezone, freq: once-per-instance}")).unwrap();
        assert_eq!(legacy.name(), "timezone");
        assert_eq!(legacy.frequency(), Some(Frequency::PerInstance));

        assert!(ModuleSpec::parse(&yaml("42")).is_err());
        assert!(ModuleSpec::parse(&yaml("[]")).is_err());
        assert!(ModuleSpec::parse(&yaml("{args: [x]}")).is_err());
    }

    #[test]
    fn test_invalid_frequency_is_discarded() {
        let spec = ModuleSpec::parse(&yaml("[runcmd, weekly]")).unwrap();
        assert_eq!(spec.frequency(), None);
    }

    #[test]
    fn test_read_module_specs_skips_malformed() {
        let cfg = yaml("cloud_init_modules: [bootcmd, 3, [runcmd], {x: 1}]");
        let specs = read_module_specs(&cfg, "cloud_init_modules");
        let names: Vec<&str> = specs.iter().map(ModuleSpec::name).collect();
        assert_eq!(names, vec!["bootcmd", "runcmd"]);
        assert!(read_module_specs(&cfg, "missing").is_empty());
    }

    #[test]
    fn test_registry_lookup_normalizes() {
        let registry = ModuleRegistry::builtin();
        assert!(registry.lookup("cc_write_files").is_some());
        assert!(registry.lookup("write-files").is_some());
        assert!(registry.lookup("scripts-user").is_some());
        assert!(registry.lookup("nope").is_none());
        assert_eq!(canonical_name("cc_set-hostname"), "set_hostname");
    }
}
