//! Cloud-config loader
//!
//! Loads the system config layers from standard locations and builds the
//! per-run view that adds datasource, vendor and user config on top.

use super::{cmdline, defaults, merge};
use crate::{CloudInitError, state::CloudPaths, util};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Load the system configuration
///
/// Layers, lowest to highest: built-in defaults, `cloud.cfg`, sorted
/// `cloud.cfg.d/*.cfg` (shallow, later files replace whole top-level keys),
/// the runtime `<run_dir>/cloud.cfg`, then the kernel command line. A base `cloud.cfg` that fails to parse is fatal; broken
/// drop-ins are logged and skipped.
pub async fn fetch_base_config(paths: &CloudPaths) -> Result<Value, CloudInitError> {
    let mut layers = vec![defaults::builtin_config()];

    if let Some(base) = load_config_file(&paths.main_config()).await? {
        debug!("Loaded base config from {}", paths.main_config().display());
        layers.push(base);
    }

    // Drop-ins override each other by top-level key. One that names its
    // own merger chain is folded in as a separate layer.
    let mut dropins = Mapping::new();
    for path in list_dropins(&paths.config_d()).await? {
        match load_config_file(&path).await {
            Ok(Some(Value::Mapping(cfg))) => {
                debug!("Loaded drop-in config from {}", path.display());
                if cfg.contains_key("merge_how") || cfg.contains_key("merge_type") {
                    if !dropins.is_empty() {
                        layers.push(Value::Mapping(std::mem::take(&mut dropins)));
                    }
                    layers.push(Value::Mapping(cfg));
                } else {
                    for (key, value) in cfg {
                        dropins.insert(key, value);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to parse {}: {}", path.display(), e),
        }
    }
    if !dropins.is_empty() {
        layers.push(Value::Mapping(dropins));
    }

    match load_config_file(&paths.runtime_config()).await {
        Ok(Some(cfg)) => layers.push(cfg),
        Ok(None) => {}
        Err(e) => warn!("Failed to parse {}: {}", paths.runtime_config().display(), e),
    }

    if let Some(cfg) = cmdline::read_cmdline_config(&paths.proc_cmdline).await {
        info!("Using cloud-config from kernel command line");
        layers.push(cfg);
    }

    Ok(merge::merge_all(layers))
}

/// Load one config file; None when it does not exist
pub async fn load_config_file(path: &Path) -> Result<Option<Value>, CloudInitError> {
    let Some(raw) = util::read_optional(path).await? else {
        return Ok(None);
    };
    let text = String::from_utf8_lossy(&raw);
    let cfg = super::parse_cloud_config(&text).map_err(|e| {
        CloudInitError::Config(format!("{}: {}", path.display(), e))
    })?;
    Ok(Some(cfg))
}

/// Drop-in configs in a directory, sorted by file name
async fn list_dropins(dir: &Path) -> Result<Vec<PathBuf>, CloudInitError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "cfg") {
            entries.push(path);
        }
    }
    entries.sort();
    Ok(entries)
}

/// Per-run configuration view
///
/// Folds, lowest to highest: datasource config, system config, the
/// instance's vendor cloud-config, its user cloud-config, then any extra
/// files. The result is computed once; every read returns a fresh copy.
pub struct ConfigMerger {
    paths: CloudPaths,
    base_cfg: Value,
    instance_id: Option<String>,
    datasource_cfg: Option<Value>,
    additional_files: Vec<PathBuf>,
    include_vendor: bool,
    cfg: OnceCell<Value>,
}

impl ConfigMerger {
    pub fn new(paths: CloudPaths, base_cfg: Value) -> Self {
        Self {
            paths,
            base_cfg,
            instance_id: None,
            datasource_cfg: None,
            additional_files: Vec::new(),
            include_vendor: true,
            cfg: OnceCell::new(),
        }
    }

    /// Read instance config from this instance's directory instead of the
    /// `instance` link
    pub fn with_instance(mut self, instance_id: Option<&str>) -> Self {
        self.instance_id = instance_id.map(String::from);
        self
    }

    pub fn with_datasource_config(mut self, cfg: Option<Value>) -> Self {
        self.datasource_cfg = cfg;
        self
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.additional_files = files;
        self
    }

    pub fn include_vendor(mut self, include: bool) -> Self {
        self.include_vendor = include;
        self
    }

    /// The merged config (a deep copy)
    pub async fn cfg(&self) -> Result<Value, CloudInitError> {
        let cfg = self.cfg.get_or_try_init(|| self.read_cfg()).await?;
        Ok(cfg.clone())
    }

    async fn read_cfg(&self) -> Result<Value, CloudInitError> {
        let mut layers = Vec::new();

        if let Some(ds_cfg) = &self.datasource_cfg {
            layers.push(ds_cfg.clone());
        }
        layers.push(self.base_cfg.clone());

        let instance_dir = match &self.instance_id {
            Some(iid) => self.paths.instance_dir(iid),
            None => self.paths.instance_link(),
        };
        let mut instance_files = Vec::new();
        if self.include_vendor {
            instance_files.push(instance_dir.join("vendor-cloud-config.txt"));
        }
        instance_files.push(instance_dir.join("cloud-config.txt"));

        for path in instance_files.iter().chain(&self.additional_files) {
            match load_config_file(path).await {
                Ok(Some(cfg)) => {
                    debug!("Merging config from {}", path.display());
                    layers.push(cfg);
                }
                Ok(None) => {}
                Err(e) => warn!("Failed loading of cloud-config from {}: {}", path.display(), e),
            }
        }

        Ok(merge::merge_all(layers))
    }
}
