//! Read-only view of a stage run handed to every module
//!
//! Bundles the merged configuration, the resolved datasource (if any), the
//! paths helper and the distro. Modules never see mutable stage state.

use crate::{
    config,
    datasources::{Datasource, DatasourceHostname},
    distro::Distro,
    state::{CloudPaths, SemaphoreManager},
};
use serde_yaml::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct Cloud {
    paths: CloudPaths,
    distro: Distro,
    datasource: Option<Arc<dyn Datasource>>,
    cfg: Value,
    instance_id: Option<String>,
}

impl Cloud {
    pub fn new(
        paths: CloudPaths,
        distro: Distro,
        datasource: Option<Arc<dyn Datasource>>,
        cfg: Value,
    ) -> Self {
        let instance_id = datasource.as_ref().map(|ds| ds.instance_id());
        Self {
            paths,
            distro,
            datasource,
            cfg,
            instance_id,
        }
    }

    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    pub fn distro(&self) -> &Distro {
        &self.distro
    }

    pub fn datasource(&self) -> Option<&dyn Datasource> {
        self.datasource.as_deref()
    }

    /// A copy of the merged configuration
    pub fn cfg(&self) -> Value {
        self.cfg.clone()
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn semaphores(&self) -> SemaphoreManager {
        SemaphoreManager::new(
            self.instance_id.as_deref().map(|iid| self.paths.sem_dir(iid)),
            self.paths.global_sem_dir(),
        )
    }

    /// Hostname from the datasource, or None without one
    pub fn get_hostname(&self, fqdn: bool, metadata_only: bool) -> Option<DatasourceHostname> {
        self.datasource()
            .and_then(|ds| ds.get_hostname(fqdn, metadata_only))
    }

    pub fn public_ssh_keys(&self) -> Vec<String> {
        self.datasource()
            .map(|ds| ds.public_ssh_keys())
            .unwrap_or_default()
    }

    /// Resolve the hostname and fqdn to apply
    ///
    /// `fqdn` and `hostname` in the config win over datasource metadata. A
    /// dotted `hostname` is split unless `prefer_fqdn_over_hostname` is set.
    /// With `metadata_only` there is no `localhost` fallback.
    pub fn hostname_and_fqdn(
        &self,
        cfg: &Value,
        metadata_only: bool,
    ) -> Option<(String, String, bool)> {
        let prefer_fqdn = config::get_bool(cfg, "prefer_fqdn_over_hostname", false);

        if let Some(fqdn) = config::get_str(cfg, "fqdn").filter(|s| !s.is_empty()) {
            let hostname = if prefer_fqdn {
                fqdn.to_string()
            } else {
                config::get_str(cfg, "hostname")
                    .filter(|h| !h.is_empty())
                    .unwrap_or_else(|| fqdn.split('.').next().unwrap_or(fqdn))
                    .to_string()
            };
            return Some((hostname, fqdn.to_string(), false));
        }

        if let Some(hostname) = config::get_str(cfg, "hostname").filter(|h| !h.is_empty()) {
            if hostname.contains('.') {
                let short = hostname.split('.').next().unwrap_or(hostname);
                let name = if prefer_fqdn { hostname } else { short };
                return Some((name.to_string(), hostname.to_string(), false));
            }
            return Some((hostname.to_string(), hostname.to_string(), false));
        }

        let fqdn = self.get_hostname(true, metadata_only)?;
        let short = self.get_hostname(false, metadata_only)?;
        let hostname = if prefer_fqdn {
            fqdn.hostname.clone()
        } else {
            short.hostname
        };
        Some((hostname, fqdn.hostname, fqdn.is_default))
    }
}
