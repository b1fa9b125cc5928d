//! Hostname modules
//!
//! `set_hostname` applies the hostname once per instance, `update_hostname`
//! reconciles it on every boot. Both honour `preserve_hostname`.

use super::{ALL_DISTROS, Module, ModuleMeta};
use crate::{CloudInitError, cloud::Cloud, config, state::Frequency};
use async_trait::async_trait;
use serde_yaml::Value;
use tracing::{debug, info};

pub struct SetHostname;

pub struct UpdateHostname;

/// Apply the hostname resolved from `cfg` and the datasource
///
/// Returns false when nothing was changed: `preserve_hostname` is set, no
/// hostname is known, or the hostname is the one last applied. With
/// `metadata_only` a hostname that is only the `localhost` default is
/// ignored.
pub async fn apply_hostname(
    cloud: &Cloud,
    cfg: &Value,
    metadata_only: bool,
) -> Result<bool, CloudInitError> {
    if config::get_bool(cfg, "preserve_hostname", false) {
        debug!("Configuration option 'preserve_hostname' is set, not setting the hostname");
        return Ok(false);
    }
    let Some((hostname, fqdn, is_default)) = cloud.hostname_and_fqdn(cfg, metadata_only) else {
        debug!("No hostname available from config or datasource");
        return Ok(false);
    };
    if is_default && hostname == "localhost" {
        debug!("Hostname is the localhost default, not setting it");
        return Ok(false);
    }
    cloud.distro().set_hostname(&hostname, &fqdn).await
}

#[async_trait]
impl Module for SetHostname {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            id: "set_hostname",
            frequency: Frequency::PerInstance,
            distros: &[ALL_DISTROS],
            activate_by_schema_keys: &[],
        }
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &Cloud,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        if apply_hostname(cloud, cfg, false)
            .await
            .map_err(|e| CloudInitError::module(name, e.to_string()))?
        {
            info!("Hostname set by {}", name);
        }
        Ok(())
    }
}

#[async_trait]
impl Module for UpdateHostname {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            id: "update_hostname",
            frequency: Frequency::PerAlways,
            distros: &[ALL_DISTROS],
            activate_by_schema_keys: &[],
        }
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &Cloud,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        if apply_hostname(cloud, cfg, false)
            .await
            .map_err(|e| CloudInitError::module(name, e.to_string()))?
        {
            info!("Hostname updated by {}", name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{datasources::mock::MockDatasource, distro::Distro, state::CloudPaths};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn cloud(temp: &TempDir, metadata: serde_json::Value) -> Cloud {
        let paths = CloudPaths::with_root(temp.path());
        let ds = MockDatasource::new().with_metadata(metadata);
        Cloud::new(
            paths.clone(),
            Distro::new("ubuntu", paths),
            Some(Arc::new(ds)),
            Value::Null,
        )
    }

    #[tokio::test]
    async fn test_sets_hostname_from_metadata() {
        let temp = TempDir::new().unwrap();
        let cloud = cloud(
            &temp,
            serde_json::json!({"instance-id": "i-1", "local-hostname": "web.example.com"}),
        );

        SetHostname
            .handle("set_hostname", &Value::Null, &cloud, &[])
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(temp.path().join("etc/hostname")).unwrap(),
            "web\n"
        );
        let hosts = std::fs::read_to_string(temp.path().join("etc/hosts")).unwrap();
        assert!(hosts.contains("127.0.1.1 web.example.com web"));
    }

    #[tokio::test]
    async fn test_preserve_hostname() {
        let temp = TempDir::new().unwrap();
        let cloud = cloud(
            &temp,
            serde_json::json!({"instance-id": "i-1", "local-hostname": "web"}),
        );
        let cfg: Value = serde_yaml::from_str("preserve_hostname: true").unwrap();

        assert!(!apply_hostname(&cloud, &cfg, false).await.unwrap());
        assert!(!temp.path().join("etc/hostname").exists());
    }

    #[tokio::test]
    async fn test_update_is_noop_when_unchanged() {
        let temp = TempDir::new().unwrap();
        let cloud = cloud(
            &temp,
            serde_json::json!({"instance-id": "i-1", "local-hostname": "web"}),
        );

        assert!(apply_hostname(&cloud, &Value::Null, false).await.unwrap());
        assert!(!apply_hostname(&cloud, &Value::Null, false).await.unwrap());
    }
}
