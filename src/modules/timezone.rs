//! Timezone configuration module

use super::{ALL_DISTROS, Module, ModuleMeta};
use crate::{CloudInitError, cloud::Cloud, config, state::Frequency};
use async_trait::async_trait;
use serde_yaml::Value;
use tracing::{debug, info};

pub struct Timezone;

#[async_trait]
impl Module for Timezone {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            id: "timezone",
            frequency: Frequency::PerInstance,
            distros: &[ALL_DISTROS],
            activate_by_schema_keys: &["timezone"],
        }
    }

    /// The first module argument wins over the `timezone` key
    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &Cloud,
        args: &[String],
    ) -> Result<(), CloudInitError> {
        let timezone = args
            .first()
            .map(String::as_str)
            .or_else(|| config::get_str(cfg, "timezone"))
            .map(str::trim)
            .filter(|tz| !tz.is_empty());

        let Some(timezone) = timezone else {
            debug!("Skipping module named {}, no 'timezone' specified", name);
            return Ok(());
        };

        info!("Setting timezone to: {}", timezone);
        cloud
            .distro()
            .set_timezone(timezone)
            .await
            .map_err(|e| CloudInitError::module(name, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{distro::Distro, state::CloudPaths};
    use tempfile::TempDir;

    fn cloud(temp: &TempDir) -> Cloud {
        let paths = CloudPaths::with_root(temp.path());
        std::fs::create_dir_all(temp.path().join("usr/share/zoneinfo/Europe")).unwrap();
        std::fs::write(temp.path().join("usr/share/zoneinfo/Europe/Paris"), "TZif").unwrap();
        Cloud::new(paths.clone(), Distro::new("ubuntu", paths), None, Value::Null)
    }

    #[tokio::test]
    async fn test_args_override_config() {
        let temp = TempDir::new().unwrap();
        let cfg: Value = serde_yaml::from_str("timezone: Nowhere/City").unwrap();

        Timezone
            .handle("timezone", &cfg, &cloud(&temp), &["Europe/Paris".to_string()])
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(temp.path().join("etc/timezone")).unwrap(),
            "Europe/Paris\n"
        );
    }

    #[tokio::test]
    async fn test_unknown_zone_fails() {
        let temp = TempDir::new().unwrap();
        let cfg: Value = serde_yaml::from_str("timezone: Nowhere/City").unwrap();
        assert!(Timezone.handle("timezone", &cfg, &cloud(&temp), &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_timezone_is_skipped() {
        let temp = TempDir::new().unwrap();
        Timezone
            .handle("timezone", &Value::Null, &cloud(&temp), &[])
            .await
            .unwrap();
        assert!(!temp.path().join("etc/timezone").exists());
    }
}
