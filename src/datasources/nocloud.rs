//! NoCloud datasource
//!
//! Reads metadata and user data from local files, inline system config, or
//! (NoCloudNet only) a `seedfrom` URL.
//! Seed locations, in order:
//! - `datasource.NoCloud` inline `meta-data` / `user-data` / `vendor-data`
//! - /var/lib/cloud/seed/nocloud/ and /var/lib/cloud/seed/nocloud-net/
//! - Mounted filesystem with label 'cidata'
//! - `seedfrom` (file path for NoCloud, http(s) for NoCloudNet)

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::{Datasource, DatasourceContext, DatasourceData, DsMode, yaml_to_json};
use crate::url_helper::{UrlOptions, read_file_or_url};
use crate::{CloudInitError, util};

/// Instance id used when the seed does not name one
const DEFAULT_NOCLOUD_IID: &str = "nocloud";

/// Raw seed contents before interpretation
#[derive(Debug, Default)]
struct Seed {
    meta_data: Option<Value>,
    user_data: Option<Vec<u8>>,
    vendor_data: Option<Vec<u8>>,
    network_config: Option<Value>,
    source: String,
}

/// NoCloud datasource for local file-based configuration
pub struct NoCloud {
    /// NoCloudNet variant: network dsmode and http seeds
    net: bool,
    ds_cfg: serde_yaml::Value,
    seed_dirs: Vec<PathBuf>,
    data: DatasourceData,
}

impl NoCloud {
    pub fn new(ctx: &DatasourceContext) -> Self {
        Self::build(ctx, false)
    }

    /// The network-mode variant, which may also seed from http(s)
    pub fn new_net(ctx: &DatasourceContext) -> Self {
        Self::build(ctx, true)
    }

    fn build(ctx: &DatasourceContext, net: bool) -> Self {
        let seed = ctx.paths.seed_dir();
        let mut seed_dirs = vec![seed.join("nocloud"), seed.join("nocloud-net")];
        for mount in ["/mnt/cidata", "/media/cidata", "/run/cloud-init/cidata"] {
            seed_dirs.push(ctx.paths.target(mount));
        }
        let name = if net { "NoCloudNet" } else { "NoCloud" };
        let mut ds_cfg = ctx.ds_cfg(name);
        if ds_cfg.is_null() && net {
            ds_cfg = ctx.ds_cfg("NoCloud");
        }
        Self {
            net,
            ds_cfg,
            seed_dirs,
            data: DatasourceData::default(),
        }
    }

    fn default_dsmode(&self) -> DsMode {
        if self.net { DsMode::Net } else { DsMode::Local }
    }

    /// Seed supplied inline in system config
    fn inline_seed(&self) -> Result<Option<Seed>, CloudInitError> {
        let Some(md) = self.ds_cfg.get("meta-data") else {
            return Ok(None);
        };
        let meta_data = match md {
            serde_yaml::Value::String(s) => yaml_to_json(s)?,
            other => serde_json::to_value(other)?,
        };
        let text = |key: &str| {
            self.ds_cfg
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.as_bytes().to_vec())
        };
        Ok(Some(Seed {
            meta_data: Some(meta_data),
            user_data: text("user-data"),
            vendor_data: text("vendor-data"),
            network_config: None,
            source: "ds_config".to_string(),
        }))
    }

    /// First seed directory containing meta-data
    async fn dir_seed(&self) -> Result<Option<Seed>, CloudInitError> {
        for dir in &self.seed_dirs {
            let Some(md) = util::read_optional(dir.join("meta-data")).await? else {
                continue;
            };
            debug!("Reading NoCloud seed from {}", dir.display());
            let network_config = match util::read_optional(dir.join("network-config")).await? {
                Some(raw) => Some(yaml_to_json(&String::from_utf8_lossy(&raw))?),
                None => None,
            };
            return Ok(Some(Seed {
                meta_data: Some(yaml_to_json(&String::from_utf8_lossy(&md))?),
                user_data: util::read_optional(dir.join("user-data")).await?,
                vendor_data: util::read_optional(dir.join("vendor-data")).await?,
                network_config,
                source: format!("seed-dir ({})", dir.display()),
            }));
        }
        Ok(None)
    }

    /// Seed from the configured `seedfrom` location
    async fn url_seed(&self) -> Result<Option<Seed>, CloudInitError> {
        let Some(seedfrom) = self.ds_cfg.get("seedfrom").and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        let is_remote = seedfrom.starts_with("http://") || seedfrom.starts_with("https://");
        if is_remote != self.net {
            debug!("{} does not handle seedfrom {}", self.name(), seedfrom);
            return Ok(None);
        }

        let base = if seedfrom.ends_with('/') {
            seedfrom.to_string()
        } else {
            format!("{seedfrom}/")
        };
        let opts = UrlOptions {
            retries: 2,
            ..Default::default()
        };

        let md = read_file_or_url(&format!("{base}meta-data"), &opts).await?;
        let optional = |name: &'static str| {
            let url = format!("{base}{name}");
            let opts = opts.clone();
            async move {
                match read_file_or_url(&url, &opts).await {
                    Ok(resp) => Some(resp.contents),
                    Err(e) => {
                        debug!("No {} at seed: {}", name, e);
                        None
                    }
                }
            }
        };

        Ok(Some(Seed {
            meta_data: Some(yaml_to_json(&String::from_utf8_lossy(&md.contents))?),
            user_data: optional("user-data").await,
            vendor_data: optional("vendor-data").await,
            network_config: None,
            source: format!("seed-from ({seedfrom})"),
        }))
    }

    /// Instance id from whatever seed is present, without a full fetch
    async fn quick_instance_id(&self) -> Option<String> {
        let seed = match self.inline_seed() {
            Ok(Some(seed)) => Some(seed),
            _ => self.dir_seed().await.ok().flatten(),
        }?;
        seed.meta_data?
            .get("instance-id")
            .and_then(super::value_to_string)
    }
}

#[async_trait]
impl Datasource for NoCloud {
    fn name(&self) -> &'static str {
        if self.net { "NoCloudNet" } else { "NoCloud" }
    }

    async fn get_data(&mut self) -> Result<bool, CloudInitError> {
        let mut seed = match self.inline_seed()? {
            Some(seed) => Some(seed),
            None => self.dir_seed().await?,
        };
        if seed.is_none() {
            seed = self.url_seed().await?;
        }
        let Some(seed) = seed else {
            debug!("{}: no seed found", self.name());
            return Ok(false);
        };

        let mut metadata = match seed.meta_data {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Default::default(),
            Some(other) => {
                warn!("{}: meta-data is not a mapping: {}", self.name(), other);
                return Ok(false);
            }
        };
        metadata
            .entry("instance-id")
            .or_insert_with(|| Value::String(DEFAULT_NOCLOUD_IID.to_string()));

        let dsmode = metadata
            .get("dsmode")
            .and_then(|v| v.as_str())
            .and_then(DsMode::parse)
            .unwrap_or_else(|| self.default_dsmode());
        if dsmode == DsMode::Disabled {
            debug!("{}: not claiming datasource, dsmode=disabled", self.name());
            return Ok(false);
        }

        let network_config = seed
            .network_config
            .or_else(|| metadata.get("network-config").cloned());

        self.data = DatasourceData {
            metadata: Value::Object(metadata),
            userdata_raw: seed.user_data,
            vendordata_raw: seed.vendor_data,
            network_config,
            config: None,
            dsmode,
            source: seed.source,
            cloud_name: "nocloud".to_string(),
            platform: "nocloud".to_string(),
        };
        Ok(true)
    }

    fn data(&self) -> &DatasourceData {
        &self.data
    }

    fn data_mut(&mut self) -> &mut DatasourceData {
        &mut self.data
    }

    async fn check_instance_id(&self, cached: &DatasourceData) -> bool {
        let Some(current) = cached
            .metadata
            .get("instance-id")
            .and_then(super::value_to_string)
        else {
            return false;
        };
        self.quick_instance_id().await.as_deref() == Some(current.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CloudPaths;
    use tempfile::TempDir;
    use tokio::fs;

    fn ctx(temp: &TempDir, sys_cfg: &str) -> DatasourceContext {
        DatasourceContext {
            sys_cfg: serde_yaml::from_str(sys_cfg).unwrap(),
            distro: "ubuntu".into(),
            paths: CloudPaths::with_root(temp.path()),
        }
    }

    async fn write_seed(temp: &TempDir, meta: &str, user: Option<&str>) {
        let dir = temp.path().join("var/lib/cloud/seed/nocloud");
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("meta-data"), meta).await.unwrap();
        if let Some(user) = user {
            fs::write(dir.join("user-data"), user).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_seed_dir() {
        let temp = TempDir::new().unwrap();
        write_seed(
            &temp,
            "instance-id: test-001\nlocal-hostname: test-host\n",
            Some("#cloud-config\nhostname: h\n"),
        )
        .await;

        let mut ds = NoCloud::new(&ctx(&temp, "{}"));
        assert!(ds.get_data().await.unwrap());
        assert_eq!(ds.instance_id(), "test-001");
        assert_eq!(ds.dsmode(), DsMode::Local);
        assert_eq!(ds.userdata_raw(), Some(&b"#cloud-config\nhostname: h\n"[..]));
        assert!(ds.description().contains("seed-dir"));
    }

    #[tokio::test]
    async fn test_no_seed() {
        let temp = TempDir::new().unwrap();
        let mut ds = NoCloud::new(&ctx(&temp, "{}"));
        assert!(!ds.get_data().await.unwrap());
    }

    #[tokio::test]
    async fn test_inline_seed_and_default_iid() {
        let temp = TempDir::new().unwrap();
        let cfg = "datasource:\n  NoCloud:\n    meta-data: {local-hostname: inline}\n    user-data: \"#cloud-config\\n\"\n";
        let mut ds = NoCloud::new(&ctx(&temp, cfg));
        assert!(ds.get_data().await.unwrap());
        assert_eq!(ds.instance_id(), "nocloud");
        assert_eq!(ds.get_hostname(false, true).unwrap().hostname, "inline");
    }

    #[tokio::test]
    async fn test_dsmode_from_metadata() {
        let temp = TempDir::new().unwrap();
        write_seed(&temp, "instance-id: x\ndsmode: net\n", None).await;
        let mut ds = NoCloud::new(&ctx(&temp, "{}"));
        assert!(ds.get_data().await.unwrap());
        assert_eq!(ds.dsmode(), DsMode::Net);

        write_seed(&temp, "instance-id: x\ndsmode: disabled\n", None).await;
        let mut ds = NoCloud::new(&ctx(&temp, "{}"));
        assert!(!ds.get_data().await.unwrap());
    }

    #[tokio::test]
    async fn test_net_variant_defaults_to_net_mode() {
        let temp = TempDir::new().unwrap();
        write_seed(&temp, "instance-id: x\n", None).await;
        let mut ds = NoCloud::new_net(&ctx(&temp, "{}"));
        assert!(ds.get_data().await.unwrap());
        assert_eq!(ds.name(), "NoCloudNet");
        assert_eq!(ds.dsmode(), DsMode::Net);
    }

    #[tokio::test]
    async fn test_check_instance_id() {
        let temp = TempDir::new().unwrap();
        write_seed(&temp, "instance-id: iid-1\n", None).await;
        let mut ds = NoCloud::new(&ctx(&temp, "{}"));
        ds.get_data().await.unwrap();
        let cached = ds.data().clone();

        let fresh = NoCloud::new(&ctx(&temp, "{}"));
        assert!(fresh.check_instance_id(&cached).await);

        write_seed(&temp, "instance-id: iid-2\n", None).await;
        assert!(!fresh.check_instance_id(&cached).await);
    }
}
