//! Init stage controller
//!
//! Drives one `init` invocation: load config, resolve the datasource,
//! materialize the instance, apply network config, process user-data and
//! vendor-data and hand a [`Cloud`] to the modules runner. The merged config
//! is cached and recomputed whenever an input to it changes.

use crate::{
    CloudInitError,
    cloud::Cloud,
    config::{self, ConfigMerger, fetch_base_config},
    datasources::{
        Datasource, DatasourceContext, Dependency,
        resolver::{DatasourceRegistry, Existing, find_source, restore_from_checked_cache, write_cache},
    },
    distro::Distro,
    handlers::{HandlerRegistry, WalkOptions, default_handlers},
    modules::hostname::apply_hostname,
    network::{self, NetworkConfigSource},
    state::{
        CloudPaths, Frequency, InstanceState, Materialized, SemaphoreManager,
        instance_data::persist_instance_data,
    },
    userdata::{MimePart, UserDataProcessor, create_multipart},
    util,
};
use serde_yaml::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_DISTRO: &str = "ubuntu";

pub struct Init {
    paths: CloudPaths,
    deps: Vec<Dependency>,
    base_cfg: Value,
    files: Vec<PathBuf>,
    registry: DatasourceRegistry,
    state: InstanceState,
    datasource: Option<Arc<dyn Datasource>>,
    materialized: Option<Materialized>,
    cfg: Option<Value>,
    userdata: Option<MimePart>,
    vendordata: Option<MimePart>,
}

impl Init {
    /// Load the system config; a broken base config is fatal
    pub async fn new(paths: CloudPaths, deps: Vec<Dependency>) -> Result<Self, CloudInitError> {
        let base_cfg = fetch_base_config(&paths).await?;
        Ok(Self::with_base_config(paths, deps, base_cfg))
    }

    pub fn with_base_config(paths: CloudPaths, deps: Vec<Dependency>, base_cfg: Value) -> Self {
        Self {
            state: InstanceState::new(paths.clone()),
            paths,
            deps,
            base_cfg,
            files: Vec::new(),
            registry: DatasourceRegistry::builtin(),
            datasource: None,
            materialized: None,
            cfg: None,
            userdata: None,
            vendordata: None,
        }
    }

    pub fn with_registry(mut self, registry: DatasourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Extra config files merged above everything else
    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self.reset_cfg();
        self
    }

    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    pub fn datasource(&self) -> Option<Arc<dyn Datasource>> {
        self.datasource.clone()
    }

    pub fn distro_name(&self) -> String {
        config::get_str(&self.base_cfg, "system_info.distro")
            .unwrap_or(DEFAULT_DISTRO)
            .to_string()
    }

    pub fn distro(&self) -> Distro {
        Distro::new(self.distro_name(), self.paths.clone())
    }

    fn reset_cfg(&mut self) {
        self.cfg = None;
    }

    fn merger(&self) -> ConfigMerger {
        ConfigMerger::new(self.paths.clone(), self.base_cfg.clone())
            .with_instance(self.state.instance_id())
            .with_datasource_config(self.datasource.as_ref().and_then(|ds| ds.config_obj()))
            .with_files(self.files.clone())
    }

    /// The merged config; a copy on every call
    pub async fn cfg(&mut self) -> Result<Value, CloudInitError> {
        if let Some(cfg) = &self.cfg {
            return Ok(cfg.clone());
        }
        let cfg = self.merger().cfg().await?;
        self.cfg = Some(cfg.clone());
        Ok(cfg)
    }

    /// Create the state directory skeleton
    pub async fn initialize(&self) -> Result<(), CloudInitError> {
        self.state.initialize().await
    }

    /// Forget the previous boot's completion marker
    pub async fn purge_cache(&self) -> Result<(), CloudInitError> {
        self.state.purge_boot_finished().await
    }

    /// Resolve the datasource, preferring a valid cached one
    pub async fn fetch(&mut self, existing: Existing) -> Result<Arc<dyn Datasource>, CloudInitError> {
        if let Some(ds) = &self.datasource {
            return Ok(ds.clone());
        }

        let cfg = self.cfg().await?;
        let ctx = DatasourceContext {
            sys_cfg: cfg.clone(),
            distro: self.distro_name(),
            paths: self.paths.clone(),
        };

        let run_iid = self.state.run_instance_id().await?;
        let (restored, desc) =
            restore_from_checked_cache(&self.registry, &ctx, existing, run_iid.as_deref()).await;
        debug!("{}", desc);

        let ds = match restored {
            Some(ds) => ds,
            None => {
                let ds_list = config::get_str_list(&cfg, "datasource_list");
                find_source(&self.registry, &ctx, &self.deps, &ds_list).await?
            }
        };

        let ds: Arc<dyn Datasource> = Arc::from(ds);
        // instance paths resolve through the datasource from here on
        self.state.set_instance_id(&ds.instance_id());
        self.datasource = Some(ds.clone());
        self.reset_cfg();

        let merged = self.cfg().await?;
        if let Err(e) =
            persist_instance_data(&self.paths, ds.as_ref(), &self.distro_name(), &merged).await
        {
            warn!("Failed to persist instance data: {}", e);
        }
        Ok(ds)
    }

    /// Root per-instance state under the datasource's instance id
    pub async fn instancify(&mut self) -> Result<Materialized, CloudInitError> {
        let ds = self
            .datasource
            .clone()
            .ok_or_else(|| CloudInitError::Datasource("no datasource to instancify".into()))?;
        let iid = ds.instance_id();

        let materialized = self.state.materialize(&iid, &ds.description()).await?;
        write_cache(&self.paths, &iid, ds.as_ref()).await?;

        self.materialized = Some(materialized.clone());
        self.reset_cfg();
        Ok(materialized)
    }

    /// True on a first boot or after the instance id changed
    pub fn is_new_instance(&self) -> bool {
        self.materialized
            .as_ref()
            .is_some_and(Materialized::is_new_instance)
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.state.instance_id()
    }

    pub fn semaphores(&self) -> SemaphoreManager {
        self.state.semaphores()
    }

    async fn processor(&mut self) -> Result<UserDataProcessor, CloudInitError> {
        let cfg = self.cfg().await?;
        let error_on_failure = config::get_bool(&cfg, "features.error_on_user_data_failure", true);
        Ok(UserDataProcessor::new(self.paths.clone(), self.instance_id())
            .error_on_failure(error_on_failure))
    }

    /// Store raw and processed user-data and vendor-data for the instance
    pub async fn update(&mut self) -> Result<(), CloudInitError> {
        let Some(ds) = self.datasource.clone() else {
            return Ok(());
        };

        self.state
            .save_userdata_raw(ds.userdata_raw().unwrap_or_default())
            .await?;
        let userdata = self.processed(false).await?;
        self.state.save_userdata(&userdata.to_bytes()).await?;

        self.state
            .save_vendordata_raw(ds.vendordata_raw().unwrap_or_default())
            .await?;
        let vendordata = self.processed(true).await?;
        self.state.save_vendordata(&vendordata.to_bytes()).await?;
        Ok(())
    }

    /// Apply network config for new instances, or once per boot when
    /// `updates.network.when` includes `boot`
    pub async fn apply_network_config(&mut self, bring_up: bool) -> Result<(), CloudInitError> {
        if self.paths.upgraded_network_marker().exists() {
            info!("network config disabled by upgraded-network marker");
            return Ok(());
        }

        let cfg = self.cfg().await?;
        let (netcfg, source) = network::find_networking_config(self.datasource.as_deref(), &cfg);
        let Some(netcfg) = netcfg else {
            if source == NetworkConfigSource::Fallback {
                debug!("No network config available and no fallback renderer");
            } else {
                info!("network config is disabled by {}", source);
            }
            return Ok(());
        };

        let new_instance = self.datasource.is_none() || self.is_new_instance();
        if !new_instance && !boot_updates_enabled(&cfg) {
            debug!(
                "No network config applied. Neither a new instance nor datasource network update allowed"
            );
            return Ok(());
        }

        info!(
            "Applying network configuration from {} bringup={}: {}",
            source, bring_up, netcfg
        );
        let run_sems = SemaphoreManager::new(None, self.paths.run_sem_dir());
        if new_instance {
            network::apply_network_config(&self.paths, &netcfg).await?;
            if let Err(e) = run_sems
                .mark_ran("apply_network_config", Frequency::PerOnce)
                .await
            {
                warn!("Failed to record network config application: {}", e);
            }
            return Ok(());
        }

        let (ran, _) = run_sems
            .run_once(
                "apply_network_config",
                Frequency::PerOnce,
                network::apply_network_config(&self.paths, &netcfg),
            )
            .await?;
        if !ran {
            debug!("Network config already applied this boot");
        }
        Ok(())
    }

    /// Run the part handlers over user-data, then vendor-data
    pub async fn consume_data(&mut self, frequency: Frequency) -> Result<(), CloudInitError> {
        let Some(iid) = self.instance_id().map(String::from) else {
            return Err(CloudInitError::UserData(
                "cannot consume data before the instance is known".to_string(),
            ));
        };

        self.consume_userdata(&iid, frequency).await?;
        self.consume_vendordata(&iid, frequency).await?;
        self.reset_cfg();
        Ok(())
    }

    /// Processed user-data or vendor-data, computed once per invocation
    async fn processed(&mut self, vendor: bool) -> Result<MimePart, CloudInitError> {
        let cached = if vendor { &self.vendordata } else { &self.userdata };
        if let Some(msg) = cached {
            return Ok(msg.clone());
        }

        let raw = self
            .datasource
            .as_ref()
            .and_then(|ds| if vendor { ds.vendordata_raw() } else { ds.userdata_raw() })
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        let msg = if raw.is_empty() {
            create_multipart(Vec::new())
        } else {
            self.processor().await?.process(&raw).await?
        };

        if vendor {
            self.vendordata = Some(msg.clone());
        } else {
            self.userdata = Some(msg.clone());
        }
        Ok(msg)
    }

    async fn consume_userdata(&mut self, iid: &str, frequency: Frequency) -> Result<(), CloudInitError> {
        let msg = self.processed(false).await?;
        let handlers = default_handlers(&self.paths, iid, false);
        self.do_handlers(&msg, handlers, iid, frequency, Vec::new()).await;
        Ok(())
    }

    async fn consume_vendordata(&mut self, iid: &str, frequency: Frequency) -> Result<(), CloudInitError> {
        if self
            .datasource
            .as_ref()
            .and_then(|ds| ds.vendordata_raw())
            .is_none_or(<[u8]>::is_empty)
        {
            debug!("no vendordata from datasource");
            return Ok(());
        }
        let msg = self.processed(true).await?;

        // User config decides about vendor-data, so vendor config is left out
        let cfg = self.merger().include_vendor(false).cfg().await?;
        let vdcfg = cfg.get("vendor_data").cloned().unwrap_or(Value::Null);
        let (enabled, disabled_handlers) = match &vdcfg {
            Value::Mapping(_) => (
                config::get_bool(&vdcfg, "enabled", true),
                config::get_str_list(&vdcfg, "disabled_handlers"),
            ),
            Value::Null => (true, Vec::new()),
            other => {
                warn!("invalid 'vendor_data' setting. resetting to: {{enabled: False}} ({:?})", other);
                (false, Vec::new())
            }
        };
        if !enabled {
            debug!("vendordata consumption is disabled.");
            return Ok(());
        }

        debug!("vendordata will be consumed. disabled_handlers={:?}", disabled_handlers);
        let handlers = default_handlers(&self.paths, iid, true);
        self.do_handlers(&msg, handlers, iid, frequency, disabled_handlers).await;
        Ok(())
    }

    async fn do_handlers(
        &self,
        msg: &MimePart,
        defaults: Vec<Box<dyn crate::handlers::PartHandler>>,
        iid: &str,
        frequency: Frequency,
        excluded: Vec<String>,
    ) {
        let mut registry = HandlerRegistry::new();
        match registry.register_dir(&self.paths.handlers_dir()).await {
            Ok(0) => {}
            Ok(n) => debug!("Registered {} handlers from {}", n, self.paths.handlers_dir().display()),
            Err(e) => warn!("Failed reading handlers directory: {}", e),
        }
        for handler in defaults {
            registry.register(handler, false);
        }

        let opts = WalkOptions {
            frequency,
            excluded,
            handler_dir: self.paths.instance_handlers_dir(iid),
        };
        registry.walk(msg, &opts).await;
    }

    /// Set the hostname early when metadata already provides one
    ///
    /// Failures are logged; `retry_stage` names the stage that tries again.
    pub async fn maybe_set_hostname(&mut self, stage: &str, retry_stage: &str) {
        let cloud = match self.cloudify().await {
            Ok(cloud) => cloud,
            Err(e) => {
                warn!("Failed building cloud for hostname in {}: {}", stage, e);
                return;
            }
        };
        let cfg = cloud.cfg();
        if cloud.hostname_and_fqdn(&cfg, true).is_none() {
            return;
        }
        if let Err(e) = apply_hostname(&cloud, &cfg, true).await {
            debug!(
                "Failed setting hostname in {} stage. Will retry in {} stage. Error: {}",
                stage, retry_stage, e
            );
        }
    }

    /// The read-only view handed to modules
    pub async fn cloudify(&mut self) -> Result<Cloud, CloudInitError> {
        let cfg = self.cfg().await?;
        Ok(Cloud::new(
            self.paths.clone(),
            self.distro(),
            self.datasource.clone(),
            cfg,
        ))
    }

    /// Stop-file that makes the network-mode `init` of this boot exit early
    pub async fn write_no_net_marker(&self) -> Result<(), CloudInitError> {
        util::write_file(self.paths.no_net_marker(), "", 0o644).await
    }
}

fn boot_updates_enabled(cfg: &Value) -> bool {
    config::get_str_list(cfg, "updates.network.when")
        .iter()
        .any(|w| w == "boot")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::mock::MockDatasource;
    use serde_json::json;
    use tempfile::TempDir;

    fn registry(ds: MockDatasource) -> DatasourceRegistry {
        let mut registry = DatasourceRegistry::empty();
        registry.register("Mock", &[Dependency::Filesystem, Dependency::Network], move |_| {
            Box::new(ds.clone())
        });
        registry
    }

    fn base() -> Value {
        serde_yaml::from_str("datasource_list: [Mock]\nsystem_info: {distro: ubuntu}").unwrap()
    }

    fn init(temp: &TempDir, ds: MockDatasource) -> Init {
        Init::with_base_config(
            CloudPaths::with_root(temp.path()),
            vec![Dependency::Filesystem, Dependency::Network],
            base(),
        )
        .with_registry(registry(ds))
    }

    #[tokio::test]
    async fn test_fetch_and_instancify() {
        let temp = TempDir::new().unwrap();
        let ds = MockDatasource::new().with_metadata(json!({"instance-id": "i-100"}));
        let mut init = init(&temp, ds);
        init.initialize().await.unwrap();

        let ds = init.fetch(Existing::Check).await.unwrap();
        assert_eq!(ds.instance_id(), "i-100");
        assert!(init.paths().instance_data().exists());

        let materialized = init.instancify().await.unwrap();
        assert!(materialized.is_new_instance());
        assert!(init.is_new_instance());
        assert!(init.paths().datasource_cache("i-100").exists());
    }

    #[tokio::test]
    async fn test_fetch_not_found() {
        let temp = TempDir::new().unwrap();
        let mut init = init(&temp, MockDatasource::new().with_found(false));
        let err = init.fetch(Existing::Check).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_datasource_config_is_lowest_layer() {
        let temp = TempDir::new().unwrap();
        let ds = MockDatasource::new()
            .with_metadata(json!({"instance-id": "i-1"}))
            .with_config(json!({"system_info": {"distro": "centos"}, "ds_only": true}));
        let mut init = init(&temp, ds);
        init.fetch(Existing::Check).await.unwrap();

        let cfg = init.cfg().await.unwrap();
        assert_eq!(config::get_str(&cfg, "system_info.distro"), Some("ubuntu"));
        assert!(config::get_bool(&cfg, "ds_only", false));
    }

    #[tokio::test]
    async fn test_consume_writes_cloud_config() {
        let temp = TempDir::new().unwrap();
        let ds = MockDatasource::new()
            .with_metadata(json!({"instance-id": "i-2"}))
            .with_userdata(b"#cloud-config\nfoo: bar\n".to_vec());
        let mut init = init(&temp, ds);
        init.initialize().await.unwrap();
        init.fetch(Existing::Check).await.unwrap();
        init.instancify().await.unwrap();
        init.update().await.unwrap();
        init.consume_data(Frequency::PerInstance).await.unwrap();

        let paths = init.paths().clone();
        assert!(paths.user_data_raw("i-2").exists());
        assert!(paths.user_data("i-2").exists());
        let cfg = init.cfg().await.unwrap();
        assert_eq!(config::get_str(&cfg, "foo"), Some("bar"));
    }

    #[tokio::test]
    async fn test_network_config_applied_for_new_instance() {
        let temp = TempDir::new().unwrap();
        let ds = MockDatasource::new()
            .with_metadata(json!({"instance-id": "i-3"}))
            .with_network_config(json!({"version": 2, "ethernets": {}}));
        let mut init = init(&temp, ds);
        init.initialize().await.unwrap();
        init.fetch(Existing::Check).await.unwrap();
        init.instancify().await.unwrap();
        init.apply_network_config(false).await.unwrap();

        assert!(init.paths().network_config_json().exists());
        assert!(temp.path().join("etc/netplan/50-cloud-init.yaml").exists());
    }

    #[tokio::test]
    async fn test_upgraded_network_marker_disables() {
        let temp = TempDir::new().unwrap();
        let ds = MockDatasource::new()
            .with_metadata(json!({"instance-id": "i-4"}))
            .with_network_config(json!({"version": 2}));
        let mut init = init(&temp, ds);
        init.initialize().await.unwrap();
        std::fs::write(init.paths().upgraded_network_marker(), "").unwrap();
        init.fetch(Existing::Check).await.unwrap();
        init.instancify().await.unwrap();
        init.apply_network_config(false).await.unwrap();

        assert!(!init.paths().network_config_json().exists());
    }

    #[test]
    fn test_boot_updates_enabled() {
        let cfg: Value = serde_yaml::from_str("updates: {network: {when: [boot]}}").unwrap();
        assert!(boot_updates_enabled(&cfg));
        assert!(!boot_updates_enabled(&Value::Null));
    }
}
