//! Datasource resolution
//!
//! Resolves the single active datasource: first from the snapshot cached by
//! an earlier stage of this boot, otherwise by probing each name in
//! `datasource_list` whose registered dependency set equals what the current
//! stage can offer.

use super::{
    Datasource, DatasourceContext, DatasourceSnapshot, Dependency, ec2::Ec2, nocloud::NoCloud,
    none::NoneDatasource,
};
use crate::{CloudInitError, state::CloudPaths, util};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

type Factory = Arc<dyn Fn(&DatasourceContext) -> Box<dyn Datasource> + Send + Sync>;

/// A named datasource constructor and the dependencies it needs
#[derive(Clone)]
pub struct DatasourceEntry {
    pub name: String,
    pub depends: BTreeSet<Dependency>,
    factory: Factory,
}

impl DatasourceEntry {
    pub fn create(&self, ctx: &DatasourceContext) -> Box<dyn Datasource> {
        (self.factory)(ctx)
    }
}

/// Compiled-in datasource registry
#[derive(Clone, Default)]
pub struct DatasourceRegistry {
    entries: Vec<DatasourceEntry>,
}

impl DatasourceRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// NoCloud (local), NoCloudNet, Ec2 and the None fallback
    pub fn builtin() -> Self {
        use Dependency::{Filesystem, Network};

        let mut registry = Self::empty();
        registry.register("NoCloud", &[Filesystem], |ctx| Box::new(NoCloud::new(ctx)));
        registry.register("NoCloudNet", &[Filesystem, Network], |ctx| {
            Box::new(NoCloud::new_net(ctx))
        });
        registry.register("Ec2", &[Filesystem, Network], |ctx| Box::new(Ec2::new(ctx)));
        registry.register("None", &[Filesystem, Network], |ctx| {
            Box::new(NoneDatasource::new(ctx))
        });
        registry.register("None", &[], |ctx| Box::new(NoneDatasource::new(ctx)));
        registry
    }

    /// Add an entry; later entries never shadow earlier ones with the same deps
    pub fn register<F>(&mut self, name: &str, depends: &[Dependency], factory: F)
    where
        F: Fn(&DatasourceContext) -> Box<dyn Datasource> + Send + Sync + 'static,
    {
        self.entries.push(DatasourceEntry {
            name: name.to_string(),
            depends: depends.iter().copied().collect(),
            factory: Arc::new(factory),
        });
    }

    /// Entries for `ds_list` names, in list order, whose deps equal `depends`
    pub fn candidates(&self, ds_list: &[String], depends: &[Dependency]) -> Vec<&DatasourceEntry> {
        let wanted: BTreeSet<Dependency> = depends.iter().copied().collect();
        let wanted = &wanted;
        ds_list
            .iter()
            .flat_map(|name| {
                let name = normalize_name(name);
                self.entries.iter().filter(move |e| {
                    e.name.eq_ignore_ascii_case(&name) && &e.depends == wanted
                })
            })
            .collect()
    }

    /// Any entry with this name, regardless of dependencies
    pub fn lookup(&self, name: &str) -> Option<&DatasourceEntry> {
        let name = normalize_name(name);
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(&name))
    }
}

/// Accept both `NoCloud` and `DataSourceNoCloud`
fn normalize_name(name: &str) -> String {
    let name = name.trim();
    name.strip_prefix("DataSource").unwrap_or(name).to_string()
}

/// Try candidates in order; the first whose `get_data` returns true wins
///
/// Errors from an individual candidate are logged and the next is tried.
pub async fn find_source(
    registry: &DatasourceRegistry,
    ctx: &DatasourceContext,
    depends: &[Dependency],
    ds_list: &[String],
) -> Result<Box<dyn Datasource>, CloudInitError> {
    let candidates = registry.candidates(ds_list, depends);
    let searched: Vec<String> = candidates.iter().map(|e| e.name.clone()).collect();
    info!("Searching for {:?} data source in: {:?}", depends, searched);

    for entry in candidates {
        let mut ds = entry.create(ctx);
        debug!("Seeing if we can get any data from {}", entry.name);
        match ds.get_data().await {
            Ok(true) => {
                info!("Loaded datasource {} - {}", entry.name, ds.description());
                return Ok(ds);
            }
            Ok(false) => debug!("{} found no data", entry.name),
            Err(e) => warn!("Getting data from {} failed: {}", entry.name, e),
        }
    }

    Err(CloudInitError::DatasourceNotFound { searched })
}

/// How far to trust a cached datasource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existing {
    /// Reuse only if this boot already saw its instance id or the
    /// datasource confirms it
    Check,
    /// Reuse unconditionally
    Trust,
}

/// Read the snapshot behind the `instance` link
///
/// Ok(None) when there is no cache; Err when one exists but is unreadable.
pub async fn load_cache(paths: &CloudPaths) -> Result<Option<DatasourceSnapshot>, CloudInitError> {
    let path = paths.instance_link().join("obj.json");
    match util::read_optional(&path).await? {
        Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        None => Ok(None),
    }
}

/// Persist the resolved datasource for later stages of this boot
pub async fn write_cache(
    paths: &CloudPaths,
    instance_id: &str,
    ds: &dyn Datasource,
) -> Result<(), CloudInitError> {
    let json = serde_json::to_vec_pretty(&ds.snapshot())?;
    let path = paths.datasource_cache(instance_id);
    // the previous snapshot is read-only
    util::remove_if_exists(&path).await?;
    util::write_file(path, json, 0o400).await
}

/// Restore a cached datasource if it is still valid
///
/// Returns the datasource (if reused) and a description of the decision.
pub async fn restore_from_checked_cache(
    registry: &DatasourceRegistry,
    ctx: &DatasourceContext,
    existing: Existing,
    run_instance_id: Option<&str>,
) -> (Option<Box<dyn Datasource>>, String) {
    let snapshot = match load_cache(&ctx.paths).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return (None, "no cache found".to_string()),
        Err(e) => {
            warn!("Failed loading cached datasource: {}", e);
            return (None, format!("cache unreadable: {e}"));
        }
    };

    let Some(entry) = registry.lookup(&snapshot.dsname) else {
        return (
            None,
            format!("cached datasource {} is not registered", snapshot.dsname),
        );
    };

    let mut ds = entry.create(ctx);
    let cached = snapshot.data;
    let instance_id = cached
        .metadata
        .get("instance-id")
        .and_then(super::value_to_string);

    if run_instance_id.is_some() && run_instance_id == instance_id.as_deref() {
        ds.restore(cached);
        let desc = format!("restored from cache with run check: {}", ds.description());
        return (Some(ds), desc);
    }

    match existing {
        Existing::Trust => {
            ds.restore(cached);
            let desc = format!("restored from cache: {}", ds.description());
            (Some(ds), desc)
        }
        Existing::Check => {
            if ds.check_instance_id(&cached).await {
                ds.restore(cached);
                let desc = format!("restored from checked cache: {}", ds.description());
                (Some(ds), desc)
            } else {
                (None, format!("cache invalid in datasource: {}", snapshot.dsname))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::mock::MockDatasource;
    use serde_json::json;
    use tempfile::TempDir;

    fn ctx(temp: &TempDir) -> DatasourceContext {
        DatasourceContext {
            sys_cfg: serde_yaml::Value::Null,
            distro: "ubuntu".into(),
            paths: CloudPaths::with_root(temp.path()),
        }
    }

    fn list(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Filesystem-only mocks, registered in order
    fn registry_with(mocks: Vec<(&'static str, MockDatasource)>) -> DatasourceRegistry {
        let mut registry = DatasourceRegistry::empty();
        for (name, mock) in mocks {
            registry.register(name, &[Dependency::Filesystem], move |_| {
                Box::new(mock.clone().with_name(name))
            });
        }
        registry
    }

    #[test]
    fn test_candidates_match_exact_dependencies() {
        let registry = DatasourceRegistry::builtin();
        let local = registry.candidates(
            &list(&["NoCloud", "Ec2", "None"]),
            &[Dependency::Filesystem],
        );
        assert_eq!(
            local.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["NoCloud"]
        );

        let net = registry.candidates(
            &list(&["DataSourceNoCloud", "Ec2", "None"]),
            &[Dependency::Network, Dependency::Filesystem],
        );
        assert_eq!(
            net.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["Ec2", "None"]
        );

        let nodeps = registry.candidates(&list(&["None"]), &[]);
        assert_eq!(nodeps.len(), 1);
    }

    #[tokio::test]
    async fn test_first_found_wins_and_errors_are_skipped() {
        use Dependency::Filesystem;
        let temp = TempDir::new().unwrap();
        let registry = registry_with(vec![
            ("Broken", MockDatasource::new().with_error("boom")),
            ("Absent", MockDatasource::new().with_found(false)),
            ("First", MockDatasource::new()),
            ("Second", MockDatasource::new()),
        ]);

        let ds = find_source(
            &registry,
            &ctx(&temp),
            &[Filesystem],
            &list(&["Broken", "Absent", "First", "Second"]),
        )
        .await
        .unwrap();
        assert_eq!(ds.name(), "First");
    }

    #[tokio::test]
    async fn test_not_found_lists_searched() {
        let temp = TempDir::new().unwrap();
        let registry = registry_with(vec![("Absent", MockDatasource::new().with_found(false))]);

        let err = find_source(
            &registry,
            &ctx(&temp),
            &[Dependency::Filesystem],
            &list(&["Absent", "Unknown"]),
        )
        .await
        .err()
        .unwrap();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Absent"));
    }

    async fn cache_mock(temp: &TempDir, iid: &str, valid: bool) -> DatasourceRegistry {
        let mock = MockDatasource::new()
            .with_metadata(json!({"instance-id": iid}))
            .with_instance_id_valid(valid);
        let paths = CloudPaths::with_root(temp.path());
        write_cache(&paths, iid, &mock).await.unwrap();
        util::sym_link(&paths.instance_dir(iid), &paths.instance_link())
            .await
            .unwrap();
        registry_with(vec![("Mock", mock)])
    }

    #[tokio::test]
    async fn test_restore_no_cache() {
        let temp = TempDir::new().unwrap();
        let (ds, desc) = restore_from_checked_cache(
            &DatasourceRegistry::builtin(),
            &ctx(&temp),
            Existing::Trust,
            None,
        )
        .await;
        assert!(ds.is_none());
        assert_eq!(desc, "no cache found");
    }

    #[tokio::test]
    async fn test_restore_run_check_and_trust() {
        let temp = TempDir::new().unwrap();
        let registry = cache_mock(&temp, "i-1", false).await;

        let (ds, desc) =
            restore_from_checked_cache(&registry, &ctx(&temp), Existing::Check, Some("i-1")).await;
        assert_eq!(ds.unwrap().instance_id(), "i-1");
        assert!(desc.contains("run check"));

        let (ds, _) =
            restore_from_checked_cache(&registry, &ctx(&temp), Existing::Trust, None).await;
        assert!(ds.is_some());

        let (ds, desc) =
            restore_from_checked_cache(&registry, &ctx(&temp), Existing::Check, None).await;
        assert!(ds.is_none());
        assert!(desc.contains("cache invalid"));
    }

    #[tokio::test]
    async fn test_restore_checked_by_datasource() {
        let temp = TempDir::new().unwrap();
        let registry = cache_mock(&temp, "i-2", true).await;
        let (ds, desc) =
            restore_from_checked_cache(&registry, &ctx(&temp), Existing::Check, Some("other"))
                .await;
        assert!(ds.is_some());
        assert!(desc.contains("checked cache"));
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_distinguished() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_root(temp.path());
        util::write_file(paths.datasource_cache("i-3"), "{not json", 0o600)
            .await
            .unwrap();
        util::sym_link(&paths.instance_dir("i-3"), &paths.instance_link())
            .await
            .unwrap();

        assert!(load_cache(&paths).await.is_err());
        let (ds, desc) = restore_from_checked_cache(
            &DatasourceRegistry::builtin(),
            &ctx(&temp),
            Existing::Trust,
            None,
        )
        .await;
        assert!(ds.is_none());
        assert!(desc.starts_with("cache unreadable"));
    }
}
