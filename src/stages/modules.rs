//! Modules runner
//!
//! Runs the modules named by one `cloud_*_modules` section in list order.
//! Each module is filtered by applicability and distro, then executed through
//! the semaphore store under `config-<name>`. A failing module is recorded
//! and the section carries on.

use crate::{
    CloudInitError,
    cloud::Cloud,
    config,
    modules::{ALL_DISTROS, Module, ModuleRegistry, ModuleSpec, canonical_name, read_module_specs},
    state::Frequency,
};
use serde_yaml::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to each module of a section
#[derive(Debug, Default)]
pub struct SectionOutcome {
    /// Every module that reached the semaphore check, run or not
    pub which_ran: Vec<String>,
    pub failures: Vec<(String, CloudInitError)>,
    /// Not verified on this distro
    pub skipped: Vec<String>,
    /// None of the module's activation keys are configured
    pub inapplicable: Vec<String>,
    /// Not verified on this distro but listed in `unverified_modules`
    pub forced: Vec<String>,
    /// A semaphore said the module already ran
    pub already_ran: Vec<String>,
}

impl SectionOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failure messages in `name: error` form for status files
    pub fn error_strings(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|(name, e)| format!("{}: {}", name, e))
            .collect()
    }
}

struct Resolved {
    spec: ModuleSpec,
    module: Arc<dyn Module>,
}

pub struct Modules {
    cloud: Cloud,
    registry: ModuleRegistry,
}

impl Modules {
    pub fn new(cloud: Cloud, registry: ModuleRegistry) -> Self {
        Self { cloud, registry }
    }

    pub fn cloud(&self) -> &Cloud {
        &self.cloud
    }

    /// Run every module listed under `section` in the merged config
    pub async fn run_section(&self, section: &str) -> SectionOutcome {
        let cfg = self.cloud.cfg();
        let specs = read_module_specs(&cfg, section);
        if specs.is_empty() {
            debug!("No '{}' modules to run under section '{}'", section, section);
            return SectionOutcome::default();
        }

        let resolved = self.fixup(specs);
        let mut outcome = SectionOutcome::default();
        let unverified = config::get_str_list(&cfg, "unverified_modules");
        let distro = self.cloud.distro().name().to_string();

        let mut runnable = Vec::new();
        for item in resolved {
            let meta = item.module.meta();
            let name = item.spec.name().to_string();

            if !is_activated(meta.activate_by_schema_keys, &cfg) {
                debug!(
                    "Skipping modules '{}' because no applicable config is provided.",
                    name
                );
                outcome.inapplicable.push(name);
                continue;
            }

            let verified = meta.distros.contains(&ALL_DISTROS)
                || meta.distros.iter().any(|d| *d == distro);
            if !verified {
                if unverified.iter().any(|u| canonical_name(u) == canonical_name(&name)) {
                    info!(
                        "running unverified_modules: '{}' (distro {} not in {:?})",
                        name, distro, meta.distros
                    );
                    outcome.forced.push(name);
                } else {
                    info!(
                        "Skipping modules '{}' because they are not verified on distro '{}'. \
                         To run anyway, add them to 'unverified_modules' in config.",
                        name, distro
                    );
                    outcome.skipped.push(name);
                    continue;
                }
            }
            runnable.push(item);
        }

        self.run_modules(runnable, &cfg, &mut outcome).await;
        outcome
    }

    /// Run one module ad hoc, without section or distro filtering
    pub async fn run_single(
        &self,
        name: &str,
        args: Vec<String>,
        frequency: Option<Frequency>,
    ) -> Result<SectionOutcome, CloudInitError> {
        let Some(module) = self.registry.lookup(name) else {
            return Err(CloudInitError::InvalidModule(name.to_string()));
        };
        let cfg = self.cloud.cfg();
        let mut outcome = SectionOutcome::default();
        let resolved = Resolved {
            spec: ModuleSpec::single(name, frequency, args),
            module,
        };
        self.run_modules(vec![resolved], &cfg, &mut outcome).await;
        Ok(outcome)
    }

    /// Drop specs naming unknown modules
    fn fixup(&self, specs: Vec<ModuleSpec>) -> Vec<Resolved> {
        specs
            .into_iter()
            .filter_map(|spec| match self.registry.lookup(spec.name()) {
                Some(module) => Some(Resolved { spec, module }),
                None => {
                    warn!("Could not find module named {}", spec.name());
                    None
                }
            })
            .collect()
    }

    async fn run_modules(&self, resolved: Vec<Resolved>, cfg: &Value, outcome: &mut SectionOutcome) {
        let semaphores = self.cloud.semaphores();
        for Resolved { spec, module } in resolved {
            let name = spec.name().to_string();
            let meta = module.meta();
            let freq = spec.frequency().unwrap_or(meta.frequency);
            let run_name = format!("config-{}", canonical_name(&name));
            outcome.which_ran.push(name.clone());

            let module_cfg = cfg.clone();
            let work = module.handle(&name, &module_cfg, &self.cloud, spec.args());
            match semaphores.run_once(&run_name, freq, work).await {
                Ok((true, _)) => debug!("Module {} ran (freq={})", name, freq),
                Ok((false, _)) => {
                    debug!("Module {} already ran (freq={})", name, freq);
                    outcome.already_ran.push(name);
                }
                Err(e) => {
                    warn!("Running module {} failed: {}", name, e);
                    outcome.failures.push((name, e));
                }
            }
        }

        info!(
            "Ran {} modules with {} failures",
            outcome.which_ran.len(),
            outcome.failures.len()
        );
    }
}

fn is_activated(keys: &[&str], cfg: &Value) -> bool {
    keys.is_empty() || keys.iter().any(|k| cfg.get(*k).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datasources::mock::MockDatasource,
        distro::Distro,
        modules::ModuleMeta,
        state::CloudPaths,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Counting {
        id: &'static str,
        frequency: Frequency,
        distros: &'static [&'static str],
        keys: &'static [&'static str],
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Module for Counting {
        fn meta(&self) -> ModuleMeta {
            ModuleMeta {
                id: self.id,
                frequency: self.frequency,
                distros: self.distros,
                activate_by_schema_keys: self.keys,
            }
        }

        async fn handle(
            &self,
            name: &str,
            _cfg: &Value,
            _cloud: &Cloud,
            _args: &[String],
        ) -> Result<(), CloudInitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CloudInitError::module(name, "boom"));
            }
            Ok(())
        }
    }

    fn counting(id: &'static str, frequency: Frequency) -> (Counting, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let module = Counting {
            id,
            frequency,
            distros: &[ALL_DISTROS],
            keys: &[],
            fail: false,
            calls: calls.clone(),
        };
        (module, calls)
    }

    fn cloud(temp: &TempDir, iid: &str, distro: &str, cfg: &str) -> Cloud {
        let paths = CloudPaths::with_root(temp.path());
        let ds = MockDatasource::new().with_metadata(serde_json::json!({"instance-id": iid}));
        Cloud::new(
            paths.clone(),
            Distro::new(distro, paths),
            Some(Arc::new(ds)),
            serde_yaml::from_str(cfg).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_per_instance_runs_once_per_instance() {
        let temp = TempDir::new().unwrap();
        let (module, calls) = counting("counted", Frequency::PerInstance);
        let mut registry = ModuleRegistry::empty();
        registry.register(module);
        let cfg = "cloud_init_modules: [counted]";

        for _ in 0..2 {
            let runner = Modules::new(cloud(&temp, "i-1", "ubuntu", cfg), registry.clone());
            let outcome = runner.run_section("cloud_init_modules").await;
            assert!(outcome.is_success());
            assert_eq!(outcome.which_ran, vec!["counted"]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let runner = Modules::new(cloud(&temp, "i-2", "ubuntu", cfg), registry);
        runner.run_section("cloud_init_modules").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_frequency_override_always() {
        let temp = TempDir::new().unwrap();
        let (module, calls) = counting("counted", Frequency::PerInstance);
        let mut registry = ModuleRegistry::empty();
        registry.register(module);

        for _ in 0..3 {
            let runner = Modules::new(
                cloud(&temp, "i-1", "ubuntu", "cloud_init_modules: [[counted, always]]"),
                registry.clone(),
            );
            runner.run_section("cloud_init_modules").await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_retried() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ModuleRegistry::empty();
        registry.register(Counting {
            id: "broken",
            frequency: Frequency::PerInstance,
            distros: &[ALL_DISTROS],
            keys: &[],
            fail: true,
            calls: calls.clone(),
        });
        let (ok, ok_calls) = counting("fine", Frequency::PerInstance);
        registry.register(ok);
        let cfg = "cloud_config_modules: [broken, fine]";

        let runner = Modules::new(cloud(&temp, "i-1", "ubuntu", cfg), registry.clone());
        let outcome = runner.run_section("cloud_config_modules").await;
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, "broken");
        assert_eq!(outcome.error_strings().len(), 1);
        assert_eq!(ok_calls.load(Ordering::SeqCst), 1);

        let runner = Modules::new(cloud(&temp, "i-1", "ubuntu", cfg), registry);
        let outcome = runner.run_section("cloud_config_modules").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.already_ran, vec!["fine"]);
    }

    #[tokio::test]
    async fn test_distro_filter_and_unverified() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ModuleRegistry::empty();
        registry.register(Counting {
            id: "ubuntu_only",
            frequency: Frequency::PerAlways,
            distros: &["ubuntu"],
            keys: &[],
            fail: false,
            calls: calls.clone(),
        });

        let runner = Modules::new(
            cloud(&temp, "i-1", "centos", "cloud_init_modules: [ubuntu_only]"),
            registry.clone(),
        );
        let outcome = runner.run_section("cloud_init_modules").await;
        assert!(outcome.which_ran.is_empty());
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.skipped, vec!["ubuntu_only"]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let runner = Modules::new(
            cloud(
                &temp,
                "i-1",
                "centos",
                "cloud_init_modules: [ubuntu_only]\nunverified_modules: [ubuntu_only]",
            ),
            registry,
        );
        let outcome = runner.run_section("cloud_init_modules").await;
        assert_eq!(outcome.forced, vec!["ubuntu_only"]);
        assert_eq!(outcome.which_ran, vec!["ubuntu_only"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inapplicable_and_unknown() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ModuleRegistry::empty();
        registry.register(Counting {
            id: "keyed",
            frequency: Frequency::PerAlways,
            distros: &[ALL_DISTROS],
            keys: &["keyed_cfg"],
            fail: false,
            calls: calls.clone(),
        });

        let runner = Modules::new(
            cloud(&temp, "i-1", "ubuntu", "cloud_init_modules: [keyed, missing]"),
            registry.clone(),
        );
        let outcome = runner.run_section("cloud_init_modules").await;
        assert_eq!(outcome.inapplicable, vec!["keyed"]);
        assert!(outcome.which_ran.is_empty());

        let runner = Modules::new(
            cloud(&temp, "i-1", "ubuntu", "cloud_init_modules: [keyed]\nkeyed_cfg: 1"),
            registry,
        );
        runner.run_section("cloud_init_modules").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_single() {
        let temp = TempDir::new().unwrap();
        let (module, calls) = counting("counted", Frequency::PerInstance);
        let mut registry = ModuleRegistry::empty();
        registry.register(module);
        let runner = Modules::new(cloud(&temp, "i-1", "ubuntu", "{}"), registry);

        let outcome = runner
            .run_single("counted", vec![], Some(Frequency::PerAlways))
            .await
            .unwrap();
        assert_eq!(outcome.which_ran, vec!["counted"]);
        runner
            .run_single("counted", vec![], Some(Frequency::PerAlways))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(matches!(
            runner.run_single("nope", vec![], None).await,
            Err(CloudInitError::InvalidModule(_))
        ));
    }
}
