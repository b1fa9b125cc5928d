//! Boot stage entry points
//!
//! Each boot runs these as separate invocations, carrying state only through
//! the filesystem:
//! 1. `init --local` - before networking, local datasources only
//! 2. `init` - networked datasources, user-data consumption, init modules
//! 3. `modules --mode config` - configuration modules
//! 4. `modules --mode final` - scripts and the final message
//!
//! Stage functions return the errors they collected instead of failing;
//! only a missing datasource in network `init` is reported as a failure.

pub mod init;
pub mod modules;

pub use init::Init;
pub use modules::{Modules, SectionOutcome};

use crate::{
    CloudInitError,
    config,
    datasources::{
        Datasource, Dependency, DsMode,
        resolver::{DatasourceRegistry, Existing},
    },
    modules::ModuleRegistry,
    state::{CloudInitResult, CloudInitStatus, CloudPaths, Frequency, InstanceState, StageStatus},
    util,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Inputs shared by every stage invocation
#[derive(Clone)]
pub struct StageOptions {
    /// Extra config files from `--file`
    pub files: Vec<PathBuf>,
    /// Carry on without a datasource
    pub force: bool,
    pub datasources: DatasourceRegistry,
    pub modules: ModuleRegistry,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            force: false,
            datasources: DatasourceRegistry::builtin(),
            modules: ModuleRegistry::builtin(),
        }
    }
}

/// Which `cloud_<mode>_modules` section a `modules` invocation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulesMode {
    Init,
    Config,
    Final,
}

impl ModulesMode {
    pub fn section(&self) -> String {
        format!("cloud_{}_modules", self)
    }

    /// Key in status.json
    pub fn stage_name(&self) -> String {
        format!("modules-{}", self)
    }
}

impl fmt::Display for ModulesMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Config => "config",
            Self::Final => "final",
        })
    }
}

/// What `init` hands back: the datasource (if any) and collected errors
pub type InitOutcome = (Option<Arc<dyn Datasource>>, Vec<String>);

/// Run `init` (network mode) or `init --local`
pub async fn main_init(
    paths: &CloudPaths,
    local: bool,
    opts: &StageOptions,
) -> Result<InitOutcome, CloudInitError> {
    let (mode, deps) = if local {
        (DsMode::Local, vec![Dependency::Filesystem])
    } else {
        (DsMode::Net, vec![Dependency::Filesystem, Dependency::Network])
    };

    let mut init = Init::new(paths.clone(), deps)
        .await?
        .with_registry(opts.datasources.clone())
        .with_files(opts.files.clone());
    init.initialize().await?;

    if mode == DsMode::Net && paths.no_net_marker().exists() {
        info!(
            "[{}] Exiting. stop file {} existed",
            mode,
            paths.no_net_marker().display()
        );
        return Ok((None, Vec::new()));
    }

    let existing = if mode == DsMode::Local {
        util::remove_if_exists(paths.no_net_marker()).await?;
        init.purge_cache().await?;
        let cfg = init.cfg().await?;
        if config::get_bool(&cfg, "manual_cache_clean", false) {
            debug!("manual cache clean set from config");
            Existing::Trust
        } else if paths.instance_link().join("manual-clean").exists() {
            debug!("manual cache clean found from marker");
            Existing::Trust
        } else {
            Existing::Check
        }
    } else {
        Existing::Trust
    };

    match init.fetch(existing).await {
        Ok(ds) => {
            if mode == DsMode::Net && ds.dsmode() != mode {
                debug!("[{}] Exiting. datasource {} in local mode", mode, ds.description());
                return Ok((None, Vec::new()));
            }
        }
        Err(e) if e.is_not_found() => {
            if mode == DsMode::Local {
                debug!("No local datasource found");
            } else {
                error!("No instance datasource found! Likely bad things to come!");
            }
            if !opts.force {
                if let Err(e) = init.apply_network_config(false).await {
                    warn!("Failed applying network config: {}", e);
                }
                debug!("[{}] Exiting without datasource", mode);
                let errors = match mode {
                    DsMode::Local => Vec::new(),
                    _ => vec!["No instance datasource found.".to_string()],
                };
                return Ok((None, errors));
            }
            debug!("[{}] barreling on in force mode without datasource", mode);
        }
        Err(e) => return Err(e),
    }

    if init.datasource().is_some() {
        let materialized = init.instancify().await?;
        debug!(
            "[{}] will now be targeting instance id: {}. new={}",
            mode,
            materialized.instance_id,
            materialized.is_new_instance()
        );
    }

    if mode == DsMode::Local {
        init.maybe_set_hostname("local", "network").await;
    }

    if let Err(e) = init.apply_network_config(mode == DsMode::Net).await {
        warn!("Failed applying network config: {}", e);
    }

    let datasource = init.datasource();
    if mode == DsMode::Local {
        match &datasource {
            Some(ds) if ds.dsmode() != mode => {
                debug!("[{}] Exiting. datasource {} not in local mode.", mode, ds.description());
                return Ok((datasource, Vec::new()));
            }
            Some(ds) => {
                debug!(
                    "[{}] {} is in local mode, will apply init modules now.",
                    mode,
                    ds.description()
                );
                // the network stage has nothing left to do this boot
                if let Err(e) = init.write_no_net_marker().await {
                    warn!("Failed writing {}: {}", paths.no_net_marker().display(), e);
                }
            }
            None => return Ok((None, Vec::new())),
        }
    }

    if let Err(e) = init.update().await {
        error!("Consuming user data failed! {}", e);
        return Ok((datasource, vec!["Consuming user data failed!".to_string()]));
    }
    init.maybe_set_hostname("init-net", "modules:config").await;

    if let Err(e) = consume(&mut init).await {
        error!("Consuming user data failed! {}", e);
        return Ok((datasource, vec!["Consuming user data failed!".to_string()]));
    }

    let runner = Modules::new(init.cloudify().await?, opts.modules.clone());
    let outcome = run_module_section(&runner, ModulesMode::Init).await;
    Ok((datasource, outcome))
}

/// Per-instance consumption, or only the always-run parts when that
/// already happened for this instance
async fn consume(init: &mut Init) -> Result<(), CloudInitError> {
    if init.instance_id().is_none() {
        debug!("No instance to consume data for");
        return Ok(());
    }
    let semaphores = init.semaphores();
    let (ran, _) = semaphores
        .run_once(
            "consume_data",
            Frequency::PerInstance,
            init.consume_data(Frequency::PerInstance),
        )
        .await?;
    if !ran {
        init.consume_data(Frequency::PerAlways).await?;
    }
    Ok(())
}

async fn run_module_section(runner: &Modules, mode: ModulesMode) -> Vec<String> {
    let section = mode.section();
    let outcome = runner.run_section(&section).await;
    if outcome.which_ran.is_empty() && outcome.failures.is_empty() {
        debug!("No '{}' modules to run under section '{}'", mode, section);
        return Vec::new();
    }
    outcome.error_strings()
}

/// Fetch the cached datasource for `modules` and `single`
///
/// The inner `Err` carries the message to report when no datasource was
/// found and `force` is not set.
async fn trusted_init(
    paths: &CloudPaths,
    opts: &StageOptions,
    what: &str,
) -> Result<Result<Init, String>, CloudInitError> {
    let mut init = Init::new(paths.clone(), Vec::new())
        .await?
        .with_registry(opts.datasources.clone())
        .with_files(opts.files.clone());

    match init.fetch(Existing::Trust).await {
        Ok(_) => Ok(Ok(init)),
        Err(e) if e.is_not_found() => {
            let msg = format!(
                "Can not apply stage {}, no datasource found! Likely bad things to come!",
                what
            );
            error!("{}", msg);
            if opts.force {
                Ok(Ok(init))
            } else {
                Ok(Err(msg))
            }
        }
        Err(e) => Err(e),
    }
}

/// Run `modules --mode <mode>`
pub async fn main_modules(
    paths: &CloudPaths,
    mode: ModulesMode,
    opts: &StageOptions,
) -> Result<Vec<String>, CloudInitError> {
    let mut init = match trusted_init(paths, opts, &mode.to_string()).await? {
        Ok(init) => init,
        Err(msg) => return Ok(vec![msg]),
    };

    if mode == ModulesMode::Init {
        warn!("'modules --mode init' is deprecated; 'init' already runs the init modules");
    }
    let runner = Modules::new(init.cloudify().await?, opts.modules.clone());
    Ok(run_module_section(&runner, mode).await)
}

/// Run one module by name
pub async fn main_single(
    paths: &CloudPaths,
    name: &str,
    frequency: Option<Frequency>,
    args: Vec<String>,
    opts: &StageOptions,
) -> Result<Vec<String>, CloudInitError> {
    let mut init = match trusted_init(paths, opts, "single").await? {
        Ok(init) => init,
        Err(_) => {
            return Ok(vec![
                "Failed to fetch your datasource, likely bad things to come!".to_string(),
            ]);
        }
    };

    if let Some(freq) = frequency {
        debug!("Using passed in frequency {}", freq);
    }
    let runner = Modules::new(init.cloudify().await?, opts.modules.clone());
    let outcome = match runner.run_single(name, args, frequency).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Did not run {}, does it exist? ({})", name, e);
            return Ok(vec![format!("Did not run {}, does it exist?", name)]);
        }
    };

    if !outcome.failures.is_empty() {
        warn!("Ran {} but it failed!", name);
        return Ok(outcome.error_strings());
    }
    Ok(Vec::new())
}

/// Stage result recorded in status.json
#[derive(Debug, Default)]
pub struct StageReport {
    pub datasource: Option<String>,
    pub errors: Vec<String>,
}

impl From<InitOutcome> for StageReport {
    fn from((datasource, errors): InitOutcome) -> Self {
        Self {
            datasource: datasource.map(|ds| ds.description()),
            errors,
        }
    }
}

impl From<Vec<String>> for StageReport {
    fn from(errors: Vec<String>) -> Self {
        Self {
            datasource: None,
            errors,
        }
    }
}

/// Record start, finish and errors of `stage` around `work`
///
/// `init-local` starts a new boot and clears the previous status and
/// result. `modules-final` also writes result.json. Returns the number of
/// errors the stage produced; an `Err` from `work` counts as one.
pub async fn status_wrapper<F, R>(
    paths: &CloudPaths,
    stage: &str,
    work: F,
) -> Result<usize, CloudInitError>
where
    F: Future<Output = Result<R, CloudInitError>>,
    R: Into<StageReport>,
{
    let state = InstanceState::new(paths.clone());

    let mut status = if stage == "init-local" {
        for path in [
            paths.status_link(),
            paths.result_link(),
            paths.status_file(),
            paths.result_file(),
        ] {
            util::remove_if_exists(path).await?;
        }
        CloudInitStatus::default()
    } else {
        match state.read_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Unreadable status file, starting fresh: {}", e);
                CloudInitStatus::default()
            }
        }
    };

    status.stage = Some(stage.to_string());
    status.stages.insert(
        stage.to_string(),
        StageStatus {
            start: Some(util::epoch_seconds()),
            ..Default::default()
        },
    );
    state.update_status(&status).await?;

    let errors = match work.await {
        Ok(report) => {
            let report = report.into();
            if report.datasource.is_some() {
                status.datasource = report.datasource;
            }
            report.errors
        }
        Err(e) => {
            error!("failed stage {}: {}", stage, e);
            vec![e.to_string()]
        }
    };

    if let Some(entry) = status.stages.get_mut(stage) {
        entry.errors = errors.clone();
        entry.finished = Some(util::epoch_seconds());
    }
    status.stage = None;
    state.update_status(&status).await?;

    if stage == "modules-final" {
        let result = CloudInitResult {
            datasource: status.datasource.clone(),
            errors: status.errors(),
        };
        state.write_result(&result).await?;
    }

    Ok(errors.len())
}
