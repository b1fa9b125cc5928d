//! Instance state management
//!
//! Manages the /var/lib/cloud directory structure including:
//! - Instance materialization (symlink, per-instance directories)
//! - Current vs previous instance-id and datasource tracking
//! - Semaphore files for run-once control
//! - Status and result files

pub mod instance_data;
pub mod paths;
pub mod semaphore;

pub use paths::CloudPaths;
pub use semaphore::{Frequency, SemaphoreManager};

use crate::{CloudInitError, util};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Outcome of recording the resolved instance on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    pub instance_id: String,
    /// Instance id recorded by the previous boot, if any
    pub previous_instance_id: Option<String>,
}

impl Materialized {
    /// A first boot or a changed instance id
    pub fn is_new_instance(&self) -> bool {
        self.previous_instance_id.as_deref() != Some(self.instance_id.as_str())
    }
}

/// Instance state manager
#[derive(Debug, Clone)]
pub struct InstanceState {
    /// Cloud paths configuration
    paths: CloudPaths,
    /// Current instance ID (if known)
    instance_id: Option<String>,
}

impl InstanceState {
    pub fn new(paths: CloudPaths) -> Self {
        Self {
            paths,
            instance_id: None,
        }
    }

    /// Get the paths configuration
    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    /// Get the current instance ID
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Semaphores rooted at the current instance (if any) and the global dir
    pub fn semaphores(&self) -> SemaphoreManager {
        SemaphoreManager::new(
            self.instance_id.as_deref().map(|id| self.paths.sem_dir(id)),
            self.paths.global_sem_dir(),
        )
    }

    /// Create the base directory structure
    pub async fn initialize(&self) -> Result<(), CloudInitError> {
        info!("Initializing cloud-init state directories");

        for dir in [
            self.paths.data_dir(),
            self.paths.instances_dir(),
            self.paths.scripts_per_boot(),
            self.paths.scripts_per_instance(),
            self.paths.scripts_per_once(),
            self.paths.seed_dir(),
            self.paths.global_sem_dir(),
            self.paths.handlers_dir(),
            self.paths.run_dir.clone(),
        ] {
            fs::create_dir_all(&dir).await?;
        }

        debug!(
            "Created cloud-init directories under {}",
            self.paths.cloud_dir.display()
        );
        Ok(())
    }

    /// Adopt an instance id without touching disk (used when restoring a cached datasource)
    pub fn set_instance_id(&mut self, instance_id: &str) {
        self.instance_id = Some(instance_id.to_string());
    }

    /// Root per-instance state under `instance_id`
    ///
    /// Creates the instance directories, points the `instance` symlink at
    /// them, and records the datasource and instance id, keeping the
    /// previous values alongside.
    pub async fn materialize(
        &mut self,
        instance_id: &str,
        datasource_desc: &str,
    ) -> Result<Materialized, CloudInitError> {
        info!("Materializing instance {}", instance_id);

        let instance_dir = self.paths.instance_dir(instance_id);
        for dir in [
            instance_dir.clone(),
            self.paths.sem_dir(instance_id),
            self.paths.instance_handlers_dir(instance_id),
            self.paths.instance_scripts_dir(instance_id),
            self.paths.vendor_scripts_dir(instance_id),
            self.paths.boothooks_dir(instance_id),
            instance_dir.join("data"),
        ] {
            fs::create_dir_all(&dir).await?;
        }

        util::sym_link(&instance_dir, &self.paths.instance_link()).await?;

        // Datasource identity, current and previous
        let ds_file = self.paths.datasource_file(instance_id);
        if let Some(previous) = util::read_trimmed(&ds_file).await? {
            fs::write(self.paths.previous_datasource(), previous).await?;
        }
        fs::write(&ds_file, format!("{datasource_desc}\n")).await?;

        // Instance id, current and previous
        let previous_instance_id = util::read_trimmed(self.paths.cached_instance_id()).await?;
        if let Some(previous) = &previous_instance_id {
            fs::write(self.paths.previous_instance_id(), format!("{previous}\n")).await?;
        }
        fs::write(self.paths.cached_instance_id(), format!("{instance_id}\n")).await?;
        util::write_file(
            self.paths.run_instance_id(),
            format!("{instance_id}\n"),
            0o644,
        )
        .await?;

        self.instance_id = Some(instance_id.to_string());

        let materialized = Materialized {
            instance_id: instance_id.to_string(),
            previous_instance_id,
        };
        if materialized.is_new_instance() {
            info!("New instance detected: {}", instance_id);
        }
        Ok(materialized)
    }

    /// Instance id cached by the last boot (`data/instance-id`)
    pub async fn cached_instance_id(&self) -> Result<Option<String>, CloudInitError> {
        util::read_trimmed(self.paths.cached_instance_id()).await
    }

    /// Instance id seen earlier in this boot (`/run/cloud-init/instance-id`)
    pub async fn run_instance_id(&self) -> Result<Option<String>, CloudInitError> {
        util::read_trimmed(self.paths.run_instance_id()).await
    }

    /// Instance id before the current one was recorded
    pub async fn previous_instance_id(&self) -> Result<Option<String>, CloudInitError> {
        util::read_trimmed(self.paths.previous_instance_id()).await
    }

    /// Save raw user-data (root-only)
    pub async fn save_userdata_raw(&self, data: &[u8]) -> Result<(), CloudInitError> {
        self.save_instance_file(|p, id| p.user_data_raw(id), data).await
    }

    /// Save processed user-data (root-only)
    pub async fn save_userdata(&self, data: &[u8]) -> Result<(), CloudInitError> {
        self.save_instance_file(|p, id| p.user_data(id), data).await
    }

    pub async fn save_vendordata_raw(&self, data: &[u8]) -> Result<(), CloudInitError> {
        self.save_instance_file(|p, id| p.vendor_data_raw(id), data)
            .await
    }

    pub async fn save_vendordata(&self, data: &[u8]) -> Result<(), CloudInitError> {
        self.save_instance_file(|p, id| p.vendor_data(id), data).await
    }

    async fn save_instance_file(
        &self,
        path_for: impl Fn(&CloudPaths, &str) -> std::path::PathBuf,
        data: &[u8],
    ) -> Result<(), CloudInitError> {
        if let Some(id) = &self.instance_id {
            let path = path_for(&self.paths, id);
            util::write_file(&path, data, 0o600).await?;
            debug!("Saved {}", path.display());
        }
        Ok(())
    }

    /// Mark boot as finished
    pub async fn mark_boot_finished(&self) -> Result<(), CloudInitError> {
        if let Some(id) = &self.instance_id {
            let path = self.paths.boot_finished(id);
            fs::write(&path, format!("{}\n", util::epoch_seconds())).await?;
            info!("Boot finished marker created");
        }
        Ok(())
    }

    /// Check if boot has finished
    pub fn is_boot_finished(&self) -> bool {
        self.instance_id
            .as_deref()
            .is_some_and(|id| self.paths.boot_finished(id).exists())
    }

    /// Remove the boot-finished marker of whatever instance the link points at
    pub async fn purge_boot_finished(&self) -> Result<(), CloudInitError> {
        util::remove_if_exists(self.paths.instance_link().join("boot-finished")).await
    }

    /// Write status, keeping a link in the run directory
    pub async fn update_status(&self, status: &CloudInitStatus) -> Result<(), CloudInitError> {
        let path = self.paths.status_file();
        let json = serde_json::to_string_pretty(&StatusFile { v1: status.clone() })?;
        util::write_file(&path, json, 0o644).await?;
        util::sym_link(&path, &self.paths.status_link()).await?;
        Ok(())
    }

    /// Read current status
    pub async fn read_status(&self) -> Result<CloudInitStatus, CloudInitError> {
        match util::read_optional(self.paths.status_file()).await? {
            Some(content) => Ok(serde_json::from_slice::<StatusFile>(&content)?.v1),
            None => Ok(CloudInitStatus::default()),
        }
    }

    /// Write the final result, keeping a link in the run directory
    pub async fn write_result(&self, result: &CloudInitResult) -> Result<(), CloudInitError> {
        let path = self.paths.result_file();
        let json = serde_json::to_string_pretty(&ResultFile { v1: result.clone() })?;
        util::write_file(&path, json, 0o644).await?;
        util::sym_link(&path, &self.paths.result_link()).await?;
        Ok(())
    }

    /// Clean all cloud-init state (for testing or reset)
    pub async fn clean(&self, include_logs: bool) -> Result<(), CloudInitError> {
        info!("Cleaning cloud-init state");

        for dir in [
            self.paths.instances_dir(),
            self.paths.data_dir(),
            self.paths.global_sem_dir(),
            self.paths.handlers_dir(),
            self.paths.run_dir.clone(),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir).await?;
            }
        }

        let link = self.paths.instance_link();
        if link.exists() || link.is_symlink() {
            fs::remove_file(&link).await.ok();
        }

        if include_logs {
            for log in ["/var/log/cloud-init.log", "/var/log/cloud-init-output.log"] {
                let path = self.paths.target(Path::new(log));
                util::remove_if_exists(path).await?;
            }
        }

        info!("Cloud-init state cleaned");
        Ok(())
    }
}

/// Per-stage progress recorded in status.json
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub start: Option<f64>,
    pub finished: Option<f64>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Status of cloud-init execution across the boot stages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudInitStatus {
    /// Stage currently running, None when idle
    pub stage: Option<String>,
    /// Description of the resolved datasource
    pub datasource: Option<String>,
    /// Keyed by stage name (`init-local`, `init`, `modules-config`, `modules-final`)
    #[serde(flatten)]
    pub stages: BTreeMap<String, StageStatus>,
}

impl CloudInitStatus {
    /// All errors recorded by any stage
    pub fn errors(&self) -> Vec<String> {
        self.stages
            .values()
            .flat_map(|s| s.errors.iter().cloned())
            .collect()
    }

    /// Short human summary: running, done or error
    pub fn summary(&self) -> &'static str {
        if self.stage.is_some() {
            "running"
        } else if self.stages.is_empty() {
            "not-run"
        } else if self.stages.values().any(|s| !s.errors.is_empty()) {
            "error"
        } else {
            "done"
        }
    }
}

/// Contents of result.json, written when the final stage completes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudInitResult {
    pub datasource: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct StatusFile {
    v1: CloudInitStatus,
}

#[derive(Serialize, Deserialize)]
struct ResultFile {
    v1: CloudInitResult,
}
