//! Standard cloud-init paths
//!
//! Defines the directory structure used for persisted state. Everything that
//! survives across the `init --local`, `init` and `modules` invocations of a
//! boot lives under one of these roots.

use std::path::{Component, Path, PathBuf};

/// Base directory for cloud-init state
pub const CLOUD_DIR: &str = "/var/lib/cloud";

/// Cloud configuration directory
pub const CONFIG_DIR: &str = "/etc/cloud";

/// Per-boot runtime directory (tmpfs)
pub const RUN_DIR: &str = "/run/cloud-init";

/// Kernel command line
pub const PROC_CMDLINE: &str = "/proc/cmdline";

/// Standard cloud-init paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudPaths {
    /// Persistent state directory (default: /var/lib/cloud)
    pub cloud_dir: PathBuf,
    /// Config directory (default: /etc/cloud)
    pub config_dir: PathBuf,
    /// Runtime directory, cleared every boot (default: /run/cloud-init)
    pub run_dir: PathBuf,
    /// Root of the system being configured (default: /)
    pub root: PathBuf,
    /// Kernel command line file
    pub proc_cmdline: PathBuf,
}

impl Default for CloudPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudPaths {
    /// Create with default paths
    pub fn new() -> Self {
        Self {
            cloud_dir: PathBuf::from(CLOUD_DIR),
            config_dir: PathBuf::from(CONFIG_DIR),
            run_dir: PathBuf::from(RUN_DIR),
            root: PathBuf::from("/"),
            proc_cmdline: PathBuf::from(PROC_CMDLINE),
        }
    }

    /// Root every path under `base` (useful for testing)
    ///
    /// Produces `base/var/lib/cloud`, `base/etc/cloud`, `base/run/cloud-init`,
    /// a target root of `base` and a command line at `base/proc/cmdline`.
    pub fn with_root(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            cloud_dir: base.join("var/lib/cloud"),
            config_dir: base.join("etc/cloud"),
            run_dir: base.join("run/cloud-init"),
            root: base.to_path_buf(),
            proc_cmdline: base.join("proc/cmdline"),
        }
    }

    /// Override the state directories from `system_info.paths`
    pub fn with_overrides(mut self, cloud_dir: Option<&str>, run_dir: Option<&str>) -> Self {
        if let Some(dir) = cloud_dir {
            self.cloud_dir = PathBuf::from(dir);
        }
        if let Some(dir) = run_dir {
            self.run_dir = PathBuf::from(dir);
        }
        self
    }

    /// Map an absolute system path (e.g. `/etc/hostname`) under the target root
    pub fn target(&self, path: impl AsRef<Path>) -> PathBuf {
        let relative: PathBuf = path
            .as_ref()
            .components()
            .filter(|c| matches!(c, Component::Normal(_) | Component::CurDir))
            .collect();
        self.root.join(relative)
    }

    // ==================== Base Directories ====================

    /// /var/lib/cloud/data - Cached data directory
    pub fn data_dir(&self) -> PathBuf {
        self.cloud_dir.join("data")
    }

    /// /var/lib/cloud/instances - All instances directory
    pub fn instances_dir(&self) -> PathBuf {
        self.cloud_dir.join("instances")
    }

    /// /var/lib/cloud/instance - Symlink to current instance
    pub fn instance_link(&self) -> PathBuf {
        self.cloud_dir.join("instance")
    }

    /// /var/lib/cloud/scripts - Scripts directory
    pub fn scripts_dir(&self) -> PathBuf {
        self.cloud_dir.join("scripts")
    }

    /// /var/lib/cloud/seed - Seed data directory
    pub fn seed_dir(&self) -> PathBuf {
        self.cloud_dir.join("seed")
    }

    /// /var/lib/cloud/sem - Global (once) semaphores
    pub fn global_sem_dir(&self) -> PathBuf {
        self.cloud_dir.join("sem")
    }

    /// /var/lib/cloud/handlers - Global part handler directory
    pub fn handlers_dir(&self) -> PathBuf {
        self.cloud_dir.join("handlers")
    }

    // ==================== Instance-specific Paths ====================

    /// /var/lib/cloud/instances/<id> - Instance directory
    ///
    /// Path separators in the id are replaced so an id can never escape
    /// the instances directory.
    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.instances_dir().join(path_safe_iid(instance_id))
    }

    /// /var/lib/cloud/instances/<id>/sem - Semaphore directory
    pub fn sem_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("sem")
    }

    pub fn instance_handlers_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("handlers")
    }

    /// /var/lib/cloud/instances/<id>/scripts - User-data scripts
    pub fn instance_scripts_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("scripts")
    }

    /// /var/lib/cloud/instances/<id>/scripts/vendor - Vendor-data scripts
    pub fn vendor_scripts_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_scripts_dir(instance_id).join("vendor")
    }

    pub fn boothooks_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("boothooks")
    }

    /// /var/lib/cloud/instances/<id>/data/urlcache - `#include-once` markers
    pub fn urlcache_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("data").join("urlcache")
    }

    /// /var/lib/cloud/instances/<id>/boot-finished - Boot completion marker
    pub fn boot_finished(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("boot-finished")
    }

    /// /var/lib/cloud/instances/<id>/obj.json - Cached datasource snapshot
    pub fn datasource_cache(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("obj.json")
    }

    /// /var/lib/cloud/instances/<id>/cloud-config.txt - Merged user cloud-config
    pub fn cloud_config(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("cloud-config.txt")
    }

    /// /var/lib/cloud/instances/<id>/vendor-cloud-config.txt - Merged vendor cloud-config
    pub fn vendor_cloud_config(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id)
            .join("vendor-cloud-config.txt")
    }

    /// /var/lib/cloud/instances/<id>/user-data.txt - Raw user-data
    pub fn user_data_raw(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("user-data.txt")
    }

    /// /var/lib/cloud/instances/<id>/user-data.txt.i - Processed user-data
    pub fn user_data(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("user-data.txt.i")
    }

    /// /var/lib/cloud/instances/<id>/vendor-data.txt - Raw vendor-data
    pub fn vendor_data_raw(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("vendor-data.txt")
    }

    pub fn vendor_data(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("vendor-data.txt.i")
    }

    /// /var/lib/cloud/instances/<id>/datasource - Datasource identifier
    pub fn datasource_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("datasource")
    }

    // ==================== Scripts Directories ====================

    /// /var/lib/cloud/scripts/per-boot - Scripts run every boot
    pub fn scripts_per_boot(&self) -> PathBuf {
        self.scripts_dir().join("per-boot")
    }

    /// /var/lib/cloud/scripts/per-instance - Scripts run once per instance
    pub fn scripts_per_instance(&self) -> PathBuf {
        self.scripts_dir().join("per-instance")
    }

    /// /var/lib/cloud/scripts/per-once - Scripts run once ever
    pub fn scripts_per_once(&self) -> PathBuf {
        self.scripts_dir().join("per-once")
    }

    // ==================== Config Paths ====================

    /// /etc/cloud/cloud.cfg - Main config file
    pub fn main_config(&self) -> PathBuf {
        self.config_dir.join("cloud.cfg")
    }

    /// /etc/cloud/cloud.cfg.d - Config drop-in directory
    pub fn config_d(&self) -> PathBuf {
        self.config_dir.join("cloud.cfg.d")
    }

    // ==================== Data Paths ====================

    /// /var/lib/cloud/data/instance-id - Cached instance ID
    pub fn cached_instance_id(&self) -> PathBuf {
        self.data_dir().join("instance-id")
    }

    /// /var/lib/cloud/data/previous-instance-id - Previous instance ID
    pub fn previous_instance_id(&self) -> PathBuf {
        self.data_dir().join("previous-instance-id")
    }

    pub fn previous_datasource(&self) -> PathBuf {
        self.data_dir().join("previous-datasource")
    }

    /// /var/lib/cloud/data/set-hostname - Last hostname applied
    pub fn set_hostname_file(&self) -> PathBuf {
        self.data_dir().join("set-hostname")
    }

    /// /var/lib/cloud/data/no-net - Stop-file for network-mode init
    pub fn no_net_marker(&self) -> PathBuf {
        self.data_dir().join("no-net")
    }

    /// /var/lib/cloud/data/upgraded-network - Network config permanently disabled
    pub fn upgraded_network_marker(&self) -> PathBuf {
        self.data_dir().join("upgraded-network")
    }

    /// /var/lib/cloud/data/result.json - Execution result
    pub fn result_file(&self) -> PathBuf {
        self.data_dir().join("result.json")
    }

    /// /var/lib/cloud/data/status.json - Current status
    pub fn status_file(&self) -> PathBuf {
        self.data_dir().join("status.json")
    }

    // ==================== Runtime Paths ====================

    /// /run/cloud-init/instance-id - Instance id seen this boot
    pub fn run_instance_id(&self) -> PathBuf {
        self.run_dir.join("instance-id")
    }

    /// /run/cloud-init/cloud.cfg - Runtime config written by early boot tooling
    pub fn runtime_config(&self) -> PathBuf {
        self.run_dir.join("cloud.cfg")
    }

    /// /run/cloud-init/instance-data.json - Redacted instance data
    pub fn instance_data(&self) -> PathBuf {
        self.run_dir.join("instance-data.json")
    }

    /// /run/cloud-init/instance-data-sensitive.json - Root-only instance data
    pub fn instance_data_sensitive(&self) -> PathBuf {
        self.run_dir.join("instance-data-sensitive.json")
    }

    pub fn network_config_json(&self) -> PathBuf {
        self.run_dir.join("network-config.json")
    }

    /// /run/cloud-init/sem - Per-boot semaphores
    pub fn run_sem_dir(&self) -> PathBuf {
        self.run_dir.join("sem")
    }

    pub fn status_link(&self) -> PathBuf {
        self.run_dir.join("status.json")
    }

    pub fn result_link(&self) -> PathBuf {
        self.run_dir.join("result.json")
    }
}

/// Replace path separators so an instance id is a single path component
pub fn path_safe_iid(instance_id: &str) -> String {
    instance_id.replace('/', "_")
}
