//! Script directory modules
//!
//! Each module runs the executable files of one directory in lexical order.
//! A failing script does not stop the rest; the module fails afterwards
//! with a count.

use super::{ALL_DISTROS, Module, ModuleMeta};
use crate::{CloudInitError, cloud::Cloud, state::Frequency};
use async_trait::async_trait;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Run every executable regular file in `dir`, sorted by name
///
/// A missing directory runs nothing. Returns the number of scripts run.
pub async fn run_parts(dir: &Path, instance_id: Option<&str>) -> Result<usize, CloudInitError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No scripts directory {}", dir.display());
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let mut scripts: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() && is_executable(&metadata) {
            scripts.push(entry.path());
        }
    }
    scripts.sort();

    let mut failed = Vec::new();
    for script in &scripts {
        debug!("Running script {}", script.display());
        let mut cmd = Command::new(script);
        if let Some(iid) = instance_id {
            cmd.env("INSTANCE_ID", iid);
        }
        match cmd.output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                warn!(
                    "Script {} exited with {}: {}",
                    script.display(),
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                failed.push(script.clone());
            }
            Err(e) => {
                warn!("Failed to execute {}: {}", script.display(), e);
                failed.push(script.clone());
            }
        }
    }

    if !failed.is_empty() {
        return Err(CloudInitError::Command(format!(
            "Ran {} scripts but {} failed",
            scripts.len(),
            failed.len()
        )));
    }
    Ok(scripts.len())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

async fn run_dir_for(name: &str, dir: PathBuf, cloud: &Cloud) -> Result<(), CloudInitError> {
    let count = run_parts(&dir, cloud.instance_id())
        .await
        .map_err(|e| CloudInitError::module(name, e.to_string()))?;
    if count > 0 {
        info!("{} ran {} scripts from {}", name, count, dir.display());
    }
    Ok(())
}

macro_rules! scripts_module {
    ($ty:ident, $id:literal, $freq:expr, |$cloud:ident| $dir:expr) => {
        pub struct $ty;

        #[async_trait]
        impl Module for $ty {
            fn meta(&self) -> ModuleMeta {
                ModuleMeta {
                    id: $id,
                    frequency: $freq,
                    distros: &[ALL_DISTROS],
                    activate_by_schema_keys: &[],
                }
            }

            async fn handle(
                &self,
                name: &str,
                _cfg: &Value,
                $cloud: &Cloud,
                _args: &[String],
            ) -> Result<(), CloudInitError> {
                let Some(dir) = $dir else {
                    debug!("Skipping module named {}, no instance", name);
                    return Ok(());
                };
                run_dir_for(name, dir, $cloud).await
            }
        }
    };
}

scripts_module!(ScriptsPerOnce, "scripts_per_once", Frequency::PerOnce, |cloud| Some(
    cloud.paths().scripts_per_once()
));
scripts_module!(ScriptsPerBoot, "scripts_per_boot", Frequency::PerAlways, |cloud| Some(
    cloud.paths().scripts_per_boot()
));
scripts_module!(
    ScriptsPerInstance,
    "scripts_per_instance",
    Frequency::PerInstance,
    |cloud| Some(cloud.paths().scripts_per_instance())
);
scripts_module!(ScriptsUser, "scripts_user", Frequency::PerInstance, |cloud| cloud
    .instance_id()
    .map(|iid| cloud.paths().instance_scripts_dir(iid)));
scripts_module!(ScriptsVendor, "scripts_vendor", Frequency::PerInstance, |cloud| cloud
    .instance_id()
    .map(|iid| cloud.paths().vendor_scripts_dir(iid)));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{datasources::mock::MockDatasource, distro::Distro, state::CloudPaths};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str, mode: u32) {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[tokio::test]
    async fn test_run_parts_order_and_filter() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("scripts");
        let log = temp.path().join("log");
        let append = |tag: &str| format!("#!/bin/sh\necho {} >> {}\n", tag, log.display());

        script(&dir, "20-second", &append("second"), 0o755);
        script(&dir, "10-first", &append("first"), 0o755);
        script(&dir, "30-skipped", &append("skipped"), 0o644);
        std::fs::create_dir_all(dir.join("vendor")).unwrap();

        assert_eq!(run_parts(&dir, None).await.unwrap(), 2);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_run_parts_keeps_going_after_failure() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("scripts");
        let marker = temp.path().join("ran");

        script(&dir, "a", "#!/bin/sh\nexit 1\n", 0o755);
        script(&dir, "b", &format!("#!/bin/sh\ntouch {}\n", marker.display()), 0o755);

        let err = run_parts(&dir, None).await.unwrap_err();
        assert!(err.to_string().contains("Ran 2 scripts but 1 failed"));
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_missing_dir_runs_nothing() {
        let temp = TempDir::new().unwrap();
        assert_eq!(run_parts(&temp.path().join("nope"), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scripts_user_uses_instance_dir() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_root(temp.path());
        let out = temp.path().join("out");
        script(
            &paths.instance_scripts_dir("i-5"),
            "runcmd",
            &format!("#!/bin/sh\necho $INSTANCE_ID > {}\n", out.display()),
            0o700,
        );
        let ds = MockDatasource::new().with_metadata(serde_json::json!({"instance-id": "i-5"}));
        let cloud = Cloud::new(
            paths.clone(),
            Distro::new("ubuntu", paths),
            Some(Arc::new(ds)),
            Value::Null,
        );

        ScriptsUser
            .handle("scripts_user", &Value::Null, &cloud, &[])
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "i-5\n");
    }
}
