//! Bootcmd module - execute early boot commands
//!
//! These commands run very early in the boot process, on every boot, before
//! most other modules. Unlike runcmd a failure here fails the module.

use super::runcmd::{parse_commands, shellify};
use super::{ALL_DISTROS, Module, ModuleMeta};
use crate::{CloudInitError, cloud::Cloud, state::Frequency, util};
use async_trait::async_trait;
use serde_yaml::Value;
use tokio::process::Command;
use tracing::{debug, info};

pub struct Bootcmd;

#[async_trait]
impl Module for Bootcmd {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            id: "bootcmd",
            frequency: Frequency::PerAlways,
            distros: &[ALL_DISTROS],
            activate_by_schema_keys: &["bootcmd"],
        }
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &Cloud,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        let Some(value) = cfg.get("bootcmd") else {
            debug!("Skipping module named {}, no 'bootcmd' key in configuration", name);
            return Ok(());
        };
        let commands = parse_commands(name, value)?;
        if commands.is_empty() {
            return Ok(());
        }

        info!("Executing {} bootcmd commands", commands.len());
        let script = cloud.paths().run_dir.join("bootcmd.sh");
        util::write_file(&script, shellify(&commands), 0o700).await?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg(&script);
        if let Some(iid) = cloud.instance_id() {
            cmd.env("INSTANCE_ID", iid);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| CloudInitError::Command(e.to_string()))?;

        if !output.stdout.is_empty() {
            debug!("bootcmd stdout: {}", String::from_utf8_lossy(&output.stdout));
        }
        if !output.status.success() {
            return Err(CloudInitError::module(
                name,
                format!(
                    "bootcmd exited with status {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}
