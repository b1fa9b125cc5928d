//! Runcmd module - turn `runcmd` into a script for the final stage
//!
//! Nothing runs here: the commands are written to the instance's
//! `scripts/runcmd` and executed later by `scripts_user`.

use super::{ALL_DISTROS, Module, ModuleMeta};
use crate::config::RunCmd;
use crate::{CloudInitError, cloud::Cloud, state::Frequency, util};
use async_trait::async_trait;
use serde_yaml::Value;
use tracing::{debug, info};

pub struct Runcmd;

/// Render commands as a POSIX shell script
pub fn shellify(commands: &[RunCmd]) -> String {
    let mut script = String::from("#!/bin/sh\n");
    for cmd in commands {
        script.push_str(&cmd.to_shell_line());
        script.push('\n');
    }
    script
}

/// Parse a `runcmd`/`bootcmd` list, rejecting anything else
pub fn parse_commands(module: &str, value: &Value) -> Result<Vec<RunCmd>, CloudInitError> {
    serde_yaml::from_value(value.clone()).map_err(|e| {
        CloudInitError::module(module, format!("expected a list of commands: {}", e))
    })
}

#[async_trait]
impl Module for Runcmd {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            id: "runcmd",
            frequency: Frequency::PerInstance,
            distros: &[ALL_DISTROS],
            activate_by_schema_keys: &["runcmd"],
        }
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &Cloud,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        let Some(value) = cfg.get("runcmd") else {
            debug!("Skipping module named {}, no 'runcmd' key in configuration", name);
            return Ok(());
        };
        let Some(iid) = cloud.instance_id() else {
            return Err(CloudInitError::module(name, "no instance to write runcmd for"));
        };

        let commands = parse_commands(name, value)?;
        let path = cloud.paths().instance_scripts_dir(iid).join("runcmd");
        util::write_file(&path, shellify(&commands), 0o700).await?;
        info!("Wrote {} runcmd commands to {}", commands.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellify() {
        let commands: Vec<RunCmd> =
            serde_yaml::from_str("- echo hi\n- [ls, -l, /my dir]\n").unwrap();
        assert_eq!(shellify(&commands), "#!/bin/sh\necho hi\nls -l '/my dir'\n");
    }

    #[test]
    fn test_parse_commands_rejects_mapping() {
        let value: Value = serde_yaml::from_str("{a: b}").unwrap();
        assert!(parse_commands("runcmd", &value).is_err());
    }
}
