//! Shell script part handlers
//!
//! Scripts are only written here; the `scripts_*` modules run them later
//! in the final stage.

use super::{Part, PartHandler, PartOutcome, clean_filename, dos2unix};
use crate::{
    CloudInitError,
    state::{CloudPaths, Frequency},
    userdata::ContentType,
    util,
};
use async_trait::async_trait;
use std::path::PathBuf;

/// Writes `text/x-shellscript` parts into the instance scripts directory
pub struct ShellScriptPartHandler {
    script_dir: PathBuf,
}

impl ShellScriptPartHandler {
    pub fn new(paths: &CloudPaths, instance_id: &str, vendor: bool) -> Self {
        let script_dir = if vendor {
            paths.vendor_scripts_dir(instance_id)
        } else {
            paths.instance_scripts_dir(instance_id)
        };
        Self { script_dir }
    }
}

#[async_trait]
impl PartHandler for ShellScriptPartHandler {
    fn name(&self) -> String {
        "shell-script".to_string()
    }

    fn list_types(&self) -> Vec<String> {
        vec![ContentType::ShellScript.mime_type().to_string()]
    }

    fn frequency(&self) -> Frequency {
        Frequency::PerAlways
    }

    fn handler_version(&self) -> u8 {
        2
    }

    async fn handle_part(&mut self, part: &Part<'_>) -> Result<PartOutcome, CloudInitError> {
        if part.is_signal() {
            return Ok(PartOutcome::Handled);
        }
        let path = self.script_dir.join(clean_filename(part.filename));
        util::write_file(&path, dos2unix(part.payload), 0o700).await?;
        Ok(PartOutcome::Handled)
    }
}

/// Writes `text/x-shellscript-per-{boot,instance,once}` parts into the
/// matching global `scripts/per-*` directory
pub struct ShellScriptByFreqPartHandler {
    frequency: Frequency,
    script_dir: PathBuf,
}

impl ShellScriptByFreqPartHandler {
    pub fn new(paths: &CloudPaths, script_frequency: Frequency) -> Self {
        let script_dir = match script_frequency {
            Frequency::PerAlways => paths.scripts_per_boot(),
            Frequency::PerInstance => paths.scripts_per_instance(),
            Frequency::PerOnce => paths.scripts_per_once(),
        };
        Self {
            frequency: script_frequency,
            script_dir,
        }
    }

    fn content_type(&self) -> &'static str {
        match self.frequency {
            Frequency::PerAlways => "text/x-shellscript-per-boot",
            Frequency::PerInstance => "text/x-shellscript-per-instance",
            Frequency::PerOnce => "text/x-shellscript-per-once",
        }
    }
}

#[async_trait]
impl PartHandler for ShellScriptByFreqPartHandler {
    fn name(&self) -> String {
        format!("shell-script-by-frequency ({})", self.frequency)
    }

    fn list_types(&self) -> Vec<String> {
        vec![self.content_type().to_string()]
    }

    fn frequency(&self) -> Frequency {
        Frequency::PerAlways
    }

    fn handler_version(&self) -> u8 {
        2
    }

    async fn handle_part(&mut self, part: &Part<'_>) -> Result<PartOutcome, CloudInitError> {
        if part.is_signal() {
            return Ok(PartOutcome::Handled);
        }
        let path = self.script_dir.join(clean_filename(part.filename));
        util::write_file(&path, dos2unix(part.payload), 0o700).await?;
        Ok(PartOutcome::Handled)
    }
}
