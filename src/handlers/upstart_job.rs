//! Upstart job part handler

use super::{Part, PartHandler, PartOutcome, clean_filename, dos2unix};
use crate::{
    CloudInitError,
    state::{CloudPaths, Frequency},
    userdata::ContentType,
    util,
};
use async_trait::async_trait;
use std::path::PathBuf;

/// Installs `#upstart-job` parts as `/etc/init/<name>.conf`, once per instance
pub struct UpstartJobPartHandler {
    upstart_dir: PathBuf,
}

impl UpstartJobPartHandler {
    pub fn new(paths: &CloudPaths) -> Self {
        Self {
            upstart_dir: paths.target("/etc/init"),
        }
    }
}

#[async_trait]
impl PartHandler for UpstartJobPartHandler {
    fn name(&self) -> String {
        "upstart-job".to_string()
    }

    fn list_types(&self) -> Vec<String> {
        vec![ContentType::UpstartJob.mime_type().to_string()]
    }

    fn handler_version(&self) -> u8 {
        2
    }

    async fn handle_part(&mut self, part: &Part<'_>) -> Result<PartOutcome, CloudInitError> {
        if part.is_signal() || part.frequency != Some(Frequency::PerInstance) {
            return Ok(PartOutcome::Handled);
        }

        let mut filename = clean_filename(part.filename);
        if !filename.to_lowercase().ends_with(".conf") {
            filename.push_str(".conf");
        }
        util::write_file(self.upstart_dir.join(filename), dos2unix(part.payload), 0o644).await?;
        Ok(PartOutcome::Handled)
    }
}
