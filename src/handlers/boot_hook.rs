//! Boot hook part handler
//!
//! `#cloud-boothook` parts run immediately while user-data is consumed, on
//! every boot, with `INSTANCE_ID` in their environment.

use super::{Part, PartHandler, PartOutcome, clean_filename, dos2unix};
use crate::{
    CloudInitError,
    state::{CloudPaths, Frequency},
    userdata::ContentType,
    util,
};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

pub struct BootHookPartHandler {
    boothook_dir: PathBuf,
    instance_id: String,
}

impl BootHookPartHandler {
    pub fn new(paths: &CloudPaths, instance_id: &str) -> Self {
        Self {
            boothook_dir: paths.boothooks_dir(instance_id),
            instance_id: instance_id.to_string(),
        }
    }

    /// Payload without the `#cloud-boothook` marker line
    fn script_body(payload: &[u8]) -> Vec<u8> {
        let payload = dos2unix(payload);
        let text = String::from_utf8_lossy(&payload);
        let prefix = ContentType::CloudBoothook.prefix();
        match text.strip_prefix(prefix) {
            Some(rest) => rest.trim_start().as_bytes().to_vec(),
            None => payload,
        }
    }
}

#[async_trait]
impl PartHandler for BootHookPartHandler {
    fn name(&self) -> String {
        "boot-hook".to_string()
    }

    fn list_types(&self) -> Vec<String> {
        vec![ContentType::CloudBoothook.mime_type().to_string()]
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

        let path = self.boothook_dir.join(clean_filename(part.filename));
        util::write_file(&path, Self::script_body(part.payload), 0o700).await?;

        debug!("Running boothook {}", path.display());
        match Command::new(&path)
            .env("INSTANCE_ID", &self.instance_id)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                "Boothooks script {} execution error: exit status {}: {}",
                path.display(),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!(
                "Boothooks unknown error when running {}: {}",
                path.display(),
                e
            ),
        }
        Ok(PartOutcome::Handled)
    }
}
