//! Cloud-config part handler
//!
//! Accumulates every `#cloud-config` and `#cloud-config-jsonp` part of a
//! walk into one document and writes it when the walk ends.

use super::{Part, PartHandler, PartOutcome};
use crate::{
    CloudInitError,
    config::{
        self, jsonp,
        merge::{self, Merger, MergerSpec},
    },
    state::{CloudPaths, Frequency},
    userdata::{
        ContentType,
        types::{CONTENT_END, CONTENT_START},
    },
    util,
};
use async_trait::async_trait;
use serde_yaml::Value;
use std::path::PathBuf;
use tracing::debug;

/// Header naming the merger chain for a part
pub const MERGE_HEADER: &str = "Merge-Type";

pub struct CloudConfigPartHandler {
    path: PathBuf,
    buffer: Option<Value>,
    file_names: Vec<String>,
}

impl CloudConfigPartHandler {
    pub fn new(paths: &CloudPaths, instance_id: &str, vendor: bool) -> Self {
        let path = if vendor {
            paths.vendor_cloud_config(instance_id)
        } else {
            paths.cloud_config(instance_id)
        };
        Self::with_path(path)
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            buffer: None,
            file_names: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.buffer = None;
        self.file_names.clear();
    }

    fn render(&self) -> Result<String, CloudInitError> {
        let Some(buffer) = &self.buffer else {
            return Ok(String::new());
        };

        let mut lines = vec![config::CLOUD_CONFIG_HEADER.to_string(), String::new()];
        if !self.file_names.is_empty() {
            lines.push(format!("# from {} files", self.file_names.len()));
            for name in &self.file_names {
                let name = if name.is_empty() { "?" } else { name };
                lines.push(format!("# {}", name));
            }
            lines.push(String::new());
        }
        lines.push(serde_yaml::to_string(buffer)?);
        Ok(lines.join("\n"))
    }

    async fn write(&self) -> Result<(), CloudInitError> {
        util::write_file(&self.path, self.render()?, 0o600).await
    }

    /// Merger chain from the payload's `merge_how` and the part headers
    fn extract_mergers(
        payload: &mut Value,
        header: Option<&str>,
    ) -> Result<Vec<MergerSpec>, CloudInitError> {
        let mut specs = match payload {
            Value::Mapping(map) => merge::extract_mergers(map)?,
            _ => Vec::new(),
        };
        if let Some(header) = header.filter(|h| !h.trim().is_empty()) {
            specs.extend(merge::parse_merge_how(header)?);
        }
        if specs.is_empty() {
            specs = merge::parse_merge_how(merge::DEFAULT_PART_MERGE)?;
        }
        Ok(specs)
    }

    fn merge_part(&self, part: &Part<'_>, buffer: &Value) -> Result<Value, CloudInitError> {
        let mut payload = config::parse_cloud_config(&part.text())?;
        let header = part.headers.and_then(|h| {
            h.get(MERGE_HEADER)
                .or_else(|| h.get(&format!("X-{}", MERGE_HEADER)))
        });
        let specs = Self::extract_mergers(&mut payload, header)?;
        debug!("Merging by applying {:?}", specs);
        Ok(Merger::construct(&specs)?.merge(buffer, &payload))
    }

    fn merge_patch(part: &Part<'_>, buffer: &Value) -> Result<Value, CloudInitError> {
        let ops = jsonp::parse_patch(&part.text())?;
        debug!("Merging by applying json patch {:?}", ops);
        let mut doc = serde_json::to_value(buffer)?;
        jsonp::apply_patch(&mut doc, &ops)?;
        Ok(serde_yaml::to_value(doc)?)
    }
}

#[async_trait]
impl PartHandler for CloudConfigPartHandler {
    fn name(&self) -> String {
        "cloud-config".to_string()
    }

    fn list_types(&self) -> Vec<String> {
        vec![
            ContentType::CloudConfig.mime_type().to_string(),
            ContentType::CloudConfigJsonp.mime_type().to_string(),
        ]
    }

    fn frequency(&self) -> Frequency {
        Frequency::PerAlways
    }

    fn handler_version(&self) -> u8 {
        3
    }

    async fn handle_part(&mut self, part: &Part<'_>) -> Result<PartOutcome, CloudInitError> {
        match part.content_type {
            CONTENT_START => {
                self.reset();
                return Ok(PartOutcome::Handled);
            }
            CONTENT_END => {
                let written = self.write().await;
                self.reset();
                written?;
                return Ok(PartOutcome::Handled);
            }
            _ => {}
        }

        // The first part merges into an empty document
        let buffer = match (&self.buffer, self.file_names.is_empty()) {
            (Some(buffer), false) => buffer.clone(),
            _ => Value::Mapping(Default::default()),
        };

        let merged = if part.content_type == ContentType::CloudConfigJsonp.mime_type() {
            Self::merge_patch(part, &buffer)
        } else {
            self.merge_part(part, &buffer)
        }
        .map_err(|e| {
            CloudInitError::handler(
                self.name(),
                format!("Failed at merging in cloud config part from {}: {}", part.filename, e),
            )
        })?;

        self.buffer = Some(merged);
        self.file_names
            .push(part.filename.replace(['\n', '\r', '\t'], " ").trim().to_string());
        Ok(PartOutcome::Handled)
    }
}
