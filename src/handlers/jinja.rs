//! Jinja template part handler
//!
//! Renders `## template: jinja` parts against the sensitive instance data
//! and hands the result to the handler for whatever type it renders to.

use super::{Part, PartHandler, PartOutcome};
use crate::{
    CloudInitError,
    state::{CloudPaths, Frequency},
    template,
    userdata::ContentType,
};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::warn;

pub struct JinjaTemplatePartHandler {
    instance_data_file: PathBuf,
}

impl JinjaTemplatePartHandler {
    pub fn new(paths: &CloudPaths) -> Self {
        Self {
            instance_data_file: paths.instance_data_sensitive(),
        }
    }
}

#[async_trait]
impl PartHandler for JinjaTemplatePartHandler {
    fn name(&self) -> String {
        "jinja-template".to_string()
    }

    fn list_types(&self) -> Vec<String> {
        vec![ContentType::Jinja.mime_type().to_string()]
    }

    fn frequency(&self) -> Frequency {
        Frequency::PerAlways
    }

    fn handler_version(&self) -> u8 {
        3
    }

    async fn handle_part(&mut self, part: &Part<'_>) -> Result<PartOutcome, CloudInitError> {
        if part.is_signal() {
            return Ok(PartOutcome::Handled);
        }

        let rendered = template::render_from_file(&part.text(), &self.instance_data_file).await?;
        if rendered.trim().is_empty() {
            return Ok(PartOutcome::Handled);
        }

        match ContentType::sniff(rendered.as_bytes()) {
            Some(subtype) => Ok(PartOutcome::Delegate {
                content_type: subtype.mime_type().to_string(),
                payload: rendered.into_bytes(),
            }),
            None => {
                warn!(
                    "Ignoring jinja template for {}. Could not find supported sub-handler for type None",
                    part.filename
                );
                Ok(PartOutcome::Handled)
            }
        }
    }
}
