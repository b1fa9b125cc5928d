//! Final message module
//!
//! Logs the rendered `final_message` and writes the instance's
//! `boot-finished` marker.

use super::{ALL_DISTROS, Module, ModuleMeta};
use crate::{CloudInitError, cloud::Cloud, config, state::Frequency, util};
use async_trait::async_trait;
use minijinja::{Environment, context};
use serde_yaml::Value;
use tracing::{info, warn};

const DEFAULT_MESSAGE: &str = "cloud-init v. {{version}} finished at {{timestamp}}. \
Datasource {{datasource}}.  Up {{uptime}} seconds";

pub struct FinalMessage;

async fn read_uptime() -> String {
    match util::read_optional("/proc/uptime").await {
        Ok(Some(raw)) => String::from_utf8_lossy(&raw)
            .split_whitespace()
            .next()
            .unwrap_or("n/a")
            .to_string(),
        _ => "n/a".to_string(),
    }
}

/// Render the message template; `{{version}}`, `{{uptime}}`,
/// `{{timestamp}}` and `{{datasource}}` are available
pub fn render_message(
    template: &str,
    version: &str,
    uptime: &str,
    timestamp: &str,
    datasource: &str,
) -> Result<String, CloudInitError> {
    let env = Environment::new();
    env.render_str(
        template,
        context! { version, uptime, timestamp, datasource },
    )
    .map_err(|e| CloudInitError::InvalidData(format!("Template render error: {}", e)))
}

#[async_trait]
impl Module for FinalMessage {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            id: "final_message",
            frequency: Frequency::PerAlways,
            distros: &[ALL_DISTROS],
            activate_by_schema_keys: &[],
        }
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &Cloud,
        args: &[String],
    ) -> Result<(), CloudInitError> {
        let template = args
            .first()
            .map(String::as_str)
            .or_else(|| config::get_str(cfg, "final_message"))
            .unwrap_or(DEFAULT_MESSAGE);

        let version = env!("CARGO_PKG_VERSION");
        let uptime = read_uptime().await;
        let timestamp = format!("{:.0}", util::epoch_seconds());
        let datasource = cloud
            .datasource()
            .map(|ds| ds.description())
            .unwrap_or_else(|| "None".to_string());

        match render_message(template, version, &uptime, &timestamp, &datasource) {
            Ok(message) => info!("{}", message.trim_end()),
            Err(e) => warn!("Failed to render final message template: {}", e),
        }

        if let Some(iid) = cloud.instance_id() {
            util::write_file(
                cloud.paths().boot_finished(iid),
                format!("{} - {} - v. {}\n", uptime, timestamp, version),
                0o644,
            )
            .await
            .map_err(|e| CloudInitError::module(name, e.to_string()))?;
        }

        if cloud.datasource().is_none_or(|ds| ds.name() == "None") {
            warn!("Used fallback datasource");
        }
        Ok(())
    }
}
