//! Write files module
//!
//! `write_files` writes everything not marked `defer: true`;
//! `write_files_deferred` runs in the final stage and writes the rest.

use super::{ALL_DISTROS, Module, ModuleMeta};
use crate::config::WriteFileConfig;
use crate::{CloudInitError, cloud::Cloud, state::Frequency, util};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::read::GzDecoder;
use serde_yaml::Value;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

const DEFAULT_PERMS: u32 = 0o644;

pub struct WriteFiles;

pub struct WriteFilesDeferred;

#[async_trait]
impl Module for WriteFiles {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            id: "write_files",
            frequency: Frequency::PerInstance,
            distros: &[ALL_DISTROS],
            activate_by_schema_keys: &["write_files"],
        }
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &Cloud,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        let files = read_write_files(name, cfg)?;
        for file in files.iter().filter(|f| f.defer != Some(true)) {
            write_one(cloud, file).await?;
        }
        for file in files.iter().filter(|f| f.defer == Some(true)) {
            debug!("Deferring write of: {}", file.path);
        }
        Ok(())
    }
}

#[async_trait]
impl Module for WriteFilesDeferred {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            id: "write_files_deferred",
            frequency: Frequency::PerInstance,
            distros: &[ALL_DISTROS],
            activate_by_schema_keys: &["write_files"],
        }
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &Cloud,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        let files = read_write_files(name, cfg)?;
        for file in files.iter().filter(|f| f.defer == Some(true)) {
            write_one(cloud, file).await?;
        }
        Ok(())
    }
}

fn read_write_files(module: &str, cfg: &Value) -> Result<Vec<WriteFileConfig>, CloudInitError> {
    let Some(value) = cfg.get("write_files") else {
        debug!("Skipping module named {}, no 'write_files' key in configuration", module);
        return Ok(Vec::new());
    };
    serde_yaml::from_value(value.clone())
        .map_err(|e| CloudInitError::module(module, format!("invalid write_files: {}", e)))
}

async fn write_one(cloud: &Cloud, file: &WriteFileConfig) -> Result<(), CloudInitError> {
    if file.path.is_empty() {
        return Err(CloudInitError::InvalidData(
            "write_files entry without a path".to_string(),
        ));
    }
    let path = cloud.paths().target(&file.path);
    info!("Writing file: {}", path.display());

    let mut content = decode_content(&file.content, file.encoding.as_deref())?;
    if file.append == Some(true)
        && let Some(mut existing) = util::read_optional(&path).await?
    {
        existing.append(&mut content);
        content = existing;
    }

    let mode = match &file.permissions {
        Some(perms) => perms.mode()?,
        None => DEFAULT_PERMS,
    };
    util::write_file(&path, content, mode).await?;

    if let Some(owner) = &file.owner {
        if cloud.paths().root == Path::new("/") {
            set_ownership(&path, owner).await?;
        } else {
            debug!("Not changing owner of {} outside the live root", path.display());
        }
    }
    Ok(())
}

/// Decode content based on encoding type
fn decode_content(content: &str, encoding: Option<&str>) -> Result<Vec<u8>, CloudInitError> {
    let encoding = encoding.map(|e| e.trim().to_ascii_lowercase());
    match encoding.as_deref() {
        None | Some("text/plain") => Ok(content.as_bytes().to_vec()),
        Some("base64") | Some("b64") => decode_base64(content),
        Some("gzip") | Some("gz") => decompress_gzip(content.as_bytes()),
        Some("gz+base64") | Some("gzip+base64") | Some("gz+b64") | Some("gzip+b64")
        | Some("b64+gzip") | Some("base64+gzip") => decompress_gzip(&decode_base64(content)?),
        Some(other) => Err(CloudInitError::InvalidData(format!(
            "Unknown encoding: {}",
            other
        ))),
    }
}

fn decode_base64(content: &str) -> Result<Vec<u8>, CloudInitError> {
    let compact: String = content.split_whitespace().collect();
    BASE64
        .decode(compact)
        .map_err(|e| CloudInitError::InvalidData(format!("Invalid base64: {}", e)))
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, CloudInitError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| CloudInitError::InvalidData(format!("Failed to decompress gzip: {}", e)))?;
    Ok(decompressed)
}

async fn set_ownership(path: &Path, owner: &str) -> Result<(), CloudInitError> {
    debug!("Setting ownership {} on {:?}", owner, path);

    let output = tokio::process::Command::new("chown")
        .arg(owner)
        .arg(path)
        .output()
        .await
        .map_err(|e| CloudInitError::Command(e.to_string()))?;

    if !output.status.success() {
        return Err(CloudInitError::Command(format!(
            "Failed to set ownership: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
