//! User-data processing
//!
//! Normalizes raw user-data into a flat `multipart/mixed` message whose
//! leaves are ready for the part handlers:
//! - gzip payloads (whole input or single parts) are decompressed
//! - parts without a useful type are classified from their first line
//! - `#include` / `#include-once` URLs are fetched and processed in place
//! - `#cloud-config-archive` lists are exploded into separate parts

pub mod mime;
pub mod types;

pub use mime::{Headers, MimePart, create_multipart, is_mime, parse_message};
pub use types::ContentType;

use crate::{
    CloudInitError,
    state::CloudPaths,
    url_helper::{self, UrlOptions},
    util,
};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io::Read;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};
use types::{ARCHIVE_UNDEF_TYPE, DECOMP_TYPES, NOT_MULTIPART_TYPE, TYPE_NEEDED, UNDEF_TYPE};

/// Nesting limit for includes that pull in further includes
pub const MAX_INCLUDE_DEPTH: usize = 10;

/// Archive entry keys that are not copied into part headers
const ARCHIVE_RESERVED_KEYS: [&str; 6] = [
    "content",
    "filename",
    "type",
    "launch-index",
    "content-disposition",
    "content-type",
];

type ProcessFuture<'a> = Pin<Box<dyn Future<Output = Result<(), CloudInitError>> + Send + 'a>>;

/// Decompress gzip data
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, CloudInitError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| CloudInitError::InvalidData(format!("Gzip decompression failed: {}", e)))?;
    Ok(decompressed)
}

/// Decompress if the data looks like gzip, otherwise return it unchanged
pub fn maybe_decompress(data: &[u8]) -> Vec<u8> {
    if !types::is_gzip(data) {
        return data.to_vec();
    }
    match decompress_gzip(data) {
        Ok(decompressed) => {
            debug!(
                "Decompressed gzip user-data ({} -> {} bytes)",
                data.len(),
                decompressed.len()
            );
            decompressed
        }
        Err(e) => {
            debug!("Treating gzip-looking user-data as raw: {}", e);
            data.to_vec()
        }
    }
}

/// Turn raw input into a MIME message
///
/// Anything without a `MIME-Version` header near the start becomes a
/// single `text/x-not-multipart` part to be classified later.
pub fn convert_string(raw: &[u8]) -> Result<MimePart, CloudInitError> {
    let data = maybe_decompress(raw);
    if is_mime(&data) {
        parse_message(&data)
    } else {
        Ok(MimePart::new(NOT_MULTIPART_TYPE, data))
    }
}

/// Converts raw user-data into the processed multipart message
pub struct UserDataProcessor {
    paths: CloudPaths,
    instance_id: Option<String>,
    error_on_failure: bool,
    url_options: UrlOptions,
}

impl UserDataProcessor {
    pub fn new(paths: CloudPaths, instance_id: Option<&str>) -> Self {
        Self {
            paths,
            instance_id: instance_id.map(String::from),
            error_on_failure: true,
            url_options: UrlOptions {
                retries: 10,
                sec_between: Duration::from_secs(1),
                timeout: Duration::from_secs(5),
            },
        }
    }

    /// Whether include failures abort processing or are only logged
    pub fn error_on_failure(mut self, enabled: bool) -> Self {
        self.error_on_failure = enabled;
        self
    }

    pub fn with_url_options(mut self, options: UrlOptions) -> Self {
        self.url_options = options;
        self
    }

    /// Process raw user-data into a flat multipart message
    pub async fn process(&self, raw: &[u8]) -> Result<MimePart, CloudInitError> {
        let mut attached = Vec::new();
        let msg = convert_string(raw)?;
        self.process_msg(msg, &mut attached, 0).await?;
        debug!("Processed user-data into {} parts", attached.len());
        Ok(create_multipart(attached))
    }

    fn process_msg<'a>(
        &'a self,
        msg: MimePart,
        attached: &'a mut Vec<MimePart>,
        depth: usize,
    ) -> ProcessFuture<'a> {
        Box::pin(async move {
            let leaves: Vec<MimePart> = msg.leaves().into_iter().cloned().collect();
            for part in leaves {
                let Some(part) = self.normalize_part(part)? else {
                    continue;
                };
                let ctype = part.content_type().unwrap_or_else(|| UNDEF_TYPE.to_string());
                match ContentType::from_mime(&ctype) {
                    Some(t) if t.is_include() => {
                        self.do_include(&part.text(), attached, depth).await?;
                    }
                    Some(ContentType::CloudConfigArchive) => {
                        for entry in explode_archive(&part.text()) {
                            let ctype = entry.content_type();
                            match ctype.as_deref().and_then(ContentType::from_mime) {
                                Some(t) if t.is_include() => {
                                    self.do_include(&entry.text(), attached, depth).await?;
                                }
                                _ => attach_part(attached, entry),
                            }
                        }
                    }
                    _ => attach_part(attached, part),
                }
            }
            Ok(())
        })
    }

    /// Decompress and classify one leaf; None when it must be dropped
    fn normalize_part(&self, mut part: MimePart) -> Result<Option<MimePart>, CloudInitError> {
        let declared = part.content_type();

        let mut compressed = false;
        if let Some(ctype) = &declared
            && DECOMP_TYPES.contains(&ctype.as_str())
        {
            match decompress_gzip(&part.payload) {
                Ok(payload) => {
                    let mut fresh = MimePart::raw(payload);
                    if let Some(filename) = part.filename() {
                        fresh.set_filename(&filename);
                    }
                    if let Some(index) = part.headers.get("Launch-Index") {
                        fresh.headers.set("Launch-Index", index);
                    }
                    part = fresh;
                    compressed = true;
                }
                Err(e) => {
                    self.handle_error(format!(
                        "Failed decompressing payload from {} of length {} due to: {}",
                        ctype,
                        part.payload.len(),
                        e
                    ))?;
                    return Ok(None);
                }
            }
        }

        let declared = if compressed { None } else { declared };
        let sniffed = match declared.as_deref() {
            None => ContentType::sniff(&part.payload),
            Some(ctype) if TYPE_NEEDED.contains(&ctype) => ContentType::sniff(&part.payload),
            Some(_) => None,
        };
        let ctype = sniffed
            .map(|t| t.mime_type().to_string())
            .or(declared.clone())
            .unwrap_or_else(|| UNDEF_TYPE.to_string());

        if declared.as_deref() != Some(ctype.as_str()) {
            part.set_content_type(&ctype);
        }
        Ok(Some(part))
    }

    async fn do_include(
        &self,
        content: &str,
        attached: &mut Vec<MimePart>,
        depth: usize,
    ) -> Result<(), CloudInitError> {
        let mut include_once = false;

        for line in content.lines() {
            let line = if let Some(rest) = strip_prefix_ci(line, "#include-once") {
                include_once = true;
                rest.trim_start()
            } else if let Some(rest) = strip_prefix_ci(line, "#include") {
                include_once = false;
                rest.trim_start()
            } else {
                line
            };
            if line.starts_with('#') {
                continue;
            }
            let url = line.trim();
            if url.is_empty() {
                continue;
            }

            if depth >= MAX_INCLUDE_DEPTH {
                self.handle_error(format!(
                    "Not including {}: include depth limit of {} reached",
                    url, MAX_INCLUDE_DEPTH
                ))?;
                continue;
            }

            let Some(fetched) = self.fetch_include(url, include_once).await? else {
                continue;
            };
            let msg = convert_string(&fetched)?;
            self.process_msg(msg, attached, depth + 1).await?;
        }
        Ok(())
    }

    async fn fetch_include(
        &self,
        url: &str,
        include_once: bool,
    ) -> Result<Option<Vec<u8>>, CloudInitError> {
        let once_file = include_once.then(|| self.include_once_file(url));
        if let Some(path) = &once_file
            && let Some(cached) = util::read_optional(path).await?
        {
            debug!("Using cached include-once content for {}", url);
            return Ok(Some(cached));
        }

        match url_helper::read_file_or_url(url, &self.url_options).await {
            Ok(response) => {
                if let Some(path) = &once_file {
                    util::write_file(path, &response.contents, 0o600).await?;
                }
                Ok(Some(response.contents))
            }
            Err(e) => {
                let mut message = e.to_string();
                if !message.contains(url) {
                    message.push_str(&format!(" for url: {}", url));
                }
                self.handle_error(message)?;
                Ok(None)
            }
        }
    }

    fn include_once_file(&self, url: &str) -> PathBuf {
        let dir = match &self.instance_id {
            Some(iid) => self.paths.urlcache_dir(iid),
            None => self.paths.instance_link().join("data").join("urlcache"),
        };
        dir.join(hex::encode(Sha256::digest(url.as_bytes())))
    }

    fn handle_error(&self, message: String) -> Result<(), CloudInitError> {
        if self.error_on_failure {
            Err(CloudInitError::UserData(message))
        } else {
            warn!("{}", message);
            Ok(())
        }
    }
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

/// Attach a part, naming it `part-NNN` (1-based) if it has no filename
fn attach_part(attached: &mut Vec<MimePart>, mut part: MimePart) {
    if part.filename().is_none() {
        part.set_filename(&types::part_filename(attached.len() + 1));
    }
    attached.push(part);
}

/// Expand a `#cloud-config-archive` list into parts
///
/// Entries are strings (content only) or mappings with `content` and
/// optional `type`, `filename`, `launch-index` and extra header keys.
/// Include entries are fetched by the caller; everything else is attached
/// without being classified again.
fn explode_archive(archive: &str) -> Vec<MimePart> {
    let entries: Vec<serde_yaml::Value> = match serde_yaml::from_str(archive) {
        Ok(serde_yaml::Value::Sequence(entries)) => entries,
        Ok(_) => {
            warn!("cloud-config-archive is not a list, ignoring it");
            return Vec::new();
        }
        Err(e) => {
            warn!("Failed to parse cloud-config-archive: {}", e);
            return Vec::new();
        }
    };

    let mut parts = Vec::with_capacity(entries.len());

    for entry in entries {
        let entry = match entry {
            serde_yaml::Value::String(content) => {
                let mut map = serde_yaml::Mapping::new();
                map.insert("content".into(), content.into());
                map
            }
            serde_yaml::Value::Mapping(map) => map,
            other => {
                debug!("Skipping archive entry of unexpected type: {:?}", other);
                continue;
            }
        };

        let content = entry
            .get("content")
            .and_then(yaml_scalar_string)
            .unwrap_or_default();
        let mtype = entry
            .get("type")
            .and_then(yaml_scalar_string)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| ContentType::sniff_mime(content.as_bytes(), ARCHIVE_UNDEF_TYPE));

        let mut part = MimePart::new(&mtype, content);
        if let Some(filename) = entry.get("filename").and_then(yaml_scalar_string) {
            part.set_filename(&filename);
        }
        if let Some(index) = entry.get("launch-index").and_then(yaml_scalar_string) {
            part.headers.set("Launch-Index", index);
        }
        for (key, value) in &entry {
            let (Some(key), Some(value)) = (key.as_str(), yaml_scalar_string(value)) else {
                continue;
            };
            if ARCHIVE_RESERVED_KEYS.contains(&key.to_lowercase().as_str()) {
                continue;
            }
            part.headers.append(key, value);
        }
        parts.push(part);
    }
    parts
}

fn yaml_scalar_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
