//! Cloud-config embedded in the kernel command line
//!
//! Supported forms:
//!
//! ```text
//! cc: ssh_import_id: [alice, bob]\nruncmd: [ [ ls, -l ], echo hi ] end_cc
//! cc:ssh_import_id: [alice] end_cc cc:runcmd: [ [ ls, -l ] ] end_cc
//! cc:ssh_import_id: %5Balice%5D end_cc
//! ```

use crate::{CloudInitError, util};
use percent_encoding::percent_decode_str;
use serde_yaml::Value;
use std::path::Path;
use tracing::{debug, warn};

const TAG_BEGIN: &str = "cc:";
const TAG_END: &str = "end_cc";

/// Extract the YAML text of every `cc: ... end_cc` token, joined by newlines
pub fn read_cc_from_cmdline(cmdline: &str) -> String {
    let mut tokens = Vec::new();
    let mut rest = cmdline;

    while let Some(begin) = rest.find(TAG_BEGIN) {
        let body = &rest[begin + TAG_BEGIN.len()..];
        let (token, next) = match body.find(TAG_END) {
            Some(end) => (&body[..end], &body[end + TAG_END.len()..]),
            None => (body, ""),
        };
        let decoded = percent_decode_str(token.trim_start()).decode_utf8_lossy();
        tokens.push(decoded.replace("\\n", "\n"));
        rest = next;
    }

    tokens.join("\n")
}

/// Parse the kernel command line's cloud-config, None when there is none
pub fn parse_cmdline_config(cmdline: &str) -> Result<Option<Value>, CloudInitError> {
    let text = read_cc_from_cmdline(cmdline);
    if text.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_yaml::from_str(&text)?;
    Ok(value.is_mapping().then_some(value))
}

/// Read and parse the command line at `path` (normally /proc/cmdline)
///
/// Unreadable or unparsable command lines are logged and ignored.
pub async fn read_cmdline_config(path: &Path) -> Option<Value> {
    let raw = match util::read_optional(path).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            debug!("Could not read {}: {}", path.display(), e);
            return None;
        }
    };
    match parse_cmdline_config(&String::from_utf8_lossy(&raw)) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("Ignoring kernel command line config: {}", e);
            None
        }
    }
}
