//! User-data content types
//!
//! Known MIME types, the synthetic walk signals, and detection of a part's
//! type from the first bytes of its payload.

use std::fmt;

/// Signal sent to every handler before the first part of a walk
pub const CONTENT_START: &str = "__begin__";
/// Signal sent to every initialized handler after the last part
pub const CONTENT_END: &str = "__end__";
pub const CONTENT_SIGNALS: [&str; 2] = [CONTENT_START, CONTENT_END];

/// Type given to raw (non-MIME) user-data before sniffing
pub const NOT_MULTIPART_TYPE: &str = "text/x-not-multipart";
/// Type of a MIME part with no Content-Type header
pub const UNDEF_TYPE: &str = "text/plain";
/// Type of a part without a recognisable header
pub const OCTET_TYPE: &str = "application/octet-stream";
/// Default type for text entries of a cloud-config archive
pub const ARCHIVE_UNDEF_TYPE: &str = "text/cloud-config";

/// Declared types that are re-derived from the payload
pub const TYPE_NEEDED: [&str; 3] = [UNDEF_TYPE, NOT_MULTIPART_TYPE, "text/x-shellscript"];

/// Declared types whose payload is gzip-compressed
pub const DECOMP_TYPES: [&str; 8] = [
    "application/gzip",
    "application/gzip-compressed",
    "application/gzipped",
    "application/x-compress",
    "application/x-compressed",
    "application/x-gunzip",
    "application/x-gzip",
    "application/x-gzip-compressed",
];

/// Filename given to parts that carry none
pub fn part_filename(index: usize) -> String {
    format!("part-{index:03}")
}

/// Content types cloud-init understands natively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Cloud-config YAML (#cloud-config)
    CloudConfig,
    /// List of parts (#cloud-config-archive)
    CloudConfigArchive,
    /// JSON patch over the accumulated cloud-config (#cloud-config-jsonp)
    CloudConfigJsonp,
    /// Script with an interpreter line (#!)
    ShellScript,
    /// List of URLs to fetch (#include)
    IncludeUrl,
    /// List of URLs fetched once per instance (#include-once)
    IncludeOnceUrl,
    /// Script run immediately during the init stage (#cloud-boothook)
    CloudBoothook,
    /// Handler supplied inside user-data (#part-handler)
    PartHandler,
    /// Upstart job definition (#upstart-job)
    UpstartJob,
    /// Jinja template rendering to another type (## template: jinja)
    Jinja,
}

/// Payload prefixes, in detection order
const PREFIXES: [(&str, ContentType); 10] = [
    ("#include", ContentType::IncludeUrl),
    ("#include-once", ContentType::IncludeOnceUrl),
    ("#!", ContentType::ShellScript),
    ("#cloud-config", ContentType::CloudConfig),
    ("#part-handler", ContentType::PartHandler),
    ("#cloud-boothook", ContentType::CloudBoothook),
    ("#cloud-config-archive", ContentType::CloudConfigArchive),
    ("#cloud-config-jsonp", ContentType::CloudConfigJsonp),
    ("## template: jinja", ContentType::Jinja),
    ("#upstart-job", ContentType::UpstartJob),
];

impl ContentType {
    /// Get the MIME type string for this content type
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::CloudConfig => "text/cloud-config",
            Self::CloudConfigArchive => "text/cloud-config-archive",
            Self::CloudConfigJsonp => "text/cloud-config-jsonp",
            Self::ShellScript => "text/x-shellscript",
            Self::IncludeUrl => "text/x-include-url",
            Self::IncludeOnceUrl => "text/x-include-once-url",
            Self::CloudBoothook => "text/cloud-boothook",
            Self::PartHandler => "text/part-handler",
            Self::UpstartJob => "text/upstart-job",
            Self::Jinja => "text/jinja2",
        }
    }

    /// The payload prefix that announces this type
    pub fn prefix(&self) -> &'static str {
        PREFIXES
            .iter()
            .find(|(_, t)| t == self)
            .map(|(p, _)| *p)
            .unwrap_or_default()
    }

    /// Parse content type from MIME type string
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.split(';').next().unwrap_or(mime).trim().to_lowercase();
        match mime.as_str() {
            "text/cloud-config" | "text/x-cloud-config" => Some(Self::CloudConfig),
            "text/cloud-config-archive" => Some(Self::CloudConfigArchive),
            "text/cloud-config-jsonp" => Some(Self::CloudConfigJsonp),
            "text/x-shellscript" | "text/x-sh" => Some(Self::ShellScript),
            "text/x-include-url" => Some(Self::IncludeUrl),
            "text/x-include-once-url" => Some(Self::IncludeOnceUrl),
            "text/cloud-boothook" => Some(Self::CloudBoothook),
            "text/part-handler" => Some(Self::PartHandler),
            "text/upstart-job" => Some(Self::UpstartJob),
            "text/jinja2" | "text/x-jinja2" => Some(Self::Jinja),
            _ => None,
        }
    }

    /// Detect the type from the start of a payload
    ///
    /// The longest matching prefix wins, so `#cloud-config-archive` is not
    /// mistaken for `#cloud-config`. Binary payloads are never matched.
    pub fn sniff(payload: &[u8]) -> Option<Self> {
        let head = &payload[..payload.len().min(256)];
        let text = match std::str::from_utf8(head) {
            Ok(text) => text,
            // A multi-byte character cut at the window edge is still text
            Err(e) if e.error_len().is_none() => std::str::from_utf8(&head[..e.valid_up_to()]).ok()?,
            Err(_) => return None,
        };
        let text = text.trim_start().to_lowercase();

        PREFIXES
            .iter()
            .filter(|(prefix, _)| text.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, t)| *t)
    }

    /// MIME type for a payload, or `default` when nothing matches
    pub fn sniff_mime(payload: &[u8], default: &str) -> String {
        Self::sniff(payload)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn is_include(&self) -> bool {
        matches!(self, Self::IncludeUrl | Self::IncludeOnceUrl)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mime_type())
    }
}

/// Check for gzip magic bytes
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}
