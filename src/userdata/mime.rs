//! MIME message parsing and serialization for user-data
//!
//! Only what user-data needs: header blocks with continuation lines,
//! (nested) multipart bodies, and base64 / quoted-printable transfer
//! encodings. Payloads are kept as bytes so gzip and other binary parts
//! survive untouched.

use crate::CloudInitError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::borrow::Cow;
use tracing::debug;

/// Bytes searched for a `MIME-Version` header before treating input as MIME
const MIME_SNIFF_LEN: usize = 4096;

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every `name` header with a single new value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.0.push((name.to_string(), value.into()));
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.0.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One MIME entity: a leaf with a payload or a multipart container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MimePart {
    pub headers: Headers,
    /// Decoded payload (empty for containers)
    pub payload: Vec<u8>,
    pub children: Vec<MimePart>,
}

impl MimePart {
    /// Leaf part with a content type
    pub fn new(content_type: &str, payload: impl Into<Vec<u8>>) -> Self {
        let mut headers = Headers::default();
        headers.set("Content-Type", content_type);
        Self {
            headers,
            payload: payload.into(),
            children: Vec::new(),
        }
    }

    /// Leaf part with no headers at all
    pub fn raw(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: Headers::default(),
            payload: payload.into(),
            children: Vec::new(),
        }
    }

    /// Empty `multipart/mixed` container
    pub fn multipart() -> Self {
        let mut headers = Headers::default();
        headers.set(
            "Content-Type",
            format!("multipart/mixed; boundary=\"{}\"", new_boundary()),
        );
        headers.set("MIME-Version", "1.0");
        Self {
            headers,
            payload: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Media type without parameters, lowercased; None when unset
    pub fn content_type(&self) -> Option<String> {
        let value = self.headers.get("Content-Type")?;
        let media = value.split(';').next().unwrap_or(value).trim();
        (!media.is_empty()).then(|| media.to_lowercase())
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.headers.set("Content-Type", content_type);
    }

    /// Filename from Content-Disposition
    pub fn filename(&self) -> Option<String> {
        self.headers
            .get("Content-Disposition")
            .and_then(|cd| header_param(cd, "filename"))
    }

    pub fn set_filename(&mut self, filename: &str) {
        self.headers.set(
            "Content-Disposition",
            format!("attachment; filename=\"{filename}\""),
        );
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.starts_with("multipart/"))
    }

    /// Payload as text (lossy)
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Non-container parts, depth first
    pub fn leaves(&self) -> Vec<&MimePart> {
        if !self.is_multipart() {
            return vec![self];
        }
        self.children.iter().flat_map(|c| c.leaves()).collect()
    }

    /// Serialize to MIME text, base64-encoding binary payloads
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        let binary = !self.is_multipart() && std::str::from_utf8(&self.payload).is_err();
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("Content-Transfer-Encoding") {
                continue;
            }
            out.extend_from_slice(format!("{name}: {value}\n").as_bytes());
        }
        if binary {
            out.extend_from_slice(b"Content-Transfer-Encoding: base64\n");
        }
        out.push(b'\n');

        if self.is_multipart() {
            let boundary = self.boundary().unwrap_or_default();
            for child in &self.children {
                out.extend_from_slice(format!("--{boundary}\n").as_bytes());
                child.write_to(out);
                out.push(b'\n');
            }
            out.extend_from_slice(format!("--{boundary}--\n").as_bytes());
        } else if binary {
            let encoded = STANDARD.encode(&self.payload);
            for chunk in encoded.as_bytes().chunks(76) {
                out.extend_from_slice(chunk);
                out.push(b'\n');
            }
        } else {
            out.extend_from_slice(&self.payload);
        }
    }

    fn boundary(&self) -> Option<String> {
        self.headers
            .get("Content-Type")
            .and_then(|ct| header_param(ct, "boundary"))
    }
}

/// Whether raw user-data should be parsed as a MIME message
pub fn is_mime(data: &[u8]) -> bool {
    let head = &data[..data.len().min(MIME_SNIFF_LEN)];
    String::from_utf8_lossy(head)
        .to_lowercase()
        .contains("mime-version:")
}

/// Parse a complete MIME message
pub fn parse_message(data: &[u8]) -> Result<MimePart, CloudInitError> {
    let part = parse_entity(data)?;
    debug!("Parsed MIME message with {} leaf parts", part.leaves().len());
    Ok(part)
}

/// Wrap leaf parts in a new `multipart/mixed` container
pub fn create_multipart(parts: Vec<MimePart>) -> MimePart {
    let mut root = MimePart::multipart();
    root.children = parts;
    root
}

fn new_boundary() -> String {
    format!("==============={}==", uuid::Uuid::new_v4().simple())
}

fn parse_entity(data: &[u8]) -> Result<MimePart, CloudInitError> {
    let (headers, body) = split_headers(data);
    let mut part = MimePart {
        headers,
        payload: Vec::new(),
        children: Vec::new(),
    };

    if part.is_multipart()
        && let Some(boundary) = part.boundary()
    {
        for section in split_multipart(body, &boundary) {
            part.children.push(parse_entity(section)?);
        }
        return Ok(part);
    }

    let encoding = part
        .headers
        .get("Content-Transfer-Encoding")
        .map(|e| e.trim().to_lowercase());
    part.payload = match encoding.as_deref() {
        Some("base64") => decode_base64(body)?,
        Some("quoted-printable") => decode_quoted_printable(body),
        _ => body.to_vec(),
    };
    part.headers.remove("Content-Transfer-Encoding");
    Ok(part)
}

/// Split a header block from the body; the body starts after the first
/// blank line or at the first line that is not a header
fn split_headers(data: &[u8]) -> (Headers, &[u8]) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut offset = 0;

    for line in data.split_inclusive(|&b| b == b'\n') {
        let text = String::from_utf8_lossy(line.trim_ascii_end());
        if text.is_empty() {
            offset += line.len();
            break;
        }
        if text.starts_with([' ', '\t']) {
            let Some((_, value)) = headers.last_mut() else {
                break;
            };
            value.push(' ');
            value.push_str(text.trim());
        } else if let Some((name, value)) = text.split_once(':')
            && is_header_name(name)
        {
            headers.push((name.to_string(), value.trim().to_string()));
        } else {
            break;
        }
        offset += line.len();
    }

    (Headers(headers), &data[offset..])
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b':')
}

/// Sections between `--boundary` lines, up to the closing `--boundary--`
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{boundary}");
    let close = format!("--{boundary}--");
    let mut sections = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;

    for line in body.split_inclusive(|&b| b == b'\n') {
        let trimmed = line.trim_ascii_end();
        let is_close = trimmed == close.as_bytes();
        if is_close || trimmed == delimiter.as_bytes() {
            if let Some(s) = start {
                sections.push(strip_line_break(&body[s..offset]));
            }
            if is_close {
                return sections;
            }
            start = Some(offset + line.len());
        }
        offset += line.len();
    }

    // Unterminated message; keep what follows the last delimiter
    if let Some(s) = start {
        sections.push(&body[s..]);
    }
    sections
}

/// The line break before a delimiter belongs to the delimiter
fn strip_line_break(data: &[u8]) -> &[u8] {
    data.strip_suffix(b"\r\n")
        .or_else(|| data.strip_suffix(b"\n"))
        .unwrap_or(data)
}

/// Value of `name=` in a structured header (`attachment; filename="x"`)
pub fn header_param(value: &str, name: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| val.trim().trim_matches('"').to_string())
    })
}

fn decode_base64(data: &[u8]) -> Result<Vec<u8>, CloudInitError> {
    let clean: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(&clean)
        .map_err(|e| CloudInitError::InvalidData(format!("Base64 decode error: {}", e)))
}

fn decode_quoted_printable(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] != b'=' {
            result.push(data[i]);
            i += 1;
            continue;
        }
        // Soft line break
        if data[i + 1..].starts_with(b"\r\n") {
            i += 3;
            continue;
        }
        if data[i + 1..].starts_with(b"\n") {
            i += 2;
            continue;
        }
        let hex = data
            .get(i + 1..i + 3)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u8::from_str_radix(h, 16).ok());
        match hex {
            Some(byte) => {
                result.push(byte);
                i += 3;
            }
            None => {
                result.push(b'=');
                i += 1;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "MIME-Version: 1.0
Content-Type: multipart/mixed; boundary=\"BOUNDARY\"

--BOUNDARY
Content-Type: text/cloud-config

#cloud-config
hostname: test

--BOUNDARY
Content-Type: text/x-shellscript
Content-Disposition: attachment; filename=\"setup.sh\"

#!/bin/bash
echo hello
--BOUNDARY--
";

    #[test]
    fn test_parse_simple_multipart() {
        let msg = parse_message(SIMPLE.as_bytes()).unwrap();
        assert!(msg.is_multipart());
        let leaves = msg.leaves();
        assert_eq!(leaves.len(), 2);

        assert_eq!(leaves[0].content_type().as_deref(), Some("text/cloud-config"));
        assert_eq!(leaves[0].text(), "#cloud-config\nhostname: test\n");
        assert_eq!(leaves[0].filename(), None);

        assert_eq!(leaves[1].content_type().as_deref(), Some("text/x-shellscript"));
        assert_eq!(leaves[1].filename().as_deref(), Some("setup.sh"));
        assert_eq!(leaves[1].text(), "#!/bin/bash\necho hello");
    }

    #[test]
    fn test_parse_nested_multipart() {
        let data = "MIME-Version: 1.0
Content-Type: multipart/mixed; boundary=outer

--outer
Content-Type: multipart/alternative; boundary=inner

--inner
Content-Type: text/plain

one
--inner
Content-Type: text/plain

two
--inner--
--outer
Content-Type: text/plain

three
--outer--
";
        let msg = parse_message(data.as_bytes()).unwrap();
        let texts: Vec<_> = msg.leaves().iter().map(|p| p.text().into_owned()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_parse_base64_binary_content() {
        let data = "MIME-Version: 1.0
Content-Type: multipart/mixed; boundary=test

--test
Content-Type: application/octet-stream
Content-Transfer-Encoding: base64

H4sI/w==
--test--
";
        let msg = parse_message(data.as_bytes()).unwrap();
        let leaf = msg.leaves()[0];
        assert_eq!(leaf.payload, vec![0x1f, 0x8b, 0x08, 0xff]);
        assert!(leaf.headers.get("content-transfer-encoding").is_none());
    }

    #[test]
    fn test_header_continuation_and_case() {
        let data = "MIME-Version: 1.0\r\ncontent-type: multipart/mixed;\r\n boundary=\"b\"\r\n\r\n--b\r\nContent-Type: text/plain\r\n\r\nx\r\n--b--\r\n";
        let msg = parse_message(data.as_bytes()).unwrap();
        assert_eq!(msg.leaves()[0].text(), "x");
    }

    #[test]
    fn test_is_mime() {
        assert!(is_mime(b"Content-Type: text/plain\nMIME-Version: 1.0\n\nx"));
        assert!(is_mime(b"mime-version: 1.0\n"));
        assert!(!is_mime(b"#cloud-config\nhostname: x\n"));
    }

    #[test]
    fn test_header_param() {
        assert_eq!(
            header_param("attachment; filename=\"test.sh\"", "filename").as_deref(),
            Some("test.sh")
        );
        assert_eq!(
            header_param("attachment; FILENAME=script.sh", "filename").as_deref(),
            Some("script.sh")
        );
        assert_eq!(header_param("attachment", "filename"), None);
    }

    #[test]
    fn test_create_multipart_reparses() {
        let mut script = MimePart::new("text/x-shellscript", "#!/bin/sh\necho hi\n");
        script.set_filename("part-001");
        let binary = MimePart::new("application/octet-stream", vec![0u8, 0xff, 0xfe]);

        let bytes = create_multipart(vec![script, binary]).to_bytes();
        assert!(is_mime(&bytes));

        let parsed = parse_message(&bytes).unwrap();
        let leaves = parsed.leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].filename().as_deref(), Some("part-001"));
        assert_eq!(leaves[0].text(), "#!/bin/sh\necho hi\n");
        assert_eq!(leaves[1].payload, vec![0u8, 0xff, 0xfe]);
    }

    #[test]
    fn test_decode_quoted_printable() {
        assert_eq!(decode_quoted_printable(b"Hello=20World"), b"Hello World");
        assert_eq!(decode_quoted_printable(b"Line1=\r\nLine2"), b"Line1Line2");
        assert_eq!(decode_quoted_printable(b"a=zz"), b"a=zz");
    }

    #[test]
    fn test_headers_set_replaces() {
        let mut headers = Headers::default();
        headers.append("Content-Type", "text/plain");
        headers.set("content-type", "text/cloud-config");
        assert_eq!(headers.iter().count(), 1);
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/cloud-config"));
    }
}
