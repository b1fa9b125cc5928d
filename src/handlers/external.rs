//! Script-based part handlers
//!
//! A handler script is shipped in user-data as a `text/part-handler` part
//! or installed in `<cloud_dir>/handlers`. It declares itself in comment
//! headers:
//!
//! ```text
//! #part-handler
//! #!/bin/sh
//! # list-types: text/x-custom, text/x-other
//! # handler-version: 2
//! # frequency: always
//! ```
//!
//! Each call runs `<interpreter> <script> <content-type> <filename>
//! [<frequency>]` with the payload on stdin. Version 3 handlers also get
//! every part header as a `PART_HEADER_<NAME>` environment variable.

use super::{Part, PartHandler, PartOutcome};
use crate::{CloudInitError, state::Frequency};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_INTERPRETER: &str = "/bin/sh";

#[derive(Debug, Clone)]
pub struct ExternalPartHandler {
    path: PathBuf,
    interpreter: Vec<String>,
    types: Vec<String>,
    version: u8,
    frequency: Frequency,
}

impl ExternalPartHandler {
    /// Load and validate a handler script
    pub async fn load(path: &Path) -> Result<Self, CloudInitError> {
        let raw = tokio::fs::read(path).await?;
        Self::parse(path, &String::from_utf8_lossy(&raw))
    }

    /// Read the declaration headers of a handler script
    pub fn parse(path: &Path, script: &str) -> Result<Self, CloudInitError> {
        let invalid = |msg: String| CloudInitError::handler(path.display().to_string(), msg);

        let mut interpreter = None;
        let mut types = Vec::new();
        let mut version = 1;
        let mut frequency = Frequency::PerInstance;

        for line in script.lines().map(str::trim) {
            if line.is_empty() {
                continue;
            }
            if !line.starts_with('#') {
                break;
            }
            if let Some(shebang) = line.strip_prefix("#!") {
                if interpreter.is_none() {
                    interpreter = Some(shebang.split_whitespace().map(String::from).collect::<Vec<_>>());
                }
                continue;
            }

            let Some((key, value)) = line.trim_start_matches('#').split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_lowercase().replace('_', "-").as_str() {
                "list-types" => types.extend(
                    value
                        .split([',', ' '])
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from),
                ),
                "handler-version" => {
                    version = match value.parse() {
                        Ok(v) if (1..=3).contains(&v) => v,
                        _ => {
                            warn!(
                                "Handler {} declares unknown handler-version '{}', using 1",
                                path.display(),
                                value
                            );
                            1
                        }
                    };
                }
                "frequency" => {
                    frequency = value.parse().unwrap_or_else(|e| {
                        warn!("Handler {}: {}, using {}", path.display(), e, Frequency::PerInstance);
                        Frequency::PerInstance
                    });
                }
                _ => {}
            }
        }

        if types.is_empty() {
            return Err(invalid("declares no content types".to_string()));
        }

        let interpreter = interpreter
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_INTERPRETER.to_string()]);

        Ok(Self {
            path: path.to_path_buf(),
            interpreter,
            types,
            version,
            frequency,
        })
    }

    fn command(&self, part: &Part<'_>) -> Command {
        let mut cmd = Command::new(&self.interpreter[0]);
        cmd.args(&self.interpreter[1..])
            .arg(&self.path)
            .arg(part.content_type)
            .arg(part.filename);
        if let Some(freq) = part.frequency {
            cmd.arg(freq.as_str());
        }
        if let Some(headers) = part.headers {
            for (name, value) in headers.iter() {
                cmd.env(header_env_name(name), value);
            }
        }
        cmd
    }
}

/// `Content-Type` -> `PART_HEADER_CONTENT_TYPE`
fn header_env_name(header: &str) -> String {
    let name: String = header
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("PART_HEADER_{}", name)
}

#[async_trait]
impl PartHandler for ExternalPartHandler {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    fn list_types(&self) -> Vec<String> {
        self.types.clone()
    }

    fn frequency(&self) -> Frequency {
        self.frequency
    }

    fn handler_version(&self) -> u8 {
        self.version
    }

    async fn handle_part(&mut self, part: &Part<'_>) -> Result<PartOutcome, CloudInitError> {
        debug!("Running part handler {} for {}", self.path.display(), part.content_type);
        let mut child = self
            .command(part)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CloudInitError::Command(format!("{}: {}", self.path.display(), e)))?;

        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(part.payload).await
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e.into());
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(CloudInitError::handler(
                self.name(),
                format!(
                    "exit status {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(PartOutcome::Handled)
    }
}
