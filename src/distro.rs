//! Distro operations used by the stages and modules
//!
//! Every system file is written beneath the target root from
//! [`CloudPaths`], so the whole pipeline can run against a scratch
//! directory. Commands that change the running system (`hostname`,
//! `timedatectl`) are only invoked when the target root is `/`.

use crate::{CloudInitError, state::CloudPaths, util};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Hostname and fqdn last applied by us (`data/set-hostname`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameRecord {
    pub hostname: String,
    pub fqdn: String,
}

#[derive(Debug, Clone)]
pub struct Distro {
    name: String,
    paths: CloudPaths,
}

impl Distro {
    pub fn new(name: impl Into<String>, paths: CloudPaths) -> Self {
        Self {
            name: name.into(),
            paths,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_live_system(&self) -> bool {
        self.paths.root == Path::new("/")
    }

    /// Hostname recorded by the last successful [`Distro::set_hostname`]
    pub async fn previous_hostname(&self) -> Result<Option<HostnameRecord>, CloudInitError> {
        match util::read_optional(self.paths.set_hostname_file()).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Write `/etc/hostname` and apply it to the running system
    ///
    /// Returns false when the hostname was already the one we last set.
    pub async fn set_hostname(&self, hostname: &str, fqdn: &str) -> Result<bool, CloudInitError> {
        let record = HostnameRecord {
            hostname: hostname.to_string(),
            fqdn: fqdn.to_string(),
        };
        let etc_hostname = self.paths.target("/etc/hostname");
        if self.previous_hostname().await?.as_ref() == Some(&record) && etc_hostname.exists() {
            debug!("Hostname {} unchanged, not setting", hostname);
            return Ok(false);
        }

        info!("Setting hostname to {} (fqdn {})", hostname, fqdn);
        util::write_file(&etc_hostname, format!("{}\n", hostname), 0o644).await?;
        self.update_etc_hosts(hostname, fqdn).await?;

        if self.is_live_system() {
            let output = Command::new("hostname")
                .arg(hostname)
                .output()
                .await
                .map_err(|e| CloudInitError::Command(e.to_string()))?;
            if !output.status.success() {
                return Err(CloudInitError::Command(format!(
                    "Failed to set hostname: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }

        util::write_file(
            self.paths.set_hostname_file(),
            serde_json::to_vec(&record)?,
            0o644,
        )
        .await?;
        Ok(true)
    }

    /// Point `127.0.1.1` at the instance's names in `/etc/hosts`
    async fn update_etc_hosts(&self, hostname: &str, fqdn: &str) -> Result<(), CloudInitError> {
        let path = self.paths.target("/etc/hosts");
        let existing = util::read_optional(&path)
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .unwrap_or_default();

        let entry = if fqdn != hostname {
            format!("127.0.1.1 {} {}", fqdn, hostname)
        } else {
            format!("127.0.1.1 {}", hostname)
        };

        let mut lines: Vec<String> = existing
            .lines()
            .filter(|l| !l.trim_start().starts_with("127.0.1.1"))
            .map(String::from)
            .collect();
        if !lines.iter().any(|l| l.trim_start().starts_with("127.0.0.1")) {
            lines.insert(0, "127.0.0.1 localhost".to_string());
        }
        lines.push(entry);

        util::write_file(&path, lines.join("\n") + "\n", 0o644).await
    }

    /// Link `/etc/localtime` to the zoneinfo file and write `/etc/timezone`
    pub async fn set_timezone(&self, timezone: &str) -> Result<(), CloudInitError> {
        let zone_path = format!("/usr/share/zoneinfo/{}", timezone);
        if timezone.contains("..") || !self.paths.target(&zone_path).exists() {
            return Err(CloudInitError::InvalidData(format!(
                "Invalid timezone: {} (not found in /usr/share/zoneinfo)",
                timezone
            )));
        }

        if self.is_live_system() && self.try_timedatectl(timezone).await {
            return Ok(());
        }

        let localtime = self.paths.target("/etc/localtime");
        util::sym_link(Path::new(&zone_path), &localtime).await?;
        util::write_file(
            self.paths.target("/etc/timezone"),
            format!("{}\n", timezone),
            0o644,
        )
        .await?;
        info!("Set timezone to {}", timezone);
        Ok(())
    }

    async fn try_timedatectl(&self, timezone: &str) -> bool {
        match Command::new("timedatectl")
            .args(["set-timezone", timezone])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                info!("Timezone set via timedatectl");
                true
            }
            Ok(output) => {
                warn!(
                    "timedatectl failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                debug!("timedatectl not available: {}", e);
                false
            }
        }
    }
}
