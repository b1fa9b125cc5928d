//! Semaphore file handling
//!
//! Semaphores record that a named unit of work completed:
//! - once-per-instance: `instances/<id>/sem/<name>`, naturally reset by a new instance id
//! - once: `<cloud_dir>/sem/<name>.once`, sticky across instance changes
//! - always: never consulted
//!
//! A missing semaphore only causes a harmless re-run, so writes go through a
//! temp file and rename and a failed write is logged instead of propagated.

use crate::CloudInitError;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tracing::{debug, warn};

/// How often a module or part handler should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    /// Once per unique instance id
    PerInstance,
    /// Every invocation, no semaphore
    PerAlways,
    /// Once ever, across instance changes
    PerOnce,
}

impl Frequency {
    /// Canonical string as written in config and passed to part handlers
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerInstance => "once-per-instance",
            Self::PerAlways => "always",
            Self::PerOnce => "once",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = CloudInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "once-per-instance" | "per-instance" | "per_instance" | "instance" => {
                Ok(Self::PerInstance)
            }
            "always" | "per-always" | "per_always" => Ok(Self::PerAlways),
            "once" | "per-once" | "per_once" => Ok(Self::PerOnce),
            other => Err(CloudInitError::InvalidData(format!(
                "Unknown frequency '{other}'"
            ))),
        }
    }
}

/// File-backed semaphore store
#[derive(Debug, Clone)]
pub struct SemaphoreManager {
    /// Per-instance directory (`/var/lib/cloud/instances/<id>/sem`), unset before
    /// an instance is materialized
    instance_sem_dir: Option<PathBuf>,
    /// Global directory for once semaphores (`/var/lib/cloud/sem`)
    global_sem_dir: PathBuf,
}

impl SemaphoreManager {
    pub fn new(instance_sem_dir: Option<PathBuf>, global_sem_dir: impl AsRef<Path>) -> Self {
        Self {
            instance_sem_dir,
            global_sem_dir: global_sem_dir.as_ref().to_path_buf(),
        }
    }

    /// Semaphore file for `name`, or None when the frequency is untracked
    fn sem_path(&self, name: &str, freq: Frequency) -> Option<PathBuf> {
        match freq {
            Frequency::PerAlways => None,
            Frequency::PerInstance => self.instance_sem_dir.as_ref().map(|d| d.join(name)),
            Frequency::PerOnce => Some(self.global_sem_dir.join(format!("{name}.once"))),
        }
    }

    /// True iff the semaphore for `(name, freq)` exists
    ///
    /// Both the canonical name and the legacy hyphenated spelling are checked.
    pub fn has_run(&self, name: &str, freq: Frequency) -> bool {
        let canonical = canon_sem_name(name);
        let mut names = vec![canonical.as_str()];
        if canonical != name {
            names.push(name);
        }
        names.into_iter().any(|n| {
            self.sem_path(n, freq).is_some_and(|p| {
                let exists = p.exists();
                debug!(
                    "Semaphore check for {} ({}): {} -> {}",
                    n,
                    freq,
                    p.display(),
                    if exists { "ran" } else { "not ran" }
                );
                exists
            })
        })
    }

    /// Record a completed run of `(name, freq)`
    pub async fn mark_ran(&self, name: &str, freq: Frequency) -> Result<(), CloudInitError> {
        let Some(path) = self.sem_path(&canon_sem_name(name), freq) else {
            return Ok(());
        };
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        fs::create_dir_all(parent).await?;

        let contents = format!("{}: {}\n", std::process::id(), timestamp());
        let tmp = parent.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));
        fs::write(&tmp, contents).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Created semaphore: {}", path.display());
        Ok(())
    }

    /// Clear a semaphore so the work runs again
    pub async fn clear(&self, name: &str, freq: Frequency) -> Result<(), CloudInitError> {
        for n in [canon_sem_name(name), name.to_string()] {
            if let Some(path) = self.sem_path(&n, freq)
                && path.exists()
            {
                fs::remove_file(&path).await?;
                debug!("Removed semaphore: {}", path.display());
            }
        }
        Ok(())
    }

    /// List the per-instance semaphores
    pub async fn list(&self) -> Result<Vec<String>, CloudInitError> {
        let mut semaphores = Vec::new();
        let Some(dir) = &self.instance_sem_dir else {
            return Ok(semaphores);
        };

        if dir.exists() {
            let mut entries = fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str()
                    && !name.starts_with('.')
                {
                    semaphores.push(name.to_string());
                }
            }
        }

        semaphores.sort();
        Ok(semaphores)
    }

    /// Run `work` at most once per `(name, freq)` identity
    ///
    /// Returns `(true, Some(result))` when the work ran, `(false, None)` when
    /// a semaphore says it already ran. `PerAlways` never consults the store.
    /// Errors from `work` propagate and leave no semaphore behind, so the
    /// next invocation retries. When there is no instance directory yet the
    /// work runs untracked.
    pub async fn run_once<T, F>(
        &self,
        name: &str,
        freq: Frequency,
        work: F,
    ) -> Result<(bool, Option<T>), CloudInitError>
    where
        F: Future<Output = Result<T, CloudInitError>>,
    {
        if freq != Frequency::PerAlways && self.has_run(name, freq) {
            debug!("{} already ran (freq={})", name, freq);
            return Ok((false, None));
        }

        if freq == Frequency::PerInstance && self.instance_sem_dir.is_none() {
            debug!("No instance semaphore dir; running {} untracked", name);
        } else {
            debug!("Running {} using lock (freq={})", name, freq);
        }

        let result = work.await?;

        if let Err(e) = self.mark_ran(name, freq).await {
            warn!("Failed to write semaphore for {} ({}): {}", name, freq, e);
        }

        Ok((true, Some(result)))
    }
}

/// Semaphore names use underscores; module names may arrive with hyphens
pub fn canon_sem_name(name: &str) -> String {
    name.replace('-', "_")
}

fn timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    format!("{}.{:06}", duration.as_secs(), duration.subsec_micros())
}
