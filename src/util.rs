//! Small filesystem helpers shared by handlers, modules and stages

use crate::CloudInitError;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Write `content` to `path`, creating parent directories and applying `mode`
pub async fn write_file(
    path: impl AsRef<Path>,
    content: impl AsRef<[u8]>,
    mode: u32,
) -> Result<(), CloudInitError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, content).await?;
    set_mode(path, mode).await?;
    debug!("Wrote {} (mode {:o})", path.display(), mode);
    Ok(())
}

/// Apply unix permission bits
pub async fn set_mode(path: &Path, mode: u32) -> Result<(), CloudInitError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Read a file, returning None when it does not exist
pub async fn read_optional(path: impl AsRef<Path>) -> Result<Option<Vec<u8>>, CloudInitError> {
    match fs::read(path.as_ref()).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read a text file and trim it, treating missing or empty files as None
pub async fn read_trimmed(path: impl AsRef<Path>) -> Result<Option<String>, CloudInitError> {
    Ok(read_optional(path).await?.and_then(|data| {
        let text = String::from_utf8_lossy(&data).trim().to_string();
        (!text.is_empty()).then_some(text)
    }))
}

/// Remove a file if present
pub async fn remove_if_exists(path: impl AsRef<Path>) -> Result<(), CloudInitError> {
    match fs::remove_file(path.as_ref()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Replace `link` with a symlink pointing at `target`
pub async fn sym_link(target: &Path, link: &Path) -> Result<(), CloudInitError> {
    if link.exists() || link.is_symlink() {
        fs::remove_file(link).await.ok();
    }
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).await?;
    }

    #[cfg(unix)]
    fs::symlink(target, link).await?;

    #[cfg(not(unix))]
    fs::write(link, target.to_string_lossy().as_bytes()).await?;

    debug!("Linked {} -> {}", link.display(), target.display());
    Ok(())
}

/// Seconds since the epoch as a float, the unit used in status files
pub fn epoch_seconds() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_file_creates_parents_and_mode() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a/b/c.txt");
        write_file(&path, "hi", 0o600).await.unwrap();

        assert_eq!(fs::read_to_string(&path).await.unwrap(), "hi");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).await.unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_read_optional_missing() {
        let temp = TempDir::new().unwrap();
        assert!(read_optional(temp.path().join("nope")).await.unwrap().is_none());
        assert!(read_trimmed(temp.path().join("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sym_link_replaces_existing() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::create_dir_all(&a).await.unwrap();
        fs::create_dir_all(&b).await.unwrap();
        let link = temp.path().join("link");

        sym_link(&a, &link).await.unwrap();
        sym_link(&b, &link).await.unwrap();
        assert_eq!(fs::read_link(&link).await.unwrap(), b);
    }
}
