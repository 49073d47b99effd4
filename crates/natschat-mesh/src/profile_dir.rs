use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const DEFAULT_PROFILE_DIR: &str = ".natschat";
const CONFIG_FILE: &str = "config.toml";
const DAEMON_LOG_FILE: &str = "natschat-node.log";

/// Return the default profile directory.
///
/// Priority: `$NATSCHAT_HOME` env var, then `~/.natschat`.
pub fn default_profile_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("NATSCHAT_HOME") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME env var not set")?;
    Ok(PathBuf::from(home).join(DEFAULT_PROFILE_DIR))
}

/// Ensure the profile directory exists with `0700` permissions.
pub fn ensure_profile_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    #[cfg(unix)]
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

pub fn config_path(profile: &Path) -> PathBuf {
    profile.join(CONFIG_FILE)
}

pub fn daemon_log_path(profile: &Path) -> PathBuf {
    profile.join(DAEMON_LOG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("sub/profile");
        ensure_profile_dir(&profile).unwrap();
        assert!(profile.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn profile_dir_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("perms");
        ensure_profile_dir(&profile).unwrap();
        let meta = std::fs::metadata(&profile).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }
}
