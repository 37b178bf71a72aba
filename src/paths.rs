//! Application path management for portable and installed modes.
//!
//! - **Working-directory mode**: if `config.yaml` exists in the current
//!   directory, everything lives next to it. This is how the station is
//!   normally run from a checkout with its `library.tsv`.
//! - **Portable mode**: a `.portable` marker next to the executable keeps
//!   all files beside the executable.
//! - **Installed mode** (default): files live in the platform data
//!   directory (`%APPDATA%\TempoSteps`, `~/.local/share/TempoSteps`).

use std::path::{Path, PathBuf};
use tracing::debug;

/// Application name used for directories in installed mode
const APP_NAME: &str = "TempoSteps";

/// Application paths for config, catalog, and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config: PathBuf,
    pub logs_dir: PathBuf,
    /// Whether files sit next to the config in a user-chosen directory
    pub is_portable: bool,
}

impl AppPaths {
    /// Detect the appropriate paths based on environment.
    ///
    /// Called before logging is initialized.
    pub fn detect() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        if cwd.join("config.yaml").exists() {
            return Self::rooted_at(&cwd, true);
        }

        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));

        if exe_dir.join(".portable").exists() {
            return Self::rooted_at(&exe_dir, true);
        }

        let data_dir = dirs::data_dir().unwrap_or(exe_dir).join(APP_NAME);
        Self::rooted_at(&data_dir, false)
    }

    fn rooted_at(base: &Path, is_portable: bool) -> Self {
        Self {
            config: base.join("config.yaml"),
            logs_dir: base.join("logs"),
            is_portable,
        }
    }

    /// Get the base directory (for displaying in logs)
    pub fn base_dir(&self) -> PathBuf {
        self.config
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolve a configured path relative to the base directory
    pub fn resolve(&self, configured: &str) -> PathBuf {
        let path = Path::new(configured);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    /// Ensure the logs directory exists.
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        if !self.logs_dir.exists() {
            debug!("Creating logs directory: {}", self.logs_dir.display());
            std::fs::create_dir_all(&self.logs_dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_layout() {
        let paths = AppPaths::rooted_at(Path::new("station"), true);

        assert!(paths.is_portable);
        assert_eq!(paths.config, PathBuf::from("station/config.yaml"));
        assert_eq!(paths.logs_dir, PathBuf::from("station/logs"));
        assert_eq!(paths.base_dir(), PathBuf::from("station"));
    }

    #[test]
    fn test_resolve() {
        let paths = AppPaths::rooted_at(Path::new("station"), false);

        assert_eq!(paths.resolve("library.tsv"), PathBuf::from("station/library.tsv"));
        #[cfg(unix)]
        assert_eq!(paths.resolve("/srv/library.tsv"), PathBuf::from("/srv/library.tsv"));
    }

    #[test]
    fn test_ensure_directories() {
        let temp = tempfile::TempDir::new().unwrap();
        let paths = AppPaths::rooted_at(temp.path(), true);

        paths.ensure_directories().unwrap();
        assert!(paths.logs_dir.is_dir());
    }
}
