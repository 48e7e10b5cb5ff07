//! Where configuration files live.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const APP: &str = "vaultgrid";

/// Configuration file locations for one user and one project.
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("org", "VaultGrid", APP),
        }
    }

    /// `config.toml` in the user's XDG config directory.
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoUserConfigDir { app: APP })
    }

    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("vaultgrid.toml")
    }

    /// Per-checkout overrides, kept out of version control.
    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("vaultgrid.local.toml")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
