//! Layered configuration loading.
//!
//! Later sources override earlier ones: built-in defaults, the user file,
//! `vaultgrid.toml`, `vaultgrid.local.toml`, then `VGRID_*` variables.

use crate::{Paths, VaultGridConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "VGRID".to_string(),
            include_user_config: true,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip ~/.config/vaultgrid/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Merges every source, resolves relative vault paths against the
    /// project directory and validates the result.
    pub fn load(self) -> Result<VaultGridConfig> {
        let mut builder = config::Config::builder();

        let defaults = VaultGridConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        if self.include_user_config {
            let paths = Paths::new();
            if let Ok(user_config_file) = paths.user_config_file() {
                if user_config_file.exists() {
                    builder = builder.add_source(
                        config::File::from(user_config_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }
        }

        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(
                config::File::from(project_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // VGRID_VAULT__TRIM_DIR_COUNT=2 -> vault.trim_dir_count
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut grid_config: VaultGridConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        grid_config.resolve_paths(&self.project_dir);
        grid_config
            .validate()
            .context("Configuration failed validation")?;

        Ok(grid_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use vaultgrid_types::{ResourceClass, VaultScheme};

    fn loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(dir)
            .with_env_prefix("VGRID_LOADER_TEST")
            .without_user_config()
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path())
            .load()
            .expect("Failed to load config");

        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.vault.max_path_len, 1088);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[server]
zone = "labZone"
default_resource = "demoResc"

[vault]
scheme = "random"
add_user_name = true

[quota]
enforce = true

[[resources]]
name = "demoResc"
vault_path = "vault/demo"

[[resources]]
name = "cacheResc"
group = "pair"
class = "cache"
vault_path = "/srv/cache"

[[resources]]
name = "archResc"
group = "pair"
class = "archive"
vault_path = "/srv/archive"
"#;
        fs::write(project_dir.join("vaultgrid.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.server.zone, "labZone");
        assert_eq!(config.server.default_resource.as_deref(), Some("demoResc"));
        assert_eq!(config.vault.scheme, VaultScheme::Random);
        assert!(config.vault.add_user_name);
        assert!(config.quota.enforce);
        assert_eq!(config.resources.len(), 3);
        assert_eq!(config.resources[2].class, ResourceClass::Archive);
        // Relative vault paths resolve against the project directory
        assert_eq!(
            config.resources[0].vault_path,
            project_dir.join("vault/demo")
        );
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("vaultgrid.toml"),
            r"
[descriptors]
logical_capacity = 64
",
        )
        .expect("Failed to write project config");

        fs::write(
            project_dir.join("vaultgrid.local.toml"),
            r"
[descriptors]
logical_capacity = 16
",
        )
        .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.descriptors.logical_capacity, 16);
        assert_eq!(config.descriptors.physical_capacity, 1026);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(
            project_dir.join("vaultgrid.toml"),
            r"
[descriptors]
physical_capacity = 2
",
        )
        .expect("Failed to write config");

        let err = loader(project_dir).load().unwrap_err();
        assert!(format!("{err:#}").contains("physical_capacity"));
    }
}
