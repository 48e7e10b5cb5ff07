//! Configuration management for VaultGrid
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (VGRID_* prefix, `__` between section and key)
//! 2. vaultgrid.local.toml (gitignored, local overrides)
//! 3. vaultgrid.toml (git-tracked, project config)
//! 4. ~/.config/vaultgrid/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use vaultgrid_types::{ResourceCategory, ResourceClass, ResourceIdentity, VaultScheme};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Descriptor slots below this index are reserved and never handed out.
pub const RESERVED_DESCRIPTORS: usize = 3;

/// Main VaultGrid configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultGridConfig {
    pub server: ServerConfig,
    pub descriptors: DescriptorConfig,
    pub transfer: TransferConfig,
    pub vault: VaultConfig,
    pub quota: QuotaConfig,
    pub resources: Vec<ResourceDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name this node answers to.
    pub host: String,
    /// Local zone name.
    pub zone: String,
    /// Resource used for creates that name none.
    pub default_resource: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            zone: "tempZone".to_string(),
            default_resource: None,
        }
    }
}

/// Sizes of the two descriptor tables, reserved slots included.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    pub logical_capacity: usize,
    pub physical_capacity: usize,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            logical_capacity: 1026,
            physical_capacity: 1026,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Objects up to this size travel inline with the request.
    pub max_size_for_single_buffer_mb: u64,
}

impl TransferConfig {
    pub fn single_buffer_bytes(&self) -> u64 {
        self.max_size_for_single_buffer_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_size_for_single_buffer_mb: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub scheme: VaultScheme,
    pub add_user_name: bool,
    /// Leading logical segments dropped by the graft scheme.
    pub trim_dir_count: usize,
    pub max_path_len: usize,
    /// Directory (under each vault root) receiving orphaned files.
    pub orphan_dir: String,
    /// Directory (under each vault root) receiving superseded replicas.
    pub history_dir: String,
    /// Zone-level collection holding deleted objects.
    pub trash_segment: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            scheme: VaultScheme::Graft,
            add_user_name: false,
            trim_dir_count: 1,
            max_path_len: 1088,
            orphan_dir: "orphan".to_string(),
            history_dir: "replica".to_string(),
            trash_segment: "trash".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub enforce: bool,
}

/// Resource definition from config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub category: Option<ResourceCategory>,
    #[serde(default)]
    pub class: ResourceClass,
    pub vault_path: PathBuf,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl ResourceDefinition {
    pub fn to_identity(&self) -> ResourceIdentity {
        let mut identity =
            ResourceIdentity::new(self.name.as_str(), &self.host, self.class, &self.vault_path);
        if let Some(group) = &self.group {
            identity = identity.with_group(group.as_str());
        }
        if let Some(category) = self.category {
            identity = identity.with_category(category);
        }
        identity
    }
}

impl VaultGridConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Resource identities for every configured resource.
    pub fn resource_identities(&self) -> Vec<ResourceIdentity> {
        self.resources
            .iter()
            .map(ResourceDefinition::to_identity)
            .collect()
    }

    /// Resolve relative vault paths against the project directory
    fn resolve_paths(&mut self, project_dir: &Path) {
        for resource in &mut self.resources {
            if resource.vault_path.is_relative() {
                resource.vault_path = project_dir.join(&resource.vault_path);
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.descriptors.logical_capacity <= RESERVED_DESCRIPTORS {
            return Err(ConfigError::Invalid(format!(
                "descriptors.logical_capacity must exceed {RESERVED_DESCRIPTORS}"
            )));
        }
        if self.descriptors.physical_capacity <= RESERVED_DESCRIPTORS {
            return Err(ConfigError::Invalid(format!(
                "descriptors.physical_capacity must exceed {RESERVED_DESCRIPTORS}"
            )));
        }
        if self.vault.max_path_len == 0 {
            return Err(ConfigError::Invalid(
                "vault.max_path_len cannot be zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for resource in &self.resources {
            if !names.insert(resource.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate resource name: {}",
                    resource.name
                )));
            }
            if resource.vault_path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "resource {} has an empty vault_path",
                    resource.name
                )));
            }
        }

        // Archive and bundle copies are only ever read through a cache sibling
        for staged in self.resources.iter().filter(|r| r.class.requires_staging()) {
            let Some(group) = &staged.group else {
                return Err(ConfigError::Invalid(format!(
                    "{} resource {} must belong to a resource group",
                    staged.class, staged.name
                )));
            };
            let has_cache = self
                .resources
                .iter()
                .any(|r| r.class == ResourceClass::Cache && r.group.as_ref() == Some(group));
            if !has_cache {
                return Err(ConfigError::Invalid(format!(
                    "resource group {group} has a {} member but no cache member",
                    staged.class
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(name: &str, group: Option<&str>, class: ResourceClass) -> ResourceDefinition {
        ResourceDefinition {
            name: name.to_string(),
            group: group.map(str::to_string),
            host: default_host(),
            category: None,
            class,
            vault_path: PathBuf::from(format!("/var/vault/{name}")),
        }
    }

    #[test]
    fn test_default_config() {
        let config = VaultGridConfig::default();
        assert_eq!(config.server.zone, "tempZone");
        assert_eq!(config.descriptors.logical_capacity, 1026);
        assert_eq!(config.vault.trim_dir_count, 1);
        assert_eq!(config.transfer.single_buffer_bytes(), 32 * 1024 * 1024);
        assert!(!config.quota.enforce);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_tiny_tables() {
        let mut config = VaultGridConfig::default();
        config.descriptors.logical_capacity = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_requires_cache_for_archive() {
        let mut config = VaultGridConfig::default();
        config.resources = vec![resource("arch", Some("pair"), ResourceClass::Archive)];
        assert!(config.validate().is_err());

        config
            .resources
            .push(resource("cache", Some("pair"), ResourceClass::Cache));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_requires_cache_for_bundle() {
        let mut config = VaultGridConfig::default();
        config.resources = vec![resource("bun", None, ResourceClass::Bundle)];
        assert!(config.validate().is_err());

        config.resources = vec![
            resource("bun", Some("mixed"), ResourceClass::Bundle),
            resource("cache", Some("mixed"), ResourceClass::Cache),
        ];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_duplicate_names() {
        let mut config = VaultGridConfig::default();
        config.resources = vec![
            resource("demo", None, ResourceClass::Normal),
            resource("demo", None, ResourceClass::Normal),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_definition_to_identity() {
        let identity = resource("cache", Some("pair"), ResourceClass::Cache).to_identity();
        assert_eq!(identity.name.as_str(), "cache");
        assert_eq!(identity.group.as_ref().map(|g| g.as_str()), Some("pair"));
        assert_eq!(identity.category, ResourceCategory::FileSystem);
        assert_eq!(identity.host, "localhost");
    }

    #[test]
    fn test_resolve_relative_vaults() {
        let mut config = VaultGridConfig::default();
        let mut def = resource("demo", None, ResourceClass::Normal);
        def.vault_path = PathBuf::from("vault/demo");
        config.resources.push(def);
        config.resolve_paths(Path::new("/srv/grid"));
        assert_eq!(
            config.resources[0].vault_path,
            PathBuf::from("/srv/grid/vault/demo")
        );
    }
}
