//! CLI command implementations.

pub mod config;
pub mod object;
pub mod reconcile;
pub mod resources;
pub mod vault_path;
pub mod version;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use vaultgrid_config::VaultGridConfig;
use vaultgrid_core::{
    DriverRegistry, EngineSettings, LocalArchive, MemoryCatalog, OpenEngine, QuotaPolicy,
    ResourceTable, StaticPolicy, VaultLayout, VaultPathPolicy,
};
use vaultgrid_io::{FileDriver, LocalDriver};
use vaultgrid_types::{ResourceCategory, ResourceIdentity, ResourceName};

/// Loads and validates the configuration of `project`.
pub fn load_config(project: &Path) -> Result<VaultGridConfig> {
    let config =
        VaultGridConfig::load_from_dir(project).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

pub fn engine_settings(config: &VaultGridConfig) -> EngineSettings {
    EngineSettings {
        zone: config.server.zone.clone(),
        single_buffer_bytes: config.transfer.single_buffer_bytes(),
        max_path_len: config.vault.max_path_len,
        trash_segment: config.vault.trash_segment.clone(),
        layout: VaultLayout {
            orphan_dir: config.vault.orphan_dir.clone(),
            history_dir: config.vault.history_dir.clone(),
            ..VaultLayout::default()
        },
        logical_capacity: config.descriptors.logical_capacity,
        physical_capacity: config.descriptors.physical_capacity,
    }
}

pub fn vault_path_policy(config: &VaultGridConfig) -> VaultPathPolicy {
    VaultPathPolicy {
        scheme: config.vault.scheme,
        add_user_name: config.vault.add_user_name,
        trim_count: config.vault.trim_dir_count,
    }
}

pub fn policy(config: &VaultGridConfig) -> StaticPolicy {
    let quota = if config.quota.enforce {
        QuotaPolicy::On
    } else {
        QuotaPolicy::Off
    };
    let policy = StaticPolicy::new(vault_path_policy(config)).with_quota(quota);
    match &config.server.default_resource {
        Some(resource) => policy.with_default_resource(resource.as_str()),
        None => policy,
    }
}

/// Engine over the configured resources, served by local drivers.
pub fn build_engine(config: &VaultGridConfig, catalog: Arc<MemoryCatalog>) -> OpenEngine {
    let driver: Arc<dyn FileDriver> = Arc::new(LocalDriver::new(config.server.host.as_str()));
    let drivers = DriverRegistry::new()
        .with_driver(ResourceCategory::FileSystem, Arc::clone(&driver))
        .with_driver(ResourceCategory::Structured, driver);
    OpenEngine::new(
        engine_settings(config),
        ResourceTable::new(config.resource_identities()),
        catalog,
        Arc::new(policy(config)),
        drivers,
        Arc::new(LocalArchive::new(config.server.host.as_str())),
    )
}

/// Opens a catalog snapshot, starting empty when the file does not exist yet.
pub fn open_catalog(path: &Path) -> Result<MemoryCatalog> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no catalog snapshot, starting empty");
        return Ok(MemoryCatalog::new());
    }
    MemoryCatalog::load_snapshot(path)
        .with_context(|| format!("Failed to load catalog {}", path.display()))
}

pub fn save_catalog(catalog: &MemoryCatalog, path: &Path) -> Result<()> {
    catalog
        .save_snapshot(path)
        .with_context(|| format!("Failed to save catalog {}", path.display()))
}

pub fn find_resource(config: &VaultGridConfig, name: &str) -> Result<ResourceIdentity> {
    let name = ResourceName::from(name);
    config
        .resource_identities()
        .into_iter()
        .find(|r| r.name == name)
        .with_context(|| format!("Unknown resource: {name}"))
}
