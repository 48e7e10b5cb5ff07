//! Configuration management commands.

use std::path::Path;

use anyhow::{Context, Result};
use vaultgrid_config::VaultGridConfig;

/// Show current configuration.
pub fn show(project: &Path, format: &str) -> Result<()> {
    let config =
        VaultGridConfig::load_from_dir(project).context("Failed to load configuration")?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{json}");
        }
        "toml" => {
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{toml_str}");
        }
        _ => {
            println!("VaultGrid Configuration");
            println!("=======================\n");

            println!("Server:");
            println!("  Host: {}", config.server.host);
            println!("  Zone: {}", config.server.zone);
            println!(
                "  Default resource: {}",
                config.server.default_resource.as_deref().unwrap_or("None")
            );
            println!();

            println!("Descriptors:");
            println!("  Logical capacity: {}", config.descriptors.logical_capacity);
            println!(
                "  Physical capacity: {}",
                config.descriptors.physical_capacity
            );
            println!();

            println!("Transfer:");
            println!(
                "  Single buffer limit: {} MB",
                config.transfer.max_size_for_single_buffer_mb
            );
            println!();

            println!("Vault:");
            println!("  Scheme: {}", config.vault.scheme);
            println!("  Add user name: {}", config.vault.add_user_name);
            println!("  Trim dir count: {}", config.vault.trim_dir_count);
            println!("  Max path length: {}", config.vault.max_path_len);
            println!("  Orphan dir: {}", config.vault.orphan_dir);
            println!("  History dir: {}", config.vault.history_dir);
            println!("  Trash segment: {}", config.vault.trash_segment);
            println!();

            println!("Quota:");
            println!("  Enforce: {}", config.quota.enforce);
            println!();

            println!("Resources: {}", config.resources.len());
        }
    }

    Ok(())
}

/// Validate configuration files.
pub fn validate(project: &Path) -> Result<()> {
    println!("Validating configuration in {}...", project.display());

    match super::load_config(project) {
        Ok(config) => {
            println!(
                "✓ Configuration is valid ({} resources)",
                config.resources.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed:");
            println!("  {e:#}");
            Err(e)
        }
    }
}
