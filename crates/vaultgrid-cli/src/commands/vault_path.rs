//! Vault path derivation.

use std::path::Path;

use anyhow::Result;
use vaultgrid_core::VaultPathResolver;
use vaultgrid_types::{LogicalPath, VaultScheme};

/// Command-line overrides of the configured naming policy.
#[derive(Debug, Default)]
pub struct Overrides {
    pub scheme: Option<VaultScheme>,
    pub trim: Option<usize>,
    pub add_user: bool,
}

pub fn run(
    project: &Path,
    logical_path: &str,
    resource: &str,
    user: &str,
    overrides: Overrides,
) -> Result<()> {
    let config = super::load_config(project)?;
    let resource = super::find_resource(&config, resource)?;
    let path = LogicalPath::new(logical_path)?;

    let mut policy = super::vault_path_policy(&config);
    if let Some(scheme) = overrides.scheme {
        policy.scheme = scheme;
    }
    if let Some(trim) = overrides.trim {
        policy.trim_count = trim;
    }
    policy.add_user_name |= overrides.add_user;

    let resolver = VaultPathResolver::new(config.vault.max_path_len, &config.vault.trash_segment);
    let physical = resolver.resolve(&policy, &resource, &path, user)?;
    println!("{}", physical.display());
    Ok(())
}
