//! Orphan reconciliation of one physical path.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use vaultgrid_core::{ReconcileOutcome, VaultPathResolver};

pub fn run(
    project: &Path,
    physical_path: &Path,
    resource: &str,
    catalog_path: &Path,
    user: &str,
) -> Result<()> {
    let config = super::load_config(project)?;
    let resource = super::find_resource(&config, resource)?;
    let catalog = Arc::new(super::open_catalog(catalog_path)?);
    let engine = super::build_engine(&config, Arc::clone(&catalog));

    let physical = std::path::absolute(physical_path)?;
    if !VaultPathResolver::is_in_vault(&resource, &physical) {
        bail!(
            "{} is not inside the vault of {} ({})",
            physical.display(),
            resource.name,
            resource.vault_path.display()
        );
    }

    match engine.orphans().reconcile(&resource, &physical, user)? {
        ReconcileOutcome::Vacant => println!("{}: nothing there", physical.display()),
        ReconcileOutcome::Relocated { to } => {
            println!("{}: orphan moved to {}", physical.display(), to.display());
            // Meaningful for graft-scheme vaults only
            if let Ok(logical) = VaultPathResolver::logical_path_from_physical(
                &resource,
                &config.server.zone,
                &physical,
            ) {
                println!("  no replica of {logical} was registered there");
            }
        }
        ReconcileOutcome::HistoryMoved { replica, to } => {
            println!(
                "{}: replica {} of {} moved to {}",
                physical.display(),
                replica.replica_number,
                replica.logical_path,
                to.display()
            );
            super::save_catalog(&catalog, catalog_path)?;
        }
        ReconcileOutcome::InUse { replica } => {
            println!(
                "{}: in use by replica {} of {}",
                physical.display(),
                replica.replica_number,
                replica.logical_path
            );
        }
    }
    Ok(())
}
