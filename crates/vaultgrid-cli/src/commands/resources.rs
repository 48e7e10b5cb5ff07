//! Resource listing.

use std::path::Path;

use anyhow::Result;

pub fn run(project: &Path) -> Result<()> {
    let config = super::load_config(project)?;
    let resources = config.resource_identities();

    if resources.is_empty() {
        println!("No resources configured.");
        return Ok(());
    }

    println!(
        "{:<16} {:<12} {:<8} {:<11} {:<16} VAULT",
        "NAME", "GROUP", "CLASS", "CATEGORY", "HOST"
    );
    for resource in &resources {
        println!(
            "{:<16} {:<12} {:<8} {:<11} {:<16} {}",
            resource.name.as_str(),
            resource.group.as_ref().map_or("-", |g| g.as_str()),
            resource.class.as_str(),
            resource.category.to_string(),
            resource.host,
            resource.vault_path.display()
        );
    }
    Ok(())
}
