//! Data object transfer and listing.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::DateTime;
use vaultgrid_core::{
    Catalog, LogicalHandle, OpenEngine, OpenRequest, PhysicalOpenPolicy, ReplicaSelector,
    Session,
};
use vaultgrid_types::{LogicalPath, ReplicaRecord};

/// Bytes moved per read call.
const CHUNK: usize = 1024 * 1024;

/// Store a local file as a data object.
pub fn put(
    project: &Path,
    logical_path: &str,
    source: &Path,
    resource: Option<&str>,
    catalog_path: &Path,
    user: &str,
) -> Result<()> {
    let config = super::load_config(project)?;
    let catalog = Arc::new(super::open_catalog(catalog_path)?);
    let engine = super::build_engine(&config, Arc::clone(&catalog));
    let path = LogicalPath::new(logical_path)?;
    let data = std::fs::read(source)
        .with_context(|| format!("Failed to read {}", source.display()))?;

    let mut request = OpenRequest::create(path.clone())
        .truncating()
        .with_data_size(data.len() as u64)
        .with_physical_open(PhysicalOpenPolicy::Always);
    if let Some(resource) = resource {
        request = request.on_resource(resource);
    }

    let mut session = engine.session(user);
    let outcome = engine.open(&mut session, request)?;
    let written = write_all(&engine, &mut session, outcome.handle, &data);
    let closed = engine.close(&mut session, outcome.handle);
    super::save_catalog(&catalog, catalog_path)?;
    written?;
    closed?;

    println!("{path}: {} bytes", data.len());
    Ok(())
}

fn write_all(
    engine: &OpenEngine,
    session: &mut Session,
    handle: LogicalHandle,
    mut data: &[u8],
) -> Result<()> {
    while !data.is_empty() {
        let n = engine.write(session, handle, data)?;
        if n == 0 {
            anyhow::bail!("driver accepted no bytes");
        }
        data = &data[n..];
    }
    Ok(())
}

/// Write a data object to stdout.
pub fn get(
    project: &Path,
    logical_path: &str,
    resource: Option<&str>,
    catalog_path: &Path,
    user: &str,
) -> Result<()> {
    let config = super::load_config(project)?;
    let catalog = Arc::new(super::open_catalog(catalog_path)?);
    let engine = super::build_engine(&config, Arc::clone(&catalog));
    let path = LogicalPath::new(logical_path)?;

    let mut request = OpenRequest::read(path).with_physical_open(PhysicalOpenPolicy::Always);
    if let Some(resource) = resource {
        request = request.on_resource(resource);
    }

    let mut session = engine.session(user);
    let outcome = engine.open(&mut session, request)?;
    let copied = copy_out(&engine, &session, outcome.handle);
    let closed = engine.close(&mut session, outcome.handle);
    // Staging may have registered a cache copy
    super::save_catalog(&catalog, catalog_path)?;
    copied?;
    closed?;
    Ok(())
}

fn copy_out(engine: &OpenEngine, session: &Session, handle: LogicalHandle) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    let mut buf = vec![0u8; CHUNK];
    let mut offset = 0u64;
    loop {
        let n = engine.read_at(session, handle, offset, &mut buf)?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n])?;
        offset += n as u64;
    }
    stdout.flush()?;
    Ok(())
}

/// List the replicas of a data object.
pub fn ls(logical_path: &str, catalog_path: &Path) -> Result<()> {
    let catalog = super::open_catalog(catalog_path)?;
    let path = LogicalPath::new(logical_path)?;
    let replicas = catalog.find_replicas(&path, &ReplicaSelector::default())?;

    if replicas.is_empty() {
        anyhow::bail!("No data object at {path}");
    }

    println!(
        "{:<4} {:<16} {:<14} {:>12} {:<20} PHYSICAL PATH",
        "#", "RESOURCE", "STATUS", "SIZE", "MODIFIED"
    );
    for replica in &replicas {
        println!(
            "{:<4} {:<16} {:<14} {:>12} {:<20} {}",
            replica.replica_number.to_string(),
            replica.resource.name.as_str(),
            replica.status.to_string(),
            replica.size.map_or("-".to_string(), |s| s.to_string()),
            modified(replica),
            replica.physical_path.display()
        );
    }
    Ok(())
}

fn modified(replica: &ReplicaRecord) -> String {
    let nanos = replica.modified.as_nanos();
    if nanos == 0 {
        return "-".to_string();
    }
    DateTime::from_timestamp_nanos(nanos as i64)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
