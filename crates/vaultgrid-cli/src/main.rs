//! VaultGrid operator CLI.
//!
//! Inspects configuration and resources, derives vault paths, reconciles
//! stray files and moves data objects in and out of a single-node grid
//! backed by a catalog snapshot.
//!
//! # Quick Start
//!
//! ```bash
//! # Show the effective configuration of ./grid
//! vaultgrid --project ./grid config show
//!
//! # Store a file as /tempZone/home/alice/report.pdf on resource demo
//! vaultgrid --project ./grid put /tempZone/home/alice/report.pdf ./report.pdf --resource demo
//!
//! # List its replicas
//! vaultgrid --project ./grid ls /tempZone/home/alice/report.pdf
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use vaultgrid_types::VaultScheme;

/// VaultGrid - replica resolution and vault management for a data grid.
#[derive(Parser)]
#[command(name = "vaultgrid")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory holding vaultgrid.toml.
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Configuration commands.
    #[command(subcommand)]
    Config(ConfigCommands),

    /// List configured resources.
    Resources,

    /// Derive the physical path a new replica would get.
    VaultPath {
        /// Logical path of the data object.
        logical_path: String,

        /// Resource the replica would live on.
        #[arg(short, long)]
        resource: String,

        /// Requesting user.
        #[arg(short, long, default_value = "rods")]
        user: String,

        /// Override the configured naming scheme (graft, random).
        #[arg(long)]
        scheme: Option<VaultScheme>,

        /// Override the configured number of trimmed segments.
        #[arg(long)]
        trim: Option<usize>,

        /// Insert the user name after the vault root.
        #[arg(long)]
        add_user: bool,
    },

    /// Reconcile a physical path against the catalog.
    Reconcile {
        /// Physical path inside the resource's vault.
        physical_path: PathBuf,

        /// Resource owning the vault.
        #[arg(short, long)]
        resource: String,

        /// Catalog snapshot file.
        #[arg(short, long, default_value = "catalog.json")]
        catalog: PathBuf,

        /// Requesting user.
        #[arg(short, long, default_value = "rods")]
        user: String,
    },

    /// Store a local file as a data object.
    Put {
        /// Logical path of the data object.
        logical_path: String,

        /// Local file to upload.
        source: PathBuf,

        /// Destination resource or resource group.
        #[arg(short, long)]
        resource: Option<String>,

        /// Catalog snapshot file.
        #[arg(short, long, default_value = "catalog.json")]
        catalog: PathBuf,

        /// Requesting user.
        #[arg(short, long, default_value = "rods")]
        user: String,
    },

    /// Write a data object to stdout.
    Get {
        /// Logical path of the data object.
        logical_path: String,

        /// Read from this resource or resource group.
        #[arg(short, long)]
        resource: Option<String>,

        /// Catalog snapshot file.
        #[arg(short, long, default_value = "catalog.json")]
        catalog: PathBuf,

        /// Requesting user.
        #[arg(short, long, default_value = "rods")]
        user: String,
    },

    /// List the replicas of a data object.
    Ls {
        /// Logical path of the data object.
        logical_path: String,

        /// Catalog snapshot file.
        #[arg(short, long, default_value = "catalog.json")]
        catalog: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration.
    Show {
        /// Output format (text, json, toml).
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration files.
    Validate,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let project = cli.project;

    match cli.command {
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show { format } => commands::config::show(&project, &format),
            ConfigCommands::Validate => commands::config::validate(&project),
        },
        Commands::Resources => commands::resources::run(&project),
        Commands::VaultPath {
            logical_path,
            resource,
            user,
            scheme,
            trim,
            add_user,
        } => commands::vault_path::run(
            &project,
            &logical_path,
            &resource,
            &user,
            commands::vault_path::Overrides {
                scheme,
                trim,
                add_user,
            },
        ),
        Commands::Reconcile {
            physical_path,
            resource,
            catalog,
            user,
        } => commands::reconcile::run(&project, &physical_path, &resource, &catalog, &user),
        Commands::Put {
            logical_path,
            source,
            resource,
            catalog,
            user,
        } => commands::object::put(
            &project,
            &logical_path,
            &source,
            resource.as_deref(),
            &catalog,
            &user,
        ),
        Commands::Get {
            logical_path,
            resource,
            catalog,
            user,
        } => commands::object::get(&project, &logical_path, resource.as_deref(), &catalog, &user),
        Commands::Ls {
            logical_path,
            catalog,
        } => commands::object::ls(&logical_path, &catalog),
    }
}
