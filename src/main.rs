//! atomic-upgrade CLI
//!
//! Upgrades a btrfs-rooted system by building a new generation next to the
//! running one. Each generation is a `root-<id>` sub-volume with its own UKI in
//! `EFI/Linux`, so systemd-boot lists every generation that is still kept.
//!
//! # Usage
//!
//! ```bash
//! # Snapshot, upgrade, build the boot entry, collect old generations
//! atomic-upgrade upgrade
//!
//! # Show what an upgrade would do
//! atomic-upgrade upgrade --dry-run
//!
//! # Keep only the two newest generations besides the booted one
//! atomic-upgrade gc 2
//!
//! # Show generations, the booted one, and leftovers from failed runs
//! atomic-upgrade list
//!
//! # Retry the UKI for a generation whose build failed
//! atomic-upgrade rebuild-uki 20250101-120000
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use atomic_upgrade::config::{Config, DEFAULT_CONFIG_PATH};
use atomic_upgrade::generation::{GenerationId, Registry};
use atomic_upgrade::system::{fstab, SystemDetector, SystemTools, VolumeManager};
use atomic_upgrade::upgrade::{run_gc, Upgrade};

#[derive(Parser)]
#[command(name = "atomic-upgrade")]
#[command(author, version, about = "Atomic generation-based system upgrades", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Show debug output (external commands, probes)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and upgrade a new generation
    Upgrade {
        /// Validate and report without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete old generations
    Gc {
        /// Generations to keep besides the booted one (default: KEEP_GENERATIONS)
        keep: Option<u32>,

        /// Show what would be deleted
        #[arg(long)]
        dry_run: bool,
    },

    /// List generations
    List,

    /// Rebuild the boot entry of an existing generation
    RebuildUki {
        /// Generation id, e.g. 20250101-120000
        id: String,
    },

    /// Point the root entry of an fstab at another sub-volume
    Fstab {
        path: PathBuf,
        old: String,
        new: String,
    },

    /// Inspect the root device
    Rootdev {
        #[command(subcommand)]
        action: RootdevAction,
    },
}

#[derive(Subcommand)]
enum RootdevAction {
    /// Print the detected root device as JSON
    Detect,
    /// Print the root block device path
    Device,
    /// Print the kernel command line for booting a sub-volume
    Cmdline { subvolume: String },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
    atomic_upgrade::interrupt::install();

    let result = match cli.command {
        Commands::Upgrade { dry_run } => cmd_upgrade(&cli.config, dry_run),
        Commands::Gc { keep, dry_run } => cmd_gc(&cli.config, keep, dry_run),
        Commands::List => cmd_list(&cli.config),
        Commands::RebuildUki { id } => cmd_rebuild_uki(&cli.config, &id),
        Commands::Fstab { path, old, new } => cmd_fstab(&path, &old, &new),
        Commands::Rootdev { action } => cmd_rootdev(action),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Load and validate. Any problem is fatal before anything is touched.
fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_path(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn cmd_upgrade(config_path: &Path, dry_run: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let tools = SystemTools::default();
    Upgrade::new(&config, tools.host()).run(dry_run)?;
    Ok(())
}

fn cmd_gc(config_path: &Path, keep: Option<u32>, dry_run: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let keep = keep.unwrap_or(config.keep_generations);
    if keep < 1 {
        bail!("keep count must be at least 1");
    }
    let tools = SystemTools::default();
    run_gc(&config, tools.host(), keep as usize, dry_run)?;
    Ok(())
}

fn cmd_rebuild_uki(config_path: &Path, id: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let id = GenerationId::parse(id)?;
    let tools = SystemTools::default();
    Upgrade::new(&config, tools.host()).rebuild_uki(&id)?;
    Ok(())
}

/// Read-only overview. A config that fails validation is reported, not fatal.
fn cmd_list(config_path: &Path) -> Result<()> {
    let config = Config::load_path(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let tools = SystemTools::default();
    let volumes: &dyn VolumeManager = &tools.volumes;
    let registry = Registry::new(&config, volumes);

    println!("atomic-upgrade");
    println!("==============");
    println!();
    println!("Configuration ({}):", config_path.display());
    println!("  ESP:             {}", config.esp.display());
    println!("  Boot entries:    {}", registry.artifact_dir().display());
    println!("  Btrfs mount:     {}", config.btrfs_mount.display());
    println!("  Device:          {}", config.mapped_device().display());
    println!("  Kernel:          {}", config.kernel_pkg);
    println!("  Keep:            {}", config.keep_generations);
    if let Err(e) = config.validate() {
        println!("  [WARN] {}", e);
    }
    println!();

    let current = match registry.current_subvolume() {
        Ok(current) => {
            println!("Booted sub-volume: {}", current);
            Some(current)
        }
        Err(e) => {
            println!("Booted sub-volume: unknown ({})", e);
            None
        }
    };
    println!();

    let generations = registry.list_generations();
    let top_level_mounted = volumes.is_mounted(&config.btrfs_mount).unwrap_or(false);

    println!("Generations ({}):", generations.len());
    if generations.is_empty() {
        println!("  (none)");
    }
    for generation in &generations {
        let marker = match &current {
            Some(current) if generation.is_current(current) => " (current)",
            _ => "",
        };
        let missing = top_level_mounted
            && !config.btrfs_mount.join(&generation.subvolume).exists();
        let note = if missing { " [sub-volume missing]" } else { "" };
        println!("  {}{}{}", generation.id, marker, note);
    }

    if top_level_mounted {
        let orphans = registry.orphan_subvolumes(&config.btrfs_mount);
        if !orphans.is_empty() {
            println!();
            println!("Sub-volumes without a boot entry:");
            for orphan in orphans {
                println!("  {}", orphan);
            }
            println!("  Use 'atomic-upgrade rebuild-uki <ID>' or delete them by hand.");
        }
    } else {
        println!();
        println!(
            "[SKIP] Orphan check ({} not mounted)",
            config.btrfs_mount.display()
        );
    }

    Ok(())
}

fn cmd_fstab(path: &Path, old: &str, new: &str) -> Result<()> {
    fstab::update_mount_entry(path, old, new)?;
    println!("Updated {}: {} -> {}", path.display(), old, new);
    Ok(())
}

fn cmd_rootdev(action: RootdevAction) -> Result<()> {
    let detector = SystemDetector::default();
    let info = detector.detect()?;
    match action {
        RootdevAction::Detect => {
            let json = serde_json::to_string_pretty(&info).context("encoding root device")?;
            println!("{}", json);
        }
        RootdevAction::Device => {
            println!("{}", info.source);
        }
        RootdevAction::Cmdline { subvolume } => {
            println!("{}", info.cmdline(&subvolume));
        }
    }
    Ok(())
}
