//! Storix - storage layout engine
//!
//! Classifies the disk topology of the running machine and reshapes it:
//! adding and removing disks, managing swap and mirroring boot partitions.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use storix::config::EngineConfig;
use storix::configure::swap::unit_name;
use storix::disk::detection::{get_device_info, list_block_devices};
use storix::disk::query::{BlockDeviceQuery, SystemBlockDevices};
use storix::disk::storage::SystemStorage;
use storix::layout::{classifier::classify, Layout, LayoutMutator, Transition};
use storix::utils::command::CommandRunner;
use storix::utils::deps::ensure_dependencies;
use storix::utils::error::StorixError;
use storix::utils::signal::{install_signal_handlers, is_interrupted, reraise};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "storix")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "STORIX_CONFIG")]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Dry run mode - show what would be done without making changes
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the storage layout and print it
    Show {
        /// Print the layout as JSON
        #[arg(long)]
        json: bool,
    },

    /// List fixed and removable disks
    ListDisks,

    /// Add a disk to the storage layout
    AddDisk {
        /// Disk device (e.g., /dev/sdb)
        device: String,

        /// Add the disk as the SSD holding boot, swap and cache partitions
        #[arg(long)]
        main_boot: bool,
    },

    /// Move all data off a disk so it can be removed
    ReleaseDisk {
        /// Disk device
        device: String,
    },

    /// Remove a released disk from the storage layout and wipe it
    RemoveDisk {
        /// Disk device
        device: String,
    },

    /// Create and activate swap space
    EnableSwap,

    /// Deactivate swap space and remove it
    DisableSwap,

    /// Mirror the boot partition onto every reserved boot partition
    SyncBoot,

    /// Grow the root volume when it is nearly full
    AdjustStorage,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "storix.toml")]
        output: String,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn load_config(path: Option<&str>) -> Result<EngineConfig> {
    Ok(match path {
        Some(path) => {
            info!("Loading configuration from {}", path);
            EngineConfig::from_file(path)?
        }
        None => EngineConfig::default(),
    })
}

fn require_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(StorixError::NotRoot.into());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let dry_run = cli.dry_run;
    if dry_run {
        info!("Running in dry-run mode - no changes will be made");
    }

    let result = match cli.command {
        Commands::ListDisks => cmd_list_disks(),
        Commands::GenerateConfig { output } => cmd_generate_config(&output),
        command => {
            let config = load_config(cli.config.as_deref())?;
            run(command, &config, dry_run)
        }
    };

    if is_interrupted() {
        reraise();
    }
    result
}

fn run(command: Commands, config: &EngineConfig, dry_run: bool) -> Result<()> {
    let devices = SystemBlockDevices::new(&config.unit_dir);
    let layout = classify(config, &devices)?;

    if let Commands::Show { json } = command {
        return cmd_show(&layout, &devices, json);
    }

    require_root()?;
    install_signal_handlers();
    ensure_dependencies(&layout)?;

    let mut storage = SystemStorage::new(CommandRunner::new(dry_run), config);
    let mut mutator = LayoutMutator::new(config, &devices, &mut storage);

    let transition = match command {
        Commands::AddDisk { device, main_boot } => {
            let info = get_device_info(&device)?;
            info!(
                "Adding {} ({}, {})",
                info.path,
                info.size_human(),
                info.model.as_deref().unwrap_or(&info.device_type)
            );
            mutator.add_disk(layout, &device, main_boot)?
        }
        Commands::RemoveDisk { device } => mutator.remove_disk(layout, &device)?,
        Commands::EnableSwap => mutator.enable_swap(layout)?,
        Commands::DisableSwap => mutator.disable_swap(layout)?,
        Commands::ReleaseDisk { device } => {
            mutator.release_disk(&layout, &device)?;
            println!("{} {} released", "✓".green(), device);
            return Ok(());
        }
        Commands::SyncBoot => {
            let n = mutator.sync_boot_partitions(&layout)?;
            println!("{} {} boot partition(s) synchronized", "✓".green(), n);
            return Ok(());
        }
        Commands::AdjustStorage => {
            let gib = mutator.adjust_storage(&layout)?;
            println!("{} root volume grown by {} GiB", "✓".green(), gib);
            return Ok(());
        }
        Commands::Show { .. } | Commands::ListDisks | Commands::GenerateConfig { .. } => {
            return Ok(())
        }
    };

    report_transition(&transition);
    Ok(())
}

fn report_transition(transition: &Transition) {
    println!(
        "{} storage layout is now {}",
        "✓".green(),
        transition.layout.name().bold()
    );
    if transition.boot_changed {
        warn!("Boot partition changed; the boot-loader must be reinstalled");
        if let Some(boot) = transition.layout.boot_device() {
            println!("{} boot storage moved to {}", "!".yellow(), boot);
        }
    }
}

fn cmd_show(layout: &Layout, devices: &dyn BlockDeviceQuery, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(layout)?);
        return Ok(());
    }

    let name = match layout {
        Layout::NonStandard(_) => layout.name().red().bold(),
        Layout::Empty => layout.name().yellow().bold(),
        _ => layout.name().green().bold(),
    };
    println!("{:<14} {}", "layout:", name);

    if let Some(firmware) = layout.firmware() {
        println!("{:<14} {}", "firmware:", firmware);
    }
    if let Layout::NonStandard(l) = layout {
        println!(
            "{:<14} similar to {}, but {}",
            "reason:", l.closest_layout_name, l.message
        );
    }
    if let Some(disk) = layout.boot_disk() {
        println!("{:<14} {}", "boot disk:", disk);
    }
    if let Some(boot) = layout.boot_device() {
        println!("{:<14} {}", "boot device:", boot);
    }
    if let Some(root) = layout.root_device() {
        println!("{:<14} {}", "root device:", root);
    }
    let disks = layout.disks();
    if !disks.is_empty() {
        println!("{:<14} {}", "disks:", disks.join(" "));
    }

    match layout.swap_target() {
        Some(target) => {
            let state = devices.swap_unit(&unit_name(&target), &target)?;
            let status = match (state.enabled, state.active) {
                (true, true) => "enabled, active".green(),
                (true, false) => "enabled, inactive".yellow(),
                (false, true) => "active, not enabled".yellow(),
                (false, false) => "disabled".red(),
            };
            println!("{:<14} {} ({})", "swap:", target, status);
        }
        None => println!("{:<14} {}", "swap:", "none".dimmed()),
    }
    if layout.needs_boot_sync() {
        println!("{:<14} reserved boot partitions need mirroring", "boot sync:");
    }

    Ok(())
}

fn cmd_list_disks() -> Result<()> {
    let devices = list_block_devices()?;

    if devices.is_empty() {
        println!("No disks found.");
        return Ok(());
    }

    println!("{:<15} {:>10} {:<20} {:<6} {}", "DEVICE", "SIZE", "MODEL", "TYPE", "FIXED");
    println!("{}", "-".repeat(60));

    for dev in devices {
        println!(
            "{:<15} {:>10} {:<20} {:<6} {}",
            dev.path,
            dev.size_human(),
            dev.model.as_deref().unwrap_or("-"),
            dev.device_type,
            if dev.is_fixed() { "yes" } else { "no" }
        );
    }

    Ok(())
}

fn cmd_generate_config(output: &str) -> Result<()> {
    let sample = EngineConfig::sample();
    std::fs::write(output, sample.to_toml()?)?;
    println!("✓ Sample configuration written to {}", output);
    Ok(())
}
