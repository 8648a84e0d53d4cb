//! Swap targets and their systemd `.swap` units
//!
//! A swap target is either a swap file or a block device (logical volume or
//! SSD partition). Each one is activated at boot by a unit named after the
//! systemd-escaped target path.

use crate::config::RunMode;
use crate::utils::command::CommandRunner;
use crate::utils::error::{Result, StorixError};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::info;

/// Escape a path the way `systemd-escape --path` does
pub fn escape_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    let mut out = String::with_capacity(trimmed.len());

    for (i, b) in trimmed.bytes().enumerate() {
        match b {
            b'/' => out.push('-'),
            b'.' if i == 0 => out.push_str("\\x2e"),
            b if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b':' => {
                out.push(b as char)
            }
            b => out.push_str(&format!("\\x{:02x}", b)),
        }
    }

    out
}

/// Unit name for a swap target (`/var/swap.dat` -> `var-swap.dat.swap`)
pub fn unit_name(target: &str) -> String {
    format!("{}.swap", escape_path(target))
}

/// Unit text activating `target` through swap.target
pub fn unit_content(target: &str) -> String {
    let description = if target.starts_with("/dev") {
        "Swap Partition"
    } else {
        "Swap File"
    };

    format!(
        "[Unit]\nDescription={}\n\n[Swap]\nWhat={}\n\n[Install]\nWantedBy=swap.target\n",
        description, target
    )
}

/// Create a swap file
///
/// Uses fallocate + mkswap, as for any non-btrfs filesystem.
pub fn create_swap_file(cmd: &CommandRunner, path: &str, size_bytes: u64) -> Result<()> {
    info!("Creating {} MiB swap file at {}", size_bytes / (1024 * 1024), path);

    if let Some(parent) = Path::new(path).parent() {
        if !cmd.is_dry_run() {
            fs::create_dir_all(parent)?;
        }
    }

    // fallocate refuses to shrink; start from an empty file
    if !cmd.is_dry_run() && Path::new(path).exists() {
        fs::remove_file(path)?;
    }

    cmd.run("fallocate", &["-l", &size_bytes.to_string(), path])
        .map_err(|e| StorixError::CommandFailed {
            command: "fallocate".to_string(),
            stderr: e.to_string(),
        })?;

    // Set permissions
    if !cmd.is_dry_run() {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    cmd.run("mkswap", &["-f", path])
        .map_err(|e| StorixError::CommandFailed {
            command: "mkswap".to_string(),
            stderr: e.to_string(),
        })?;

    info!("Swap file created successfully");
    Ok(())
}

pub fn remove_swap_file(cmd: &CommandRunner, path: &str) -> Result<()> {
    info!("Removing swap file {}", path);

    if cmd.is_dry_run() {
        println!("  [dry-run] rm {}", path);
        return Ok(());
    }

    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Write a unit into `unit_dir`
pub fn install_unit(cmd: &CommandRunner, unit_dir: &str, name: &str, content: &str) -> Result<()> {
    let path = Path::new(unit_dir).join(name);
    info!("Writing swap unit {}", path.display());

    if cmd.is_dry_run() {
        println!("  [dry-run] Would write {}:", path.display());
        for line in content.lines() {
            println!("    {}", line);
        }
        return Ok(());
    }

    fs::create_dir_all(unit_dir)?;
    fs::write(&path, content)?;
    Ok(())
}

pub fn remove_unit(cmd: &CommandRunner, unit_dir: &str, name: &str) -> Result<()> {
    let path = Path::new(unit_dir).join(name);
    info!("Removing swap unit {}", path.display());

    if cmd.is_dry_run() {
        println!("  [dry-run] rm {}", path.display());
        return Ok(());
    }

    match fs::remove_file(&path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }
    Ok(())
}

/// Enable the unit and switch the target on
pub fn activate(cmd: &CommandRunner, run_mode: RunMode, unit: &str, target: &str) -> Result<()> {
    info!("Enabling swap on {} ({})", target, unit);
    if run_mode == RunMode::Normal {
        cmd.run("systemctl", &["daemon-reload"])?;
    }
    cmd.run("systemctl", &["enable", unit])?;

    match run_mode {
        RunMode::Setup => cmd.run("swapon", &[target])?,
        RunMode::Normal => cmd.run("systemctl", &["start", unit])?,
    };
    Ok(())
}

/// Switch the target off and disable the unit
pub fn deactivate(cmd: &CommandRunner, run_mode: RunMode, unit: &str, target: &str) -> Result<()> {
    info!("Disabling swap on {} ({})", target, unit);

    match run_mode {
        RunMode::Setup => cmd.run("swapoff", &[target])?,
        RunMode::Normal => cmd.run("systemctl", &["stop", unit])?,
    };
    cmd.run("systemctl", &["disable", unit])?;
    Ok(())
}
