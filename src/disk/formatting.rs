//! Filesystem formatting

use crate::utils::command::CommandRunner;
use crate::utils::error::{Result, StorixError};
use tracing::info;

/// Format a reserved or real ESP as FAT32
pub fn format_esp(cmd: &CommandRunner, partition: &str) -> Result<()> {
    info!("Formatting {} as FAT32 (EFI)", partition);

    cmd.run("mkfs.vfat", &["-F32", "-n", "EFI", partition])
        .map(|_| ())
        .map_err(|e| {
            StorixError::FilesystemError(format!("Failed to format EFI partition: {}", e))
        })
}

/// Write a swap signature to a partition, logical volume or file
pub fn format_swap(cmd: &CommandRunner, target: &str) -> Result<()> {
    info!("Formatting {} as swap", target);

    cmd.run("mkswap", &["-f", target]).map(|_| ()).map_err(|e| {
        StorixError::FilesystemError(format!("Failed to format swap on {}: {}", target, e))
    })
}

/// Grow an ext4 filesystem to fill its (already grown) device
pub fn grow_ext4(cmd: &CommandRunner, device: &str) -> Result<()> {
    info!("Resizing ext4 filesystem on {}", device);

    cmd.run("resize2fs", &[device]).map(|_| ()).map_err(|e| {
        StorixError::FilesystemError(format!("Failed to resize {}: {}", device, e))
    })
}
