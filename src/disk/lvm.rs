//! LVM volume-group membership and logical volume operations
//!
//! Every layout with a volume group keeps exactly one PV per disk; these
//! helpers wrap the `lvm` sub-commands the mutator needs.

use crate::utils::command::CommandRunner;
use crate::utils::error::{Result, StorixError};
use tracing::info;

fn lvm_step(cmd: &CommandRunner, subcommand: &str, args: &[&str]) -> Result<()> {
    cmd.lvm(subcommand, args)
        .map(|_| ())
        .map_err(|e| match e {
            StorixError::CommandFailed { command, stderr } => StorixError::CommandFailed {
                command,
                stderr: format!("lvm {} failed: {}", subcommand, stderr.trim()),
            },
            other => other,
        })
}

/// Create a physical volume on a device
pub fn create_pv(cmd: &CommandRunner, device: &str) -> Result<()> {
    info!("Creating LVM physical volume on {}", device);
    lvm_step(cmd, "pvcreate", &["-ff", "-y", device])?;
    info!("Physical volume created on {}", device);
    Ok(())
}

/// Drop the LVM label from a device that already left its volume group
pub fn remove_pv(cmd: &CommandRunner, device: &str) -> Result<()> {
    info!("Removing LVM label from {}", device);
    lvm_step(cmd, "pvremove", &["-y", device])
}

/// Add a physical volume to a volume group
pub fn extend_vg(cmd: &CommandRunner, vg_name: &str, pv_device: &str) -> Result<()> {
    info!("Extending volume group '{}' with {}", vg_name, pv_device);
    lvm_step(cmd, "vgextend", &[vg_name, pv_device])?;
    info!("Volume group '{}' extended", vg_name);
    Ok(())
}

/// Remove an empty physical volume from a volume group
pub fn reduce_vg(cmd: &CommandRunner, vg_name: &str, pv_device: &str) -> Result<()> {
    info!("Reducing volume group '{}' by {}", vg_name, pv_device);
    lvm_step(cmd, "vgreduce", &[vg_name, pv_device])
}

/// Migrate every allocated extent off a physical volume
pub fn move_pv(cmd: &CommandRunner, pv_device: &str) -> Result<()> {
    info!("Moving allocated extents off {}", pv_device);
    lvm_step(cmd, "pvmove", &[pv_device])?;
    info!("{} no longer holds allocated extents", pv_device);
    Ok(())
}

/// Create a linear logical volume of `size_bytes`
pub fn create_lv(cmd: &CommandRunner, vg_name: &str, lv_name: &str, size_bytes: u64) -> Result<()> {
    let size = format!("{}b", size_bytes);
    info!("Creating LV '{}/{}' ({} bytes)", vg_name, lv_name, size_bytes);
    lvm_step(cmd, "lvcreate", &["-y", "-L", &size, "-n", lv_name, vg_name])?;

    // Wait for the device node to appear
    cmd.settle();
    Ok(())
}

pub fn remove_lv(cmd: &CommandRunner, vg_name: &str, lv_name: &str) -> Result<()> {
    info!("Removing LV '{}/{}'", vg_name, lv_name);
    lvm_step(cmd, "lvremove", &["-y", &lv_path(vg_name, lv_name)])
}

/// Grow a logical volume by whole GiB
pub fn extend_lv(cmd: &CommandRunner, vg_name: &str, lv_name: &str, add_gib: u64) -> Result<()> {
    let size = format!("+{}G", add_gib);
    info!("Extending LV '{}/{}' by {} GiB", vg_name, lv_name, add_gib);
    lvm_step(cmd, "lvextend", &["-L", &size, &lv_path(vg_name, lv_name)])
}

/// Get the device path for a logical volume
pub fn lv_path(vg_name: &str, lv_name: &str) -> String {
    format!("/dev/{}/{}", vg_name, lv_name)
}

/// Get the device mapper path
///
/// Dashes inside either name are doubled by device-mapper.
pub fn lv_mapper_path(vg_name: &str, lv_name: &str) -> String {
    format!(
        "/dev/mapper/{}-{}",
        vg_name.replace('-', "--"),
        lv_name.replace('-', "--")
    )
}

/// Paths a logical volume may be reachable under, most canonical first
///
/// Older device-mapper setups named volumes `vg.lv`.
pub fn lv_device_candidates(vg_name: &str, lv_name: &str) -> Vec<String> {
    vec![
        lv_path(vg_name, lv_name),
        lv_mapper_path(vg_name, lv_name),
        format!("/dev/mapper/{}.{}", vg_name, lv_name),
    ]
}
