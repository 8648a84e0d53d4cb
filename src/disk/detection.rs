//! Disk detection and enumeration

use crate::disk::naming::is_whole_disk;
use crate::utils::error::{Result, StorixError};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Information about a whole disk
#[derive(Debug, Clone, Serialize)]
pub struct BlockDevice {
    /// Device path (e.g., /dev/sda)
    pub path: String,
    /// Device name (e.g., sda)
    pub name: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Device model (if available)
    pub model: Option<String>,
    /// Device type (ssd, hdd, nvme, usb, ...)
    pub device_type: String,
    /// Whether device is removable or attached over USB
    pub removable: bool,
}

impl BlockDevice {
    /// Get human-readable size
    pub fn size_human(&self) -> String {
        size_human(self.size_bytes)
    }

    /// Fixed disks are the only candidates for a storage layout
    pub fn is_fixed(&self) -> bool {
        !self.removable && is_whole_disk(&self.path)
    }
}

pub fn size_human(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.1}T", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1}G", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1}M", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1}K", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Read a sysfs attribute, returning None if not available
fn read_sysfs_attr(device: &str, attr: &str) -> Option<String> {
    let path = format!("/sys/block/{}/{}", device, attr);
    fs::read_to_string(&path).ok().map(|s| s.trim().to_string())
}

/// Read a numeric sysfs attribute
fn read_sysfs_u64(device: &str, attr: &str) -> Option<u64> {
    read_sysfs_attr(device, attr).and_then(|s| s.parse().ok())
}

/// `queue/rotational` of a disk, `None` when sysfs does not say
pub fn is_rotational(device: &str) -> Option<bool> {
    read_sysfs_u64(device, "queue/rotational").map(|r| r != 0)
}

/// USB-attached disks resolve to a sysfs path under a usb controller
fn is_usb_attached(device: &str) -> bool {
    fs::canonicalize(format!("/sys/block/{}", device))
        .map(|p| p.to_string_lossy().contains("/usb"))
        .unwrap_or(false)
}

/// Determine device type from sysfs
fn determine_device_type(device: &str, removable: bool) -> String {
    if removable {
        return "usb".to_string();
    }
    if device.starts_with("nvme") {
        return "nvme".to_string();
    }
    if device.starts_with("mmcblk") {
        return "mmc".to_string();
    }
    match is_rotational(device) {
        Some(false) => "ssd".to_string(),
        Some(true) => "hdd".to_string(),
        None => "disk".to_string(),
    }
}

/// List whole disks with a recognised naming pattern
pub fn list_block_devices() -> Result<Vec<BlockDevice>> {
    let mut devices = Vec::new();

    for entry in fs::read_dir("/sys/block")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let path = format!("/dev/{}", name);

        // Skips loop, dm-*, bcache*, md* and friends
        if !is_whole_disk(&path) {
            continue;
        }

        let size_sectors = read_sysfs_u64(&name, "size").unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }

        // sysfs `size` is always in 512-byte units
        let size_bytes = size_sectors * 512;

        let removable =
            read_sysfs_u64(&name, "removable").unwrap_or(0) == 1 || is_usb_attached(&name);
        let device_type = determine_device_type(&name, removable);
        let model = read_sysfs_attr(&name, "device/model")
            .or_else(|| read_sysfs_attr(&name, "device/name"));

        devices.push(BlockDevice {
            path,
            name,
            size_bytes,
            model,
            device_type,
            removable,
        });
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(devices)
}

/// Paths of non-removable, non-USB whole disks, sorted
pub fn fixed_disks() -> Result<Vec<String>> {
    Ok(list_block_devices()?
        .into_iter()
        .filter(BlockDevice::is_fixed)
        .map(|d| d.path)
        .collect())
}

/// Get information about a specific disk
pub fn get_device_info(device_path: &str) -> Result<BlockDevice> {
    let name = Path::new(device_path)
        .file_name()
        .ok_or_else(|| StorixError::DeviceNotFound(device_path.to_string()))?
        .to_string_lossy()
        .to_string();

    if !Path::new("/sys/block").join(&name).exists() {
        return Err(StorixError::DeviceNotFound(device_path.to_string()));
    }

    let size_bytes = read_sysfs_u64(&name, "size").unwrap_or(0) * 512;
    let removable = read_sysfs_u64(&name, "removable").unwrap_or(0) == 1 || is_usb_attached(&name);
    let model =
        read_sysfs_attr(&name, "device/model").or_else(|| read_sysfs_attr(&name, "device/name"));

    Ok(BlockDevice {
        path: device_path.to_string(),
        device_type: determine_device_type(&name, removable),
        name,
        size_bytes,
        model,
        removable,
    })
}

/// MemTotal from /proc/meminfo, in bytes
pub fn memory_bytes() -> Result<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo")?;
    parse_mem_total(&meminfo)
        .ok_or_else(|| StorixError::ConfigError("MemTotal missing from /proc/meminfo".into()))
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mem_total() {
        let meminfo = "MemTotal:       16303480 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16303480 * 1024));
        assert_eq!(parse_mem_total("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn test_size_human() {
        assert_eq!(size_human(512), "512B");
        assert_eq!(size_human(512 * 1024 * 1024), "512.0M");
        assert_eq!(size_human(3 * 1024 * 1024 * 1024 / 2), "1.5G");
    }

    #[test]
    fn fixed_requires_known_naming() {
        let disk = BlockDevice {
            path: "/dev/sda".into(),
            name: "sda".into(),
            size_bytes: 1 << 30,
            model: None,
            device_type: "hdd".into(),
            removable: false,
        };
        assert!(disk.is_fixed());
        let usb = BlockDevice {
            removable: true,
            ..disk.clone()
        };
        assert!(!usb.is_fixed());
        let loopdev = BlockDevice {
            path: "/dev/loop0".into(),
            ..disk
        };
        assert!(!loopdev.is_fixed());
    }
}
