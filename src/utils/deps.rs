//! Host tool checking for storage operations

use crate::layout::Layout;
use crate::utils::command::command_exists;
use crate::utils::error::{Result, StorixError};
use std::collections::HashMap;
use tracing::info;

/// Binary to package mapping
fn binary_to_package() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();
    // Core partitioning
    map.insert("sfdisk", "util-linux");
    map.insert("wipefs", "util-linux");
    map.insert("mkswap", "util-linux");
    map.insert("swapon", "util-linux");
    map.insert("blkid", "util-linux");
    map.insert("blockdev", "util-linux");
    map.insert("lsblk", "util-linux");
    map.insert("partprobe", "parted");
    map.insert("parted", "parted");

    // Filesystems
    map.insert("mkfs.vfat", "dosfstools");
    map.insert("resize2fs", "e2fsprogs");

    // Volume management
    map.insert("lvm", "lvm2");
    map.insert("dmsetup", "lvm2");

    // Mirroring of boot partitions
    map.insert("rsync", "rsync");

    // Services
    map.insert("systemctl", "systemd");

    map
}

/// Binaries needed to mutate the given layout
pub fn required_binaries(layout: &Layout) -> Vec<&'static str> {
    let mut bins = vec!["blkid", "blockdev", "lsblk", "mkswap", "swapon"];

    match layout {
        Layout::Empty | Layout::NonStandard(_) => {}
        Layout::BiosSimple(_) | Layout::EfiSimple(_) => {
            bins.push("systemctl");
        }
        Layout::BiosLvm(_) => {
            bins.extend(["sfdisk", "wipefs", "partprobe", "lvm", "dmsetup", "systemctl"]);
        }
        Layout::EfiLvm(_) | Layout::EfiBcacheLvm(_) => {
            bins.extend([
                "sfdisk",
                "wipefs",
                "partprobe",
                "parted",
                "lvm",
                "dmsetup",
                "mkfs.vfat",
                "rsync",
                "resize2fs",
                "systemctl",
            ]);
        }
    }

    bins
}

/// Check for missing dependencies and return list of missing packages
pub fn check_dependencies(layout: &Layout) -> Vec<String> {
    let bin_to_pkg = binary_to_package();

    let mut missing_packages: Vec<String> = Vec::new();

    for bin in required_binaries(layout) {
        if !command_exists(bin) {
            let pkg = match bin_to_pkg.get(bin) {
                Some(&pkg) => pkg.to_string(),
                None => format!("(provides {})", bin),
            };
            if !missing_packages.contains(&pkg) {
                missing_packages.push(pkg);
            }
        }
    }

    missing_packages
}

/// Fail early when a host tool a mutation relies on is absent
pub fn ensure_dependencies(layout: &Layout) -> Result<()> {
    let missing = check_dependencies(layout);

    if missing.is_empty() {
        info!("All required host tools are installed");
        return Ok(());
    }

    Err(StorixError::ConfigError(format!(
        "Required host packages are missing: {}",
        missing.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lvm_layouts_need_lvm_tools() {
        let layout = Layout::Empty;
        assert!(!required_binaries(&layout).contains(&"lvm"));

        let map = binary_to_package();
        for bin in ["sfdisk", "lvm", "rsync", "parted", "mkfs.vfat"] {
            assert!(map.contains_key(bin), "no package for {}", bin);
        }
    }
}
