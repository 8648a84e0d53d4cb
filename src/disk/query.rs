//! Read-only facts about block devices
//!
//! The classifier and the mutator never probe the machine directly; they go
//! through [`BlockDeviceQuery`] so that every decision is made over facts
//! fetched in one pass.

use crate::disk::bcache::{self, BcacheRole, BcacheSysfs};
use crate::disk::detection;
use crate::disk::gpt;
use crate::disk::naming::kernel_name;
use crate::utils::command::{command_succeeds, run_command_optional, run_command_output};
use crate::utils::error::{Result, StorixError};
use serde::Serialize;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Partition table found on a disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableType {
    Mbr,
    Gpt,
    None,
}

impl PartitionTableType {
    /// Map a `blkid` PTTYPE value
    pub fn from_blkid(value: &str) -> Self {
        match value {
            "gpt" => Self::Gpt,
            "dos" => Self::Mbr,
            _ => Self::None,
        }
    }

    /// Name used in diagnostics (`dos` for MBR, as `blkid` reports it)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mbr => "dos",
            Self::Gpt => "gpt",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for PartitionTableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Boot-time activation state of a swap target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwapUnitState {
    /// Current content of the unit file, if installed
    pub content: Option<String>,
    /// Linked into `swap.target.wants`
    pub enabled: bool,
    /// Listed in /proc/swaps
    pub active: bool,
}

/// Bytes used and total bytes of a mounted filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesystemUsage {
    pub used: u64,
    pub total: u64,
}

impl FilesystemUsage {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64
        }
    }
}

pub trait BlockDeviceQuery {
    /// Non-removable whole disks, sorted by path
    fn fixed_disks(&self) -> Result<Vec<String>>;

    /// Whether a device node (or file) exists
    fn exists(&self, path: &str) -> bool;

    fn partition_table_type(&self, disk: &str) -> Result<PartitionTableType>;

    /// Filesystem signature on a device, `None` when blank
    fn filesystem_type(&self, device: &str) -> Result<Option<String>>;

    /// Size of a block device or regular file
    fn size_bytes(&self, device: &str) -> Result<u64>;

    /// (volume group, logical volume) when `device` is an LVM logical volume
    fn lvm_info(&self, device: &str) -> Result<Option<(String, String)>>;

    /// Slaves of a bcache device, cache devices first and backing device last
    fn bcache_slaves(&self, bcache_device: &str) -> Result<Vec<String>>;

    /// Role recorded in the bcache superblock of a device, if any
    fn bcache_role(&self, device: &str) -> Result<Option<BcacheRole>>;

    fn bcache_set_uuid(&self, cache_device: &str) -> Result<Uuid>;

    /// The bcache device stacked on a backing partition
    fn bcache_device_for_backing(&self, partition: &str) -> Result<Option<String>>;

    /// Source device of a mount point
    fn mount_source(&self, mount_point: &str) -> Result<Option<String>>;

    fn volume_group_exists(&self, vg: &str) -> Result<bool>;

    /// Physical volumes of a volume group
    fn physical_volumes(&self, vg: &str) -> Result<Vec<String>>;

    /// Logical volume names of a volume group
    fn logical_volumes(&self, vg: &str) -> Result<Vec<String>>;

    /// Bytes allocated to logical volumes on a physical volume
    fn pv_used_bytes(&self, pv: &str) -> Result<u64>;

    /// Non-rotational disk
    fn is_ssd(&self, disk: &str) -> Result<bool>;

    /// Non-zero boot code in the first 440 bytes of a disk
    fn has_boot_code(&self, disk: &str) -> Result<bool>;

    fn is_esp_partition(&self, partition: &str) -> Result<bool>;

    fn filesystem_usage(&self, mount_point: &str) -> Result<FilesystemUsage>;

    fn memory_bytes(&self) -> Result<u64>;

    /// Activation state of a swap target and its systemd unit
    fn swap_unit(&self, unit_name: &str, target: &str) -> Result<SwapUnitState>;
}

/// [`BlockDeviceQuery`] backed by sysfs, procfs and the util-linux/lvm tools
#[derive(Debug, Clone)]
pub struct SystemBlockDevices {
    unit_dir: PathBuf,
    sysfs: BcacheSysfs,
}

impl SystemBlockDevices {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            sysfs: BcacheSysfs::default(),
        }
    }
}

impl BlockDeviceQuery for SystemBlockDevices {
    fn fixed_disks(&self) -> Result<Vec<String>> {
        detection::fixed_disks()
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn partition_table_type(&self, disk: &str) -> Result<PartitionTableType> {
        // blkid exits 2 when it finds nothing
        Ok(run_command_optional("blkid", &["-p", "-o", "value", "-s", "PTTYPE", disk])
            .map(|v| PartitionTableType::from_blkid(v.trim()))
            .unwrap_or(PartitionTableType::None))
    }

    fn filesystem_type(&self, device: &str) -> Result<Option<String>> {
        Ok(run_command_optional("blkid", &["-p", "-o", "value", "-s", "TYPE", device])
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()))
    }

    fn size_bytes(&self, device: &str) -> Result<u64> {
        let meta = fs::metadata(device)
            .map_err(|_| StorixError::DeviceNotFound(device.to_string()))?;
        if meta.file_type().is_block_device() {
            let out = run_command_output("blockdev", &["--getsize64", device])?;
            out.trim().parse().map_err(|_| {
                StorixError::DeviceNotFound(format!("{} (unreadable size '{}')", device, out))
            })
        } else {
            Ok(meta.len())
        }
    }

    fn lvm_info(&self, device: &str) -> Result<Option<(String, String)>> {
        let out = match run_command_optional(
            "lvm",
            &["lvs", "--noheadings", "-o", "vg_name,lv_name", device],
        ) {
            Some(out) => out,
            None => return Ok(None),
        };
        let mut fields = out.split_whitespace();
        Ok(match (fields.next(), fields.next()) {
            (Some(vg), Some(lv)) => Some((vg.to_string(), lv.to_string())),
            _ => None,
        })
    }

    fn bcache_slaves(&self, bcache_device: &str) -> Result<Vec<String>> {
        self.sysfs.slaves(bcache_device)
    }

    fn bcache_role(&self, device: &str) -> Result<Option<BcacheRole>> {
        let path = Path::new(device);
        if bcache::is_backing_device(path)? {
            Ok(Some(BcacheRole::Backing))
        } else if bcache::is_cache_device(path)? {
            Ok(Some(BcacheRole::Cache))
        } else {
            Ok(None)
        }
    }

    fn bcache_set_uuid(&self, cache_device: &str) -> Result<Uuid> {
        bcache::read_set_uuid(Path::new(cache_device))
    }

    fn bcache_device_for_backing(&self, partition: &str) -> Result<Option<String>> {
        self.sysfs.find_by_backing(partition)
    }

    fn mount_source(&self, mount_point: &str) -> Result<Option<String>> {
        let mounts = fs::read_to_string("/proc/self/mounts")?;
        Ok(parse_mount_source(&mounts, mount_point))
    }

    fn volume_group_exists(&self, vg: &str) -> Result<bool> {
        Ok(command_succeeds("lvm", &["vgdisplay", vg]))
    }

    fn physical_volumes(&self, vg: &str) -> Result<Vec<String>> {
        let out = run_command_output("lvm", &["pvdisplay", "-c"])?;
        Ok(parse_colon_listing(&out, vg)
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    fn logical_volumes(&self, vg: &str) -> Result<Vec<String>> {
        let out = run_command_output("lvm", &["lvdisplay", "-c"])?;
        let prefix = format!("/dev/{}/", vg);
        Ok(parse_colon_listing(&out, vg)
            .into_iter()
            .filter_map(|(path, _)| path.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    fn pv_used_bytes(&self, pv: &str) -> Result<u64> {
        let out = run_command_output(
            "lvm",
            &["pvs", "--noheadings", "--units", "b", "--nosuffix", "-o", "pv_used", pv],
        )?;
        out.trim().parse().map_err(|_| StorixError::CommandFailed {
            command: format!("lvm pvs {}", pv),
            stderr: format!("unexpected output '{}'", out),
        })
    }

    fn is_ssd(&self, disk: &str) -> Result<bool> {
        Ok(detection::is_rotational(kernel_name(disk)) == Some(false))
    }

    fn has_boot_code(&self, disk: &str) -> Result<bool> {
        gpt::has_boot_code(disk)
    }

    fn is_esp_partition(&self, partition: &str) -> Result<bool> {
        gpt::is_esp_partition(partition)
    }

    fn filesystem_usage(&self, mount_point: &str) -> Result<FilesystemUsage> {
        let st = nix::sys::statvfs::statvfs(mount_point)?;
        let frsize = st.fragment_size() as u64;
        let total = st.blocks() as u64 * frsize;
        let free = st.blocks_free() as u64 * frsize;
        Ok(FilesystemUsage {
            used: total.saturating_sub(free),
            total,
        })
    }

    fn memory_bytes(&self) -> Result<u64> {
        detection::memory_bytes()
    }

    fn swap_unit(&self, unit_name: &str, target: &str) -> Result<SwapUnitState> {
        let unit_path = self.unit_dir.join(unit_name);
        let content = match fs::read_to_string(&unit_path) {
            Ok(c) => Some(c),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let enabled = self
            .unit_dir
            .join("swap.target.wants")
            .join(unit_name)
            .exists();

        let swaps = fs::read_to_string("/proc/swaps").unwrap_or_default();
        let resolved = fs::canonicalize(target).ok();
        let active = swaps.lines().skip(1).filter_map(|l| l.split_whitespace().next()).any(|dev| {
            dev == target || resolved.as_deref() == Some(Path::new(dev))
        });

        debug!(
            "Swap unit {}: installed={}, enabled={}, active={}",
            unit_name,
            content.is_some(),
            enabled,
            active
        );
        Ok(SwapUnitState {
            content,
            enabled,
            active,
        })
    }
}

/// Source of the topmost mount on `mount_point` in /proc/mounts format
pub fn parse_mount_source(mounts: &str, mount_point: &str) -> Option<String> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            (target == mount_point).then(|| source.to_string())
        })
        .last()
}

/// `(first field, remaining fields)` of `pvdisplay -c`/`lvdisplay -c` lines
/// whose second field is the volume group
fn parse_colon_listing(out: &str, vg: &str) -> Vec<(String, String)> {
    out.lines()
        .filter_map(|line| {
            let mut fields = line.trim().splitn(3, ':');
            let name = fields.next()?;
            let owner = fields.next()?;
            (owner == vg).then(|| (name.to_string(), fields.next().unwrap_or("").to_string()))
        })
        .collect()
}
