//! Physical storage operations
//!
//! [`StorageOps`] is the only way the mutator touches the machine. The
//! system implementation routes every step through [`CommandRunner`], so
//! `--dry-run` prints the whole plan without side effects.

use crate::config::{EngineConfig, RunMode};
use crate::configure::swap;
use crate::disk::bcache::{self, BcacheRole, BcacheSysfs, SuperblockOptions};
use crate::disk::naming::kernel_name;
use crate::disk::query::{BlockDeviceQuery, PartitionTableType, SystemBlockDevices};
use crate::disk::{formatting, lvm, partitioning, partitioning::PartitionSpec};
use crate::utils::command::CommandRunner;
use crate::utils::error::{Result, StorixError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Where boot partitions are temporarily mounted while being mirrored
const SYNC_MOUNT_DIR: &str = "/run/storix";

pub trait StorageOps {
    /// Replace the partition table of a disk, returning the partition paths
    fn initialize_disk(
        &mut self,
        disk: &str,
        table: PartitionTableType,
        parts: &[PartitionSpec],
    ) -> Result<Vec<String>>;

    fn wipe_disk(&mut self, disk: &str) -> Result<()>;

    fn set_esp_flag(&mut self, partition: &str, on: bool) -> Result<()>;

    fn format_esp(&mut self, partition: &str) -> Result<()>;

    fn format_swap(&mut self, target: &str) -> Result<()>;

    /// Mirror the tree mounted at `src_mount` onto `dst_partition`
    fn sync_boot_files(&mut self, src_partition: &str, src_mount: &str, dst_partition: &str) -> Result<()>;

    fn mount(&mut self, device: &str, mount_point: &str, read_only: bool) -> Result<()>;

    fn unmount(&mut self, mount_point: &str) -> Result<()>;

    fn create_pv(&mut self, device: &str) -> Result<()>;

    fn remove_pv(&mut self, device: &str) -> Result<()>;

    fn extend_vg(&mut self, vg: &str, pv: &str) -> Result<()>;

    fn reduce_vg(&mut self, vg: &str, pv: &str) -> Result<()>;

    fn move_pv(&mut self, pv: &str) -> Result<()>;

    fn create_lv(&mut self, vg: &str, lv: &str, size_bytes: u64) -> Result<()>;

    fn remove_lv(&mut self, vg: &str, lv: &str) -> Result<()>;

    fn extend_lv(&mut self, vg: &str, lv: &str, add_gib: u64) -> Result<()>;

    fn grow_filesystem(&mut self, device: &str) -> Result<()>;

    /// Write a bcache superblock; returns (device uuid, set uuid)
    fn make_bcache(&mut self, device: &str, role: BcacheRole) -> Result<(Uuid, Uuid)>;

    fn register_bcache_cache(&mut self, partition: &str) -> Result<()>;

    /// Register a backing partition; returns the new `/dev/bcacheN`
    fn register_bcache_backing(&mut self, partition: &str) -> Result<String>;

    fn attach_bcache(&mut self, bcache_device: &str, set_uuid: &Uuid) -> Result<()>;

    fn unregister_cache_set(&mut self, set_uuid: &Uuid) -> Result<()>;

    fn stop_bcache(&mut self, bcache_device: &str) -> Result<()>;

    fn create_swap_file(&mut self, path: &str, size_bytes: u64) -> Result<()>;

    fn remove_swap_file(&mut self, path: &str) -> Result<()>;

    fn install_swap_unit(&mut self, unit: &str, content: &str) -> Result<()>;

    fn remove_swap_unit(&mut self, unit: &str) -> Result<()>;

    fn enable_swap(&mut self, unit: &str, target: &str) -> Result<()>;

    fn disable_swap(&mut self, unit: &str, target: &str) -> Result<()>;
}

/// [`StorageOps`] acting on the running machine
#[derive(Debug, Clone)]
pub struct SystemStorage {
    cmd: CommandRunner,
    unit_dir: String,
    run_mode: RunMode,
    sysfs: BcacheSysfs,
    devices: SystemBlockDevices,
}

impl SystemStorage {
    pub fn new(cmd: CommandRunner, config: &EngineConfig) -> Self {
        Self {
            cmd,
            unit_dir: config.unit_dir.clone(),
            run_mode: config.run_mode,
            sysfs: BcacheSysfs::default(),
            devices: SystemBlockDevices::new(&config.unit_dir),
        }
    }

    fn dry_run(&self, what: &str) -> bool {
        if self.cmd.is_dry_run() {
            println!("  [dry-run] {}", what);
            true
        } else {
            false
        }
    }

    fn check_interrupted(&self) -> Result<()> {
        if crate::utils::signal::is_interrupted() {
            return Err(StorixError::Interrupted);
        }
        Ok(())
    }
}

impl StorageOps for SystemStorage {
    fn initialize_disk(
        &mut self,
        disk: &str,
        table: PartitionTableType,
        parts: &[PartitionSpec],
    ) -> Result<Vec<String>> {
        self.check_interrupted()?;
        partitioning::initialize_disk(&self.cmd, disk, table, parts)
    }

    fn wipe_disk(&mut self, disk: &str) -> Result<()> {
        partitioning::wipe_disk(&self.cmd, disk)
    }

    fn set_esp_flag(&mut self, partition: &str, on: bool) -> Result<()> {
        partitioning::set_esp_flag(&self.cmd, partition, on)
    }

    fn format_esp(&mut self, partition: &str) -> Result<()> {
        formatting::format_esp(&self.cmd, partition)
    }

    fn format_swap(&mut self, target: &str) -> Result<()> {
        formatting::format_swap(&self.cmd, target)
    }

    fn sync_boot_files(&mut self, src_partition: &str, src_mount: &str, dst_partition: &str) -> Result<()> {
        info!("Mirroring {} to {}", src_partition, dst_partition);

        if !self.cmd.is_dry_run() {
            let devices = &self.devices;
            if devices.size_bytes(src_partition)? != devices.size_bytes(dst_partition)? {
                return Err(StorixError::rejected(format!(
                    "{} and {} have different size",
                    src_partition, dst_partition
                )));
            }
            if devices.filesystem_type(src_partition)? != devices.filesystem_type(dst_partition)? {
                return Err(StorixError::rejected(format!(
                    "{} and {} have different filesystem",
                    src_partition, dst_partition
                )));
            }
        }

        let mount_point: PathBuf = Path::new(SYNC_MOUNT_DIR).join(kernel_name(dst_partition));
        let mount_str = mount_point.to_string_lossy().to_string();
        if !self.cmd.is_dry_run() {
            fs::create_dir_all(&mount_point)?;
        }

        self.cmd.run("mount", &[dst_partition, &mount_str])?;
        // Trailing slash: copy the content, not the directory
        let src = format!("{}/", src_mount.trim_end_matches('/'));
        let copied = self.cmd.run("rsync", &["-q", "-a", "--delete", &src, &mount_str]);
        self.cmd.force_run("umount", &[&mount_str])?;
        copied?;

        if !self.cmd.is_dry_run() {
            if let Err(e) = fs::remove_dir(&mount_point) {
                warn!("Could not remove {}: {}", mount_point.display(), e);
            }
        }
        Ok(())
    }

    fn mount(&mut self, device: &str, mount_point: &str, read_only: bool) -> Result<()> {
        info!("Mounting {} on {}", device, mount_point);
        if read_only {
            self.cmd.run("mount", &["-o", "ro", device, mount_point])?;
        } else {
            self.cmd.run("mount", &[device, mount_point])?;
        }
        Ok(())
    }

    fn unmount(&mut self, mount_point: &str) -> Result<()> {
        info!("Unmounting {}", mount_point);
        self.cmd.run("umount", &[mount_point])?;
        Ok(())
    }

    fn create_pv(&mut self, device: &str) -> Result<()> {
        lvm::create_pv(&self.cmd, device)
    }

    fn remove_pv(&mut self, device: &str) -> Result<()> {
        lvm::remove_pv(&self.cmd, device)
    }

    fn extend_vg(&mut self, vg: &str, pv: &str) -> Result<()> {
        lvm::extend_vg(&self.cmd, vg, pv)
    }

    fn reduce_vg(&mut self, vg: &str, pv: &str) -> Result<()> {
        lvm::reduce_vg(&self.cmd, vg, pv)
    }

    fn move_pv(&mut self, pv: &str) -> Result<()> {
        lvm::move_pv(&self.cmd, pv)
    }

    fn create_lv(&mut self, vg: &str, lv: &str, size_bytes: u64) -> Result<()> {
        lvm::create_lv(&self.cmd, vg, lv, size_bytes)
    }

    fn remove_lv(&mut self, vg: &str, lv: &str) -> Result<()> {
        lvm::remove_lv(&self.cmd, vg, lv)
    }

    fn extend_lv(&mut self, vg: &str, lv: &str, add_gib: u64) -> Result<()> {
        lvm::extend_lv(&self.cmd, vg, lv, add_gib)
    }

    fn grow_filesystem(&mut self, device: &str) -> Result<()> {
        formatting::grow_ext4(&self.cmd, device)
    }

    fn make_bcache(&mut self, device: &str, role: BcacheRole) -> Result<(Uuid, Uuid)> {
        self.check_interrupted()?;
        if self.dry_run(&format!("write bcache {} superblock to {}", role, device)) {
            return Ok((Uuid::nil(), Uuid::nil()));
        }
        bcache::write_superblock(Path::new(device), role, &SuperblockOptions::default())
    }

    fn register_bcache_cache(&mut self, partition: &str) -> Result<()> {
        info!("Registering bcache cache device {}", partition);
        if self.dry_run(&format!("echo {} > /sys/fs/bcache/register", partition)) {
            return Ok(());
        }
        self.sysfs.register(partition)?;
        self.cmd.settle();
        Ok(())
    }

    fn register_bcache_backing(&mut self, partition: &str) -> Result<String> {
        info!("Registering bcache backing device {}", partition);
        if self.dry_run(&format!("echo {} > /sys/fs/bcache/register", partition)) {
            return Ok(format!("/dev/bcache-on-{}", kernel_name(partition)));
        }
        self.sysfs.register(partition)?;
        self.cmd.settle();

        let bcache_dev = self
            .sysfs
            .find_by_backing(partition)?
            .ok_or_else(|| StorixError::DeviceNotFound(format!("bcache device on {}", partition)))?;
        info!("{} is now backing {}", partition, bcache_dev);
        Ok(bcache_dev)
    }

    fn attach_bcache(&mut self, bcache_device: &str, set_uuid: &Uuid) -> Result<()> {
        info!("Attaching {} to cache set {}", bcache_device, set_uuid);
        if self.dry_run(&format!("attach {} to cache set {}", bcache_device, set_uuid)) {
            return Ok(());
        }
        self.sysfs.attach(bcache_device, set_uuid)
    }

    fn unregister_cache_set(&mut self, set_uuid: &Uuid) -> Result<()> {
        info!("Unregistering cache set {}", set_uuid);
        if self.dry_run(&format!("unregister cache set {}", set_uuid)) {
            return Ok(());
        }
        self.sysfs.unregister_set(set_uuid)
    }

    fn stop_bcache(&mut self, bcache_device: &str) -> Result<()> {
        info!("Stopping {}", bcache_device);
        if self.dry_run(&format!("stop {}", bcache_device)) {
            return Ok(());
        }
        self.sysfs.stop(bcache_device)?;
        self.cmd.settle();
        Ok(())
    }

    fn create_swap_file(&mut self, path: &str, size_bytes: u64) -> Result<()> {
        swap::create_swap_file(&self.cmd, path, size_bytes)
    }

    fn remove_swap_file(&mut self, path: &str) -> Result<()> {
        swap::remove_swap_file(&self.cmd, path)
    }

    fn install_swap_unit(&mut self, unit: &str, content: &str) -> Result<()> {
        swap::install_unit(&self.cmd, &self.unit_dir, unit, content)
    }

    fn remove_swap_unit(&mut self, unit: &str) -> Result<()> {
        swap::remove_unit(&self.cmd, &self.unit_dir, unit)
    }

    fn enable_swap(&mut self, unit: &str, target: &str) -> Result<()> {
        swap::activate(&self.cmd, self.run_mode, unit, target)
    }

    fn disable_swap(&mut self, unit: &str, target: &str) -> Result<()> {
        swap::deactivate(&self.cmd, self.run_mode, unit, target)
    }
}
