//! Layout mutation
//!
//! Every operation takes the current [`Layout`] by value, checks its
//! preconditions before the first side effect, drives the storage steps
//! through [`StorageOps`] and returns the resulting layout. When the boot
//! mount was re-pointed at another partition the [`Transition`] says so,
//! so the caller can re-run the boot-loader installer.

use crate::config::EngineConfig;
use crate::configure::swap::{unit_content, unit_name};
use crate::disk::bcache::BcacheRole;
use crate::disk::lvm::lv_path;
use crate::disk::naming::partition_path;
use crate::disk::partitioning::{PartitionRole, PartitionSpec};
use crate::disk::query::{BlockDeviceQuery, PartitionTableType};
use crate::disk::storage::StorageOps;
use crate::layout::{BiosLvm, EfiBcacheLvm, EfiLvm, Layout};
use crate::utils::error::{Result, StorixError};
use tracing::{info, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Root usage ratio from which `adjust_storage` grows the root volume
pub const ADJUST_THRESHOLD: f64 = 0.9;
/// Usage ratio the root volume is grown back to
pub const ADJUST_TARGET: f64 = 0.7;

/// Result of a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub layout: Layout,
    /// The boot mount now points at a different partition
    pub boot_changed: bool,
}

impl Transition {
    fn unchanged_boot(layout: Layout) -> Self {
        Self {
            layout,
            boot_changed: false,
        }
    }

    fn moved_boot(layout: Layout) -> Self {
        Self {
            layout,
            boot_changed: true,
        }
    }
}

fn unsupported(layout: &Layout) -> StorixError {
    match layout {
        Layout::Empty => StorixError::rejected("empty storage layout does not support this operation"),
        Layout::NonStandard(l) => StorixError::rejected(format!(
            "non-standard storage layout (similar to {}, but {}) does not support this operation",
            l.closest_layout_name, l.message
        )),
        other => StorixError::rejected(format!(
            "storage layout \"{}\" does not support this operation",
            other.name()
        )),
    }
}

fn not_managed() -> StorixError {
    StorixError::rejected("the specified device is not managed")
}

/// The smallest remaining disk path becomes the new boot disk
fn elect_boot_disk<'a>(candidates: impl Iterator<Item = &'a String>) -> Result<String> {
    candidates
        .min()
        .cloned()
        .ok_or_else(|| StorixError::rejected("no disk left to boot from"))
}

pub struct LayoutMutator<'a> {
    config: &'a EngineConfig,
    devices: &'a dyn BlockDeviceQuery,
    ops: &'a mut dyn StorageOps,
}

impl<'a> LayoutMutator<'a> {
    pub fn new(
        config: &'a EngineConfig,
        devices: &'a dyn BlockDeviceQuery,
        ops: &'a mut dyn StorageOps,
    ) -> Self {
        Self {
            config,
            devices,
            ops,
        }
    }

    fn require_fixed_disk(&self, disk: &str) -> Result<()> {
        if !self.devices.fixed_disks()?.iter().any(|d| d == disk) {
            return Err(StorixError::rejected(
                "the specified device is not a fixed harddisk",
            ));
        }
        Ok(())
    }

    fn require_unused_pv(&self, pv: &str) -> Result<()> {
        let used = self.devices.pv_used_bytes(pv)?;
        if used > 0 {
            return Err(StorixError::rejected(format!(
                "physical volume {} still holds {} bytes of data, release the disk first",
                pv, used
            )));
        }
        Ok(())
    }

    /// Re-point the boot mount at partition 1 of `disk`
    fn move_boot_to(&mut self, disk: &str) -> Result<()> {
        let esp = partition_path(disk, 1);
        info!("Moving boot partition to {}", esp);
        self.ops.unmount(&self.config.boot_mount)?;
        self.ops.set_esp_flag(&esp, true)?;
        self.ops.mount(&esp, &self.config.boot_mount, true)
    }

    /// Add a fixed disk to the layout
    ///
    /// `main_boot` adds the disk as the SSD of a bcache layout.
    pub fn add_disk(&mut self, layout: Layout, disk: &str, main_boot: bool) -> Result<Transition> {
        if layout.disks().iter().any(|d| d == disk) {
            return Err(StorixError::rejected("the specified device is already managed"));
        }
        match layout {
            Layout::BiosLvm(l) => {
                self.reject_main_boot(BiosLvm::NAME, main_boot)?;
                self.require_fixed_disk(disk)?;
                self.add_bios_lvm_disk(l, disk)
            }
            Layout::EfiLvm(l) => {
                self.reject_main_boot(EfiLvm::NAME, main_boot)?;
                self.require_fixed_disk(disk)?;
                self.add_efi_lvm_disk(l, disk)
            }
            Layout::EfiBcacheLvm(l) => {
                if main_boot && l.ssd.is_some() {
                    return Err(StorixError::rejected("mainboot device already exists"));
                }
                self.require_fixed_disk(disk)?;
                if main_boot {
                    self.add_ssd(l, disk)
                } else {
                    self.add_bcache_hdd(l, disk)
                }
            }
            other => Err(unsupported(&other)),
        }
    }

    fn reject_main_boot(&self, name: &str, main_boot: bool) -> Result<()> {
        if main_boot {
            return Err(StorixError::rejected(format!(
                "storage layout \"{}\" does not support --main-boot",
                name
            )));
        }
        Ok(())
    }

    fn add_bios_lvm_disk(&mut self, mut l: BiosLvm, disk: &str) -> Result<Transition> {
        let parts = self.ops.initialize_disk(
            disk,
            PartitionTableType::Mbr,
            &[PartitionSpec::rest(PartitionRole::LvmPv)],
        )?;
        let pv = &parts[0];
        self.ops.create_pv(pv)?;
        self.ops.extend_vg(&l.volume_group, pv)?;

        l.pv_disks.push(disk.to_string());
        l.pv_disks.sort();
        info!("{} added to volume group {}", disk, l.volume_group);
        Ok(Transition::unchanged_boot(Layout::BiosLvm(l)))
    }

    /// Reserved ESP-sized partition 1, formatted and mirrored from the boot mount
    fn prepare_reserved_esp(&mut self, src: &str, partition: &str) -> Result<()> {
        self.ops.format_esp(partition)?;
        self.ops
            .sync_boot_files(src, &self.config.boot_mount, partition)
    }

    fn add_efi_lvm_disk(&mut self, mut l: EfiLvm, disk: &str) -> Result<Transition> {
        let parts = self.ops.initialize_disk(
            disk,
            PartitionTableType::Gpt,
            &[
                PartitionSpec::bytes(self.config.esp_size_bytes(), PartitionRole::Filesystem("vfat".into())),
                PartitionSpec::rest(PartitionRole::LvmPv),
            ],
        )?;
        self.prepare_reserved_esp(&partition_path(&l.boot_disk, 1), &parts[0])?;
        self.ops.create_pv(&parts[1])?;
        self.ops.extend_vg(&l.volume_group, &parts[1])?;

        l.pv_disks.push(disk.to_string());
        l.pv_disks.sort();
        info!("{} added to volume group {}", disk, l.volume_group);
        Ok(Transition::unchanged_boot(Layout::EfiLvm(l)))
    }

    fn add_bcache_hdd(&mut self, mut l: EfiBcacheLvm, disk: &str) -> Result<Transition> {
        if self.devices.is_ssd(disk)? {
            warn!("{} is an SSD; adding it as a bcache backing disk", disk);
        }
        let boot = Layout::EfiBcacheLvm(l.clone())
            .boot_device()
            .ok_or_else(|| StorixError::rejected("storage layout has no boot device"))?;

        let parts = self.ops.initialize_disk(
            disk,
            PartitionTableType::Gpt,
            &[
                PartitionSpec::bytes(self.config.esp_size_bytes(), PartitionRole::Filesystem("vfat".into())),
                PartitionSpec::rest(PartitionRole::Bcache),
            ],
        )?;
        self.prepare_reserved_esp(&boot, &parts[0])?;

        self.ops.make_bcache(&parts[1], BcacheRole::Backing)?;
        let bcache_dev = self.ops.register_bcache_backing(&parts[1])?;
        if let Some(cache) = &l.ssd_cache_partition {
            let set_uuid = self.devices.bcache_set_uuid(cache)?;
            self.ops.attach_bcache(&bcache_dev, &set_uuid)?;
        }
        self.ops.create_pv(&bcache_dev)?;
        self.ops.extend_vg(&l.volume_group, &bcache_dev)?;

        info!("{} added to volume group {} as {}", disk, l.volume_group, bcache_dev);
        l.pv_disks.insert(disk.to_string(), bcache_dev);
        Ok(Transition::unchanged_boot(Layout::EfiBcacheLvm(l)))
    }

    fn add_ssd(&mut self, mut l: EfiBcacheLvm, disk: &str) -> Result<Transition> {
        if !self.devices.is_ssd(disk)? {
            return Err(StorixError::rejected(
                "the specified device is not a fixed SSD harddisk",
            ));
        }
        let Some(boot_hdd) = l.boot_disk.clone() else {
            return Err(StorixError::rejected("storage layout has no boot disk"));
        };
        let boot_esp = partition_path(&boot_hdd, 1);
        let swap_size = self.config.swap_size_bytes(self.devices.memory_bytes()?);

        let parts = self.ops.initialize_disk(
            disk,
            PartitionTableType::Gpt,
            &[
                PartitionSpec::bytes(self.config.esp_size_bytes(), PartitionRole::Esp),
                PartitionSpec::bytes(swap_size, PartitionRole::Swap),
                PartitionSpec::rest(PartitionRole::Bcache),
            ],
        )?;
        let (esp, swap, cache) = (&parts[0], &parts[1], &parts[2]);
        self.prepare_reserved_esp(&boot_esp, esp)?;
        self.ops.format_swap(swap)?;

        let (_, set_uuid) = self.ops.make_bcache(cache, BcacheRole::Cache)?;
        self.ops.register_bcache_cache(cache)?;
        for bcache_dev in l.pv_disks.values() {
            self.ops.attach_bcache(bcache_dev, &set_uuid)?;
        }

        info!("Moving boot partition from {} to {}", boot_esp, esp);
        self.ops.unmount(&self.config.boot_mount)?;
        self.ops.set_esp_flag(&boot_esp, false)?;
        self.ops.mount(esp, &self.config.boot_mount, true)?;

        l.ssd = Some(disk.to_string());
        l.ssd_esp_partition = Some(esp.clone());
        l.ssd_swap_partition = Some(swap.clone());
        l.ssd_cache_partition = Some(cache.clone());
        l.boot_disk = None;
        Ok(Transition::moved_boot(Layout::EfiBcacheLvm(l)))
    }

    /// Physical volume a managed disk contributes to the volume group
    fn member_pv(&self, layout: &Layout, disk: &str) -> Result<Option<String>> {
        let pv = match layout {
            Layout::BiosLvm(l) => l
                .pv_disks
                .iter()
                .any(|d| d == disk)
                .then(|| partition_path(disk, 1)),
            Layout::EfiLvm(l) => l
                .pv_disks
                .iter()
                .any(|d| d == disk)
                .then(|| partition_path(disk, 2)),
            Layout::EfiBcacheLvm(l) => {
                if l.ssd.as_deref() == Some(disk) {
                    return Ok(None);
                }
                l.pv_disks.get(disk).cloned()
            }
            other => return Err(unsupported(other)),
        };
        pv.map(Some).ok_or_else(not_managed)
    }

    /// Migrate every allocated extent off a managed disk
    pub fn release_disk(&mut self, layout: &Layout, disk: &str) -> Result<()> {
        let Some(pv) = self.member_pv(layout, disk)? else {
            info!("{} holds no physical volume, nothing to release", disk);
            return Ok(());
        };
        if self.devices.pv_used_bytes(&pv)? == 0 {
            info!("{} holds no allocated extents", pv);
            return Ok(());
        }
        self.ops.move_pv(&pv)
    }

    /// Remove a released disk from the layout and wipe it
    pub fn remove_disk(&mut self, layout: Layout, disk: &str) -> Result<Transition> {
        let pv = self.member_pv(&layout, disk)?;
        match (layout, pv) {
            (Layout::EfiBcacheLvm(l), None) => self.remove_ssd(l),
            (Layout::EfiBcacheLvm(l), Some(pv)) => self.remove_bcache_hdd(l, disk, &pv),
            (Layout::BiosLvm(l), Some(pv)) => self.remove_bios_lvm_disk(l, disk, &pv),
            (Layout::EfiLvm(l), Some(pv)) => self.remove_efi_lvm_disk(l, disk, &pv),
            (other, _) => Err(unsupported(&other)),
        }
    }

    fn require_not_last(&self, members: usize) -> Result<()> {
        if members <= 1 {
            return Err(StorixError::rejected(
                "can not remove the last physical volume",
            ));
        }
        Ok(())
    }

    fn leave_volume_group(&mut self, vg: &str, pv: &str) -> Result<()> {
        self.ops.reduce_vg(vg, pv)?;
        self.ops.remove_pv(pv)
    }

    fn remove_bios_lvm_disk(&mut self, mut l: BiosLvm, disk: &str, pv: &str) -> Result<Transition> {
        self.require_not_last(l.pv_disks.len())?;
        self.require_unused_pv(pv)?;

        l.pv_disks.retain(|d| d != disk);
        let boot_changed = l.boot_disk == disk;
        if boot_changed {
            l.boot_disk = elect_boot_disk(l.pv_disks.iter())?;
            warn!(
                "{} carried the boot code; install the boot-loader on {}",
                disk, l.boot_disk
            );
        }

        self.leave_volume_group(&l.volume_group, pv)?;
        self.ops.wipe_disk(disk)?;
        Ok(Transition {
            layout: Layout::BiosLvm(l),
            boot_changed,
        })
    }

    fn remove_efi_lvm_disk(&mut self, mut l: EfiLvm, disk: &str, pv: &str) -> Result<Transition> {
        self.require_not_last(l.pv_disks.len())?;
        self.require_unused_pv(pv)?;

        l.pv_disks.retain(|d| d != disk);
        let boot_changed = l.boot_disk == disk;
        if boot_changed {
            l.boot_disk = elect_boot_disk(l.pv_disks.iter())?;
            self.move_boot_to(&l.boot_disk)?;
        }

        self.leave_volume_group(&l.volume_group, pv)?;
        self.ops.wipe_disk(disk)?;
        Ok(Transition {
            layout: Layout::EfiLvm(l),
            boot_changed,
        })
    }

    fn remove_bcache_hdd(&mut self, mut l: EfiBcacheLvm, disk: &str, bcache_dev: &str) -> Result<Transition> {
        self.require_not_last(l.pv_disks.len())?;
        self.require_unused_pv(bcache_dev)?;

        l.pv_disks.remove(disk);
        let boot_changed = l.boot_disk.as_deref() == Some(disk);
        if boot_changed {
            let next = elect_boot_disk(l.pv_disks.keys())?;
            self.move_boot_to(&next)?;
            l.boot_disk = Some(next);
        }

        self.leave_volume_group(&l.volume_group, bcache_dev)?;
        self.ops.stop_bcache(bcache_dev)?;
        self.ops.wipe_disk(disk)?;
        Ok(Transition {
            layout: Layout::EfiBcacheLvm(l),
            boot_changed,
        })
    }

    fn remove_ssd(&mut self, mut l: EfiBcacheLvm) -> Result<Transition> {
        let (Some(ssd), Some(cache)) = (l.ssd.clone(), l.ssd_cache_partition.clone()) else {
            return Err(not_managed());
        };
        if let Some(swap) = &l.ssd_swap_partition {
            let state = self.devices.swap_unit(&unit_name(swap), swap)?;
            if state.content.is_some() || state.enabled || state.active {
                return Err(StorixError::rejected(
                    "swap partition is in use, disable swap first",
                ));
            }
        }
        let next = elect_boot_disk(l.pv_disks.keys())?;

        let set_uuid = self.devices.bcache_set_uuid(&cache)?;
        self.ops.unregister_cache_set(&set_uuid)?;
        self.move_boot_to(&next)?;
        self.ops.wipe_disk(&ssd)?;

        l.ssd = None;
        l.ssd_esp_partition = None;
        l.ssd_swap_partition = None;
        l.ssd_cache_partition = None;
        l.boot_disk = Some(next);
        Ok(Transition::moved_boot(Layout::EfiBcacheLvm(l)))
    }

    /// Install and activate the unit for `target`, skipping steps already done
    fn activate_swap(&mut self, target: &str, mut active: bool) -> Result<()> {
        let unit = unit_name(target);
        let content = unit_content(target);
        let state = self.devices.swap_unit(&unit, target)?;
        active &= state.active;

        if state.content.as_deref() != Some(content.as_str()) {
            self.ops.install_swap_unit(&unit, &content)?;
        }
        if !(state.enabled && active) {
            self.ops.enable_swap(&unit, target)?;
        }
        Ok(())
    }

    /// Stop swapping on `target` before it is replaced
    fn stop_swap(&mut self, target: &str) -> Result<()> {
        let unit = unit_name(target);
        let state = self.devices.swap_unit(&unit, target)?;
        if state.enabled || state.active {
            self.ops.disable_swap(&unit, target)?;
        }
        Ok(())
    }

    fn swap_size(&self) -> Result<u64> {
        Ok(self.config.swap_size_bytes(self.devices.memory_bytes()?))
    }

    /// Returns true when the existing swap target was kept
    fn ensure_swap_file(&mut self, current: Option<&str>) -> Result<bool> {
        let path = self.config.swap_file.clone();
        let size = self.swap_size()?;
        if current.is_some() && self.devices.size_bytes(&path)? >= size {
            return Ok(true);
        }
        if current.is_some() {
            info!("Swap file {} is smaller than {} bytes, recreating", path, size);
            self.stop_swap(&path)?;
        }
        self.ops.create_swap_file(&path, size)?;
        Ok(false)
    }

    fn ensure_swap_lv(&mut self, vg: &str, current: Option<&str>) -> Result<bool> {
        let lv = self.config.swap_lv.clone();
        let path = lv_path(vg, &lv);
        let size = self.swap_size()?;
        if current.is_some() {
            if self.devices.size_bytes(&path)? >= size {
                return Ok(true);
            }
            info!("Swap volume {} is smaller than {} bytes, recreating", path, size);
            self.stop_swap(&path)?;
            self.ops.remove_lv(vg, &lv)?;
        }
        self.ops.create_lv(vg, &lv, size)?;
        self.ops.format_swap(&path)?;
        Ok(false)
    }

    /// Create, register and activate swap space sized to twice the memory
    pub fn enable_swap(&mut self, layout: Layout) -> Result<Transition> {
        let layout = match layout {
            Layout::BiosSimple(mut l) => {
                let kept = self.ensure_swap_file(l.swap_file.as_deref())?;
                self.activate_swap(&self.config.swap_file.clone(), kept)?;
                l.swap_file = Some(self.config.swap_file.clone());
                Layout::BiosSimple(l)
            }
            Layout::EfiSimple(mut l) => {
                let kept = self.ensure_swap_file(l.swap_file.as_deref())?;
                self.activate_swap(&self.config.swap_file.clone(), kept)?;
                l.swap_file = Some(self.config.swap_file.clone());
                Layout::EfiSimple(l)
            }
            Layout::BiosLvm(mut l) => {
                let kept = self.ensure_swap_lv(&l.volume_group, l.swap_lv.as_deref())?;
                self.activate_swap(&lv_path(&l.volume_group, &self.config.swap_lv), kept)?;
                l.swap_lv = Some(self.config.swap_lv.clone());
                Layout::BiosLvm(l)
            }
            Layout::EfiLvm(mut l) => {
                let kept = self.ensure_swap_lv(&l.volume_group, l.swap_lv.as_deref())?;
                self.activate_swap(&lv_path(&l.volume_group, &self.config.swap_lv), kept)?;
                l.swap_lv = Some(self.config.swap_lv.clone());
                Layout::EfiLvm(l)
            }
            Layout::EfiBcacheLvm(l) => {
                let Some(swap) = l.ssd_swap_partition.clone() else {
                    return Err(StorixError::rejected(
                        "storage layout without SSD has no swap partition",
                    ));
                };
                let size = self.swap_size()?;
                if self.devices.size_bytes(&swap)? < size {
                    return Err(StorixError::rejected(format!(
                        "swap partition {} is smaller than the required {} bytes",
                        swap, size
                    )));
                }
                self.activate_swap(&swap, true)?;
                Layout::EfiBcacheLvm(l)
            }
            other => return Err(unsupported(&other)),
        };
        Ok(Transition::unchanged_boot(layout))
    }

    /// Deactivate swap and drop its unit and backing file or volume
    pub fn disable_swap(&mut self, layout: Layout) -> Result<Transition> {
        let layout = match layout {
            Layout::BiosSimple(mut l) => {
                if let Some(path) = l.swap_file.take() {
                    self.drop_swap_unit(&path)?;
                    self.ops.remove_swap_file(&path)?;
                }
                Layout::BiosSimple(l)
            }
            Layout::EfiSimple(mut l) => {
                if let Some(path) = l.swap_file.take() {
                    self.drop_swap_unit(&path)?;
                    self.ops.remove_swap_file(&path)?;
                }
                Layout::EfiSimple(l)
            }
            Layout::BiosLvm(mut l) => {
                if let Some(lv) = l.swap_lv.take() {
                    self.drop_swap_unit(&lv_path(&l.volume_group, &lv))?;
                    self.ops.remove_lv(&l.volume_group, &lv)?;
                }
                Layout::BiosLvm(l)
            }
            Layout::EfiLvm(mut l) => {
                if let Some(lv) = l.swap_lv.take() {
                    self.drop_swap_unit(&lv_path(&l.volume_group, &lv))?;
                    self.ops.remove_lv(&l.volume_group, &lv)?;
                }
                Layout::EfiLvm(l)
            }
            Layout::EfiBcacheLvm(l) => {
                if let Some(swap) = &l.ssd_swap_partition {
                    self.drop_swap_unit(swap)?;
                }
                Layout::EfiBcacheLvm(l)
            }
            other => return Err(unsupported(&other)),
        };
        Ok(Transition::unchanged_boot(layout))
    }

    fn drop_swap_unit(&mut self, target: &str) -> Result<()> {
        let unit = unit_name(target);
        let state = self.devices.swap_unit(&unit, target)?;
        if state.enabled || state.active {
            self.ops.disable_swap(&unit, target)?;
        }
        if state.content.is_some() {
            self.ops.remove_swap_unit(&unit)?;
        }
        Ok(())
    }

    /// Mirror the active ESP onto every reserved ESP-sized partition
    ///
    /// Returns the number of partitions written.
    pub fn sync_boot_partitions(&mut self, layout: &Layout) -> Result<usize> {
        let Some((src, dsts)) = layout.boot_mirrors() else {
            info!("Storage layout {} has nothing to mirror", layout.name());
            return Ok(0);
        };
        for dst in &dsts {
            info!("Mirroring {} onto {}", src, dst);
            self.ops.sync_boot_files(&src, &self.config.boot_mount, dst)?;
        }
        Ok(dsts.len())
    }

    /// Grow the root volume once it is at least 90% full
    ///
    /// Returns the number of GiB added.
    pub fn adjust_storage(&mut self, layout: &Layout) -> Result<u64> {
        let (vg, root_lv) = match layout {
            Layout::BiosLvm(l) => (&l.volume_group, &l.root_lv),
            Layout::EfiLvm(l) => (&l.volume_group, &l.root_lv),
            Layout::EfiBcacheLvm(l) => (&l.volume_group, &l.root_lv),
            other => return Err(unsupported(other)),
        };
        let usage = self.devices.filesystem_usage(&self.config.root_mount)?;
        if usage.ratio() < ADJUST_THRESHOLD {
            return Err(StorixError::rejected(
                "root device space usage is less than 90%, adjustment is not needed",
            ));
        }
        let add_gib = grow_gib(usage.used, usage.total);

        self.ops.extend_lv(vg, root_lv, add_gib)?;
        self.ops.grow_filesystem(&lv_path(vg, root_lv))?;
        info!("Root volume grown by {} GiB", add_gib);
        Ok(add_gib)
    }
}

/// Whole GiB to add so that `used` fills at most 70% of the filesystem
pub fn grow_gib(used: u64, total: u64) -> u64 {
    let target = (used as f64 / ADJUST_TARGET) as u64;
    target.saturating_sub(total) / GIB + 1
}
