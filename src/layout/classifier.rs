//! Layout classification
//!
//! Classification is a pure function of the device facts answered by a
//! [`BlockDeviceQuery`]. The mount sources of the root and boot mount points
//! pick one candidate layout; that candidate's rules are then checked in
//! order and the first violation turns the result into
//! [`Layout::NonStandard`] carrying the violated rule as its message.

use crate::config::EngineConfig;
use crate::disk::lvm::{lv_device_candidates, lv_path};
use crate::disk::naming::{is_bcache_device, partition_disk, partition_path, split_partition};
use crate::disk::query::{BlockDeviceQuery, PartitionTableType};
use crate::layout::{BiosLvm, BiosSimple, EfiBcacheLvm, EfiLvm, EfiSimple, Layout, NonStandard};
use crate::utils::error::{Result, StorixError};
use std::collections::BTreeMap;
use tracing::{debug, info};

const ROOT_FS: &str = "ext4";
const SWAP_FS: &str = "swap";

fn mismatch(candidate: &str, reason: impl Into<String>) -> StorixError {
    StorixError::LayoutDetection {
        candidate: candidate.to_string(),
        reason: reason.into(),
    }
}

pub struct LayoutClassifier<'a> {
    config: &'a EngineConfig,
    devices: &'a dyn BlockDeviceQuery,
}

impl<'a> LayoutClassifier<'a> {
    pub fn new(config: &'a EngineConfig, devices: &'a dyn BlockDeviceQuery) -> Self {
        Self { config, devices }
    }

    /// Classify the running system
    ///
    /// Only I/O failures surface as errors; a rule violation is a
    /// successful `NonStandard` result.
    pub fn classify(&self) -> Result<Layout> {
        let Some(root) = self.devices.mount_source(&self.config.root_mount)? else {
            info!("Nothing mounted at {}", self.config.root_mount);
            return Ok(Layout::Empty);
        };
        if !self.any_disk_has_table()? {
            info!("No fixed disk carries a partition table");
            return Ok(Layout::Empty);
        }

        let boot = self.devices.mount_source(&self.config.boot_mount)?;
        let lvm = self.devices.lvm_info(&root)?;
        debug!("root={} boot={:?} lvm={:?}", root, boot, lvm);

        let attempt = match (&boot, &lvm) {
            (boot, Some(root_lv)) => {
                let pvs = self.devices.physical_volumes(&root_lv.0)?;
                let bcache = pvs.iter().any(|pv| is_bcache_device(pv));
                match boot {
                    Some(boot) if bcache => self.efi_bcache_lvm(boot, root_lv),
                    Some(boot) => self.efi_lvm(boot, root_lv),
                    None if bcache => Err(mismatch(
                        EfiBcacheLvm::NAME,
                        format!("nothing is mounted at {}", self.config.boot_mount),
                    )),
                    None => self.bios_lvm(root_lv),
                }
            }
            (Some(boot), None) => self.efi_simple(boot, &root),
            (None, None) => self.bios_simple(&root),
        };

        match attempt {
            Ok(layout) => {
                info!("Detected {} storage layout", layout.name());
                Ok(layout)
            }
            Err(StorixError::LayoutDetection { candidate, reason }) => {
                info!("Storage layout is non-standard: similar to {}, but {}", candidate, reason);
                let boot_disk = match (&boot, &lvm) {
                    (Some(_), _) => None,
                    (None, Some(_)) => self.guess_boot_code_disk()?,
                    (None, None) => partition_disk(&root),
                };
                Ok(Layout::NonStandard(NonStandard {
                    efi: boot.is_some(),
                    boot_disk,
                    boot_partition: boot,
                    root_partition: root,
                    closest_layout_name: candidate,
                    message: reason,
                }))
            }
            Err(e) => Err(e),
        }
    }

    fn any_disk_has_table(&self) -> Result<bool> {
        for disk in self.devices.fixed_disks()? {
            if self.devices.partition_table_type(&disk)? != PartitionTableType::None {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn require_esp(&self, candidate: &str, boot: &str) -> Result<()> {
        if !self.devices.is_esp_partition(boot)? {
            return Err(mismatch(candidate, "boot device is not an ESP partition"));
        }
        Ok(())
    }

    fn require_table(&self, candidate: &str, disk: &str, table: PartitionTableType) -> Result<()> {
        if self.devices.partition_table_type(disk)? != table {
            return Err(mismatch(
                candidate,
                format!("partition type of {} is not \"{}\"", disk, table),
            ));
        }
        Ok(())
    }

    fn require_fs(&self, candidate: &str, device: &str, fs: &str) -> Result<()> {
        if self.devices.filesystem_type(device)?.as_deref() != Some(fs) {
            return Err(mismatch(
                candidate,
                format!("{} has an invalid file system", device),
            ));
        }
        Ok(())
    }

    fn require_esp_size(&self, candidate: &str, partition: &str) -> Result<()> {
        if !self.devices.exists(partition)
            || self.devices.size_bytes(partition)? != self.config.esp_size_bytes()
        {
            return Err(mismatch(candidate, format!("{} has an invalid size", partition)));
        }
        Ok(())
    }

    fn require_no_partition(&self, candidate: &str, disk: &str, index: u32, label: &str) -> Result<()> {
        if self.devices.exists(&partition_path(disk, index)) {
            return Err(mismatch(candidate, format!("redundant partition exists on {}", label)));
        }
        Ok(())
    }

    /// Split a member partition, requiring it to sit at `index`
    fn member_disk(&self, candidate: &str, partition: &str, index: u32) -> Result<String> {
        match split_partition(partition) {
            Some((disk, i)) if i == index => Ok(disk),
            Some((disk, _)) => Err(mismatch(
                candidate,
                format!(
                    "physical volume partition of {} is not {}",
                    disk,
                    partition_path(&disk, index)
                ),
            )),
            None => Err(mismatch(
                candidate,
                format!("{} is not a partition of a fixed harddisk", partition),
            )),
        }
    }

    /// Swap file of the simple layouts, if one with a swap signature exists
    fn swap_file(&self) -> Result<Option<String>> {
        let path = &self.config.swap_file;
        if !self.devices.exists(path) {
            return Ok(None);
        }
        let fs = self.devices.filesystem_type(path)?;
        Ok((fs.as_deref() == Some(SWAP_FS)).then(|| path.clone()))
    }

    fn require_volume_group(&self, candidate: &str) -> Result<Vec<String>> {
        let vg = &self.config.volume_group;
        if !self.devices.volume_group_exists(vg)? {
            return Err(mismatch(
                candidate,
                format!("volume group \"{}\" does not exist", vg),
            ));
        }
        self.devices.physical_volumes(vg)
    }

    /// The root mount must be the configured root logical volume
    fn require_root_lv(&self, candidate: &str, root_lv: &(String, String)) -> Result<()> {
        let (vg, lv) = root_lv;
        if *vg != self.config.volume_group || *lv != self.config.root_lv {
            return Err(mismatch(
                candidate,
                format!(
                    "root device is not {}",
                    lv_path(&self.config.volume_group, &self.config.root_lv)
                ),
            ));
        }
        Ok(())
    }

    /// Root (ext4) and optional swap logical volumes; returns the swap LV name
    fn check_logical_volumes(&self, candidate: &str, with_swap: bool) -> Result<Option<String>> {
        let vg = &self.config.volume_group;
        let lvs = self.devices.logical_volumes(vg)?;

        let root_lv = &self.config.root_lv;
        let root_node = lv_device_candidates(vg, root_lv)
            .into_iter()
            .find(|p| self.devices.exists(p));
        let root_node = match root_node {
            Some(node) if lvs.contains(root_lv) => node,
            _ => {
                return Err(mismatch(
                    candidate,
                    format!("logical volume \"{}\" does not exist", lv_path(vg, root_lv)),
                ))
            }
        };
        self.require_fs(candidate, &root_node, ROOT_FS)?;

        let swap_lv = &self.config.swap_lv;
        if !with_swap || !lvs.contains(swap_lv) {
            return Ok(None);
        }
        let swap_node = lv_device_candidates(vg, swap_lv)
            .into_iter()
            .find(|p| self.devices.exists(p))
            .unwrap_or_else(|| lv_path(vg, swap_lv));
        self.require_fs(candidate, &swap_node, SWAP_FS)?;
        Ok(Some(swap_lv.clone()))
    }

    /// First PV disk carrying boot code, else the first PV disk
    fn guess_boot_code_disk(&self) -> Result<Option<String>> {
        let mut disks: Vec<String> = self
            .devices
            .physical_volumes(&self.config.volume_group)?
            .iter()
            .filter_map(|pv| partition_disk(pv))
            .collect();
        disks.sort();
        disks.dedup();
        for disk in &disks {
            if self.devices.has_boot_code(disk)? {
                return Ok(Some(disk.clone()));
            }
        }
        Ok(disks.into_iter().next())
    }

    fn bios_simple(&self, root: &str) -> Result<Layout> {
        let candidate = BiosSimple::NAME;
        let (disk, index) = split_partition(root).ok_or_else(|| {
            mismatch(candidate, format!("{} is not a partition of a fixed harddisk", root))
        })?;
        self.require_table(candidate, &disk, PartitionTableType::Mbr)?;
        self.require_fs(candidate, root, ROOT_FS)?;
        self.require_no_partition(candidate, &disk, index + 1, &disk)?;

        Ok(Layout::BiosSimple(BiosSimple {
            disk,
            root_partition: root.to_string(),
            swap_file: self.swap_file()?,
        }))
    }

    fn efi_simple(&self, boot: &str, root: &str) -> Result<Layout> {
        let candidate = EfiSimple::NAME;
        self.require_esp(candidate, boot)?;

        let boot_disk = partition_disk(boot);
        let root_disk = partition_disk(root);
        let disk = match (boot_disk, root_disk) {
            (Some(b), Some(r)) if b == r => b,
            _ => {
                return Err(mismatch(
                    candidate,
                    "boot device and root device are not on the same disk",
                ))
            }
        };
        if boot != partition_path(&disk, 1) {
            return Err(mismatch(
                candidate,
                format!("boot device is not {}", partition_path(&disk, 1)),
            ));
        }
        if root != partition_path(&disk, 2) {
            return Err(mismatch(
                candidate,
                format!("root device is not {}", partition_path(&disk, 2)),
            ));
        }
        self.require_esp_size(candidate, boot)?;
        self.require_fs(candidate, root, ROOT_FS)?;
        self.require_no_partition(candidate, &disk, 3, &disk)?;

        Ok(Layout::EfiSimple(EfiSimple {
            disk,
            esp_partition: boot.to_string(),
            root_partition: root.to_string(),
            swap_file: self.swap_file()?,
        }))
    }

    fn bios_lvm(&self, root_lv: &(String, String)) -> Result<Layout> {
        let candidate = BiosLvm::NAME;
        let pvs = self.require_volume_group(candidate)?;
        self.require_root_lv(candidate, root_lv)?;

        let mut pv_disks = Vec::new();
        for pv in &pvs {
            let disk = self.member_disk(candidate, pv, 1)?;
            self.require_table(candidate, &disk, PartitionTableType::Mbr)?;
            self.require_no_partition(candidate, &disk, 2, &disk)?;
            pv_disks.push(disk);
        }
        pv_disks.sort();

        let swap_lv = self.check_logical_volumes(candidate, true)?;

        let mut with_code = Vec::new();
        for disk in &pv_disks {
            if self.devices.has_boot_code(disk)? {
                with_code.push(disk.clone());
            }
        }
        let boot_disk = match with_code.len() {
            1 => with_code.remove(0),
            0 => return Err(mismatch(candidate, "no harddisk has boot-code")),
            _ => return Err(mismatch(candidate, "boot-code exists on multiple harddisks")),
        };

        Ok(Layout::BiosLvm(BiosLvm {
            volume_group: self.config.volume_group.clone(),
            pv_disks,
            root_lv: self.config.root_lv.clone(),
            swap_lv,
            boot_disk,
        }))
    }

    fn efi_lvm(&self, boot: &str, root_lv: &(String, String)) -> Result<Layout> {
        let candidate = EfiLvm::NAME;
        self.require_esp(candidate, boot)?;
        let pvs = self.require_volume_group(candidate)?;
        self.require_root_lv(candidate, root_lv)?;

        let mut pv_disks = Vec::new();
        for pv in &pvs {
            let disk = self.member_disk(candidate, pv, 2)?;
            self.require_table(candidate, &disk, PartitionTableType::Gpt)?;
            self.require_esp_size(candidate, &partition_path(&disk, 1))?;
            self.require_no_partition(candidate, &disk, 3, &disk)?;
            pv_disks.push(disk);
        }
        pv_disks.sort();

        let swap_lv = self.check_logical_volumes(candidate, true)?;

        let boot_disk = match split_partition(boot) {
            Some((disk, 1)) if pv_disks.contains(&disk) => disk,
            _ => {
                return Err(mismatch(
                    candidate,
                    "boot device is not partition 1 of a physical volume disk",
                ))
            }
        };
        for disk in pv_disks.iter().filter(|d| **d != boot_disk) {
            if self.devices.is_esp_partition(&partition_path(disk, 1))? {
                return Err(mismatch(candidate, "ESP flag exists on multiple harddisks"));
            }
        }

        Ok(Layout::EfiLvm(EfiLvm {
            volume_group: self.config.volume_group.clone(),
            pv_disks,
            root_lv: self.config.root_lv.clone(),
            swap_lv,
            boot_disk,
        }))
    }

    fn efi_bcache_lvm(&self, boot: &str, root_lv: &(String, String)) -> Result<Layout> {
        let candidate = EfiBcacheLvm::NAME;
        self.require_esp(candidate, boot)?;
        let pvs = self.require_volume_group(candidate)?;
        self.require_root_lv(candidate, root_lv)?;

        let mut pv_disks = BTreeMap::new();
        let mut slaves_of = BTreeMap::new();
        for pv in &pvs {
            if !is_bcache_device(pv) {
                return Err(mismatch(
                    candidate,
                    format!(
                        "volume group \"{}\" has non-bcache physical volume",
                        self.config.volume_group
                    ),
                ));
            }
            let slaves = self.devices.bcache_slaves(pv)?;
            let Some(backing) = slaves.last() else {
                return Err(mismatch(candidate, format!("{} has no backing device", pv)));
            };
            let disk = self.member_disk(candidate, backing, 2)?;
            self.require_table(candidate, &disk, PartitionTableType::Gpt)?;
            self.require_esp_size(candidate, &partition_path(&disk, 1))?;
            self.require_no_partition(candidate, &disk, 3, &disk)?;
            pv_disks.insert(disk, pv.clone());
            slaves_of.insert(pv.clone(), slaves);
        }

        self.check_logical_volumes(candidate, false)?;

        let layout = |ssd: Option<String>, boot_disk: Option<String>| {
            let part = |i| ssd.as_deref().map(|d| partition_path(d, i));
            EfiBcacheLvm {
                volume_group: self.config.volume_group.clone(),
                ssd_esp_partition: part(1),
                ssd_swap_partition: part(2),
                ssd_cache_partition: part(3),
                ssd,
                pv_disks: pv_disks.clone(),
                root_lv: self.config.root_lv.clone(),
                boot_disk,
            }
        };

        let boot_disk = partition_disk(boot).ok_or_else(|| {
            mismatch(candidate, format!("{} is not a partition of a fixed harddisk", boot))
        })?;

        if pv_disks.contains_key(&boot_disk) {
            if boot != partition_path(&boot_disk, 1) {
                return Err(mismatch(
                    candidate,
                    format!("boot device is not {}", partition_path(&boot_disk, 1)),
                ));
            }
            return Ok(Layout::EfiBcacheLvm(layout(None, Some(boot_disk))));
        }

        // Boot partition on a non-member disk: that disk is the SSD
        let ssd = boot_disk;
        let esp = partition_path(&ssd, 1);
        if boot != esp {
            return Err(mismatch(candidate, "SSD is not boot device"));
        }
        self.require_esp_size(candidate, &esp)?;

        let swap = partition_path(&ssd, 2);
        if !self.devices.exists(&swap) {
            return Err(mismatch(candidate, "SSD has no swap partition"));
        }
        if self.devices.filesystem_type(&swap)?.as_deref() != Some(SWAP_FS) {
            return Err(mismatch(
                candidate,
                format!("swap device {} has an invalid file system", swap),
            ));
        }

        let cache = partition_path(&ssd, 3);
        if !self.devices.exists(&cache) {
            return Err(mismatch(candidate, "SSD has no cache partition"));
        }
        for (pv, slaves) in &slaves_of {
            let backing = slaves.last().map(String::as_str).unwrap_or_default();
            match slaves.len() {
                0 | 1 => {
                    return Err(mismatch(
                        candidate,
                        format!("{}({}) has no cache device", pv, backing),
                    ))
                }
                2 => {}
                _ => {
                    return Err(mismatch(
                        candidate,
                        format!("{}({}) has multiple cache devices", pv, backing),
                    ))
                }
            }
            if slaves[0] != cache {
                return Err(mismatch(
                    candidate,
                    format!("{}({}) has invalid cache device", pv, backing),
                ));
            }
        }
        self.require_no_partition(candidate, &ssd, 4, "SSD")?;

        Ok(Layout::EfiBcacheLvm(layout(Some(ssd), None)))
    }
}

/// Classify the running system
pub fn classify(config: &EngineConfig, devices: &dyn BlockDeviceQuery) -> Result<Layout> {
    LayoutClassifier::new(config, devices).classify()
}
