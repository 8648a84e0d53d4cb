//! In-memory machine for classifier and mutator tests
//!
//! [`FakeDevices`] answers queries from a shared [`FakeState`];
//! [`RecordingOps`] logs every storage step and applies its effect to the
//! same state, so a second operation observes what the first one did.

use crate::disk::bcache::BcacheRole;
use crate::disk::lvm::lv_path;
use crate::disk::naming::{partition_path, split_partition};
use crate::disk::partitioning::{PartitionRole, PartitionSize, PartitionSpec};
use crate::disk::query::{BlockDeviceQuery, FilesystemUsage, PartitionTableType, SwapUnitState};
use crate::disk::storage::StorageOps;
use crate::utils::error::{Result, StorixError};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use uuid::Uuid;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

#[derive(Debug, Default)]
pub struct FakeState {
    pub fixed_disks: Vec<String>,
    pub ssds: BTreeSet<String>,
    pub nodes: BTreeSet<String>,
    pub tables: BTreeMap<String, PartitionTableType>,
    pub filesystems: BTreeMap<String, String>,
    pub sizes: BTreeMap<String, u64>,
    pub lvm: BTreeMap<String, (String, String)>,
    pub bcache_slaves: BTreeMap<String, Vec<String>>,
    pub bcache_roles: BTreeMap<String, BcacheRole>,
    pub set_uuids: BTreeMap<String, Uuid>,
    pub mounts: BTreeMap<String, String>,
    pub volume_groups: BTreeMap<String, Vec<String>>,
    pub logical_volumes: BTreeMap<String, Vec<String>>,
    pub pv_used: BTreeMap<String, u64>,
    pub boot_code: BTreeSet<String>,
    pub esp: BTreeSet<String>,
    pub usage: BTreeMap<String, FilesystemUsage>,
    pub memory: u64,
    pub swap_units: BTreeMap<String, SwapUnitState>,
}

#[derive(Debug, Clone)]
pub struct FakeDevices {
    state: Rc<RefCell<FakeState>>,
}

impl FakeDevices {
    pub fn new() -> Self {
        let state = FakeState {
            memory: 4 * GIB,
            ..FakeState::default()
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn ops(&self) -> RecordingOps {
        RecordingOps {
            state: Rc::clone(&self.state),
            log: Vec::new(),
        }
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.borrow_mut())
    }

    pub fn disk(&self, disk: &str, table: PartitionTableType, size: u64) -> &Self {
        self.with(|s| {
            s.fixed_disks.push(disk.to_string());
            s.nodes.insert(disk.to_string());
            s.tables.insert(disk.to_string(), table);
            s.sizes.insert(disk.to_string(), size);
        });
        self
    }

    pub fn ssd(&self, disk: &str, size: u64) -> &Self {
        self.disk(disk, PartitionTableType::None, size);
        self.with(|s| s.ssds.insert(disk.to_string()));
        self
    }

    pub fn partition(&self, partition: &str, size: u64, fs: Option<&str>) -> &Self {
        self.with(|s| {
            s.nodes.insert(partition.to_string());
            s.sizes.insert(partition.to_string(), size);
            if let Some(fs) = fs {
                s.filesystems.insert(partition.to_string(), fs.to_string());
            }
        });
        self
    }

    pub fn esp(&self, partition: &str) -> &Self {
        self.with(|s| s.esp.insert(partition.to_string()));
        self
    }

    pub fn boot_code(&self, disk: &str) -> &Self {
        self.with(|s| s.boot_code.insert(disk.to_string()));
        self
    }

    pub fn mount(&self, mount_point: &str, source: &str) -> &Self {
        self.with(|s| s.mounts.insert(mount_point.to_string(), source.to_string()));
        self
    }

    pub fn volume_group(&self, vg: &str, pvs: &[&str]) -> &Self {
        self.with(|s| {
            s.volume_groups
                .insert(vg.to_string(), pvs.iter().map(|p| p.to_string()).collect());
        });
        self
    }

    pub fn logical_volume(&self, vg: &str, lv: &str, fs: &str, size: u64) -> &Self {
        self.with(|s| add_lv(s, vg, lv, size, Some(fs)));
        self
    }

    /// `/dev/bcacheN` stacked on `backing`, with an optional cache partition
    pub fn bcache(&self, device: &str, backing: &str, cache: Option<&str>) -> &Self {
        self.with(|s| {
            s.nodes.insert(device.to_string());
            s.bcache_roles.insert(backing.to_string(), BcacheRole::Backing);
            let mut slaves: Vec<String> = cache.iter().map(|c| c.to_string()).collect();
            slaves.push(backing.to_string());
            s.bcache_slaves.insert(device.to_string(), slaves);
        });
        self
    }

    pub fn cache_set(&self, partition: &str, set_uuid: Uuid) -> &Self {
        self.with(|s| {
            s.bcache_roles.insert(partition.to_string(), BcacheRole::Cache);
            s.set_uuids.insert(partition.to_string(), set_uuid);
        });
        self
    }

    pub fn pv_used(&self, pv: &str, bytes: u64) -> &Self {
        self.with(|s| s.pv_used.insert(pv.to_string(), bytes));
        self
    }

    pub fn usage(&self, mount_point: &str, used: u64, total: u64) -> &Self {
        self.with(|s| s.usage.insert(mount_point.to_string(), FilesystemUsage { used, total }));
        self
    }
}

fn add_lv(s: &mut FakeState, vg: &str, lv: &str, size: u64, fs: Option<&str>) {
    let path = lv_path(vg, lv);
    s.logical_volumes
        .entry(vg.to_string())
        .or_default()
        .push(lv.to_string());
    s.nodes.insert(path.clone());
    s.sizes.insert(path.clone(), size);
    s.lvm.insert(path.clone(), (vg.to_string(), lv.to_string()));
    if let Some(fs) = fs {
        s.filesystems.insert(path, fs.to_string());
    }
}

fn missing(what: &str) -> StorixError {
    StorixError::DeviceNotFound(what.to_string())
}

impl BlockDeviceQuery for FakeDevices {
    fn fixed_disks(&self) -> Result<Vec<String>> {
        Ok(self.state.borrow().fixed_disks.clone())
    }

    fn exists(&self, path: &str) -> bool {
        self.state.borrow().nodes.contains(path)
    }

    fn partition_table_type(&self, disk: &str) -> Result<PartitionTableType> {
        let s = self.state.borrow();
        Ok(s.tables.get(disk).copied().unwrap_or(PartitionTableType::None))
    }

    fn filesystem_type(&self, device: &str) -> Result<Option<String>> {
        Ok(self.state.borrow().filesystems.get(device).cloned())
    }

    fn size_bytes(&self, device: &str) -> Result<u64> {
        self.state
            .borrow()
            .sizes
            .get(device)
            .copied()
            .ok_or_else(|| missing(device))
    }

    fn lvm_info(&self, device: &str) -> Result<Option<(String, String)>> {
        Ok(self.state.borrow().lvm.get(device).cloned())
    }

    fn bcache_slaves(&self, bcache_device: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .borrow()
            .bcache_slaves
            .get(bcache_device)
            .cloned()
            .unwrap_or_default())
    }

    fn bcache_role(&self, device: &str) -> Result<Option<BcacheRole>> {
        Ok(self.state.borrow().bcache_roles.get(device).copied())
    }

    fn bcache_set_uuid(&self, cache_device: &str) -> Result<Uuid> {
        self.state
            .borrow()
            .set_uuids
            .get(cache_device)
            .copied()
            .ok_or_else(|| StorixError::codec(format!("{} is not a cache device", cache_device)))
    }

    fn bcache_device_for_backing(&self, partition: &str) -> Result<Option<String>> {
        let s = self.state.borrow();
        Ok(s.bcache_slaves
            .iter()
            .find(|(_, slaves)| slaves.last().map(String::as_str) == Some(partition))
            .map(|(dev, _)| dev.clone()))
    }

    fn mount_source(&self, mount_point: &str) -> Result<Option<String>> {
        Ok(self.state.borrow().mounts.get(mount_point).cloned())
    }

    fn volume_group_exists(&self, vg: &str) -> Result<bool> {
        Ok(self.state.borrow().volume_groups.contains_key(vg))
    }

    fn physical_volumes(&self, vg: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .borrow()
            .volume_groups
            .get(vg)
            .cloned()
            .unwrap_or_default())
    }

    fn logical_volumes(&self, vg: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .borrow()
            .logical_volumes
            .get(vg)
            .cloned()
            .unwrap_or_default())
    }

    fn pv_used_bytes(&self, pv: &str) -> Result<u64> {
        Ok(self.state.borrow().pv_used.get(pv).copied().unwrap_or(0))
    }

    fn is_ssd(&self, disk: &str) -> Result<bool> {
        Ok(self.state.borrow().ssds.contains(disk))
    }

    fn has_boot_code(&self, disk: &str) -> Result<bool> {
        Ok(self.state.borrow().boot_code.contains(disk))
    }

    fn is_esp_partition(&self, partition: &str) -> Result<bool> {
        Ok(self.state.borrow().esp.contains(partition))
    }

    fn filesystem_usage(&self, mount_point: &str) -> Result<FilesystemUsage> {
        self.state
            .borrow()
            .usage
            .get(mount_point)
            .copied()
            .ok_or_else(|| missing(mount_point))
    }

    fn memory_bytes(&self) -> Result<u64> {
        Ok(self.state.borrow().memory)
    }

    fn swap_unit(&self, unit_name: &str, _target: &str) -> Result<SwapUnitState> {
        Ok(self
            .state
            .borrow()
            .swap_units
            .get(unit_name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Two GPT disks, sdb booting, both carrying PVs on partition 2
pub fn efi_lvm_machine() -> FakeDevices {
    let dev = FakeDevices::new();
    for disk in ["/dev/sda", "/dev/sdb"] {
        dev.disk(disk, PartitionTableType::Gpt, 100 * GIB)
            .partition(&format!("{}1", disk), 512 * MIB, Some("vfat"))
            .partition(&format!("{}2", disk), 99 * GIB, Some("LVM2_member"));
    }
    dev.esp("/dev/sdb1")
        .volume_group("hdd", &["/dev/sda2", "/dev/sdb2"])
        .logical_volume("hdd", "root", "ext4", 150 * GIB)
        .logical_volume("hdd", "swap", "swap", 8 * GIB)
        .mount("/", "/dev/mapper/hdd-root")
        .mount("/boot", "/dev/sdb1");
    dev.with(|s| {
        s.lvm.insert("/dev/mapper/hdd-root".into(), ("hdd".into(), "root".into()));
    });
    dev
}

pub fn bios_lvm_machine() -> FakeDevices {
    let dev = FakeDevices::new();
    for disk in ["/dev/sda", "/dev/sdb"] {
        dev.disk(disk, PartitionTableType::Mbr, 100 * GIB)
            .partition(&format!("{}1", disk), 100 * GIB, Some("LVM2_member"));
    }
    dev.boot_code("/dev/sda")
        .volume_group("hdd", &["/dev/sda1", "/dev/sdb1"])
        .logical_volume("hdd", "root", "ext4", 150 * GIB)
        .mount("/", "/dev/hdd/root");
    dev
}

pub fn bcache_machine(with_ssd: bool) -> FakeDevices {
    let dev = FakeDevices::new();
    let set = Uuid::new_v4();
    let cache = with_ssd.then_some("/dev/nvme0n1p3");
    for (i, disk) in ["/dev/sda", "/dev/sdb"].iter().enumerate() {
        dev.disk(disk, PartitionTableType::Gpt, 1000 * GIB)
            .partition(&format!("{}1", disk), 512 * MIB, Some("vfat"))
            .partition(&format!("{}2", disk), 999 * GIB, None)
            .bcache(&format!("/dev/bcache{}", i), &format!("{}2", disk), cache);
    }
    dev.volume_group("hdd", &["/dev/bcache0", "/dev/bcache1"])
        .logical_volume("hdd", "root", "ext4", 1500 * GIB)
        .mount("/", "/dev/hdd/root");
    if with_ssd {
        dev.ssd("/dev/nvme0n1", 256 * GIB);
        dev.with(|s| {
            s.tables.insert("/dev/nvme0n1".into(), PartitionTableType::Gpt);
        });
        dev.partition("/dev/nvme0n1p1", 512 * MIB, Some("vfat"))
            .esp("/dev/nvme0n1p1")
            .partition("/dev/nvme0n1p2", 10 * GIB, Some("swap"))
            .partition("/dev/nvme0n1p3", 200 * GIB, None)
            .cache_set("/dev/nvme0n1p3", set)
            .mount("/boot", "/dev/nvme0n1p1");
    } else {
        dev.esp("/dev/sda1").mount("/boot", "/dev/sda1");
    }
    dev
}

/// One recorded storage step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    InitializeDisk(String, PartitionTableType, Vec<PartitionSpec>),
    WipeDisk(String),
    SetEspFlag(String, bool),
    FormatEsp(String),
    FormatSwap(String),
    SyncBootFiles(String, String),
    Mount(String, String, bool),
    Unmount(String),
    CreatePv(String),
    RemovePv(String),
    ExtendVg(String, String),
    ReduceVg(String, String),
    MovePv(String),
    CreateLv(String, String, u64),
    RemoveLv(String, String),
    ExtendLv(String, String, u64),
    GrowFilesystem(String),
    MakeBcache(String, BcacheRole),
    RegisterCache(String),
    RegisterBacking(String),
    AttachBcache(String, Uuid),
    UnregisterCacheSet(Uuid),
    StopBcache(String),
    CreateSwapFile(String, u64),
    RemoveSwapFile(String),
    InstallSwapUnit(String),
    RemoveSwapUnit(String),
    EnableSwap(String),
    DisableSwap(String),
}

#[derive(Debug)]
pub struct RecordingOps {
    state: Rc<RefCell<FakeState>>,
    pub log: Vec<Op>,
}

impl RecordingOps {
    fn apply<T>(&mut self, op: Op, f: impl FnOnce(&mut FakeState) -> T) -> T {
        self.log.push(op);
        f(&mut self.state.borrow_mut())
    }
}

impl StorageOps for RecordingOps {
    fn initialize_disk(
        &mut self,
        disk: &str,
        table: PartitionTableType,
        parts: &[PartitionSpec],
    ) -> Result<Vec<String>> {
        let op = Op::InitializeDisk(disk.to_string(), table, parts.to_vec());
        self.apply(op, |s| {
            s.tables.insert(disk.to_string(), table);
            let total = s.sizes.get(disk).copied().unwrap_or(0);
            let fixed: u64 = parts
                .iter()
                .filter_map(|p| match p.size {
                    PartitionSize::Bytes(b) => Some(b),
                    PartitionSize::Rest => None,
                })
                .sum();
            let mut paths = Vec::new();
            for (i, part) in parts.iter().enumerate() {
                let path = partition_path(disk, i as u32 + 1);
                let size = match part.size {
                    PartitionSize::Bytes(b) => b,
                    PartitionSize::Rest => total.saturating_sub(fixed),
                };
                s.nodes.insert(path.clone());
                s.sizes.insert(path.clone(), size);
                s.filesystems.remove(&path);
                if part.role == PartitionRole::Esp {
                    s.esp.insert(path.clone());
                } else {
                    s.esp.remove(&path);
                }
                paths.push(path);
            }
            Ok(paths)
        })
    }

    fn wipe_disk(&mut self, disk: &str) -> Result<()> {
        self.apply(Op::WipeDisk(disk.to_string()), |s| {
            s.tables.insert(disk.to_string(), PartitionTableType::None);
            s.boot_code.remove(disk);
            s.nodes
                .retain(|n| split_partition(n).map(|(d, _)| d) != Some(disk.to_string()));
            s.esp
                .retain(|n| split_partition(n).map(|(d, _)| d) != Some(disk.to_string()));
            Ok(())
        })
    }

    fn set_esp_flag(&mut self, partition: &str, on: bool) -> Result<()> {
        self.apply(Op::SetEspFlag(partition.to_string(), on), |s| {
            if on {
                s.esp.insert(partition.to_string());
            } else {
                s.esp.remove(partition);
            }
            Ok(())
        })
    }

    fn format_esp(&mut self, partition: &str) -> Result<()> {
        self.apply(Op::FormatEsp(partition.to_string()), |s| {
            s.filesystems.insert(partition.to_string(), "vfat".into());
            Ok(())
        })
    }

    fn format_swap(&mut self, target: &str) -> Result<()> {
        self.apply(Op::FormatSwap(target.to_string()), |s| {
            s.filesystems.insert(target.to_string(), "swap".into());
            Ok(())
        })
    }

    fn sync_boot_files(&mut self, src_partition: &str, _src_mount: &str, dst_partition: &str) -> Result<()> {
        let op = Op::SyncBootFiles(src_partition.to_string(), dst_partition.to_string());
        self.apply(op, |_| Ok(()))
    }

    fn mount(&mut self, device: &str, mount_point: &str, read_only: bool) -> Result<()> {
        let op = Op::Mount(device.to_string(), mount_point.to_string(), read_only);
        self.apply(op, |s| {
            s.mounts.insert(mount_point.to_string(), device.to_string());
            Ok(())
        })
    }

    fn unmount(&mut self, mount_point: &str) -> Result<()> {
        self.apply(Op::Unmount(mount_point.to_string()), |s| {
            s.mounts.remove(mount_point);
            Ok(())
        })
    }

    fn create_pv(&mut self, device: &str) -> Result<()> {
        self.apply(Op::CreatePv(device.to_string()), |_| Ok(()))
    }

    fn remove_pv(&mut self, device: &str) -> Result<()> {
        self.apply(Op::RemovePv(device.to_string()), |_| Ok(()))
    }

    fn extend_vg(&mut self, vg: &str, pv: &str) -> Result<()> {
        self.apply(Op::ExtendVg(vg.to_string(), pv.to_string()), |s| {
            s.volume_groups
                .entry(vg.to_string())
                .or_default()
                .push(pv.to_string());
            Ok(())
        })
    }

    fn reduce_vg(&mut self, vg: &str, pv: &str) -> Result<()> {
        self.apply(Op::ReduceVg(vg.to_string(), pv.to_string()), |s| {
            if let Some(pvs) = s.volume_groups.get_mut(vg) {
                pvs.retain(|p| p != pv);
            }
            Ok(())
        })
    }

    fn move_pv(&mut self, pv: &str) -> Result<()> {
        self.apply(Op::MovePv(pv.to_string()), |s| {
            s.pv_used.insert(pv.to_string(), 0);
            Ok(())
        })
    }

    fn create_lv(&mut self, vg: &str, lv: &str, size_bytes: u64) -> Result<()> {
        let op = Op::CreateLv(vg.to_string(), lv.to_string(), size_bytes);
        self.apply(op, |s| {
            add_lv(s, vg, lv, size_bytes, None);
            Ok(())
        })
    }

    fn remove_lv(&mut self, vg: &str, lv: &str) -> Result<()> {
        self.apply(Op::RemoveLv(vg.to_string(), lv.to_string()), |s| {
            let path = lv_path(vg, lv);
            if let Some(lvs) = s.logical_volumes.get_mut(vg) {
                lvs.retain(|l| l != lv);
            }
            s.nodes.remove(&path);
            s.sizes.remove(&path);
            s.lvm.remove(&path);
            s.filesystems.remove(&path);
            Ok(())
        })
    }

    fn extend_lv(&mut self, vg: &str, lv: &str, add_gib: u64) -> Result<()> {
        let op = Op::ExtendLv(vg.to_string(), lv.to_string(), add_gib);
        self.apply(op, |s| {
            *s.sizes.entry(lv_path(vg, lv)).or_default() += add_gib * GIB;
            Ok(())
        })
    }

    fn grow_filesystem(&mut self, device: &str) -> Result<()> {
        self.apply(Op::GrowFilesystem(device.to_string()), |_| Ok(()))
    }

    fn make_bcache(&mut self, device: &str, role: BcacheRole) -> Result<(Uuid, Uuid)> {
        self.apply(Op::MakeBcache(device.to_string(), role), |s| {
            let set_uuid = Uuid::new_v4();
            s.bcache_roles.insert(device.to_string(), role);
            if role == BcacheRole::Cache {
                s.set_uuids.insert(device.to_string(), set_uuid);
            }
            Ok((Uuid::new_v4(), set_uuid))
        })
    }

    fn register_bcache_cache(&mut self, partition: &str) -> Result<()> {
        self.apply(Op::RegisterCache(partition.to_string()), |_| Ok(()))
    }

    fn register_bcache_backing(&mut self, partition: &str) -> Result<String> {
        self.apply(Op::RegisterBacking(partition.to_string()), |s| {
            let device = (0..)
                .map(|n| format!("/dev/bcache{}", n))
                .find(|d| !s.bcache_slaves.contains_key(d))
                .unwrap_or_default();
            s.nodes.insert(device.clone());
            s.bcache_slaves
                .insert(device.clone(), vec![partition.to_string()]);
            Ok(device)
        })
    }

    fn attach_bcache(&mut self, bcache_device: &str, set_uuid: &Uuid) -> Result<()> {
        self.apply(Op::AttachBcache(bcache_device.to_string(), *set_uuid), |s| {
            let cache = s
                .set_uuids
                .iter()
                .find(|(_, u)| *u == set_uuid)
                .map(|(p, _)| p.clone());
            if let (Some(cache), Some(slaves)) = (cache, s.bcache_slaves.get_mut(bcache_device)) {
                slaves.insert(0, cache);
            }
            Ok(())
        })
    }

    fn unregister_cache_set(&mut self, set_uuid: &Uuid) -> Result<()> {
        self.apply(Op::UnregisterCacheSet(*set_uuid), |s| {
            let cache = s
                .set_uuids
                .iter()
                .find(|(_, u)| *u == set_uuid)
                .map(|(p, _)| p.clone());
            if let Some(cache) = cache {
                for slaves in s.bcache_slaves.values_mut() {
                    slaves.retain(|p| *p != cache);
                }
            }
            Ok(())
        })
    }

    fn stop_bcache(&mut self, bcache_device: &str) -> Result<()> {
        self.apply(Op::StopBcache(bcache_device.to_string()), |s| {
            s.bcache_slaves.remove(bcache_device);
            s.nodes.remove(bcache_device);
            Ok(())
        })
    }

    fn create_swap_file(&mut self, path: &str, size_bytes: u64) -> Result<()> {
        self.apply(Op::CreateSwapFile(path.to_string(), size_bytes), |s| {
            s.nodes.insert(path.to_string());
            s.sizes.insert(path.to_string(), size_bytes);
            s.filesystems.insert(path.to_string(), "swap".into());
            Ok(())
        })
    }

    fn remove_swap_file(&mut self, path: &str) -> Result<()> {
        self.apply(Op::RemoveSwapFile(path.to_string()), |s| {
            s.nodes.remove(path);
            s.sizes.remove(path);
            s.filesystems.remove(path);
            Ok(())
        })
    }

    fn install_swap_unit(&mut self, unit: &str, content: &str) -> Result<()> {
        self.apply(Op::InstallSwapUnit(unit.to_string()), |s| {
            s.swap_units.entry(unit.to_string()).or_default().content = Some(content.to_string());
            Ok(())
        })
    }

    fn remove_swap_unit(&mut self, unit: &str) -> Result<()> {
        self.apply(Op::RemoveSwapUnit(unit.to_string()), |s| {
            s.swap_units.remove(unit);
            Ok(())
        })
    }

    fn enable_swap(&mut self, unit: &str, _target: &str) -> Result<()> {
        self.apply(Op::EnableSwap(unit.to_string()), |s| {
            let state = s.swap_units.entry(unit.to_string()).or_default();
            state.enabled = true;
            state.active = true;
            Ok(())
        })
    }

    fn disable_swap(&mut self, unit: &str, _target: &str) -> Result<()> {
        self.apply(Op::DisableSwap(unit.to_string()), |s| {
            if let Some(state) = s.swap_units.get_mut(unit) {
                state.enabled = false;
                state.active = false;
            }
            Ok(())
        })
    }
}
