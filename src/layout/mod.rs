//! Storage layouts
//!
//! A [`Layout`] is always derived from live device state by the
//! [`classifier`] and never persisted. The [`mutator`] consumes a layout,
//! performs the physical steps of a change and hands back the new value.

pub mod classifier;
pub mod mutator;

#[cfg(test)]
pub(crate) mod testing;

use crate::disk::lvm::lv_path;
use crate::disk::naming::partition_path;
use serde::Serialize;
use std::collections::BTreeMap;

pub use classifier::LayoutClassifier;
pub use mutator::{LayoutMutator, Transition};

/// Boot firmware a layout is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Bios,
    Efi,
}

impl std::fmt::Display for Firmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Firmware::Bios => write!(f, "bios"),
            Firmware::Efi => write!(f, "efi"),
        }
    }
}

/// Single MBR disk with an ext4 root partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BiosSimple {
    pub disk: String,
    pub root_partition: String,
    pub swap_file: Option<String>,
}

impl BiosSimple {
    pub const NAME: &'static str = "bios-simple";
}

/// MBR disks, one whole-disk LVM physical volume each
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BiosLvm {
    pub volume_group: String,
    pub pv_disks: Vec<String>,
    pub root_lv: String,
    pub swap_lv: Option<String>,
    /// The disk carrying boot code
    pub boot_disk: String,
}

impl BiosLvm {
    pub const NAME: &'static str = "bios-lvm";
}

/// Single GPT disk: ESP on partition 1, ext4 root on partition 2
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EfiSimple {
    pub disk: String,
    pub esp_partition: String,
    pub root_partition: String,
    pub swap_file: Option<String>,
}

impl EfiSimple {
    pub const NAME: &'static str = "efi-simple";
}

/// GPT disks with an ESP-sized partition 1 and an LVM physical volume on
/// partition 2; only the boot disk's partition 1 carries the ESP flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EfiLvm {
    pub volume_group: String,
    pub pv_disks: Vec<String>,
    pub root_lv: String,
    pub swap_lv: Option<String>,
    pub boot_disk: String,
}

impl EfiLvm {
    pub const NAME: &'static str = "efi-lvm";
}

/// HDDs whose partition 2 is a bcache backing device wrapped into an LVM
/// physical volume, optionally accelerated by one SSD (ESP, swap, cache)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EfiBcacheLvm {
    pub volume_group: String,
    pub ssd: Option<String>,
    pub ssd_esp_partition: Option<String>,
    pub ssd_swap_partition: Option<String>,
    pub ssd_cache_partition: Option<String>,
    /// HDD -> `/dev/bcacheN` stacked on its partition 2
    pub pv_disks: BTreeMap<String, String>,
    pub root_lv: String,
    /// Set only when there is no SSD
    pub boot_disk: Option<String>,
}

impl EfiBcacheLvm {
    pub const NAME: &'static str = "efi-bcache-lvm";
}

/// Device facts resembling a known layout but violating one of its rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonStandard {
    pub efi: bool,
    pub boot_disk: Option<String>,
    pub boot_partition: Option<String>,
    pub root_partition: String,
    pub closest_layout_name: String,
    pub message: String,
}

impl NonStandard {
    pub const NAME: &'static str = "non-standard";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "layout", rename_all = "kebab-case")]
pub enum Layout {
    Empty,
    BiosSimple(BiosSimple),
    BiosLvm(BiosLvm),
    EfiSimple(EfiSimple),
    EfiLvm(EfiLvm),
    EfiBcacheLvm(EfiBcacheLvm),
    NonStandard(NonStandard),
}

impl Layout {
    pub const EMPTY_NAME: &'static str = "empty";

    pub fn name(&self) -> &'static str {
        match self {
            Layout::Empty => Self::EMPTY_NAME,
            Layout::BiosSimple(_) => BiosSimple::NAME,
            Layout::BiosLvm(_) => BiosLvm::NAME,
            Layout::EfiSimple(_) => EfiSimple::NAME,
            Layout::EfiLvm(_) => EfiLvm::NAME,
            Layout::EfiBcacheLvm(_) => EfiBcacheLvm::NAME,
            Layout::NonStandard(_) => NonStandard::NAME,
        }
    }

    pub fn firmware(&self) -> Option<Firmware> {
        match self {
            Layout::Empty => None,
            Layout::BiosSimple(_) | Layout::BiosLvm(_) => Some(Firmware::Bios),
            Layout::EfiSimple(_) | Layout::EfiLvm(_) | Layout::EfiBcacheLvm(_) => {
                Some(Firmware::Efi)
            }
            Layout::NonStandard(l) if l.efi => Some(Firmware::Efi),
            Layout::NonStandard(_) => Some(Firmware::Bios),
        }
    }

    /// Disk holding the MBR boot code (BIOS layouts)
    pub fn boot_disk(&self) -> Option<&str> {
        match self {
            Layout::BiosSimple(l) => Some(&l.disk),
            Layout::BiosLvm(l) => Some(&l.boot_disk),
            Layout::NonStandard(l) if !l.efi => l.boot_disk.as_deref(),
            _ => None,
        }
    }

    /// The ESP mounted as boot storage (EFI layouts)
    pub fn boot_device(&self) -> Option<String> {
        match self {
            Layout::EfiSimple(l) => Some(l.esp_partition.clone()),
            Layout::EfiLvm(l) => Some(partition_path(&l.boot_disk, 1)),
            Layout::EfiBcacheLvm(l) => l
                .ssd_esp_partition
                .clone()
                .or_else(|| l.boot_disk.as_deref().map(|d| partition_path(d, 1))),
            Layout::NonStandard(l) if l.efi => l.boot_partition.clone(),
            _ => None,
        }
    }

    pub fn root_device(&self) -> Option<String> {
        match self {
            Layout::Empty => None,
            Layout::BiosSimple(l) => Some(l.root_partition.clone()),
            Layout::EfiSimple(l) => Some(l.root_partition.clone()),
            Layout::BiosLvm(l) => Some(lv_path(&l.volume_group, &l.root_lv)),
            Layout::EfiLvm(l) => Some(lv_path(&l.volume_group, &l.root_lv)),
            Layout::EfiBcacheLvm(l) => Some(lv_path(&l.volume_group, &l.root_lv)),
            Layout::NonStandard(l) => Some(l.root_partition.clone()),
        }
    }

    /// Current swap file, logical volume or partition
    pub fn swap_target(&self) -> Option<String> {
        match self {
            Layout::BiosSimple(l) => l.swap_file.clone(),
            Layout::EfiSimple(l) => l.swap_file.clone(),
            Layout::BiosLvm(l) => l.swap_lv.as_deref().map(|lv| lv_path(&l.volume_group, lv)),
            Layout::EfiLvm(l) => l.swap_lv.as_deref().map(|lv| lv_path(&l.volume_group, lv)),
            Layout::EfiBcacheLvm(l) => l.ssd_swap_partition.clone(),
            Layout::Empty | Layout::NonStandard(_) => None,
        }
    }

    /// Every disk the layout is built on, sorted
    pub fn disks(&self) -> Vec<String> {
        let mut disks = match self {
            Layout::Empty | Layout::NonStandard(_) => Vec::new(),
            Layout::BiosSimple(l) => vec![l.disk.clone()],
            Layout::EfiSimple(l) => vec![l.disk.clone()],
            Layout::BiosLvm(l) => l.pv_disks.clone(),
            Layout::EfiLvm(l) => l.pv_disks.clone(),
            Layout::EfiBcacheLvm(l) => l.pv_disks.keys().cloned().chain(l.ssd.clone()).collect(),
        };
        disks.sort();
        disks
    }

    /// Active ESP and the reserved ESP-sized partitions mirroring it
    pub fn boot_mirrors(&self) -> Option<(String, Vec<String>)> {
        match self {
            Layout::EfiLvm(l) => {
                let dsts: Vec<String> = l
                    .pv_disks
                    .iter()
                    .filter(|d| **d != l.boot_disk)
                    .map(|d| partition_path(d, 1))
                    .collect();
                (!dsts.is_empty()).then(|| (partition_path(&l.boot_disk, 1), dsts))
            }
            Layout::EfiBcacheLvm(l) => {
                let src = self.boot_device()?;
                let dsts: Vec<String> = l
                    .pv_disks
                    .keys()
                    .filter(|d| l.boot_disk.as_deref() != Some(d.as_str()))
                    .map(|d| partition_path(d, 1))
                    .collect();
                (!dsts.is_empty()).then_some((src, dsts))
            }
            _ => None,
        }
    }

    pub fn needs_boot_sync(&self) -> bool {
        self.boot_mirrors().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn efi_lvm() -> Layout {
        Layout::EfiLvm(EfiLvm {
            volume_group: "hdd".into(),
            pv_disks: vec!["/dev/sda".into(), "/dev/sdb".into()],
            root_lv: "root".into(),
            swap_lv: Some("swap".into()),
            boot_disk: "/dev/sdb".into(),
        })
    }

    #[test]
    fn accessors_follow_the_variant() {
        let layout = efi_lvm();
        assert_eq!(layout.name(), "efi-lvm");
        assert_eq!(layout.firmware(), Some(Firmware::Efi));
        assert_eq!(layout.boot_disk(), None);
        assert_eq!(layout.boot_device().as_deref(), Some("/dev/sdb1"));
        assert_eq!(layout.root_device().as_deref(), Some("/dev/hdd/root"));
        assert_eq!(layout.swap_target().as_deref(), Some("/dev/hdd/swap"));

        let bios = Layout::BiosSimple(BiosSimple {
            disk: "/dev/vda".into(),
            root_partition: "/dev/vda1".into(),
            swap_file: None,
        });
        assert_eq!(bios.boot_disk(), Some("/dev/vda"));
        assert_eq!(bios.boot_device(), None);
        assert_eq!(bios.swap_target(), None);
        assert_eq!(Layout::Empty.firmware(), None);
    }

    #[test]
    fn boot_mirrors_skip_the_boot_disk() {
        let (src, dsts) = efi_lvm().boot_mirrors().unwrap();
        assert_eq!(src, "/dev/sdb1");
        assert_eq!(dsts, vec!["/dev/sda1"]);

        let single = Layout::EfiLvm(EfiLvm {
            pv_disks: vec!["/dev/sdb".into()],
            ..match efi_lvm() {
                Layout::EfiLvm(l) => l,
                _ => unreachable!(),
            }
        });
        assert!(!single.needs_boot_sync());
    }

    #[test]
    fn bcache_with_ssd_mirrors_every_hdd() {
        let layout = Layout::EfiBcacheLvm(EfiBcacheLvm {
            volume_group: "hdd".into(),
            ssd: Some("/dev/nvme0n1".into()),
            ssd_esp_partition: Some("/dev/nvme0n1p1".into()),
            ssd_swap_partition: Some("/dev/nvme0n1p2".into()),
            ssd_cache_partition: Some("/dev/nvme0n1p3".into()),
            pv_disks: BTreeMap::from([("/dev/sda".to_string(), "/dev/bcache0".to_string())]),
            root_lv: "root".into(),
            boot_disk: None,
        });
        assert!(layout.needs_boot_sync());
        let (src, dsts) = layout.boot_mirrors().unwrap();
        assert_eq!(src, "/dev/nvme0n1p1");
        assert_eq!(dsts, vec!["/dev/sda1"]);
        assert_eq!(layout.disks(), vec!["/dev/nvme0n1", "/dev/sda"]);
        assert_eq!(layout.swap_target().as_deref(), Some("/dev/nvme0n1p2"));
    }

    #[test]
    fn serializes_with_kebab_case_tag() {
        let json = serde_json::to_value(efi_lvm()).unwrap();
        assert_eq!(json["layout"], "efi-lvm");
        assert_eq!(json["boot_disk"], "/dev/sdb");
        assert_eq!(serde_json::to_value(Layout::Empty).unwrap()["layout"], "empty");
    }
}
