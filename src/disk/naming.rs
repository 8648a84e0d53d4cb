//! Disk and partition device-path conventions
//!
//! `/dev/sda` + 2 -> `/dev/sda2`, `/dev/nvme0n1` + 2 -> `/dev/nvme0n1p2`.

use once_cell::sync::Lazy;
use regex::Regex;

/// Whole-disk names whose partitions append the number directly
static LETTER_DISK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/dev/(?:sd|vd|xvd)[a-z]+$").expect("valid regex")
});

/// Whole-disk names whose partitions use a `p` separator
static NUMBERED_DISK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/dev/(?:nvme[0-9]+n[0-9]+|mmcblk[0-9]+)$").expect("valid regex")
});

static LETTER_PARTITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(/dev/(?:sd|vd|xvd)[a-z]+)([0-9]+)$").expect("valid regex")
});

static NUMBERED_PARTITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(/dev/(?:nvme[0-9]+n[0-9]+|mmcblk[0-9]+))p([0-9]+)$").expect("valid regex")
});

static BCACHE_DEVICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/dev/bcache[0-9]+$").expect("valid regex"));

/// Returns `true` for a recognised whole-disk path
pub fn is_whole_disk(path: &str) -> bool {
    LETTER_DISK.is_match(path) || NUMBERED_DISK.is_match(path)
}

/// Returns `true` for `/dev/bcacheN`
pub fn is_bcache_device(path: &str) -> bool {
    BCACHE_DEVICE.is_match(path)
}

/// Partition device path for a disk and 1-based partition index.
///
/// Panics when `disk` does not follow a known whole-disk naming pattern:
/// callers only pass disks obtained from `split_partition` or from the
/// fixed-disk list, so anything else is a bug in the naming table.
pub fn partition_path(disk: &str, index: u32) -> String {
    if LETTER_DISK.is_match(disk) {
        format!("{}{}", disk, index)
    } else if NUMBERED_DISK.is_match(disk) {
        format!("{}p{}", disk, index)
    } else {
        panic!("unsupported disk naming pattern: {}", disk)
    }
}

/// Split a partition path into (disk path, 1-based partition index).
///
/// Returns `None` when the path is not a partition of a recognised disk.
pub fn split_partition(path: &str) -> Option<(String, u32)> {
    let caps = LETTER_PARTITION
        .captures(path)
        .or_else(|| NUMBERED_PARTITION.captures(path))?;
    let index = caps[2].parse().ok()?;
    Some((caps[1].to_string(), index))
}

/// Owning disk of a partition path
pub fn partition_disk(path: &str) -> Option<String> {
    split_partition(path).map(|(disk, _)| disk)
}

/// Kernel name of a device (`/dev/sda1` -> `sda1`)
pub fn kernel_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_path() {
        assert_eq!(partition_path("/dev/sda", 1), "/dev/sda1");
        assert_eq!(partition_path("/dev/vdb", 12), "/dev/vdb12");
        assert_eq!(partition_path("/dev/xvdc", 3), "/dev/xvdc3");
        assert_eq!(partition_path("/dev/nvme0n1", 2), "/dev/nvme0n1p2");
        assert_eq!(partition_path("/dev/mmcblk0", 1), "/dev/mmcblk0p1");
    }

    #[test]
    #[should_panic(expected = "unsupported disk naming pattern")]
    fn partition_path_rejects_partitions() {
        partition_path("/dev/sda1", 1);
    }

    #[test]
    fn test_split_partition() {
        assert_eq!(split_partition("/dev/sda2"), Some(("/dev/sda".to_string(), 2)));
        assert_eq!(
            split_partition("/dev/nvme1n1p10"),
            Some(("/dev/nvme1n1".to_string(), 10))
        );
        assert_eq!(split_partition("/dev/sda"), None);
        assert_eq!(split_partition("/dev/nvme0n1"), None);
        assert_eq!(split_partition("/dev/bcache0"), None);
        assert_eq!(split_partition("/dev/mapper/hdd-root"), None);
    }

    #[test]
    fn split_then_join_is_identity() {
        for p in ["/dev/sdb1", "/dev/vda3", "/dev/nvme0n1p2", "/dev/mmcblk0p1"] {
            let (disk, idx) = split_partition(p).unwrap();
            assert!(is_whole_disk(&disk));
            assert_eq!(partition_path(&disk, idx), p);
        }
    }

    #[test]
    fn test_device_classes() {
        assert!(is_whole_disk("/dev/sda"));
        assert!(!is_whole_disk("/dev/sda1"));
        assert!(is_bcache_device("/dev/bcache12"));
        assert!(!is_bcache_device("/dev/bcache"));
        assert_eq!(kernel_name("/dev/bcache0"), "bcache0");
    }
}
