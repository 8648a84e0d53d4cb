//! Partition table creation
//!
//! A table is declared as an ordered list of (size or "rest", role) pairs.
//! Entries before the "rest" entry are packed from the first aligned sector
//! upward, entries after it are packed against the end of the disk, and the
//! "rest" entry takes whatever lies between.

use crate::disk::gpt::SECTOR_SIZE;
use crate::disk::naming::{partition_path, split_partition};
use crate::disk::query::PartitionTableType;
use crate::utils::command::{run_command_output, CommandRunner};
use crate::utils::error::{Result, StorixError};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// First usable sector, also the alignment grain (1 MiB)
pub const FIRST_LBA: u64 = 2048;
pub const ALIGN_SECTORS: u64 = 2048;

/// Sectors reserved at the end of a GPT disk for the backup table
pub const GPT_BACKUP_SECTORS: u64 = 34;

/// Bytes zeroed at the start of every new partition
pub const SIGNATURE_ERASE_BYTES: usize = 16 * 1024;

const MBR_PRIMARY_LIMIT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    Bytes(u64),
    /// Everything not claimed by the other entries
    Rest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionRole {
    Plain,
    Esp,
    Bcache,
    Swap,
    LvmPv,
    /// Partition typed for a filesystem (`vfat`, `ext4`, ...)
    Filesystem(String),
}

impl PartitionRole {
    fn gpt_type(&self) -> &'static str {
        match self {
            Self::Esp => "C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
            Self::LvmPv => "E6D6D379-F507-44C2-A23C-238F2A3DF928",
            Self::Swap => "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F",
            Self::Filesystem(fs) if fs == "vfat" => "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7",
            Self::Plain | Self::Bcache | Self::Filesystem(_) => "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
        }
    }

    fn mbr_type(&self) -> &'static str {
        match self {
            Self::Swap => "82",
            Self::LvmPv => "8e",
            Self::Filesystem(fs) if fs == "vfat" => "c",
            _ => "83",
        }
    }

    fn gpt_only(&self) -> bool {
        matches!(self, Self::Esp | Self::Bcache)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub size: PartitionSize,
    pub role: PartitionRole,
}

impl PartitionSpec {
    pub fn new(size: PartitionSize, role: PartitionRole) -> Self {
        Self { size, role }
    }

    pub fn bytes(bytes: u64, role: PartitionRole) -> Self {
        Self::new(PartitionSize::Bytes(bytes), role)
    }

    pub fn rest(role: PartitionRole) -> Self {
        Self::new(PartitionSize::Rest, role)
    }
}

/// A partition placed on the disk, in 512-byte sectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPartition {
    pub number: u32,
    pub start: u64,
    pub sectors: u64,
    pub role: PartitionRole,
}

impl PlannedPartition {
    pub fn end(&self) -> u64 {
        self.start + self.sectors
    }
}

fn align_up(sector: u64) -> u64 {
    sector.div_ceil(ALIGN_SECTORS) * ALIGN_SECTORS
}

fn align_down(sector: u64) -> u64 {
    sector / ALIGN_SECTORS * ALIGN_SECTORS
}

fn to_sectors(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}

fn no_space(what: &str) -> StorixError {
    StorixError::PartitionError(format!("insufficient space for {}", what))
}

/// Place `parts` on a disk of `total_sectors` sectors.
pub fn plan_partitions(
    total_sectors: u64,
    table: PartitionTableType,
    parts: &[PartitionSpec],
) -> Result<Vec<PlannedPartition>> {
    if parts.is_empty() {
        return Err(StorixError::PartitionError("no partitions requested".into()));
    }

    // Exclusive end of the usable area
    let usable_end = match table {
        PartitionTableType::Gpt => total_sectors.saturating_sub(GPT_BACKUP_SECTORS - 1),
        PartitionTableType::Mbr => {
            if parts.len() > MBR_PRIMARY_LIMIT {
                return Err(StorixError::PartitionError(format!(
                    "an MBR table holds at most {} partitions",
                    MBR_PRIMARY_LIMIT
                )));
            }
            if let Some(p) = parts.iter().find(|p| p.role.gpt_only()) {
                return Err(StorixError::PartitionError(format!(
                    "{:?} partitions require a GPT table",
                    p.role
                )));
            }
            total_sectors
        }
        PartitionTableType::None => {
            return Err(StorixError::PartitionError("no partition table type given".into()))
        }
    };

    let rest_positions: Vec<usize> = parts
        .iter()
        .enumerate()
        .filter(|(_, p)| p.size == PartitionSize::Rest)
        .map(|(i, _)| i)
        .collect();
    if rest_positions.len() > 1 {
        return Err(StorixError::PartitionError(
            "only one partition may take the rest of the disk".into(),
        ));
    }
    let rest_at = rest_positions.first().copied().unwrap_or(parts.len());

    let fixed_sectors = |p: &PartitionSpec| match p.size {
        PartitionSize::Bytes(b) if b > 0 => Ok(to_sectors(b)),
        PartitionSize::Bytes(_) => Err(StorixError::PartitionError("zero-sized partition".into())),
        PartitionSize::Rest => unreachable!("rest entry sized as fixed"),
    };

    let mut planned = Vec::with_capacity(parts.len());

    // Head: lowest aligned offsets upward
    let mut cursor = FIRST_LBA;
    for (i, part) in parts[..rest_at].iter().enumerate() {
        let sectors = fixed_sectors(part)?;
        if cursor + sectors > usable_end {
            return Err(no_space(&format!("partition {}", i + 1)));
        }
        planned.push(PlannedPartition {
            number: i as u32 + 1,
            start: cursor,
            sectors,
            role: part.role.clone(),
        });
        cursor = align_up(cursor + sectors);
    }

    if rest_at == parts.len() {
        return Ok(planned);
    }

    // Tail: packed against the end, last entry last
    let mut tail = Vec::new();
    let mut tail_end = usable_end;
    for (offset, part) in parts[rest_at + 1..].iter().enumerate().rev() {
        let sectors = fixed_sectors(part)?;
        let start = align_down(tail_end.checked_sub(sectors).ok_or_else(|| {
            no_space(&format!("partition {}", rest_at + offset + 2))
        })?);
        if start < cursor {
            return Err(no_space(&format!("partition {}", rest_at + offset + 2)));
        }
        tail.push(PlannedPartition {
            number: (rest_at + offset + 2) as u32,
            start,
            sectors,
            role: part.role.clone(),
        });
        tail_end = start;
    }
    tail.reverse();

    if tail_end <= cursor {
        return Err(no_space(&format!("partition {}", rest_at + 1)));
    }
    planned.push(PlannedPartition {
        number: rest_at as u32 + 1,
        start: cursor,
        sectors: tail_end - cursor,
        role: parts[rest_at].role.clone(),
    });
    planned.extend(tail);

    Ok(planned)
}

/// Generate the sfdisk script for a planned table
pub fn generate_sfdisk_script(disk: &str, table: PartitionTableType, planned: &[PlannedPartition]) -> String {
    let mut script = String::new();
    match table {
        PartitionTableType::Gpt => script.push_str("label: gpt\n"),
        _ => script.push_str("label: dos\n"),
    }
    script.push_str(&format!("device: {}\n", disk));
    script.push_str("unit: sectors\n");
    script.push_str(&format!("sector-size: {}\n", SECTOR_SIZE));
    script.push('\n');

    for part in planned {
        let type_code = match table {
            PartitionTableType::Gpt => part.role.gpt_type(),
            _ => part.role.mbr_type(),
        };
        script.push_str(&format!(
            "{} : start={}, size={}, type={}\n",
            partition_path(disk, part.number),
            part.start,
            part.sectors,
            type_code
        ));
    }

    script
}

/// Zero the leading bytes of every planned partition through the disk node
pub fn erase_signatures<W: Write + Seek>(disk: &mut W, planned: &[PlannedPartition]) -> Result<()> {
    let zeros = [0u8; SIGNATURE_ERASE_BYTES];
    for part in planned {
        let len = (part.sectors * SECTOR_SIZE).min(SIGNATURE_ERASE_BYTES as u64) as usize;
        disk.seek(SeekFrom::Start(part.start * SECTOR_SIZE))?;
        disk.write_all(&zeros[..len])?;
    }
    disk.flush()?;
    Ok(())
}

fn disk_sectors(disk: &str) -> Result<u64> {
    let out = run_command_output("blockdev", &["--getsz", disk])?;
    out.trim().parse().map_err(|_| {
        StorixError::PartitionError(format!("cannot read size of {}: '{}'", disk, out))
    })
}

/// Replace the partition table of `disk` and return the new partition paths
pub fn initialize_disk(
    cmd: &CommandRunner,
    disk: &str,
    table: PartitionTableType,
    parts: &[PartitionSpec],
) -> Result<Vec<String>> {
    let total = disk_sectors(disk)?;
    let planned = plan_partitions(total, table, parts)?;
    let script = generate_sfdisk_script(disk, table, &planned);
    let paths: Vec<String> = planned.iter().map(|p| partition_path(disk, p.number)).collect();

    info!("Applying {} partition layout to {}", planned.len(), disk);

    if cmd.is_dry_run() {
        println!("  [dry-run] Would apply sfdisk script:");
        for line in script.lines() {
            println!("    {}", line);
        }
        return Ok(paths);
    }

    info!("Wiping existing partition table on {}...", disk);
    cmd.run("wipefs", &["-a", "-f", disk])?;

    info!("Writing new {} partition table to {}...", table, disk);
    debug!("sfdisk script:\n{}", script);
    let mut child = Command::new("sfdisk")
        .arg(disk)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| StorixError::CommandFailed {
            command: "sfdisk".to_string(),
            stderr: e.to_string(),
        })?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(script.as_bytes())?;
    }
    let result = child.wait_with_output()?;
    if !result.status.success() {
        return Err(StorixError::PartitionError(format!(
            "sfdisk failed: {}",
            String::from_utf8_lossy(&result.stderr)
        )));
    }

    let mut dev = OpenOptions::new().write(true).open(disk)?;
    erase_signatures(&mut dev, &planned)?;
    dev.sync_all()?;

    info!("Notifying kernel of partition table changes on {}...", disk);
    cmd.run_or_warn("partprobe", &[disk]);
    cmd.settle();

    info!(
        "Partitioning of {} complete ({} partitions created)",
        disk,
        planned.len()
    );
    Ok(paths)
}

/// Set or clear the ESP flag of a GPT partition
pub fn set_esp_flag(cmd: &CommandRunner, partition: &str, on: bool) -> Result<()> {
    let (disk, index) = split_partition(partition)
        .ok_or_else(|| StorixError::UnsupportedDevice(partition.to_string()))?;
    let index = index.to_string();
    let state = if on { "on" } else { "off" };

    info!("Turning ESP flag {} for {}", state, partition);
    cmd.run("parted", &["-s", &disk, "set", &index, "esp", state])?;
    cmd.settle();
    Ok(())
}

/// Remove every signature and the partition table from a disk
pub fn wipe_disk(cmd: &CommandRunner, disk: &str) -> Result<()> {
    info!("Wiping {}", disk);

    cmd.run("wipefs", &["-a", "-f", disk])?;

    // Also zero the first MiB to ensure clean state
    if !cmd.is_dry_run() {
        let mut dev = OpenOptions::new().write(true).open(disk)?;
        dev.write_all(&vec![0u8; (ALIGN_SECTORS * SECTOR_SIZE) as usize])?;
        dev.sync_all()?;
    }
    cmd.run_or_warn("partprobe", &[disk]);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    fn disk_of(bytes: u64) -> u64 {
        bytes / SECTOR_SIZE
    }

    #[test]
    fn esp_then_rest_on_gpt() {
        let total = disk_of(100 * GIB);
        let plan = plan_partitions(
            total,
            PartitionTableType::Gpt,
            &[
                PartitionSpec::bytes(512 * MIB, PartitionRole::Esp),
                PartitionSpec::rest(PartitionRole::LvmPv),
            ],
        )
        .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].start, FIRST_LBA);
        assert_eq!(plan[0].sectors, 512 * MIB / 512);
        assert_eq!(plan[1].start, plan[0].end());
        assert_eq!(plan[1].end(), total - 33);
        assert_eq!(plan[1].number, 2);
    }

    #[test]
    fn entries_after_rest_go_to_the_tail() {
        let total = disk_of(64 * GIB);
        let plan = plan_partitions(
            total,
            PartitionTableType::Gpt,
            &[
                PartitionSpec::bytes(512 * MIB, PartitionRole::Esp),
                PartitionSpec::rest(PartitionRole::Bcache),
                PartitionSpec::bytes(8 * GIB, PartitionRole::Swap),
            ],
        )
        .unwrap();

        let numbers: Vec<u32> = plan.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(plan[2].role, PartitionRole::Swap);
        assert_eq!(plan[2].start % ALIGN_SECTORS, 0);
        assert!(plan[2].end() <= total - 33);
        assert_eq!(plan[1].end(), plan[2].start);
    }

    #[test]
    fn mbr_single_rest_partition() {
        let total = disk_of(GIB);
        let plan = plan_partitions(
            total,
            PartitionTableType::Mbr,
            &[PartitionSpec::rest(PartitionRole::LvmPv)],
        )
        .unwrap();
        assert_eq!(plan[0].start, FIRST_LBA);
        assert_eq!(plan[0].end(), total);
    }

    #[test]
    fn rejected_plans() {
        let total = disk_of(GIB);
        let rest = PartitionSpec::rest(PartitionRole::Plain);

        assert!(plan_partitions(total, PartitionTableType::Gpt, &[]).is_err());
        assert!(plan_partitions(total, PartitionTableType::Gpt, &[rest.clone(), rest.clone()]).is_err());
        assert!(plan_partitions(
            total,
            PartitionTableType::Mbr,
            &[PartitionSpec::bytes(MIB, PartitionRole::Esp), rest.clone()]
        )
        .is_err());
        assert!(plan_partitions(
            total,
            PartitionTableType::Gpt,
            &[PartitionSpec::bytes(2 * GIB, PartitionRole::Swap), rest]
        )
        .is_err());
    }

    #[test]
    fn sfdisk_script_types() {
        let plan = plan_partitions(
            disk_of(10 * GIB),
            PartitionTableType::Gpt,
            &[
                PartitionSpec::bytes(512 * MIB, PartitionRole::Filesystem("vfat".into())),
                PartitionSpec::rest(PartitionRole::LvmPv),
            ],
        )
        .unwrap();
        let script = generate_sfdisk_script("/dev/nvme0n1", PartitionTableType::Gpt, &plan);

        assert!(script.starts_with("label: gpt\n"));
        assert!(script.contains("/dev/nvme0n1p1 : start=2048, size=1048576, type=EBD0A0A2"));
        assert!(script.contains("/dev/nvme0n1p2 : start=1050624"));
        assert!(script.contains("type=E6D6D379-F507-44C2-A23C-238F2A3DF928"));
    }

    #[test]
    fn signatures_are_erased() {
        let mut disk = Cursor::new(vec![0xffu8; 4 * MIB as usize]);
        let plan = vec![
            PlannedPartition {
                number: 1,
                start: 2048,
                sectors: 2048,
                role: PartitionRole::Plain,
            },
            PlannedPartition {
                number: 2,
                start: 4096,
                sectors: 16,
                role: PartitionRole::Swap,
            },
        ];
        erase_signatures(&mut disk, &plan).unwrap();

        let bytes = disk.into_inner();
        let p1 = 2048 * 512;
        assert!(bytes[p1..p1 + SIGNATURE_ERASE_BYTES].iter().all(|&b| b == 0));
        assert_eq!(bytes[p1 + SIGNATURE_ERASE_BYTES], 0xff);
        // Short partitions are only zeroed up to their own end
        let p2 = 4096 * 512;
        assert!(bytes[p2..p2 + 16 * 512].iter().all(|&b| b == 0));
        assert_eq!(bytes[p2 + 16 * 512], 0xff);
        assert_eq!(bytes[p1 - 1], 0xff);
    }
}
