//! bcache superblock codec and sysfs control
//!
//! The superblock lives 8 sectors (4 KiB) into a backing or cache device:
//!
//! ```text
//!   0  csum          u64     crc-64-we over bytes [8, 208)
//!   8  offset        u64     sector of the superblock (8)
//!  16  version       u64     0/3 cache, 1/4 backing
//!  24  magic         [u8;16]
//!  40  uuid          [u8;16] device uuid
//!  56  set_uuid      [u8;16]
//!  72  label         [u8;32]
//! 104  flags         u64     bit 0: writeback (backing only)
//! 112  seq           u64
//! 120  pad           [u64;8]
//! 184  nbuckets | data_offset   u64
//! 192  block_size    u16     sectors
//! 194  bucket_size   u16     sectors
//! 196  nr_in_set     u16
//! 198  nr_this_dev   u16
//! 200  last_mount    u32
//! 204  first_bucket  u16
//! 206  njournal_buckets | keys  u16
//! 208  d             [u64;256] journal buckets, zero-filled
//! ```
//!
//! Role detection looks at magic and version only; the checksum is not
//! recomputed before trusting them.

use crate::disk::naming::kernel_name;
use crate::utils::command::run_command_output;
use crate::utils::error::{Result, StorixError};
use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_64_WE};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Sector holding the superblock
pub const SB_SECTOR: u64 = 8;

/// Byte offset of the superblock
pub const SB_OFFSET: u64 = SB_SECTOR * 512;

/// Size of the fixed part of the superblock (without journal buckets)
pub const SB_SIZE: usize = 208;

pub const SB_JOURNAL_BUCKETS: usize = 256;

pub const BCACHE_MAGIC: [u8; 16] = [
    0xc6, 0x85, 0x73, 0xf6, 0x4e, 0x1a, 0x45, 0xca, 0x82, 0x65, 0xf5, 0x7f, 0x48, 0xba, 0x6d, 0x81,
];

pub const VERSION_CDEV: u64 = 0;
pub const VERSION_BDEV: u64 = 1;
pub const VERSION_CDEV_WITH_UUID: u64 = 3;
pub const VERSION_BDEV_WITH_OFFSET: u64 = 4;

pub const CACHE_MODE_WRITEBACK: u64 = 0x01;

/// Default bucket size in sectors
pub const DEFAULT_BUCKET_SIZE: u16 = 1024;

/// A cache device needs at least this many buckets
pub const MIN_BUCKETS: u64 = 0x80;

const CSUM_END: usize = 8;
const OFF_OFFSET: usize = 8;
const OFF_VERSION: usize = 16;
const OFF_MAGIC: usize = 24;
const OFF_UUID: usize = 40;
const OFF_SET_UUID: usize = 56;
const OFF_LABEL: usize = 72;
const OFF_FLAGS: usize = 104;
const OFF_SEQ: usize = 112;
const OFF_UNION: usize = 184;
const OFF_BLOCK_SIZE: usize = 192;
const OFF_BUCKET_SIZE: usize = 194;
const OFF_NR_IN_SET: usize = 196;
const OFF_NR_THIS_DEV: usize = 198;
const OFF_LAST_MOUNT: usize = 200;
const OFF_FIRST_BUCKET: usize = 204;
const OFF_KEYS: usize = 206;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_WE);

/// Which half of a bcache pair a device is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcacheRole {
    /// The slow device being accelerated
    Backing,
    /// The fast device holding the cache
    Cache,
}

impl BcacheRole {
    fn accepts_version(self, version: u64) -> bool {
        match self {
            Self::Backing => matches!(version, VERSION_BDEV | VERSION_BDEV_WITH_OFFSET),
            Self::Cache => matches!(version, VERSION_CDEV | VERSION_CDEV_WITH_UUID),
        }
    }
}

impl std::fmt::Display for BcacheRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backing => write!(f, "backing"),
            Self::Cache => write!(f, "cache"),
        }
    }
}

/// Optional geometry for a new superblock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuperblockOptions {
    /// Block size in sectors (default: logical sector size of the device)
    pub block_size: Option<u16>,
    /// Bucket size in sectors (default: 1024)
    pub bucket_size: Option<u16>,
    /// Data offset in sectors, backing devices only
    pub data_offset: Option<u64>,
}

/// Decoded fixed part of a bcache superblock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub csum: u64,
    pub offset: u64,
    pub version: u64,
    pub magic: [u8; 16],
    pub uuid: Uuid,
    pub set_uuid: Uuid,
    pub label: [u8; 32],
    pub flags: u64,
    pub seq: u64,
    /// `nbuckets` for cache devices, `data_offset` for backing devices
    pub nbuckets_or_data_offset: u64,
    pub block_size: u16,
    pub bucket_size: u16,
    pub nr_in_set: u16,
    pub nr_this_dev: u16,
    pub last_mount: u32,
    pub first_bucket: u16,
    pub keys: u16,
}

impl Superblock {
    /// Build a fresh superblock for a device of `device_bytes` bytes.
    pub fn new(role: BcacheRole, device_bytes: u64, block_size: u16, opts: &SuperblockOptions) -> Result<Self> {
        let bucket_size = opts.bucket_size.unwrap_or(DEFAULT_BUCKET_SIZE);
        if block_size == 0 || bucket_size == 0 {
            return Err(StorixError::codec("block and bucket size must be positive"));
        }
        if bucket_size < block_size {
            return Err(StorixError::codec(format!(
                "bucket size ({}) cannot be smaller than block size ({})",
                bucket_size, block_size
            )));
        }

        let (version, flags, union_value, nr_in_set) = match role {
            BcacheRole::Backing => match opts.data_offset {
                Some(0) => return Err(StorixError::codec("data offset must be positive")),
                Some(off) => (VERSION_BDEV_WITH_OFFSET, CACHE_MODE_WRITEBACK, off, 0),
                None => (VERSION_BDEV, CACHE_MODE_WRITEBACK, 0, 0),
            },
            BcacheRole::Cache => {
                if opts.data_offset.is_some() {
                    return Err(StorixError::codec("data offset only applies to backing devices"));
                }
                let nbuckets = device_bytes / 512 / bucket_size as u64;
                if nbuckets < MIN_BUCKETS {
                    return Err(StorixError::codec(format!(
                        "not enough buckets: {}, need {}",
                        nbuckets, MIN_BUCKETS
                    )));
                }
                (VERSION_CDEV, 0, nbuckets, 1)
            }
        };

        let mut sb = Self {
            csum: 0,
            offset: SB_SECTOR,
            version,
            magic: BCACHE_MAGIC,
            uuid: Uuid::new_v4(),
            set_uuid: Uuid::new_v4(),
            label: [0u8; 32],
            flags,
            seq: 0,
            nbuckets_or_data_offset: union_value,
            block_size,
            bucket_size,
            nr_in_set,
            nr_this_dev: 0,
            last_mount: 0,
            first_bucket: (23 / bucket_size) + 1,
            keys: 0,
        };
        sb.csum = sb.compute_csum();
        Ok(sb)
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SB_SIZE {
            return Err(StorixError::codec("bcache superblock is truncated"));
        }
        let mut magic = [0u8; 16];
        magic.copy_from_slice(&buf[OFF_MAGIC..OFF_MAGIC + 16]);
        if magic != BCACHE_MAGIC {
            return Err(StorixError::codec("bcache magic not found"));
        }
        let mut label = [0u8; 32];
        label.copy_from_slice(&buf[OFF_LABEL..OFF_LABEL + 32]);
        Ok(Self {
            csum: LittleEndian::read_u64(&buf[0..CSUM_END]),
            offset: LittleEndian::read_u64(&buf[OFF_OFFSET..]),
            version: LittleEndian::read_u64(&buf[OFF_VERSION..]),
            magic,
            uuid: uuid_at(buf, OFF_UUID),
            set_uuid: uuid_at(buf, OFF_SET_UUID),
            label,
            flags: LittleEndian::read_u64(&buf[OFF_FLAGS..]),
            seq: LittleEndian::read_u64(&buf[OFF_SEQ..]),
            nbuckets_or_data_offset: LittleEndian::read_u64(&buf[OFF_UNION..]),
            block_size: LittleEndian::read_u16(&buf[OFF_BLOCK_SIZE..]),
            bucket_size: LittleEndian::read_u16(&buf[OFF_BUCKET_SIZE..]),
            nr_in_set: LittleEndian::read_u16(&buf[OFF_NR_IN_SET..]),
            nr_this_dev: LittleEndian::read_u16(&buf[OFF_NR_THIS_DEV..]),
            last_mount: LittleEndian::read_u32(&buf[OFF_LAST_MOUNT..]),
            first_bucket: LittleEndian::read_u16(&buf[OFF_FIRST_BUCKET..]),
            keys: LittleEndian::read_u16(&buf[OFF_KEYS..]),
        })
    }

    /// Fixed part only; the journal bucket array follows as zeros on disk
    pub fn encode(&self) -> [u8; SB_SIZE] {
        let mut buf = [0u8; SB_SIZE];
        LittleEndian::write_u64(&mut buf[0..CSUM_END], self.csum);
        LittleEndian::write_u64(&mut buf[OFF_OFFSET..OFF_OFFSET + 8], self.offset);
        LittleEndian::write_u64(&mut buf[OFF_VERSION..OFF_VERSION + 8], self.version);
        buf[OFF_MAGIC..OFF_MAGIC + 16].copy_from_slice(&self.magic);
        buf[OFF_UUID..OFF_UUID + 16].copy_from_slice(self.uuid.as_bytes());
        buf[OFF_SET_UUID..OFF_SET_UUID + 16].copy_from_slice(self.set_uuid.as_bytes());
        buf[OFF_LABEL..OFF_LABEL + 32].copy_from_slice(&self.label);
        LittleEndian::write_u64(&mut buf[OFF_FLAGS..OFF_FLAGS + 8], self.flags);
        LittleEndian::write_u64(&mut buf[OFF_SEQ..OFF_SEQ + 8], self.seq);
        LittleEndian::write_u64(&mut buf[OFF_UNION..OFF_UNION + 8], self.nbuckets_or_data_offset);
        LittleEndian::write_u16(&mut buf[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 2], self.block_size);
        LittleEndian::write_u16(&mut buf[OFF_BUCKET_SIZE..OFF_BUCKET_SIZE + 2], self.bucket_size);
        LittleEndian::write_u16(&mut buf[OFF_NR_IN_SET..OFF_NR_IN_SET + 2], self.nr_in_set);
        LittleEndian::write_u16(&mut buf[OFF_NR_THIS_DEV..OFF_NR_THIS_DEV + 2], self.nr_this_dev);
        LittleEndian::write_u32(&mut buf[OFF_LAST_MOUNT..OFF_LAST_MOUNT + 4], self.last_mount);
        LittleEndian::write_u16(&mut buf[OFF_FIRST_BUCKET..OFF_FIRST_BUCKET + 2], self.first_bucket);
        LittleEndian::write_u16(&mut buf[OFF_KEYS..OFF_KEYS + 2], self.keys);
        buf
    }

    /// crc-64-we over every byte after the csum field
    pub fn compute_csum(&self) -> u64 {
        let buf = self.encode();
        CRC64.checksum(&buf[CSUM_END..])
    }

    pub fn checksum_matches(&self) -> bool {
        self.csum == self.compute_csum()
    }

    pub fn role(&self) -> Option<BcacheRole> {
        [BcacheRole::Backing, BcacheRole::Cache]
            .into_iter()
            .find(|role| role.accepts_version(self.version))
    }

    pub fn is_writeback(&self) -> bool {
        self.flags & CACHE_MODE_WRITEBACK != 0
    }
}

fn uuid_at(buf: &[u8], off: usize) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&buf[off..off + 16]);
    Uuid::from_bytes(raw)
}

/// Write a superblock to an open device, wiping the first 4 KiB and the
/// journal bucket array.
pub fn write_superblock_to<W: Write + Seek>(dev: &mut W, sb: &Superblock) -> Result<()> {
    dev.seek(SeekFrom::Start(0))?;
    dev.write_all(&[0u8; SB_OFFSET as usize])?;
    dev.write_all(&sb.encode())?;
    dev.write_all(&[0u8; SB_JOURNAL_BUCKETS * 8])?;
    dev.flush()?;
    Ok(())
}

/// Read the fixed part of the superblock from an open device
pub fn read_superblock_from<R: Read + Seek>(dev: &mut R) -> Result<Superblock> {
    let mut buf = [0u8; SB_SIZE];
    dev.seek(SeekFrom::Start(SB_OFFSET))?;
    dev.read_exact(&mut buf)?;
    Superblock::parse(&buf)
}

/// Role check reading only magic and version
pub fn has_role<R: Read + Seek>(dev: &mut R, role: BcacheRole) -> Result<bool> {
    let mut magic = [0u8; 16];
    dev.seek(SeekFrom::Start(SB_OFFSET + OFF_MAGIC as u64))?;
    if let Err(e) = dev.read_exact(&mut magic) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(false);
        }
        return Err(e.into());
    }
    if magic != BCACHE_MAGIC {
        return Ok(false);
    }

    let mut version = [0u8; 8];
    dev.seek(SeekFrom::Start(SB_OFFSET + OFF_VERSION as u64))?;
    dev.read_exact(&mut version)?;
    Ok(role.accepts_version(LittleEndian::read_u64(&version)))
}

fn default_block_size(path: &Path, file: &File) -> Result<u16> {
    let meta = file.metadata()?;
    let bytes = if meta.file_type().is_block_device() {
        let path_str = path.to_string_lossy();
        let out = run_command_output("blockdev", &["--getss", &path_str])?;
        out.trim().parse::<u64>().map_err(|_| {
            StorixError::codec(format!("unexpected sector size for {}: {}", path_str, out))
        })?
    } else {
        meta.blksize()
    };
    Ok(((bytes / 512).max(1)).min(u16::MAX as u64) as u16)
}

/// Format `path` as a bcache backing or cache device.
///
/// Returns (device uuid, set uuid).
pub fn write_superblock(path: &Path, role: BcacheRole, opts: &SuperblockOptions) -> Result<(Uuid, Uuid)> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let device_bytes = file.seek(SeekFrom::End(0))?;
    let block_size = match opts.block_size {
        Some(bs) => bs,
        None => default_block_size(path, &file)?,
    };

    let sb = Superblock::new(role, device_bytes, block_size, opts)?;
    write_superblock_to(&mut file, &sb)?;
    file.sync_all()?;

    info!(
        "Wrote bcache {} superblock to {} (uuid {}, set {})",
        role,
        path.display(),
        sb.uuid,
        sb.set_uuid
    );
    Ok((sb.uuid, sb.set_uuid))
}

pub fn read_superblock(path: &Path) -> Result<Superblock> {
    let mut file = File::open(path)?;
    read_superblock_from(&mut file)
}

pub fn is_backing_device(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    has_role(&mut file, BcacheRole::Backing)
}

pub fn is_cache_device(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    has_role(&mut file, BcacheRole::Cache)
}

/// Set uuid of a cache device
pub fn read_set_uuid(path: &Path) -> Result<Uuid> {
    let mut file = File::open(path)?;
    if !has_role(&mut file, BcacheRole::Cache)? {
        return Err(StorixError::codec(format!(
            "{} is not a bcache cache device",
            path.display()
        )));
    }
    let mut raw = [0u8; 16];
    file.seek(SeekFrom::Start(SB_OFFSET + OFF_SET_UUID as u64))?;
    file.read_exact(&mut raw)?;
    Ok(Uuid::from_bytes(raw))
}

/// Kernel bcache control files under a sysfs root
#[derive(Debug, Clone)]
pub struct BcacheSysfs {
    root: PathBuf,
}

impl Default for BcacheSysfs {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl BcacheSysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn write_attr(&self, path: PathBuf, value: &str) -> Result<()> {
        debug!("Writing '{}' to {}", value, path.display());
        fs::write(&path, value)?;
        Ok(())
    }

    /// Register a freshly formatted backing or cache device with the kernel
    pub fn register(&self, device: &str) -> Result<()> {
        self.write_attr(self.root.join("fs/bcache/register"), device)
    }

    /// Attach a bcache device to a cache set
    pub fn attach(&self, bcache_device: &str, set_uuid: &Uuid) -> Result<()> {
        let attr = self
            .root
            .join("block")
            .join(kernel_name(bcache_device))
            .join("bcache/attach");
        self.write_attr(attr, &set_uuid.to_string())
    }

    /// Unregister a cache set, detaching it from every backing device
    pub fn unregister_set(&self, set_uuid: &Uuid) -> Result<()> {
        let attr = self
            .root
            .join("fs/bcache")
            .join(set_uuid.to_string())
            .join("unregister");
        self.write_attr(attr, "1")
    }

    /// Stop a bcache device so its backing partition can be released
    pub fn stop(&self, bcache_device: &str) -> Result<()> {
        let attr = self
            .root
            .join("block")
            .join(kernel_name(bcache_device))
            .join("bcache/stop");
        self.write_attr(attr, "1")
    }

    /// Slaves of a bcache device: cache devices first, backing device last
    pub fn slaves(&self, bcache_device: &str) -> Result<Vec<String>> {
        let block_dir = self.root.join("block").join(kernel_name(bcache_device));

        let mut slaves: Vec<String> = fs::read_dir(block_dir.join("slaves"))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        slaves.sort();

        // `bcache` links to the backing device's bcache directory
        let backing_dir = fs::canonicalize(block_dir.join("bcache"))?;
        let backing = backing_dir
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                StorixError::DeviceNotFound(format!("backing device of {}", bcache_device))
            })?;

        slaves.retain(|s| *s != backing);
        slaves.push(backing);
        Ok(slaves.into_iter().map(|s| format!("/dev/{}", s)).collect())
    }

    /// The `/dev/bcacheN` device stacked on a backing partition, if registered
    pub fn find_by_backing(&self, backing: &str) -> Result<Option<String>> {
        let dev_link = self
            .root
            .join("class/block")
            .join(kernel_name(backing))
            .join("bcache/dev");
        match fs::read_link(&dev_link) {
            Ok(target) => Ok(target
                .file_name()
                .map(|n| format!("/dev/{}", n.to_string_lossy()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
