//! Protective-MBR and GPT partition entry codec
//!
//! Only the parts needed to decide whether a partition is the EFI System
//! Partition are decoded. The GPT header is trusted for two fields
//! (`partition_entry_lba` and `sizeof_partition_entry`); its checksums are
//! not re-validated here.

use crate::disk::naming::split_partition;
use crate::utils::error::{Result, StorixError};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

pub const SECTOR_SIZE: u64 = 512;

/// Size of the MBR boot code area
pub const BOOT_CODE_SIZE: usize = 440;

/// Protective MBR trailer signature
pub const MBR_MAGIC: u16 = 0xAA55;

/// OS type of the protective MBR record covering a GPT disk
pub const PROTECTIVE_OS_TYPE: u8 = 0xEE;

pub const GPT_ENTRY_SIZE: usize = 128;

/// Number of UTF-16 code units in a GPT partition name
pub const GPT_NAME_LEN: usize = 36;

/// `C12A7328-F81F-11D2-BA4B-00A0C93EC93B`
pub const ESP_TYPE_GUID: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);

/// `partition_entry_lba` offset inside the GPT header
const HEADER_ENTRY_LBA_OFFSET: usize = 72;

/// `sizeof_partition_entry` offset inside the GPT header
const HEADER_ENTRY_SIZE_OFFSET: usize = 84;

/// Encode a GUID in GPT on-disk order (`u32, u16, u16` little-endian,
/// remaining eight bytes as-is).
pub fn encode_guid(guid: &Uuid) -> [u8; 16] {
    let (d1, d2, d3, d4) = guid.as_fields();
    let mut out = [0u8; 16];
    LittleEndian::write_u32(&mut out[0..4], d1);
    LittleEndian::write_u16(&mut out[4..6], d2);
    LittleEndian::write_u16(&mut out[6..8], d3);
    out[8..16].copy_from_slice(d4);
    out
}

/// Decode a GUID stored in GPT on-disk order
pub fn decode_guid(raw: &[u8; 16]) -> Uuid {
    let d1 = LittleEndian::read_u32(&raw[0..4]);
    let d2 = LittleEndian::read_u16(&raw[4..6]);
    let d3 = LittleEndian::read_u16(&raw[6..8]);
    let mut d4 = [0u8; 8];
    d4.copy_from_slice(&raw[8..16]);
    Uuid::from_fields(d1, d2, d3, &d4)
}

/// One of the four legacy MBR partition records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbrRecord {
    pub boot_indicator: u8,
    pub start_chs: [u8; 3],
    pub os_type: u8,
    pub end_chs: [u8; 3],
    pub starting_lba: u32,
    pub size_in_lba: u32,
}

impl MbrRecord {
    fn read_from(cur: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        let boot_indicator = cur.read_u8()?;
        let mut start_chs = [0u8; 3];
        cur.read_exact(&mut start_chs)?;
        let os_type = cur.read_u8()?;
        let mut end_chs = [0u8; 3];
        cur.read_exact(&mut end_chs)?;
        Ok(Self {
            boot_indicator,
            start_chs,
            os_type,
            end_chs,
            starting_lba: cur.read_u32::<LittleEndian>()?,
            size_in_lba: cur.read_u32::<LittleEndian>()?,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.boot_indicator);
        out.extend_from_slice(&self.start_chs);
        out.push(self.os_type);
        out.extend_from_slice(&self.end_chs);
        // Writes into a Vec cannot fail.
        let _ = out.write_u32::<LittleEndian>(self.starting_lba);
        let _ = out.write_u32::<LittleEndian>(self.size_in_lba);
    }
}

/// The 512-byte (protective) MBR at LBA 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectiveMbr {
    pub boot_code: [u8; BOOT_CODE_SIZE],
    pub disk_signature: u32,
    pub unknown: u16,
    pub records: [MbrRecord; 4],
    pub magic: u16,
}

impl Default for ProtectiveMbr {
    fn default() -> Self {
        Self {
            boot_code: [0u8; BOOT_CODE_SIZE],
            disk_signature: 0,
            unknown: 0,
            records: [MbrRecord::default(); 4],
            magic: MBR_MAGIC,
        }
    }
}

impl ProtectiveMbr {
    /// A protective MBR as GPT tools write it: one 0xEE record spanning the disk
    pub fn protective(disk_sectors: u64) -> Self {
        let mut mbr = Self::default();
        mbr.records[0] = MbrRecord {
            os_type: PROTECTIVE_OS_TYPE,
            starting_lba: 1,
            size_in_lba: disk_sectors.saturating_sub(1).min(u32::MAX as u64) as u32,
            ..MbrRecord::default()
        };
        mbr
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SECTOR_SIZE as usize {
            return Err(StorixError::codec(format!(
                "MBR needs {} bytes, got {}",
                SECTOR_SIZE,
                buf.len()
            )));
        }
        let mut cur = Cursor::new(&buf[..SECTOR_SIZE as usize]);
        let mut boot_code = [0u8; BOOT_CODE_SIZE];
        cur.read_exact(&mut boot_code)?;
        let disk_signature = cur.read_u32::<LittleEndian>()?;
        let unknown = cur.read_u16::<LittleEndian>()?;
        let mut records = [MbrRecord::default(); 4];
        for record in records.iter_mut() {
            *record = MbrRecord::read_from(&mut cur)?;
        }
        let magic = cur.read_u16::<LittleEndian>()?;
        Ok(Self {
            boot_code,
            disk_signature,
            unknown,
            records,
            magic,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SECTOR_SIZE as usize);
        out.extend_from_slice(&self.boot_code);
        let _ = out.write_u32::<LittleEndian>(self.disk_signature);
        let _ = out.write_u16::<LittleEndian>(self.unknown);
        for record in &self.records {
            record.write_to(&mut out);
        }
        let _ = out.write_u16::<LittleEndian>(self.magic);
        out
    }

    /// Trailer signature present and at least one 0xEE record
    pub fn is_protective(&self) -> bool {
        self.magic == MBR_MAGIC
            && self
                .records
                .iter()
                .any(|r| r.os_type == PROTECTIVE_OS_TYPE)
    }

    pub fn has_boot_code(&self) -> bool {
        self.boot_code.iter().any(|&b| b != 0)
    }
}

/// The two GPT header fields needed to locate a partition entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptEntryLocation {
    pub partition_entry_lba: u64,
    pub sizeof_partition_entry: u32,
}

impl GptEntryLocation {
    pub fn parse(header: &[u8]) -> Result<Self> {
        if header.len() < HEADER_ENTRY_SIZE_OFFSET + 4 {
            return Err(StorixError::codec("GPT header is truncated"));
        }
        Ok(Self {
            partition_entry_lba: LittleEndian::read_u64(
                &header[HEADER_ENTRY_LBA_OFFSET..HEADER_ENTRY_LBA_OFFSET + 8],
            ),
            sizeof_partition_entry: LittleEndian::read_u32(
                &header[HEADER_ENTRY_SIZE_OFFSET..HEADER_ENTRY_SIZE_OFFSET + 4],
            ),
        })
    }

    /// Byte offset of the entry for a 1-based partition index
    pub fn entry_offset(&self, index: u32) -> Result<u64> {
        if index == 0 {
            return Err(StorixError::codec("GPT partition indexes start at 1"));
        }
        Ok(self.partition_entry_lba * SECTOR_SIZE
            + self.sizeof_partition_entry as u64 * (index as u64 - 1))
    }

    /// Write both fields into a 512-byte header sector (other fields untouched)
    pub fn write_into(&self, header: &mut [u8]) {
        LittleEndian::write_u64(
            &mut header[HEADER_ENTRY_LBA_OFFSET..HEADER_ENTRY_LBA_OFFSET + 8],
            self.partition_entry_lba,
        );
        LittleEndian::write_u32(
            &mut header[HEADER_ENTRY_SIZE_OFFSET..HEADER_ENTRY_SIZE_OFFSET + 4],
            self.sizeof_partition_entry,
        );
    }
}

/// A 128-byte GPT partition entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub lba_start: u64,
    pub lba_end: u64,
    pub attrs: u64,
    pub name: [u16; GPT_NAME_LEN],
}

impl GptEntry {
    pub fn new(type_guid: Uuid, lba_start: u64, lba_end: u64, name: &str) -> Self {
        let mut encoded = [0u16; GPT_NAME_LEN];
        for (slot, unit) in encoded.iter_mut().zip(name.encode_utf16()) {
            *slot = unit;
        }
        Self {
            type_guid,
            unique_guid: Uuid::new_v4(),
            lba_start,
            lba_end,
            attrs: 0,
            name: encoded,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < GPT_ENTRY_SIZE {
            return Err(StorixError::codec("GPT partition entry is truncated"));
        }
        let mut cur = Cursor::new(&buf[..GPT_ENTRY_SIZE]);
        let mut raw = [0u8; 16];
        cur.read_exact(&mut raw)?;
        let type_guid = decode_guid(&raw);
        cur.read_exact(&mut raw)?;
        let unique_guid = decode_guid(&raw);
        let lba_start = cur.read_u64::<LittleEndian>()?;
        let lba_end = cur.read_u64::<LittleEndian>()?;
        let attrs = cur.read_u64::<LittleEndian>()?;
        let mut name = [0u16; GPT_NAME_LEN];
        cur.read_u16_into::<LittleEndian>(&mut name)?;
        Ok(Self {
            type_guid,
            unique_guid,
            lba_start,
            lba_end,
            attrs,
            name,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(GPT_ENTRY_SIZE);
        out.extend_from_slice(&encode_guid(&self.type_guid));
        out.extend_from_slice(&encode_guid(&self.unique_guid));
        let _ = out.write_u64::<LittleEndian>(self.lba_start);
        let _ = out.write_u64::<LittleEndian>(self.lba_end);
        let _ = out.write_u64::<LittleEndian>(self.attrs);
        for unit in &self.name {
            let _ = out.write_u16::<LittleEndian>(*unit);
        }
        out
    }

    pub fn name(&self) -> String {
        let len = self.name.iter().position(|&u| u == 0).unwrap_or(GPT_NAME_LEN);
        String::from_utf16_lossy(&self.name[..len])
    }

    pub fn is_esp(&self) -> bool {
        self.type_guid == ESP_TYPE_GUID
    }
}

/// Read the MBR sector of a disk
pub fn read_mbr<R: Read + Seek>(disk: &mut R) -> Result<ProtectiveMbr> {
    let mut buf = [0u8; SECTOR_SIZE as usize];
    disk.seek(SeekFrom::Start(0))?;
    disk.read_exact(&mut buf)?;
    ProtectiveMbr::parse(&buf)
}

/// Read the GPT entry for a 1-based partition index.
///
/// Returns `None` when the disk carries no protective MBR.
pub fn read_partition_entry<R: Read + Seek>(disk: &mut R, index: u32) -> Result<Option<GptEntry>> {
    let mbr = read_mbr(disk)?;
    if !mbr.is_protective() {
        return Ok(None);
    }

    let mut header = [0u8; SECTOR_SIZE as usize];
    disk.seek(SeekFrom::Start(SECTOR_SIZE))?;
    disk.read_exact(&mut header)?;
    let location = GptEntryLocation::parse(&header)?;

    let mut entry = [0u8; GPT_ENTRY_SIZE];
    disk.seek(SeekFrom::Start(location.entry_offset(index)?))?;
    disk.read_exact(&mut entry)?;
    GptEntry::parse(&entry).map(Some)
}

/// Check the ESP type GUID of a partition on an open disk
pub fn is_esp_entry<R: Read + Seek>(disk: &mut R, index: u32) -> Result<bool> {
    Ok(read_partition_entry(disk, index)?
        .map(|entry| entry.is_esp())
        .unwrap_or(false))
}

/// Decide whether a partition device is the EFI System Partition.
///
/// Reads the owning disk, never the partition itself.
pub fn is_esp_partition(partition: &str) -> Result<bool> {
    let (disk, index) = split_partition(partition)
        .ok_or_else(|| StorixError::UnsupportedDevice(partition.to_string()))?;
    let mut file = File::open(Path::new(&disk))?;
    let esp = is_esp_entry(&mut file, index)?;
    debug!("{} (partition {} of {}) is ESP: {}", partition, index, disk, esp);
    Ok(esp)
}

/// Whether the first 440 bytes of a disk hold boot code
pub fn has_boot_code(disk: &str) -> Result<bool> {
    let mut file = File::open(Path::new(disk))?;
    let mut code = [0u8; BOOT_CODE_SIZE];
    file.read_exact(&mut code)?;
    Ok(code.iter().any(|&b| b != 0))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Linux filesystem data
    const LINUX_FS_GUID: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);

    /// Build a small GPT disk image: entries start at LBA 2.
    pub(crate) fn gpt_image(mbr: &ProtectiveMbr, entries: &[GptEntry]) -> Vec<u8> {
        let mut image = vec![0u8; 64 * 1024];
        image[..512].copy_from_slice(&mbr.encode());

        let mut header = [0u8; 512];
        header[..8].copy_from_slice(b"EFI PART");
        GptEntryLocation {
            partition_entry_lba: 2,
            sizeof_partition_entry: GPT_ENTRY_SIZE as u32,
        }
        .write_into(&mut header);
        image[512..1024].copy_from_slice(&header);

        for (i, entry) in entries.iter().enumerate() {
            let off = 1024 + i * GPT_ENTRY_SIZE;
            image[off..off + GPT_ENTRY_SIZE].copy_from_slice(&entry.encode());
        }
        image
    }

    fn standard_entries() -> Vec<GptEntry> {
        vec![
            GptEntry::new(ESP_TYPE_GUID, 2048, 1050623, "EFI"),
            GptEntry::new(LINUX_FS_GUID, 1050624, 4194270, "root"),
        ]
    }

    #[test]
    fn esp_guid_on_disk_bytes() {
        // Mixed-endian layout as written by every GPT tool
        assert_eq!(
            encode_guid(&ESP_TYPE_GUID),
            [
                0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E,
                0xC9, 0x3B
            ]
        );
        assert_eq!(decode_guid(&encode_guid(&ESP_TYPE_GUID)), ESP_TYPE_GUID);
    }

    #[test]
    fn mbr_and_entry_sizes() {
        assert_eq!(ProtectiveMbr::protective(4096).encode().len(), 512);
        assert_eq!(standard_entries()[0].encode().len(), GPT_ENTRY_SIZE);
    }

    #[test]
    fn detects_esp_by_index() {
        let image = gpt_image(&ProtectiveMbr::protective(4194304), &standard_entries());
        let mut disk = Cursor::new(image);
        assert!(is_esp_entry(&mut disk, 1).unwrap());
        assert!(!is_esp_entry(&mut disk, 2).unwrap());
        // Unused slot is all zeros
        assert!(!is_esp_entry(&mut disk, 3).unwrap());
    }

    #[test]
    fn partition_index_zero_is_rejected() {
        let image = gpt_image(&ProtectiveMbr::protective(4194304), &standard_entries());
        let mut disk = Cursor::new(image);
        let err = is_esp_entry(&mut disk, 0).unwrap_err();
        assert!(matches!(err, StorixError::Codec(_)));
    }

    #[test]
    fn single_nibble_difference_is_not_esp() {
        let almost = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93A);
        let entries = vec![GptEntry::new(almost, 2048, 1050623, "EFI")];
        let mut disk = Cursor::new(gpt_image(&ProtectiveMbr::protective(4194304), &entries));
        assert!(!is_esp_entry(&mut disk, 1).unwrap());
    }

    #[test]
    fn broken_mbr_signature_is_not_esp() {
        let mut mbr = ProtectiveMbr::protective(4194304);
        mbr.magic = 0x55AA;
        let mut disk = Cursor::new(gpt_image(&mbr, &standard_entries()));
        assert!(!is_esp_entry(&mut disk, 1).unwrap());
    }

    #[test]
    fn missing_protective_record_is_not_esp() {
        let mut mbr = ProtectiveMbr::protective(4194304);
        mbr.records[0].os_type = 0x83;
        let mut disk = Cursor::new(gpt_image(&mbr, &standard_entries()));
        assert!(!is_esp_entry(&mut disk, 1).unwrap());
    }

    #[test]
    fn entry_fields_survive_parsing() {
        let entry = &standard_entries()[1];
        let parsed = GptEntry::parse(&entry.encode()).unwrap();
        assert_eq!(parsed.type_guid, LINUX_FS_GUID);
        assert_eq!(parsed.lba_start, 1050624);
        assert_eq!(parsed.lba_end, 4194270);
        assert_eq!(parsed.name(), "root");
    }

    #[test]
    fn truncated_disk_is_codec_error() {
        let mut disk = Cursor::new(vec![0u8; 100]);
        assert!(read_mbr(&mut disk).is_err());
    }

    #[test]
    fn boot_code_detection() {
        let mut mbr = ProtectiveMbr::default();
        assert!(!mbr.has_boot_code());
        mbr.boot_code[0] = 0xEB;
        assert!(mbr.has_boot_code());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&mbr.encode()).unwrap();
        let path = file.path().to_str().unwrap().to_string();
        assert!(has_boot_code(&path).unwrap());
    }
}
