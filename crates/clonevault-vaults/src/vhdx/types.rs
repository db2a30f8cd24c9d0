//! VHDX type definitions
//!
//! On-disk records of Hyper-V VHDX files. Unlike VHD every integer is
//! little-endian, and GUIDs use the mixed-endian Windows layout.

use crate::checksum::{crc32c_checksum_update, crc32c_checksum_valid};
use clonevault_core::{Error, Result};
use uuid::Uuid;

/// Region table entry GUID of the block allocation table
pub const BAT_REGION_GUID: Uuid = Uuid::from_u128(0x2DC27766_F623_4200_9D64_115E9BFD4A08);

/// Region table entry GUID of the metadata region
pub const METADATA_REGION_GUID: Uuid = Uuid::from_u128(0x8B7CA206_4790_4B9A_B8FE_575F050F886E);

pub const FILE_PARAMETERS_GUID: Uuid = Uuid::from_u128(0xCAA16737_FA36_4D43_B3B6_33F0AA44E76B);
pub const VIRTUAL_DISK_SIZE_GUID: Uuid = Uuid::from_u128(0x2FA54224_CD1B_4876_B211_5DBED83BF4B8);
pub const VIRTUAL_DISK_ID_GUID: Uuid = Uuid::from_u128(0xBECA12AB_B2E6_4523_93EF_C309E000C746);
pub const LOGICAL_SECTOR_SIZE_GUID: Uuid = Uuid::from_u128(0x8141BF1D_A96F_4709_BA47_F233A8FAAB5F);
pub const PHYSICAL_SECTOR_SIZE_GUID: Uuid = Uuid::from_u128(0xCDA348C7_445D_4471_9CC9_E9885251C556);
pub const PARENT_LOCATOR_GUID: Uuid = Uuid::from_u128(0xA8D35F2D_B30B_454D_ABF7_D3D84834AB0C);

/// Most entries a region or metadata table may hold
pub const VHDX_MAX_ENTRIES: u32 = 2047;

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn read_guid(bytes: &[u8], offset: usize) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[offset..offset + 16]);
    Uuid::from_bytes_le(raw)
}

/// File type identifier at offset 0 (4 KiB)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentifier {
    pub creator: String,
}

impl FileIdentifier {
    /// "vhdxfile"
    pub const SIGNATURE: &'static [u8; 8] = b"vhdxfile";

    pub const SIZE: usize = 4096;

    /// Parse the identifier, checking its signature
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE || &bytes[0..8] != Self::SIGNATURE {
            return Err(Error::invalid_vault("Missing VHDX file signature"));
        }

        let units: Vec<u16> = bytes[8..520]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();

        Ok(Self {
            creator: String::from_utf16_lossy(&units),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(Self::SIGNATURE);
        for (i, unit) in self.creator.encode_utf16().take(255).enumerate() {
            bytes[8 + i * 2..10 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        bytes
    }
}

/// One of the two redundant headers (4 KiB each)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdxHeader {
    pub checksum: u32,
    pub sequence_number: u64,
    pub file_write_guid: Uuid,
    pub data_write_guid: Uuid,
    pub log_guid: Uuid,
    pub log_version: u16,
    pub version: u16,
    pub log_length: u32,
    pub log_offset: u64,
}

impl VhdxHeader {
    /// "head"
    pub const SIGNATURE: u32 = 0x6461_6568;

    pub const SIZE: usize = 4096;

    pub const CHECKSUM_OFFSET: usize = 4;

    pub const CURRENT_VERSION: u16 = 1;

    /// Build a header for a fresh image with an empty log
    pub fn new(log_offset: u64, log_length: u32) -> Self {
        let mut header = Self {
            checksum: 0,
            sequence_number: 0,
            file_write_guid: Uuid::new_v4(),
            data_write_guid: Uuid::new_v4(),
            log_guid: Uuid::nil(),
            log_version: 0,
            version: Self::CURRENT_VERSION,
            log_length,
            log_offset,
        };
        header.update_checksum();
        header
    }

    /// True when `bytes` hold a header with a matching signature and CRC
    pub fn is_valid(bytes: &[u8]) -> bool {
        bytes.len() >= Self::SIZE
            && read_u32(bytes, 0) == Self::SIGNATURE
            && crc32c_checksum_valid(&bytes[..Self::SIZE], Self::CHECKSUM_OFFSET)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE || read_u32(bytes, 0) != Self::SIGNATURE {
            return Err(Error::invalid_vault("Missing VHDX header signature"));
        }

        Ok(Self {
            checksum: read_u32(bytes, 4),
            sequence_number: read_u64(bytes, 8),
            file_write_guid: read_guid(bytes, 16),
            data_write_guid: read_guid(bytes, 32),
            log_guid: read_guid(bytes, 48),
            log_version: read_u16(bytes, 64),
            version: read_u16(bytes, 66),
            log_length: read_u32(bytes, 68),
            log_offset: read_u64(bytes, 72),
        })
    }

    /// Serialize with the stored checksum, reserved area zeroed
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&Self::SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.sequence_number.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.file_write_guid.to_bytes_le());
        bytes[32..48].copy_from_slice(&self.data_write_guid.to_bytes_le());
        bytes[48..64].copy_from_slice(&self.log_guid.to_bytes_le());
        bytes[64..66].copy_from_slice(&self.log_version.to_le_bytes());
        bytes[66..68].copy_from_slice(&self.version.to_le_bytes());
        bytes[68..72].copy_from_slice(&self.log_length.to_le_bytes());
        bytes[72..80].copy_from_slice(&self.log_offset.to_le_bytes());
        bytes
    }

    pub fn update_checksum(&mut self) {
        let mut bytes = self.to_bytes();
        crc32c_checksum_update(&mut bytes, Self::CHECKSUM_OFFSET);
        self.checksum = read_u32(&bytes, Self::CHECKSUM_OFFSET);
    }
}

/// Location of one region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionTableEntry {
    pub guid: Uuid,
    pub file_offset: u64,
    pub length: u32,
    pub required: bool,
}

/// Region table (64 KiB), stored twice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTable {
    pub entries: Vec<RegionTableEntry>,
}

impl RegionTable {
    /// "regi"
    pub const SIGNATURE: u32 = 0x6967_6572;

    pub const SIZE: usize = 64 * 1024;

    pub const CHECKSUM_OFFSET: usize = 4;

    const ENTRY_SIZE: usize = 32;

    pub fn is_valid(bytes: &[u8]) -> bool {
        bytes.len() >= Self::SIZE
            && read_u32(bytes, 0) == Self::SIGNATURE
            && crc32c_checksum_valid(&bytes[..Self::SIZE], Self::CHECKSUM_OFFSET)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE || read_u32(bytes, 0) != Self::SIGNATURE {
            return Err(Error::invalid_vault("Missing VHDX region table signature"));
        }

        let entry_count = read_u32(bytes, 8);
        if entry_count > VHDX_MAX_ENTRIES {
            return Err(Error::invalid_vault(format!(
                "VHDX region table has {} entries",
                entry_count
            )));
        }

        let entries = (0..entry_count as usize)
            .map(|i| {
                let offset = 16 + i * Self::ENTRY_SIZE;
                RegionTableEntry {
                    guid: read_guid(bytes, offset),
                    file_offset: read_u64(bytes, offset + 16),
                    length: read_u32(bytes, offset + 24),
                    required: read_u32(bytes, offset + 28) & 1 != 0,
                }
            })
            .collect();

        Ok(Self { entries })
    }

    /// Serialize and checksum
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&Self::SIGNATURE.to_le_bytes());
        bytes[8..12].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = 16 + i * Self::ENTRY_SIZE;
            bytes[offset..offset + 16].copy_from_slice(&entry.guid.to_bytes_le());
            bytes[offset + 16..offset + 24].copy_from_slice(&entry.file_offset.to_le_bytes());
            bytes[offset + 24..offset + 28].copy_from_slice(&entry.length.to_le_bytes());
            bytes[offset + 28..offset + 32].copy_from_slice(&(entry.required as u32).to_le_bytes());
        }
        crc32c_checksum_update(&mut bytes, Self::CHECKSUM_OFFSET);
        bytes
    }

    pub fn find(&self, guid: Uuid) -> Option<&RegionTableEntry> {
        self.entries.iter().find(|entry| entry.guid == guid)
    }
}

/// Location of one metadata item, relative to the metadata region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataTableEntry {
    pub item_id: Uuid,
    pub offset: u32,
    pub length: u32,
    pub is_user: bool,
    pub is_virtual_disk: bool,
    pub is_required: bool,
}

/// Metadata table (64 KiB) at the start of the metadata region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTable {
    pub entries: Vec<MetadataTableEntry>,
}

impl MetadataTable {
    /// "metadata"
    pub const SIGNATURE: &'static [u8; 8] = b"metadata";

    pub const SIZE: usize = 64 * 1024;

    const ENTRY_SIZE: usize = 32;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE || &bytes[0..8] != Self::SIGNATURE {
            return Err(Error::invalid_vault("Missing VHDX metadata table signature"));
        }

        let entry_count = read_u16(bytes, 10) as u32;
        if entry_count > VHDX_MAX_ENTRIES {
            return Err(Error::invalid_vault(format!(
                "VHDX metadata table has {} entries",
                entry_count
            )));
        }

        let entries = (0..entry_count as usize)
            .map(|i| {
                let offset = 32 + i * Self::ENTRY_SIZE;
                let flags = read_u32(bytes, offset + 24);
                MetadataTableEntry {
                    item_id: read_guid(bytes, offset),
                    offset: read_u32(bytes, offset + 16),
                    length: read_u32(bytes, offset + 20),
                    is_user: flags & 1 != 0,
                    is_virtual_disk: flags & 2 != 0,
                    is_required: flags & 4 != 0,
                }
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(Self::SIGNATURE);
        bytes[10..12].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = 32 + i * Self::ENTRY_SIZE;
            let flags = entry.is_user as u32
                | (entry.is_virtual_disk as u32) << 1
                | (entry.is_required as u32) << 2;
            bytes[offset..offset + 16].copy_from_slice(&entry.item_id.to_bytes_le());
            bytes[offset + 16..offset + 20].copy_from_slice(&entry.offset.to_le_bytes());
            bytes[offset + 20..offset + 24].copy_from_slice(&entry.length.to_le_bytes());
            bytes[offset + 24..offset + 28].copy_from_slice(&flags.to_le_bytes());
        }
        bytes
    }
}

/// File parameters metadata item (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileParameters {
    pub block_size: u32,
    pub leave_blocks_allocated: bool,
    pub has_parent: bool,
}

impl FileParameters {
    pub const SIZE: usize = 8;

    pub fn parse(bytes: &[u8]) -> Self {
        let flags = read_u32(bytes, 4);
        Self {
            block_size: read_u32(bytes, 0),
            leave_blocks_allocated: flags & 1 != 0,
            has_parent: flags & 2 != 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let flags = self.leave_blocks_allocated as u32 | (self.has_parent as u32) << 1;
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.block_size.to_le_bytes());
        bytes[4..8].copy_from_slice(&flags.to_le_bytes());
        bytes
    }
}

/// Payload block state stored in the low three bits of a BAT entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    NotPresent,
    Undefined,
    Zero,
    Unmapped,
    FullyPresent,
    PartiallyPresent,
    Reserved(u8),
}

impl BlockState {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => BlockState::NotPresent,
            1 => BlockState::Undefined,
            2 => BlockState::Zero,
            3 => BlockState::Unmapped,
            6 => BlockState::FullyPresent,
            7 => BlockState::PartiallyPresent,
            other => BlockState::Reserved(other),
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            BlockState::NotPresent => 0,
            BlockState::Undefined => 1,
            BlockState::Zero => 2,
            BlockState::Unmapped => 3,
            BlockState::FullyPresent => 6,
            BlockState::PartiallyPresent => 7,
            BlockState::Reserved(bits) => *bits & 0x7,
        }
    }
}

/// Packed BAT entry: state in bits 0-2, offset in MiB in bits 20-63
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatEntry(pub u64);

impl BatEntry {
    const STATE_MASK: u64 = 0x7;
    const OFFSET_SHIFT: u32 = 20;

    pub fn new(state: BlockState, file_offset_mb: u64) -> Self {
        Self((file_offset_mb << Self::OFFSET_SHIFT) | state.bits() as u64)
    }

    pub fn state(&self) -> BlockState {
        BlockState::from_bits((self.0 & Self::STATE_MASK) as u8)
    }

    pub fn file_offset_mb(&self) -> u64 {
        self.0 >> Self::OFFSET_SHIFT
    }
}

/// Parse a little-endian BAT region
pub fn parse_bat(bytes: &[u8]) -> Vec<BatEntry> {
    bytes
        .chunks_exact(8)
        .map(|chunk| BatEntry(read_u64(chunk, 0)))
        .collect()
}

/// Serialize BAT entries
pub fn bat_to_bytes(entries: &[BatEntry]) -> Vec<u8> {
    entries.iter().flat_map(|entry| entry.0.to_le_bytes()).collect()
}

/// Data blocks between two sector bitmap slots of the BAT
pub fn chunk_ratio(logical_sector_size: u32, block_size: u32) -> u32 {
    ((1u64 << 23) * logical_sector_size as u64 / block_size as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_layout_is_mixed_endian() {
        let bytes = BAT_REGION_GUID.to_bytes_le();
        assert_eq!(&bytes[0..4], &[0x66, 0x77, 0xC2, 0x2D]);
        assert_eq!(&bytes[4..6], &[0x23, 0xF6]);
        assert_eq!(&bytes[8..16], &[0x9D, 0x64, 0x11, 0x5E, 0x9B, 0xFD, 0x4A, 0x08]);
    }

    #[test]
    fn test_file_identifier() {
        let id = FileIdentifier { creator: "clonevault".to_string() };
        let bytes = id.to_bytes();
        assert_eq!(bytes.len(), 4096);
        assert_eq!(&bytes[0..8], b"vhdxfile");
        assert_eq!(FileIdentifier::parse(&bytes).unwrap(), id);
        assert!(FileIdentifier::parse(&[0u8; 4096]).is_err());
    }

    #[test]
    fn test_header_checksum() {
        let header = VhdxHeader::new(1024 * 1024, 1024 * 1024);
        let bytes = header.to_bytes();
        assert!(VhdxHeader::is_valid(&bytes));
        assert_eq!(&bytes[0..4], b"head");

        let parsed = VhdxHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.log_guid.is_nil());
        assert_ne!(parsed.file_write_guid, parsed.data_write_guid);

        let mut corrupted = bytes.clone();
        corrupted[200] = 1;
        assert!(!VhdxHeader::is_valid(&corrupted));
    }

    #[test]
    fn test_region_table() {
        let table = RegionTable {
            entries: vec![
                RegionTableEntry {
                    guid: METADATA_REGION_GUID,
                    file_offset: 2 * 1024 * 1024,
                    length: 1024 * 1024,
                    required: true,
                },
                RegionTableEntry {
                    guid: BAT_REGION_GUID,
                    file_offset: 3 * 1024 * 1024,
                    length: 1024 * 1024,
                    required: true,
                },
            ],
        };
        let bytes = table.to_bytes();
        assert_eq!(&bytes[0..4], b"regi");
        assert!(RegionTable::is_valid(&bytes));
        let parsed = RegionTable::parse(&bytes).unwrap();
        assert_eq!(parsed.find(BAT_REGION_GUID).unwrap().file_offset, 3 * 1024 * 1024);
    }

    #[test]
    fn test_region_table_entry_limit() {
        let mut bytes = RegionTable { entries: vec![] }.to_bytes();
        bytes[8..12].copy_from_slice(&2048u32.to_le_bytes());
        assert!(RegionTable::parse(&bytes).is_err());
    }

    #[test]
    fn test_metadata_flags() {
        let table = MetadataTable {
            entries: vec![MetadataTableEntry {
                item_id: VIRTUAL_DISK_SIZE_GUID,
                offset: 65536 + 8,
                length: 8,
                is_user: false,
                is_virtual_disk: true,
                is_required: true,
            }],
        };
        let bytes = table.to_bytes();
        assert_eq!(&bytes[0..8], b"metadata");
        assert_eq!(&bytes[32 + 24..32 + 28], &6u32.to_le_bytes());
        assert_eq!(MetadataTable::parse(&bytes).unwrap(), table);
    }

    #[test]
    fn test_bat_entry_packing() {
        let entry = BatEntry::new(BlockState::FullyPresent, 5);
        assert_eq!(entry.0, (5 << 20) | 6);
        assert_eq!(entry.state(), BlockState::FullyPresent);
        assert_eq!(entry.file_offset_mb(), 5);
        assert_eq!(BatEntry::default().state(), BlockState::NotPresent);
    }

    #[test]
    fn test_chunk_ratio() {
        assert_eq!(chunk_ratio(512, 1024 * 1024), 4096);
        assert_eq!(chunk_ratio(512, 32 * 1024 * 1024), 128);
        assert_eq!(chunk_ratio(4096, 1024 * 1024), 32768);
        assert_eq!(chunk_ratio(512, 256 * 1024 * 1024), 16);
    }
}
