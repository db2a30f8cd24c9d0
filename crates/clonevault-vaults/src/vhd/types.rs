//! VHD (Virtual Hard Disk) type definitions
//!
//! This module contains the on-disk records of Microsoft VHD files. Every
//! multi-byte field is big-endian.

use crate::checksum::{vhd_checksum, vhd_checksum_valid};
use clonevault_core::{geometry::calculate_chs, Chs, Error, Result};
use uuid::Uuid;

/// Seconds between the Unix epoch and 2000-01-01 00:00:00 UTC
const VHD_EPOCH_OFFSET: i64 = 946_684_800;

/// VHD disk type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VhdType {
    None = 0,
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
}

impl VhdType {
    /// Parse VHD type from a u32 value
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(VhdType::None),
            2 => Ok(VhdType::Fixed),
            3 => Ok(VhdType::Dynamic),
            4 => Ok(VhdType::Differencing),
            _ => Err(Error::invalid_vault(format!(
                "Unknown VHD disk type: {}",
                value
            ))),
        }
    }
}

/// VHD Footer structure (512 bytes)
///
/// The footer appears at the end of all VHD files. For dynamic VHDs a copy
/// also appears at the beginning.
#[derive(Debug, Clone)]
pub struct VhdFooter {
    pub cookie: [u8; 8], // "conectix"
    pub features: u32,
    pub version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: Chs,
    pub disk_type: VhdType,
    pub checksum: u32,
    pub uuid: [u8; 16],
    pub saved_state: u8,
}

impl VhdFooter {
    /// VHD footer cookie value "conectix"
    pub const COOKIE: &'static [u8; 8] = b"conectix";

    /// Size of the VHD footer in bytes
    pub const SIZE: usize = 512;

    /// Byte offset of the checksum field
    pub const CHECKSUM_OFFSET: usize = 64;

    /// Feature bits defined by the format
    pub const VALID_FEATURE_MASK: u32 = 3;

    /// Reserved feature bit that must always be set
    pub const FEATURE_RESERVED: u32 = 2;

    /// File format version 1.0
    pub const VERSION: u32 = 0x0001_0000;

    /// Data offset of a fixed disk
    pub const NO_DATA_OFFSET: u64 = u64::MAX;

    /// Creator application; older QEMU only trusts the size field of whitelisted creators
    pub const CREATOR_APP: &'static [u8; 4] = b"qem2";

    /// Creator host OS "Wi2k"
    pub const CREATOR_OS_WINDOWS: u32 = 0x5769_326B;

    /// Build a footer for a new image and checksum it
    pub fn new(disk_size: u64, disk_type: VhdType, data_offset: u64) -> Self {
        let timestamp = u32::try_from(chrono::Utc::now().timestamp() - VHD_EPOCH_OFFSET).unwrap_or(0);

        let mut footer = Self {
            cookie: *Self::COOKIE,
            features: Self::FEATURE_RESERVED,
            version: Self::VERSION,
            data_offset,
            timestamp,
            creator_app: *Self::CREATOR_APP,
            creator_version: 0x0001_0000,
            creator_os: Self::CREATOR_OS_WINDOWS,
            original_size: disk_size,
            current_size: disk_size,
            geometry: calculate_chs(disk_size),
            disk_type,
            checksum: 0,
            uuid: *Uuid::new_v4().as_bytes(),
            saved_state: 0,
        };
        footer.update_checksum();
        footer
    }

    /// True when `bytes` start with the footer cookie and carry a valid checksum
    pub fn is_valid(bytes: &[u8]) -> bool {
        bytes.len() >= Self::SIZE
            && &bytes[0..8] == Self::COOKIE
            && vhd_checksum_valid(&bytes[..Self::SIZE], Self::CHECKSUM_OFFSET)
    }

    /// Parse VHD footer from raw bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::invalid_vault("VHD footer too small"));
        }

        // Parse cookie
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);

        // Verify cookie
        if &cookie != Self::COOKIE {
            return Err(Error::invalid_vault(format!(
                "Invalid VHD footer cookie: expected 'conectix', got '{}'",
                String::from_utf8_lossy(&cookie)
            )));
        }

        // Parse fields (all big-endian)
        let features = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let version = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let data_offset = u64::from_be_bytes([
            bytes[16], bytes[17], bytes[18], bytes[19],
            bytes[20], bytes[21], bytes[22], bytes[23],
        ]);
        let timestamp = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);

        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&bytes[28..32]);

        let creator_version = u32::from_be_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
        let creator_os = u32::from_be_bytes([bytes[36], bytes[37], bytes[38], bytes[39]]);
        let original_size = u64::from_be_bytes([
            bytes[40], bytes[41], bytes[42], bytes[43],
            bytes[44], bytes[45], bytes[46], bytes[47],
        ]);
        let current_size = u64::from_be_bytes([
            bytes[48], bytes[49], bytes[50], bytes[51],
            bytes[52], bytes[53], bytes[54], bytes[55],
        ]);

        let geometry = Chs::unpack(u32::from_be_bytes([bytes[56], bytes[57], bytes[58], bytes[59]]));

        let disk_type_raw = u32::from_be_bytes([bytes[60], bytes[61], bytes[62], bytes[63]]);
        let disk_type = VhdType::from_u32(disk_type_raw)?;

        let checksum = u32::from_be_bytes([bytes[64], bytes[65], bytes[66], bytes[67]]);

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[68..84]);

        Ok(Self {
            cookie,
            features,
            version,
            data_offset,
            timestamp,
            creator_app,
            creator_version,
            creator_os,
            original_size,
            current_size,
            geometry,
            disk_type,
            checksum,
            uuid,
            saved_state: bytes[84],
        })
    }

    /// Serialize footer to bytes, reserved area zeroed
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.cookie);
        bytes[8..12].copy_from_slice(&self.features.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.version.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.creator_app);
        bytes[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.creator_os.to_be_bytes());
        bytes[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        bytes[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        bytes[56..60].copy_from_slice(&self.geometry.pack().to_be_bytes());
        bytes[60..64].copy_from_slice(&(self.disk_type as u32).to_be_bytes());
        bytes[64..68].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[68..84].copy_from_slice(&self.uuid);
        bytes[84] = self.saved_state;
        bytes
    }

    /// Recompute the checksum field
    pub fn update_checksum(&mut self) {
        self.checksum = vhd_checksum(&self.to_bytes(), Self::CHECKSUM_OFFSET);
    }

    /// Verify the footer checksum
    pub fn verify_checksum(&self) -> bool {
        vhd_checksum_valid(&self.to_bytes(), Self::CHECKSUM_OFFSET)
    }
}

/// VHD Dynamic Header structure (1024 bytes)
///
/// This header appears only in dynamic and differencing VHDs, located at the
/// offset specified in the footer's data_offset field.
#[derive(Debug, Clone)]
pub struct VhdDynamicHeader {
    pub cookie: [u8; 8], // "cxsparse"
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_uuid: [u8; 16],
    pub parent_timestamp: u32,
    pub parent_unicode_name: [u16; 256],
    pub parent_locator_entries: [[u8; 24]; 8],
}

impl VhdDynamicHeader {
    /// VHD dynamic header cookie value "cxsparse"
    pub const COOKIE: &'static [u8; 8] = b"cxsparse";

    /// Size of the VHD dynamic header in bytes
    pub const SIZE: usize = 1024;

    /// Byte offset of the checksum field
    pub const CHECKSUM_OFFSET: usize = 36;

    /// Header version 1.0
    pub const VERSION: u32 = 0x0001_0000;

    /// Sentinel for the unused next-header offset
    pub const NO_DATA_OFFSET: u64 = u64::MAX;

    /// Build a header for a new dynamic image and checksum it
    pub fn new(table_offset: u64, max_table_entries: u32, block_size: u32) -> Self {
        let mut header = Self {
            cookie: *Self::COOKIE,
            data_offset: Self::NO_DATA_OFFSET,
            table_offset,
            header_version: Self::VERSION,
            max_table_entries,
            block_size,
            checksum: 0,
            parent_uuid: [0u8; 16],
            parent_timestamp: 0,
            parent_unicode_name: [0u16; 256],
            parent_locator_entries: [[0u8; 24]; 8],
        };
        header.update_checksum();
        header
    }

    /// Parse VHD dynamic header from raw bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::invalid_vault("VHD dynamic header too small"));
        }

        // Parse cookie
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);

        // Verify cookie
        if &cookie != Self::COOKIE {
            return Err(Error::invalid_vault(format!(
                "Invalid VHD dynamic header cookie: expected 'cxsparse', got '{}'",
                String::from_utf8_lossy(&cookie)
            )));
        }

        // Parse fields (all big-endian)
        let data_offset = u64::from_be_bytes([
            bytes[8], bytes[9], bytes[10], bytes[11],
            bytes[12], bytes[13], bytes[14], bytes[15],
        ]);
        let table_offset = u64::from_be_bytes([
            bytes[16], bytes[17], bytes[18], bytes[19],
            bytes[20], bytes[21], bytes[22], bytes[23],
        ]);
        let header_version = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
        let max_table_entries = u32::from_be_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]);
        let block_size = u32::from_be_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
        let checksum = u32::from_be_bytes([bytes[36], bytes[37], bytes[38], bytes[39]]);

        let mut parent_uuid = [0u8; 16];
        parent_uuid.copy_from_slice(&bytes[40..56]);

        let parent_timestamp = u32::from_be_bytes([bytes[56], bytes[57], bytes[58], bytes[59]]);

        // Parent unicode name (256 UTF-16 BE characters)
        let mut parent_unicode_name = [0u16; 256];
        for (i, ch) in parent_unicode_name.iter_mut().enumerate() {
            let offset = 64 + i * 2;
            *ch = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        }

        // Parent locator entries (8 entries of 24 bytes each)
        let mut parent_locator_entries = [[0u8; 24]; 8];
        for (i, entry) in parent_locator_entries.iter_mut().enumerate() {
            let offset = 576 + i * 24;
            entry.copy_from_slice(&bytes[offset..offset + 24]);
        }

        Ok(Self {
            cookie,
            data_offset,
            table_offset,
            header_version,
            max_table_entries,
            block_size,
            checksum,
            parent_uuid,
            parent_timestamp,
            parent_unicode_name,
            parent_locator_entries,
        })
    }

    /// Serialize dynamic header to bytes, reserved areas zeroed
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.cookie);
        bytes[8..16].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.header_version.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        bytes[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[40..56].copy_from_slice(&self.parent_uuid);
        bytes[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());

        for (i, ch) in self.parent_unicode_name.iter().enumerate() {
            let offset = 64 + i * 2;
            bytes[offset..offset + 2].copy_from_slice(&ch.to_be_bytes());
        }

        for (i, entry) in self.parent_locator_entries.iter().enumerate() {
            let offset = 576 + i * 24;
            bytes[offset..offset + 24].copy_from_slice(entry);
        }
        bytes
    }

    /// Recompute the checksum field
    pub fn update_checksum(&mut self) {
        self.checksum = vhd_checksum(&self.to_bytes(), Self::CHECKSUM_OFFSET);
    }

    /// Verify the dynamic header checksum
    pub fn verify_checksum(&self) -> bool {
        vhd_checksum_valid(&self.to_bytes(), Self::CHECKSUM_OFFSET)
    }
}

/// Block Allocation Table for dynamic VHDs
///
/// Each entry is the 512-byte sector number of a block's sector bitmap, or
/// [`BlockAllocationTable::UNUSED`].
#[derive(Debug, Clone)]
pub struct BlockAllocationTable {
    pub entries: Vec<u32>,
}

impl BlockAllocationTable {
    /// Entry value of a block with no storage
    pub const UNUSED: u32 = 0xFFFF_FFFF;

    /// A table with every block absent
    pub fn unused(count: u32) -> Self {
        Self {
            entries: vec![Self::UNUSED; count as usize],
        }
    }

    /// Parse BAT from raw bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(Error::invalid_vault("BAT size must be multiple of 4"));
        }

        let entries = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(Self { entries })
    }

    /// Serialize the table, padded with unused entries to a whole sector
    pub fn to_bytes(&self) -> Vec<u8> {
        let padded = self.entries.len().div_ceil(128) * 128;
        let mut bytes = Vec::with_capacity(padded * 4);
        for &entry in &self.entries {
            bytes.extend_from_slice(&entry.to_be_bytes());
        }
        bytes.resize(padded * 4, 0xFF);
        bytes
    }

    /// Sector number of a block's bitmap, if the block is allocated
    pub fn get(&self, block_index: u32) -> Option<u32> {
        match self.entries.get(block_index as usize) {
            Some(&entry) if entry != Self::UNUSED => Some(entry),
            _ => None,
        }
    }

    /// Record the bitmap sector of a block
    pub fn set(&mut self, block_index: u32, sector: u32) {
        self.entries[block_index as usize] = sector;
    }
}
