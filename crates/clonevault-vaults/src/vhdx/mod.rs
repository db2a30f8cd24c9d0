//! VHDX vault implementation
//!
//! Hyper-V virtual hard disk v2. Only images with an empty log and no parent
//! are accepted as conversion sources.
//!
//! ## Layout written for new images
//!
//! | Offset  | Structure               |
//! |---------|-------------------------|
//! | 0       | File type identifier    |
//! | 64 KiB  | Header 1                |
//! | 128 KiB | Header 2                |
//! | 192 KiB | Region table 1          |
//! | 256 KiB | Region table 2          |
//! | 1 MiB   | Log (empty, 1 MiB)      |
//! | 2 MiB   | Metadata region (1 MiB) |
//! | 3 MiB   | BAT, then payload blocks|
//!
//! Payload blocks are whole MiBs and always start on a MiB boundary, so any
//! alignment up to 1 MiB is honored.

pub mod types;

use clonevault_core::{
    geometry::{
        ceil_div, checked_add_u64, checked_multiply_u64, is_power_of_two, round_up, u64_to_usize,
        validate_alignment,
    },
    Error, ImageFile, ImageFormat, Result, Vault, MIB, MINIMUM_DISK_SIZE,
};
use types::{
    bat_to_bytes, chunk_ratio, parse_bat, BatEntry, BlockState, FileIdentifier, FileParameters,
    MetadataTable, MetadataTableEntry, RegionTable, RegionTableEntry, VhdxHeader,
    BAT_REGION_GUID, FILE_PARAMETERS_GUID, LOGICAL_SECTOR_SIZE_GUID, METADATA_REGION_GUID,
    PARENT_LOCATOR_GUID, PHYSICAL_SECTOR_SIZE_GUID, VIRTUAL_DISK_ID_GUID, VIRTUAL_DISK_SIZE_GUID,
};
use uuid::Uuid;

pub const VHDX_HEADER1_OFFSET: u64 = 64 * 1024;
pub const VHDX_HEADER2_OFFSET: u64 = 128 * 1024;
pub const VHDX_REGION_TABLE1_OFFSET: u64 = 192 * 1024;
pub const VHDX_REGION_TABLE2_OFFSET: u64 = 256 * 1024;
pub const VHDX_LOG_OFFSET: u64 = MIB;
pub const VHDX_LOG_LENGTH: u32 = MIB as u32;
pub const VHDX_METADATA_OFFSET: u64 = 2 * MIB;
pub const VHDX_METADATA_LENGTH: u32 = MIB as u32;
pub const VHDX_BAT_OFFSET: u64 = 3 * MIB;

/// Largest virtual disk a VHDX may describe (64 TiB)
pub const VHDX_MAX_DISK_SIZE: u64 = 64 * 1024 * 1024 * MIB;

/// Block size used when none is requested (32 MiB)
pub const VHDX_DEFAULT_BLOCK_SIZE: u32 = 32 * MIB as u32;

pub const VHDX_MIN_BLOCK_SIZE: u32 = MIB as u32;
pub const VHDX_MAX_BLOCK_SIZE: u32 = 256 * MIB as u32;

/// Default physical sector size reported in new images
pub const VHDX_PHYSICAL_SECTOR_SIZE: u32 = 4096;

/// Largest alignment the MiB-granular payload placement can honor
pub const VHDX_MAX_ALIGNMENT: u32 = MIB as u32;

/// Creator string recorded in the file type identifier
const VHDX_CREATOR: &str = "clonevault";

/// Offset of the metadata payload inside the metadata region
const METADATA_PAYLOAD_OFFSET: u32 = MetadataTable::SIZE as u32;

/// Smallest file `detect` will consider
const VHDX_MINIMUM_FILE_SIZE: u64 = 4 * MIB;

fn is_valid_sector_size(sector_size: u32) -> bool {
    sector_size == 512 || sector_size == 4096
}

fn is_valid_block_size(block_size: u32) -> bool {
    (VHDX_MIN_BLOCK_SIZE..=VHDX_MAX_BLOCK_SIZE).contains(&block_size)
        && is_power_of_two(block_size as u64)
}

/// Block size a new VHDX is built with (`block_size` 0 selects the default)
pub fn resolve_block_size(block_size: u32, require_alignment: u32) -> Result<u32> {
    if require_alignment > VHDX_MAX_ALIGNMENT {
        return Err(Error::unsupported(format!(
            "VHDX cannot honor an alignment of {} bytes",
            require_alignment
        )));
    }
    let block_size = if block_size == 0 {
        VHDX_DEFAULT_BLOCK_SIZE
    } else {
        block_size
    };
    if !is_valid_block_size(block_size) {
        return Err(Error::invalid_parameter(format!(
            "Unsupported VHDX block size {}",
            block_size
        )));
    }
    Ok(block_size)
}

/// VHDX vault - Hyper-V Virtual Hard Disk v2 container
pub struct VhdxVault<F: ImageFile> {
    file: F,
    require_alignment: u32,
    header: Option<VhdxHeader>,
    params: FileParameters,
    has_parent_locator: bool,
    disk_size: u64,
    logical_sector_size: u32,
    physical_sector_size: u32,
    disk_id: Uuid,
    chunk_ratio: u32,
    data_blocks_count: u32,
    bat_offset: u64,
    bat_region_length: u32,
    table_write_size: u64,
    bat: Vec<BatEntry>,
    next_free_address: u64,
}

impl<F: ImageFile> VhdxVault<F> {
    /// Bind a file with the alignment every data block must honor
    pub fn attach(file: F, require_alignment: u32) -> Result<Self> {
        validate_alignment(require_alignment)?;
        Ok(Self {
            file,
            require_alignment,
            header: None,
            params: FileParameters::default(),
            has_parent_locator: false,
            disk_size: 0,
            logical_sector_size: 0,
            physical_sector_size: 0,
            disk_id: Uuid::nil(),
            chunk_ratio: 0,
            data_blocks_count: 0,
            bat_offset: VHDX_BAT_OFFSET,
            bat_region_length: 0,
            table_write_size: 0,
            bat: Vec::new(),
            next_free_address: 0,
        })
    }

    /// True when the file starts with the VHDX identifier
    pub fn detect(file: &F) -> Result<bool> {
        if file.size()? < VHDX_MINIMUM_FILE_SIZE {
            return Ok(false);
        }
        let mut signature = [0u8; 8];
        let read = file.read_at(&mut signature, 0)?;
        Ok(read == signature.len() && &signature == FileIdentifier::SIGNATURE)
    }

    /// The active header
    pub fn header(&self) -> Option<&VhdxHeader> {
        self.header.as_ref()
    }

    pub fn file_parameters(&self) -> &FileParameters {
        &self.params
    }

    pub fn physical_sector_size(&self) -> u32 {
        self.physical_sector_size
    }

    pub fn disk_id(&self) -> Uuid {
        self.disk_id
    }

    /// Data blocks per sector bitmap slot in the BAT
    pub fn chunk_ratio(&self) -> u32 {
        self.chunk_ratio
    }

    /// Raw BAT, sector bitmap slots included
    pub fn bat(&self) -> &[BatEntry] {
        &self.bat
    }

    /// BAT slot of data block `index`, skipping the interleaved bitmap slots
    fn bat_slot(&self, index: u32) -> usize {
        index as usize + (index / self.chunk_ratio) as usize
    }

    /// Entries the BAT needs for the current geometry
    fn total_bat_entries(&self) -> u64 {
        let data = self.data_blocks_count as u64;
        data + data.saturating_sub(1) / self.chunk_ratio as u64
    }

    /// Pick the active header from the two copies
    fn read_active_header(&self) -> Result<VhdxHeader> {
        let mut first = vec![0u8; VhdxHeader::SIZE];
        let mut second = vec![0u8; VhdxHeader::SIZE];
        self.file.read_exact_at(&mut first, VHDX_HEADER1_OFFSET)?;
        self.file.read_exact_at(&mut second, VHDX_HEADER2_OFFSET)?;

        let bytes = match (VhdxHeader::is_valid(&first), VhdxHeader::is_valid(&second)) {
            (false, false) => return Err(Error::checksum("Both VHDX headers are damaged")),
            (true, false) => first,
            (false, true) => {
                tracing::warn!("VHDX header 1 is damaged, using header 2");
                second
            }
            (true, true) => {
                let seq1 = VhdxHeader::parse(&first)?.sequence_number;
                let seq2 = VhdxHeader::parse(&second)?.sequence_number;
                if seq1 > seq2 {
                    first
                } else if seq2 > seq1 {
                    second
                } else if first == second {
                    first
                } else {
                    return Err(Error::invalid_vault(
                        "VHDX headers share a sequence number but differ",
                    ));
                }
            }
        };

        VhdxHeader::parse(&bytes)
    }

    /// First region table copy whose signature and checksum hold
    fn read_region_table(&self) -> Result<RegionTable> {
        let mut bytes = vec![0u8; RegionTable::SIZE];
        for (copy, offset) in [VHDX_REGION_TABLE1_OFFSET, VHDX_REGION_TABLE2_OFFSET]
            .into_iter()
            .enumerate()
        {
            self.file.read_exact_at(&mut bytes, offset)?;
            if RegionTable::is_valid(&bytes) {
                if copy > 0 {
                    tracing::warn!("VHDX region table 1 is damaged, using region table 2");
                }
                return RegionTable::parse(&bytes);
            }
        }
        Err(Error::checksum("Both VHDX region tables are damaged"))
    }

    fn read_item(&self, region: u64, entry: &MetadataTableEntry, len: usize) -> Result<Vec<u8>> {
        if (entry.length as usize) < len {
            return Err(Error::invalid_vault(format!(
                "VHDX metadata item {} is {} bytes, expected {}",
                entry.item_id, entry.length, len
            )));
        }
        let mut bytes = vec![0u8; len];
        self.file.read_exact_at(&mut bytes, region + entry.offset as u64)?;
        Ok(bytes)
    }

    fn read_metadata(&mut self, region: &RegionTableEntry) -> Result<()> {
        if (region.length as usize) < MetadataTable::SIZE {
            return Err(Error::invalid_vault("VHDX metadata region is too small"));
        }
        let mut table_bytes = vec![0u8; MetadataTable::SIZE];
        self.file.read_exact_at(&mut table_bytes, region.file_offset)?;
        let table = MetadataTable::parse(&table_bytes)?;

        let mut params = None;
        let mut disk_size = None;
        let mut logical_sector_size = None;
        self.physical_sector_size = VHDX_PHYSICAL_SECTOR_SIZE;
        self.has_parent_locator = false;

        for entry in &table.entries {
            if entry.offset as u64 + entry.length as u64 > region.length as u64 {
                return Err(Error::invalid_vault(format!(
                    "VHDX metadata item {} lies outside the metadata region",
                    entry.item_id
                )));
            }

            match entry.item_id {
                id if id == FILE_PARAMETERS_GUID => {
                    let bytes = self.read_item(region.file_offset, entry, FileParameters::SIZE)?;
                    params = Some(FileParameters::parse(&bytes));
                }
                id if id == VIRTUAL_DISK_SIZE_GUID => {
                    let bytes = self.read_item(region.file_offset, entry, 8)?;
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&bytes);
                    disk_size = Some(u64::from_le_bytes(raw));
                }
                id if id == LOGICAL_SECTOR_SIZE_GUID => {
                    let bytes = self.read_item(region.file_offset, entry, 4)?;
                    logical_sector_size =
                        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
                }
                id if id == PHYSICAL_SECTOR_SIZE_GUID => {
                    let bytes = self.read_item(region.file_offset, entry, 4)?;
                    self.physical_sector_size =
                        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                }
                id if id == VIRTUAL_DISK_ID_GUID => {
                    let bytes = self.read_item(region.file_offset, entry, 16)?;
                    let mut raw = [0u8; 16];
                    raw.copy_from_slice(&bytes);
                    self.disk_id = Uuid::from_bytes_le(raw);
                }
                id if id == PARENT_LOCATOR_GUID => {
                    self.has_parent_locator = true;
                }
                id if entry.is_required => {
                    return Err(Error::unsupported(format!(
                        "Unknown required VHDX metadata item {}",
                        id
                    )));
                }
                id => {
                    tracing::debug!(item = %id, "skipping optional VHDX metadata item");
                }
            }
        }

        let params = params.ok_or_else(|| Error::invalid_vault("VHDX file parameters are missing"))?;
        let disk_size = disk_size.ok_or_else(|| Error::invalid_vault("VHDX disk size is missing"))?;
        let logical_sector_size = logical_sector_size
            .ok_or_else(|| Error::invalid_vault("VHDX logical sector size is missing"))?;

        if !is_valid_block_size(params.block_size) {
            return Err(Error::invalid_vault(format!(
                "Invalid VHDX block size {}",
                params.block_size
            )));
        }
        if !is_valid_sector_size(logical_sector_size) {
            return Err(Error::invalid_vault(format!(
                "Invalid VHDX logical sector size {}",
                logical_sector_size
            )));
        }
        if disk_size == 0 || disk_size > VHDX_MAX_DISK_SIZE || disk_size % logical_sector_size as u64 != 0 {
            return Err(Error::invalid_vault(format!(
                "Invalid VHDX disk size {}",
                disk_size
            )));
        }

        self.params = params;
        self.disk_size = disk_size;
        self.logical_sector_size = logical_sector_size;
        Ok(())
    }

    fn metadata_table(&self) -> MetadataTable {
        let item = |item_id, offset: u32, length, is_virtual_disk| MetadataTableEntry {
            item_id,
            offset: METADATA_PAYLOAD_OFFSET + offset,
            length,
            is_user: false,
            is_virtual_disk,
            is_required: true,
        };
        MetadataTable {
            entries: vec![
                item(FILE_PARAMETERS_GUID, 0, 8, false),
                item(VIRTUAL_DISK_SIZE_GUID, 8, 8, true),
                item(LOGICAL_SECTOR_SIZE_GUID, 16, 4, true),
                item(PHYSICAL_SECTOR_SIZE_GUID, 20, 4, true),
                item(VIRTUAL_DISK_ID_GUID, 24, 16, true),
            ],
        }
    }

    fn metadata_payload(&self) -> Vec<u8> {
        let mut payload = vec![0u8; 4096];
        payload[0..8].copy_from_slice(&self.params.to_bytes());
        payload[8..16].copy_from_slice(&self.disk_size.to_le_bytes());
        payload[16..20].copy_from_slice(&self.logical_sector_size.to_le_bytes());
        payload[20..24].copy_from_slice(&self.physical_sector_size.to_le_bytes());
        payload[24..40].copy_from_slice(&self.disk_id.to_bytes_le());
        payload
    }

    fn region_table(&self) -> RegionTable {
        RegionTable {
            entries: vec![
                RegionTableEntry {
                    guid: METADATA_REGION_GUID,
                    file_offset: VHDX_METADATA_OFFSET,
                    length: VHDX_METADATA_LENGTH,
                    required: true,
                },
                RegionTableEntry {
                    guid: BAT_REGION_GUID,
                    file_offset: self.bat_offset,
                    length: self.bat_region_length,
                    required: true,
                },
            ],
        }
    }

    fn loaded_header(&self) -> Result<&VhdxHeader> {
        self.header
            .as_ref()
            .ok_or_else(|| Error::invalid_operation("VHDX header has not been read or constructed"))
    }
}

impl<F: ImageFile> Vault for VhdxVault<F> {
    type File = F;

    fn format(&self) -> ImageFormat {
        ImageFormat::Vhdx
    }

    fn read_header(&mut self) -> Result<()> {
        let mut identifier = vec![0u8; FileIdentifier::SIZE];
        self.file.read_exact_at(&mut identifier, 0)?;
        let identifier = FileIdentifier::parse(&identifier)?;

        let header = self.read_active_header()?;
        if header.version != VhdxHeader::CURRENT_VERSION {
            return Err(Error::unsupported(format!(
                "Unknown VHDX version {}",
                header.version
            )));
        }

        let regions = self.read_region_table()?;
        let mut bat_region = None;
        let mut metadata_region = None;
        for entry in &regions.entries {
            if entry.guid == BAT_REGION_GUID {
                bat_region = Some(*entry);
            } else if entry.guid == METADATA_REGION_GUID {
                metadata_region = Some(*entry);
            } else if entry.required {
                return Err(Error::unsupported(format!(
                    "Unknown required VHDX region {}",
                    entry.guid
                )));
            }
        }
        let bat_region = bat_region.ok_or_else(|| Error::invalid_vault("VHDX BAT region is missing"))?;
        let metadata_region =
            metadata_region.ok_or_else(|| Error::invalid_vault("VHDX metadata region is missing"))?;

        self.read_metadata(&metadata_region)?;

        self.chunk_ratio = chunk_ratio(self.logical_sector_size, self.params.block_size);
        self.data_blocks_count = ceil_div(self.disk_size, self.params.block_size as u64);
        let total_entries = self.total_bat_entries();
        if (bat_region.length as u64 / 8) < total_entries {
            return Err(Error::invalid_vault(format!(
                "VHDX BAT has {} entries, disk needs {}",
                bat_region.length / 8,
                total_entries
            )));
        }

        let mut bat_bytes = vec![0u8; u64_to_usize(bat_region.length as u64, "VHDX BAT size")?];
        self.file.read_exact_at(&mut bat_bytes, bat_region.file_offset)?;
        self.bat = parse_bat(&bat_bytes);
        self.bat_offset = bat_region.file_offset;
        self.bat_region_length = bat_region.length;
        self.table_write_size = round_up(total_entries * 8, self.require_alignment as u64);

        let partial = self
            .bat
            .iter()
            .filter(|entry| entry.state() == BlockState::PartiallyPresent)
            .count();
        if partial > 0 {
            tracing::warn!(partial, "partially present VHDX blocks are treated as absent");
        }

        // Continue after the furthest structure so the vault could keep growing
        let block_size = self.params.block_size as u64;
        let data_end = self
            .bat
            .iter()
            .filter(|entry| entry.state() == BlockState::FullyPresent)
            .map(|entry| entry.file_offset_mb() * MIB + block_size)
            .max()
            .unwrap_or(0);
        let regions_end = (bat_region.file_offset + bat_region.length as u64)
            .max(metadata_region.file_offset + metadata_region.length as u64);
        self.next_free_address = round_up(data_end.max(regions_end), MIB);

        tracing::debug!(
            creator = %identifier.creator,
            sequence = header.sequence_number,
            disk_size = self.disk_size,
            block_size = self.params.block_size,
            chunk_ratio = self.chunk_ratio,
            "read VHDX header"
        );
        self.header = Some(header);
        Ok(())
    }

    fn construct_header(
        &mut self,
        disk_size: u64,
        block_size: u32,
        sector_size: u32,
        is_fixed: bool,
    ) -> Result<()> {
        let block_size = resolve_block_size(block_size, self.require_alignment)?;
        if disk_size > VHDX_MAX_DISK_SIZE {
            return Err(Error::invalid_parameter("VHDX disk size exceeds 64 TiB"));
        }
        if disk_size < MINIMUM_DISK_SIZE {
            return Err(Error::invalid_parameter("VHDX disk size is less than 3 MiB"));
        }
        if !is_valid_sector_size(sector_size) {
            return Err(Error::invalid_parameter(format!(
                "Unsupported VHDX sector size {}",
                sector_size
            )));
        }
        if disk_size % sector_size as u64 != 0 {
            return Err(Error::invalid_parameter(
                "VHDX disk size is not a multiple of the sector size",
            ));
        }

        self.header = Some(VhdxHeader::new(VHDX_LOG_OFFSET, VHDX_LOG_LENGTH));
        self.params = FileParameters {
            block_size,
            leave_blocks_allocated: is_fixed,
            has_parent: false,
        };
        self.has_parent_locator = false;
        self.disk_size = disk_size;
        self.logical_sector_size = sector_size;
        self.physical_sector_size = VHDX_PHYSICAL_SECTOR_SIZE;
        self.disk_id = Uuid::new_v4();
        self.chunk_ratio = chunk_ratio(sector_size, block_size);
        self.data_blocks_count = ceil_div(disk_size, block_size as u64);

        let total_entries = self.total_bat_entries();
        self.table_write_size = round_up(
            checked_multiply_u64(total_entries, 8, "VHDX BAT size")?,
            self.require_alignment as u64,
        );
        let bat_region_length = round_up(self.table_write_size, MIB);
        self.bat_offset = VHDX_BAT_OFFSET;
        self.bat_region_length = u32::try_from(bat_region_length)
            .map_err(|_| Error::overflow("VHDX BAT region exceeds 4 GiB"))?;
        self.bat = vec![BatEntry::default(); u64_to_usize(self.table_write_size / 8, "VHDX BAT size")?];
        self.next_free_address = VHDX_BAT_OFFSET + bat_region_length;

        if is_fixed {
            for index in 0..self.data_blocks_count {
                let slot = self.bat_slot(index);
                self.bat[slot] = BatEntry::new(BlockState::FullyPresent, self.next_free_address / MIB);
                self.next_free_address += block_size as u64;
            }
        }

        self.file.set_size(self.next_free_address)?;

        tracing::debug!(
            disk_size,
            block_size,
            chunk_ratio = self.chunk_ratio,
            bat_entries = total_entries,
            next_free_address = self.next_free_address,
            "constructed VHDX header"
        );
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let header = self.loaded_header()?.to_bytes();
        let identifier = FileIdentifier {
            creator: VHDX_CREATOR.to_string(),
        };
        let regions = self.region_table().to_bytes();

        self.file.write_all_at(&identifier.to_bytes(), 0)?;
        self.file.write_all_at(&header, VHDX_HEADER1_OFFSET)?;
        self.file.write_all_at(&header, VHDX_HEADER2_OFFSET)?;
        self.file.write_all_at(&regions, VHDX_REGION_TABLE1_OFFSET)?;
        self.file.write_all_at(&regions, VHDX_REGION_TABLE2_OFFSET)?;
        self.file
            .write_all_at(&self.metadata_table().to_bytes(), VHDX_METADATA_OFFSET)?;
        self.file.write_all_at(
            &self.metadata_payload(),
            VHDX_METADATA_OFFSET + METADATA_PAYLOAD_OFFSET as u64,
        )?;

        let table_len = u64_to_usize(self.table_write_size, "VHDX BAT size")?;
        let entries = (table_len / 8).min(self.bat.len());
        let bat = bat_to_bytes(&self.bat[..entries]);
        self.file.write_all_at(&bat, self.bat_offset)?;

        self.file.flush()
    }

    fn check_convertible(&self) -> Result<()> {
        let header = self.loaded_header()?;
        if !header.log_guid.is_nil() {
            return Err(Error::unsupported(
                "VHDX log must be replayed before conversion",
            ));
        }
        if self.params.has_parent || self.has_parent_locator {
            return Err(Error::unsupported("Differencing VHDX is not supported"));
        }
        if self.require_alignment > VHDX_MAX_ALIGNMENT {
            return Err(Error::unsupported(format!(
                "VHDX cannot honor an alignment of {} bytes",
                self.require_alignment
            )));
        }
        Ok(())
    }

    fn is_fixed(&self) -> bool {
        self.params.leave_blocks_allocated
    }

    fn disk_size(&self) -> u64 {
        self.disk_size
    }

    fn sector_size(&self) -> u32 {
        self.logical_sector_size
    }

    fn block_size(&self) -> u32 {
        self.params.block_size
    }

    fn table_entries_count(&self) -> u32 {
        self.data_blocks_count
    }

    fn probe_block(&self, index: u32) -> Option<u64> {
        if index >= self.data_blocks_count {
            return None;
        }
        self.bat
            .get(self.bat_slot(index))
            .filter(|entry| entry.state() == BlockState::FullyPresent)
            .map(|entry| entry.file_offset_mb() * MIB)
    }

    fn allocate_block(&mut self, index: u32) -> Result<u64> {
        if let Some(offset) = self.probe_block(index) {
            return Ok(offset);
        }
        if index >= self.data_blocks_count {
            return Err(Error::invalid_parameter(format!(
                "VHDX block index {} out of range ({} blocks)",
                index, self.data_blocks_count
            )));
        }
        let slot = self.bat_slot(index);
        if slot >= self.bat.len() {
            return Err(Error::invalid_operation("VHDX header has not been constructed"));
        }

        let offset = self.next_free_address;
        let end_of_file = checked_add_u64(offset, self.params.block_size as u64, "VHDX block end")?;
        self.file.set_size(end_of_file)?;
        self.bat[slot] = BatEntry::new(BlockState::FullyPresent, offset / MIB);
        self.next_free_address = end_of_file;

        tracing::trace!(index, slot, offset, "allocated VHDX block");
        Ok(offset)
    }

    fn require_alignment(&self) -> u32 {
        self.require_alignment
    }

    fn file(&self) -> &F {
        &self.file
    }

    fn file_mut(&mut self) -> &mut F {
        &mut self.file
    }

    fn into_file(self: Box<Self>) -> F {
        self.file
    }
}
