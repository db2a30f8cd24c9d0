//! VHD (Virtual Hard Disk) vault implementation
//!
//! This module implements support for Microsoft VHD disk image format.
//!
//! ## Supported Formats
//!
//! - **Fixed VHD**: Data stored contiguously with a footer at the end
//! - **Dynamic VHD**: Sparse format using a Block Allocation Table (BAT)
//!
//! Differencing VHDs are recognized but refused as conversion sources.
//!
//! ## Layout written for dynamic images
//!
//! Footer copy at 0, dynamic header at 512, BAT at 1536, then blocks. Each
//! block is a sector bitmap padded in front to the required alignment,
//! followed by the data, so every data offset lands on a cluster boundary.

pub mod types;

use clonevault_core::{
    geometry::{
        ceil_div, checked_add_u64, is_power_of_two, natural_block_size, round_up, u64_to_usize,
        validate_alignment,
    },
    Error, ImageFile, ImageFormat, Result, Vault, MINIMUM_DISK_SIZE, SECTOR_SIZE,
};
use types::{BlockAllocationTable, VhdDynamicHeader, VhdFooter, VhdType};

use crate::checksum::vhd_checksum_valid;

/// Largest disk a dynamic VHD can describe (2040 GiB)
pub const VHD_MAX_DYNAMIC_DISK_SIZE: u64 = 2040 * 1024 * 1024 * 1024;

/// Block size used when none is requested (2 MiB)
pub const VHD_DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;

/// Smallest sector bitmap stored in front of a block
pub const VHD_MINIMUM_BITMAP_SIZE: u32 = 512;

/// Location of the dynamic header
pub const VHD_DYNAMIC_HEADER_OFFSET: u64 = VhdFooter::SIZE as u64;

/// Location of the block allocation table
pub const VHD_BAT_OFFSET: u64 = VHD_DYNAMIC_HEADER_OFFSET + VhdDynamicHeader::SIZE as u64;

/// Smallest file that can hold a dynamic VHD
const VHD_MINIMUM_FILE_SIZE: u64 = VHD_BAT_OFFSET + SECTOR_SIZE as u64 + VhdFooter::SIZE as u64;

/// Block size a VHD of `disk_size` is built with
///
/// `block_size` 0 selects the default. Fixed images ignore the request and
/// address the disk in the largest aligned power of two dividing it; dynamic
/// blocks must be at least `require_alignment` so every data offset stays on
/// a cluster boundary.
pub fn resolve_block_size(
    disk_size: u64,
    block_size: u32,
    is_fixed: bool,
    require_alignment: u32,
) -> Result<u32> {
    let block_size = if block_size == 0 {
        VHD_DEFAULT_BLOCK_SIZE
    } else {
        block_size
    };
    if block_size < SECTOR_SIZE || !is_power_of_two(block_size as u64) {
        return Err(Error::invalid_parameter(format!(
            "Unsupported VHD block size {}",
            block_size
        )));
    }
    if is_fixed {
        return Ok(natural_block_size(disk_size, require_alignment));
    }
    if block_size < require_alignment {
        return Err(Error::misaligned(format!(
            "VHD block size {} is smaller than required alignment {}",
            block_size, require_alignment
        )));
    }
    Ok(block_size)
}

/// Sparse block placement of a dynamic VHD
#[derive(Debug, Clone)]
struct DynamicLayout {
    header: VhdDynamicHeader,
    bat: BlockAllocationTable,
    bitmap_size: u32,
    bitmap_aligned_size: u32,
    bitmap_padding: u32,
    next_free_address: u64,
    template_bitmap_address: Option<u64>,
}

/// VHD vault - Microsoft Virtual Hard Disk container
pub struct VhdVault<F: ImageFile> {
    file: F,
    require_alignment: u32,
    footer: Option<VhdFooter>,
    disk_size: u64,
    block_size: u32,
    table_entries_count: u32,
    dynamic: Option<DynamicLayout>,
}

impl<F: ImageFile> VhdVault<F> {
    /// Bind a file with the alignment every data block must honor
    pub fn attach(file: F, require_alignment: u32) -> Result<Self> {
        validate_alignment(require_alignment)?;
        Ok(Self {
            file,
            require_alignment,
            footer: None,
            disk_size: 0,
            block_size: 0,
            table_entries_count: 0,
            dynamic: None,
        })
    }

    /// True when the file carries a VHD footer cookie where a footer belongs
    pub fn detect(file: &F) -> Result<bool> {
        let file_size = file.size()?;
        if file_size < VHD_MINIMUM_FILE_SIZE {
            return Ok(false);
        }

        let mut cookie = [0u8; 8];
        let offset = round_up(file_size - VhdFooter::SIZE as u64, SECTOR_SIZE as u64);
        let read = file.read_at(&mut cookie, offset)?;
        Ok(read == cookie.len() && &cookie == VhdFooter::COOKIE)
    }

    /// Get the VHD footer
    pub fn footer(&self) -> Option<&VhdFooter> {
        self.footer.as_ref()
    }

    /// Get the dynamic header (if this is a dynamic/differencing VHD)
    pub fn dynamic_header(&self) -> Option<&VhdDynamicHeader> {
        self.dynamic.as_ref().map(|layout| &layout.header)
    }

    /// Get the block allocation table (if this is a dynamic/differencing VHD)
    pub fn bat(&self) -> Option<&BlockAllocationTable> {
        self.dynamic.as_ref().map(|layout| &layout.bat)
    }

    fn loaded_footer(&self) -> Result<&VhdFooter> {
        self.footer
            .as_ref()
            .ok_or_else(|| Error::invalid_operation("VHD header has not been read or constructed"))
    }

    /// Read the footer from the end of the file, falling back to the head copy
    fn read_footer(&self, file_size: u64) -> Result<VhdFooter> {
        // A legacy 511-byte footer leaves the final reserved byte to the zero fill
        let mut bytes = [0u8; VhdFooter::SIZE];
        let offset = round_up(file_size - VhdFooter::SIZE as u64, SECTOR_SIZE as u64);
        self.file.read_at(&mut bytes, offset)?;

        if !VhdFooter::is_valid(&bytes) {
            self.file.read_exact_at(&mut bytes, 0)?;
            if &bytes[0..8] != VhdFooter::COOKIE {
                return Err(Error::invalid_vault("Missing VHD signature"));
            }
            if !vhd_checksum_valid(&bytes, VhdFooter::CHECKSUM_OFFSET) {
                return Err(Error::checksum("VHD footer checksum mismatch"));
            }
            tracing::warn!("VHD footer at end of file is damaged, using the copy at offset 0");
        }

        VhdFooter::parse(&bytes)
    }

    fn read_dynamic_layout(&self, footer: &VhdFooter, file_size: u64) -> Result<DynamicLayout> {
        if self.disk_size > VHD_MAX_DYNAMIC_DISK_SIZE {
            return Err(Error::invalid_vault(format!(
                "VHD disk size {} exceeds the dynamic VHD maximum",
                self.disk_size
            )));
        }
        if footer.data_offset > file_size.saturating_sub(VhdDynamicHeader::SIZE as u64) {
            return Err(Error::invalid_vault(format!(
                "VHD dynamic header offset {:#x} is beyond end of file",
                footer.data_offset
            )));
        }

        let mut bytes = [0u8; VhdDynamicHeader::SIZE];
        self.file.read_exact_at(&mut bytes, footer.data_offset)?;

        if &bytes[0..8] != VhdDynamicHeader::COOKIE {
            return Err(Error::invalid_vault("Missing dynamic VHD signature"));
        }
        if !vhd_checksum_valid(&bytes, VhdDynamicHeader::CHECKSUM_OFFSET) {
            return Err(Error::checksum("VHD dynamic header checksum mismatch"));
        }

        let header = VhdDynamicHeader::parse(&bytes)?;
        if header.data_offset != VhdDynamicHeader::NO_DATA_OFFSET {
            return Err(Error::invalid_vault("Unknown extra VHD header"));
        }
        if header.header_version != VhdDynamicHeader::VERSION {
            return Err(Error::unsupported(format!(
                "Unknown dynamic VHD version {:#010x}",
                header.header_version
            )));
        }

        let block_size = header.block_size;
        if block_size < SECTOR_SIZE || !is_power_of_two(block_size as u64) {
            return Err(Error::invalid_vault(format!(
                "Invalid VHD block size {}",
                block_size
            )));
        }

        let needed = ceil_div(self.disk_size, block_size as u64);
        if header.max_table_entries < needed {
            return Err(Error::invalid_vault(format!(
                "VHD BAT has {} entries, disk needs {}",
                header.max_table_entries, needed
            )));
        }

        let bat_len = u64_to_usize(header.max_table_entries as u64 * 4, "VHD BAT size")?;
        let mut bat_bytes = vec![0u8; bat_len];
        self.file.read_exact_at(&mut bat_bytes, header.table_offset)?;
        let bat = BlockAllocationTable::parse(&bat_bytes)?;

        let bitmap_size = (block_size / (SECTOR_SIZE * 8)).max(VHD_MINIMUM_BITMAP_SIZE);
        let bitmap_aligned_size = round_up(bitmap_size as u64, self.require_alignment as u64) as u32;

        // Continue after the furthest block so the vault could keep growing
        let bat_end = header.table_offset + bat.to_bytes().len() as u64;
        let data_end = bat
            .entries
            .iter()
            .filter(|&&entry| entry != BlockAllocationTable::UNUSED)
            .map(|&entry| entry as u64 * SECTOR_SIZE as u64 + bitmap_size as u64 + block_size as u64)
            .max()
            .unwrap_or(0);
        let next_free_address = round_up(bat_end.max(data_end), self.require_alignment as u64);

        tracing::debug!(
            block_size,
            max_table_entries = header.max_table_entries,
            table_offset = header.table_offset,
            "read VHD dynamic header"
        );

        Ok(DynamicLayout {
            header,
            bat,
            bitmap_size,
            bitmap_aligned_size,
            bitmap_padding: bitmap_aligned_size - bitmap_size,
            next_free_address,
            template_bitmap_address: None,
        })
    }
}

impl<F: ImageFile> Vault for VhdVault<F> {
    type File = F;

    fn format(&self) -> ImageFormat {
        ImageFormat::Vhd
    }

    fn read_header(&mut self) -> Result<()> {
        let file_size = self.file.size()?;
        if file_size < VHD_MINIMUM_FILE_SIZE {
            return Err(Error::invalid_vault("File too small to be a VHD"));
        }

        let footer = self.read_footer(file_size)?;
        if footer.features & !VhdFooter::VALID_FEATURE_MASK != 0 {
            return Err(Error::invalid_vault(format!(
                "Unknown VHD feature flags {:#010x}",
                footer.features
            )));
        }
        if footer.version != VhdFooter::VERSION {
            return Err(Error::unsupported(format!(
                "Unknown VHD version {:#010x}",
                footer.version
            )));
        }

        self.disk_size = footer.current_size;
        if self.disk_size == 0 || self.disk_size % SECTOR_SIZE as u64 != 0 {
            return Err(Error::invalid_vault(format!(
                "VHD disk size {} is not a multiple of the sector size",
                self.disk_size
            )));
        }

        match footer.disk_type {
            VhdType::Fixed => {
                if file_size < self.disk_size + VhdFooter::SIZE as u64 - 1 {
                    return Err(Error::invalid_vault(format!(
                        "Fixed VHD file ({} bytes) is shorter than its disk size {}",
                        file_size, self.disk_size
                    )));
                }
                self.block_size = natural_block_size(self.disk_size, self.require_alignment);
                self.table_entries_count = ceil_div(self.disk_size, self.block_size as u64);
                self.dynamic = None;
            }
            VhdType::Dynamic | VhdType::Differencing => {
                let layout = self.read_dynamic_layout(&footer, file_size)?;
                self.block_size = layout.header.block_size;
                self.table_entries_count = ceil_div(self.disk_size, self.block_size as u64);
                self.dynamic = Some(layout);
            }
            VhdType::None => {
                return Err(Error::invalid_vault("Unknown VHD disk type"));
            }
        }

        tracing::debug!(
            disk_type = ?footer.disk_type,
            disk_size = self.disk_size,
            block_size = self.block_size,
            "read VHD footer"
        );
        self.footer = Some(footer);
        Ok(())
    }

    fn construct_header(
        &mut self,
        disk_size: u64,
        block_size: u32,
        sector_size: u32,
        is_fixed: bool,
    ) -> Result<()> {
        if disk_size < MINIMUM_DISK_SIZE {
            return Err(Error::invalid_parameter("VHD disk size is less than 3 MiB"));
        }
        if sector_size != SECTOR_SIZE {
            return Err(Error::invalid_parameter(format!(
                "Unsupported VHD sector size {}",
                sector_size
            )));
        }
        if disk_size % SECTOR_SIZE as u64 != 0 {
            return Err(Error::invalid_parameter(
                "VHD disk size is not a multiple of the sector size",
            ));
        }

        let block_size = resolve_block_size(disk_size, block_size, is_fixed, self.require_alignment)?;
        if is_fixed {
            if disk_size / block_size as u64 > u32::MAX as u64 {
                return Err(Error::overflow("Fixed VHD has more than 2^32 blocks"));
            }

            self.disk_size = disk_size;
            self.block_size = block_size;
            self.table_entries_count = ceil_div(disk_size, block_size as u64);
            self.dynamic = None;
            self.footer = Some(VhdFooter::new(disk_size, VhdType::Fixed, VhdFooter::NO_DATA_OFFSET));
            self.file.set_size(disk_size + VhdFooter::SIZE as u64)?;
            return Ok(());
        }

        if disk_size > VHD_MAX_DYNAMIC_DISK_SIZE {
            return Err(Error::invalid_parameter(
                "Exceeded maximum dynamic VHD disk size",
            ));
        }

        let alignment = self.require_alignment as u64;
        let bitmap_size = (block_size / (SECTOR_SIZE * 8)).max(VHD_MINIMUM_BITMAP_SIZE);
        let bitmap_aligned_size = round_up(bitmap_size as u64, alignment) as u32;
        let table_entries_count = ceil_div(disk_size, block_size as u64);
        let bat = BlockAllocationTable::unused(table_entries_count);
        let next_free_address = round_up(VHD_BAT_OFFSET + bat.to_bytes().len() as u64, alignment);

        self.disk_size = disk_size;
        self.block_size = block_size;
        self.table_entries_count = table_entries_count;
        self.footer = Some(VhdFooter::new(disk_size, VhdType::Dynamic, VHD_DYNAMIC_HEADER_OFFSET));
        self.dynamic = Some(DynamicLayout {
            header: VhdDynamicHeader::new(VHD_BAT_OFFSET, table_entries_count, block_size),
            bat,
            bitmap_size,
            bitmap_aligned_size,
            bitmap_padding: bitmap_aligned_size - bitmap_size,
            next_free_address,
            template_bitmap_address: None,
        });

        tracing::debug!(
            disk_size,
            block_size,
            table_entries_count,
            next_free_address,
            "constructed dynamic VHD header"
        );
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let footer = self.loaded_footer()?.to_bytes();

        match &self.dynamic {
            None => {
                self.file.set_size(self.disk_size + VhdFooter::SIZE as u64)?;
                self.file.write_all_at(&footer, self.disk_size)?;
            }
            Some(layout) => {
                self.file.write_all_at(&footer, 0)?;
                self.file.write_all_at(&layout.header.to_bytes(), VHD_DYNAMIC_HEADER_OFFSET)?;
                self.file.write_all_at(&layout.bat.to_bytes(), VHD_BAT_OFFSET)?;
                let trailer = layout.next_free_address + self.require_alignment as u64
                    - VhdFooter::SIZE as u64;
                self.file.write_all_at(&footer, trailer)?;
            }
        }

        self.file.flush()
    }

    fn check_convertible(&self) -> Result<()> {
        let footer = self.loaded_footer()?;
        match footer.disk_type {
            VhdType::Fixed => {
                if self.disk_size / self.block_size as u64 > u32::MAX as u64 {
                    return Err(Error::overflow("Fixed VHD has more than 2^32 blocks"));
                }
                if self.disk_size % self.require_alignment as u64 != 0 {
                    return Err(Error::misaligned(format!(
                        "Fixed VHD disk size {} is not a multiple of the {} byte cluster size",
                        self.disk_size, self.require_alignment
                    )));
                }
                Ok(())
            }
            VhdType::Differencing => Err(Error::unsupported("Differencing VHD is not supported")),
            VhdType::Dynamic => {
                let layout = self
                    .dynamic
                    .as_ref()
                    .ok_or_else(|| Error::invalid_operation("Dynamic VHD has no BAT loaded"))?;

                if self.block_size < self.require_alignment {
                    return Err(Error::misaligned(format!(
                        "VHD block size {} is smaller than required alignment {}",
                        self.block_size, self.require_alignment
                    )));
                }

                let alignment = self.require_alignment as u64;
                for (index, &entry) in layout.bat.entries.iter().enumerate() {
                    if entry == BlockAllocationTable::UNUSED {
                        continue;
                    }
                    let data_offset = entry as u64 * SECTOR_SIZE as u64 + layout.bitmap_size as u64;
                    if data_offset % alignment != 0 {
                        return Err(Error::misaligned(format!(
                            "VHD data block {} at {:#x} is not aligned to {} bytes",
                            index, data_offset, alignment
                        )));
                    }
                }
                Ok(())
            }
            VhdType::None => Err(Error::invalid_vault("Unknown VHD disk type")),
        }
    }

    fn is_fixed(&self) -> bool {
        matches!(self.footer.as_ref().map(|f| f.disk_type), Some(VhdType::Fixed))
    }

    fn disk_size(&self) -> u64 {
        self.disk_size
    }

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn table_entries_count(&self) -> u32 {
        self.table_entries_count
    }

    fn probe_block(&self, index: u32) -> Option<u64> {
        if index >= self.table_entries_count {
            return None;
        }
        match &self.dynamic {
            None => self
                .footer
                .as_ref()
                .map(|_| self.block_size as u64 * index as u64),
            Some(layout) => layout
                .bat
                .get(index)
                .map(|sector| sector as u64 * SECTOR_SIZE as u64 + layout.bitmap_size as u64),
        }
    }

    fn allocate_block(&mut self, index: u32) -> Result<u64> {
        if let Some(offset) = self.probe_block(index) {
            return Ok(offset);
        }
        if index >= self.table_entries_count {
            return Err(Error::invalid_parameter(format!(
                "VHD block index {} out of range ({} blocks)",
                index, self.table_entries_count
            )));
        }

        let alignment = self.require_alignment as u64;
        let block_size = self.block_size as u64;
        let layout = self
            .dynamic
            .as_mut()
            .ok_or_else(|| Error::invalid_operation("VHD header has not been constructed"))?;

        let bitmap_address = layout.next_free_address;
        let end_of_file = checked_add_u64(
            checked_add_u64(bitmap_address, layout.bitmap_aligned_size as u64, "VHD bitmap end")?,
            block_size,
            "VHD block end",
        )?;
        if end_of_file > u32::MAX as u64 * SECTOR_SIZE as u64 {
            return Err(Error::overflow(
                "VHD grows beyond the 32-bit sector address range",
            ));
        }
        self.file.set_size(end_of_file)?;

        let cloned = match layout.template_bitmap_address {
            Some(template) => match self.file.clone_range_within(
                template,
                bitmap_address,
                layout.bitmap_aligned_size as u64,
            ) {
                Ok(()) => true,
                Err(e) if e.is_clone_contention() => {
                    tracing::warn!(template, "sector bitmap template is exhausted, writing a new one");
                    false
                }
                Err(e) => return Err(e),
            },
            None => false,
        };

        if !cloned {
            // Zero padding in front keeps the bitmap flush against the data
            let mut bitmap = vec![0u8; layout.bitmap_aligned_size as usize];
            bitmap[layout.bitmap_padding as usize..].fill(0xFF);
            self.file.write_all_at(&bitmap, bitmap_address)?;
            layout.template_bitmap_address = Some(bitmap_address);
        }

        let sector = (bitmap_address + layout.bitmap_padding as u64) / SECTOR_SIZE as u64;
        layout.bat.set(index, sector as u32);
        layout.next_free_address = end_of_file;
        debug_assert_eq!(layout.next_free_address % alignment, 0);

        let data_offset = end_of_file - block_size;
        tracing::trace!(index, data_offset, cloned, "allocated VHD block");
        Ok(data_offset)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::vhd_checksum_update;
    use clonevault_pipeline::MemoryFile;

    const MIB: u64 = 1024 * 1024;

    /// Construct, write and reopen an image in memory
    fn round_trip(disk_size: u64, block_size: u32, fixed: bool) -> VhdVault<MemoryFile> {
        let mut vault = VhdVault::attach(MemoryFile::new(4096), 4096).unwrap();
        vault.construct_header(disk_size, block_size, 512, fixed).unwrap();
        vault.write_header().unwrap();

        let bytes = Box::new(vault).into_file().into_bytes();
        let mut reopened = VhdVault::attach(MemoryFile::from_bytes(bytes, 4096), 4096).unwrap();
        reopened.read_header().unwrap();
        reopened
    }

    /// Create a synthetic dynamic VHD whose blocks are packed on sector boundaries
    fn create_packed_dynamic_vhd(virtual_size: u64, block_size: u32, allocated_blocks: &[u32]) -> Vec<u8> {
        let block_count = virtual_size.div_ceil(block_size as u64) as u32;
        let footer = VhdFooter::new(virtual_size, VhdType::Dynamic, VHD_DYNAMIC_HEADER_OFFSET).to_bytes();
        let header = VhdDynamicHeader::new(VHD_BAT_OFFSET, block_count, block_size).to_bytes();

        let mut bat = BlockAllocationTable::unused(block_count);
        let mut next_sector = ((VHD_BAT_OFFSET as usize + bat.to_bytes().len()) / 512) as u32;
        for &block in allocated_blocks {
            bat.set(block, next_sector);
            next_sector += (512 + block_size) / 512;
        }

        let mut vhd = Vec::new();
        vhd.extend_from_slice(&footer);
        vhd.extend_from_slice(&header);
        vhd.extend_from_slice(&bat.to_bytes());
        for &block in allocated_blocks {
            vhd.extend_from_slice(&[0xFFu8; 512]);
            vhd.extend(std::iter::repeat(block as u8).take(block_size as usize));
        }
        vhd.extend_from_slice(&footer);
        vhd
    }

    #[test]
    fn test_dynamic_round_trip_starts_sparse() {
        let vault = round_trip(10 * MIB, 2 * 1024 * 1024, false);

        assert!(!vault.is_fixed());
        assert_eq!(vault.disk_size(), 10 * MIB);
        assert_eq!(vault.block_size(), 2 * 1024 * 1024);
        assert_eq!(vault.sector_size(), 512);
        assert_eq!(vault.table_entries_count(), 5);
        assert!((0..5).all(|i| vault.probe_block(i).is_none()));
        assert!(vault.footer().unwrap().verify_checksum());
        assert!(vault.dynamic_header().unwrap().verify_checksum());
        assert!(vault.check_convertible().is_ok());
    }

    #[test]
    fn test_fixed_round_trip_fully_present() {
        let vault = round_trip(16 * MIB, 0, true);

        assert!(vault.is_fixed());
        assert_eq!(vault.disk_size(), 16 * MIB);
        assert_eq!(vault.block_size(), 16 * 1024 * 1024);
        assert_eq!(vault.table_entries_count(), 1);
        assert_eq!(vault.probe_block(0), Some(0));
        assert_eq!(vault.file().size().unwrap(), 16 * MIB + 512);
    }

    #[test]
    fn test_dynamic_layout_offsets() {
        let mut vault = VhdVault::attach(MemoryFile::new(4096), 4096).unwrap();
        vault.construct_header(10 * MIB, 2 * 1024 * 1024, 512, false).unwrap();

        // 1536 + 512 bytes of BAT rounds up to 4096; bitmap 512 pads to 4096
        let first = vault.allocate_block(3).unwrap();
        assert_eq!(first, 4096 + 4096);
        assert_eq!(vault.bat().unwrap().get(3), Some((4096 + 3584) / 512));
        assert_eq!(vault.probe_block(3), Some(first));
        assert_eq!(vault.file().size().unwrap(), first + 2 * MIB);

        let bitmap = &vault.file().bytes()[4096..8192];
        assert!(bitmap[..3584].iter().all(|&b| b == 0));
        assert!(bitmap[3584..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_allocate_block_idempotent() {
        let mut vault = VhdVault::attach(MemoryFile::new(4096), 4096).unwrap();
        vault.construct_header(10 * MIB, 2 * 1024 * 1024, 512, false).unwrap();

        let offset = vault.allocate_block(1).unwrap();
        let size = vault.file().size().unwrap();
        assert_eq!(vault.allocate_block(1).unwrap(), offset);
        assert_eq!(vault.file().size().unwrap(), size);
        assert_eq!(offset % 4096, 0);
    }

    #[test]
    fn test_bitmap_template_is_cloned() {
        let mut vault = VhdVault::attach(MemoryFile::new(4096), 4096).unwrap();
        vault.construct_header(10 * MIB, 2 * 1024 * 1024, 512, false).unwrap();

        let a = vault.allocate_block(0).unwrap();
        let b = vault.allocate_block(1).unwrap();
        assert_eq!(vault.file().clone_count(), 1);

        let bytes = vault.file().bytes();
        let first_bitmap = &bytes[(a - 4096) as usize..a as usize];
        let second_bitmap = &bytes[(b - 4096) as usize..b as usize];
        assert_eq!(first_bitmap, second_bitmap);
    }

    #[test]
    fn test_bitmap_clone_contention_falls_back_to_write() {
        let file = MemoryFile::new(4096).with_reference_limit(1);
        let mut vault = VhdVault::attach(file, 4096).unwrap();
        vault.construct_header(10 * MIB, 2 * 1024 * 1024, 512, false).unwrap();

        for index in 0..5 {
            vault.allocate_block(index).unwrap();
        }
        assert_eq!(vault.file().clone_count(), 0);

        vault.write_header().unwrap();
        let bytes = Box::new(vault).into_file().into_bytes();
        let mut reopened = VhdVault::attach(MemoryFile::from_bytes(bytes, 4096), 4096).unwrap();
        reopened.read_header().unwrap();
        for index in 0..5 {
            let data = reopened.probe_block(index).unwrap();
            let bitmap = &reopened.file().bytes()[(data - 512) as usize..data as usize];
            assert!(bitmap.iter().all(|&b| b == 0xFF));
        }
    }

    #[test]
    fn test_trailing_footer_location() {
        let mut vault = VhdVault::attach(MemoryFile::new(4096), 4096).unwrap();
        vault.construct_header(4 * MIB, 1024 * 1024, 512, false).unwrap();
        vault.allocate_block(0).unwrap();
        vault.write_header().unwrap();

        let bytes = vault.file().bytes();
        assert_eq!(bytes.len() % 4096, 0);
        assert!(VhdFooter::is_valid(&bytes[bytes.len() - 512..]));
        assert!(VhdFooter::is_valid(&bytes[..512]));
    }

    #[test]
    fn test_read_packed_dynamic_vhd() {
        let data = create_packed_dynamic_vhd(4 * MIB, 1024 * 1024, &[0, 2]);
        let mut vault = VhdVault::attach(MemoryFile::from_bytes(data, 512), 512).unwrap();
        vault.read_header().unwrap();

        assert_eq!(vault.table_entries_count(), 4);
        let offset = vault.probe_block(2).unwrap();
        assert_eq!(vault.file().bytes()[offset as usize], 2);
        assert!(vault.probe_block(1).is_none());
        assert!(vault.check_convertible().is_ok());
    }

    #[test]
    fn test_unaligned_blocks_not_convertible() {
        let data = create_packed_dynamic_vhd(4 * MIB, 1024 * 1024, &[0, 2]);
        let mut vault = VhdVault::attach(MemoryFile::from_bytes(data, 4096), 4096).unwrap();
        vault.read_header().unwrap();

        let err = vault.check_convertible().unwrap_err();
        assert!(matches!(err, Error::Misaligned(_)));
    }

    #[test]
    fn test_differencing_not_convertible() {
        let mut data = create_packed_dynamic_vhd(4 * MIB, 1024 * 1024, &[]);
        let len = data.len();
        for offset in [0, len - 512] {
            data[offset + 60..offset + 64].copy_from_slice(&4u32.to_be_bytes());
            vhd_checksum_update(&mut data[offset..offset + 512], VhdFooter::CHECKSUM_OFFSET);
        }

        let mut vault = VhdVault::attach(MemoryFile::from_bytes(data, 512), 512).unwrap();
        vault.read_header().unwrap();
        assert!(matches!(vault.check_convertible(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_footer_recovered_from_head_copy() {
        let mut data = create_packed_dynamic_vhd(4 * MIB, 1024 * 1024, &[1]);
        let len = data.len();
        data[len - 512..len - 504].copy_from_slice(b"garbage!");

        let mut vault = VhdVault::attach(MemoryFile::from_bytes(data, 512), 512).unwrap();
        vault.read_header().unwrap();
        assert_eq!(vault.disk_size(), 4 * MIB);
        assert!(vault.probe_block(1).is_some());
    }

    #[test]
    fn test_legacy_511_byte_footer() {
        let mut vault = VhdVault::attach(MemoryFile::new(4096), 4096).unwrap();
        vault.construct_header(4 * MIB, 0, 512, true).unwrap();
        vault.write_header().unwrap();

        let mut bytes = Box::new(vault).into_file().into_bytes();
        bytes.pop();
        let mut reopened = VhdVault::attach(MemoryFile::from_bytes(bytes, 4096), 4096).unwrap();
        reopened.read_header().unwrap();
        assert!(reopened.is_fixed());
        assert_eq!(reopened.disk_size(), 4 * MIB);
    }

    #[test]
    fn test_vhd_vault_footer_checksum_fail() {
        let mut data = create_packed_dynamic_vhd(4 * MIB, 1024 * 1024, &[]);
        let len = data.len();
        data[100] ^= 0xFF;
        data[len - 512 + 100] ^= 0xFF;

        let mut vault = VhdVault::attach(MemoryFile::from_bytes(data, 512), 512).unwrap();
        assert!(matches!(vault.read_header(), Err(Error::ChecksumVerification(_))));
    }

    #[test]
    fn test_vhd_vault_file_too_small() {
        let mut vault = VhdVault::attach(MemoryFile::from_bytes(vec![0u8; 1024], 512), 512).unwrap();
        assert!(vault.read_header().is_err());
    }

    #[test]
    fn test_construct_rejects_bad_parameters() {
        let mut vault = VhdVault::attach(MemoryFile::new(4096), 4096).unwrap();
        assert!(vault.construct_header(2 * MIB, 0, 512, false).is_err());
        assert!(vault.construct_header(4 * MIB, 0, 4096, false).is_err());
        assert!(vault.construct_header(4 * MIB + 100, 0, 512, false).is_err());
        assert!(vault.construct_header(4 * MIB, 3 * 1024 * 1024, 512, false).is_err());
        assert!(vault
            .construct_header(VHD_MAX_DYNAMIC_DISK_SIZE + 512, 0, 512, false)
            .is_err());
    }

    #[test]
    fn test_dynamic_block_smaller_than_alignment_rejected() {
        let mut vault = VhdVault::attach(MemoryFile::new(4096), 4096).unwrap();
        for block_size in [1024, 2048] {
            let err = vault.construct_header(4 * MIB, block_size, 512, false).unwrap_err();
            assert!(matches!(err, Error::Misaligned(_)));
        }
        assert!(vault.construct_header(4 * MIB, 4096, 512, false).is_ok());

        // Fixed images pick their own block size
        assert_eq!(resolve_block_size(4 * MIB, 1024, true, 4096).unwrap(), 4 * 1024 * 1024);
        assert_eq!(resolve_block_size(4 * MIB, 0, false, 4096).unwrap(), VHD_DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_offsets_aligned_for_every_alignment() {
        for shift in 9..=20 {
            let alignment = 1u32 << shift;
            let mut vault = VhdVault::attach(MemoryFile::new(alignment), alignment).unwrap();
            vault.construct_header(16 * MIB, 0, 512, false).unwrap();

            let mut offsets = Vec::new();
            for index in [5, 0, 7, 2] {
                let offset = vault.allocate_block(index).unwrap();
                assert_eq!(offset % alignment as u64, 0, "alignment {}", alignment);
                assert_eq!(vault.probe_block(index), Some(offset));
                offsets.push((index, offset));
            }
            vault.write_header().unwrap();

            let bytes = Box::new(vault).into_file().into_bytes();
            let mut reopened =
                VhdVault::attach(MemoryFile::from_bytes(bytes, alignment), alignment).unwrap();
            reopened.read_header().unwrap();
            assert!(reopened.check_convertible().is_ok(), "alignment {}", alignment);
            for (index, offset) in offsets {
                assert_eq!(reopened.probe_block(index), Some(offset));
            }
        }
    }

    #[test]
    fn test_fixed_disk_not_cluster_multiple_not_convertible() {
        let vault = round_trip(3 * MIB + 512, 0, true);
        assert!(matches!(vault.check_convertible(), Err(Error::Misaligned(_))));

        let bytes = Box::new(vault).into_file().into_bytes();
        let mut reopened = VhdVault::attach(MemoryFile::from_bytes(bytes, 512), 512).unwrap();
        reopened.read_header().unwrap();
        assert!(reopened.check_convertible().is_ok());
    }

    #[test]
    fn test_attach_rejects_bad_alignment() {
        assert!(VhdVault::attach(MemoryFile::new(4096), 3000).is_err());
    }

    #[test]
    fn test_detect() {
        let data = create_packed_dynamic_vhd(4 * MIB, 1024 * 1024, &[]);
        assert!(VhdVault::detect(&MemoryFile::from_bytes(data, 512)).unwrap());
        assert!(!VhdVault::detect(&MemoryFile::from_bytes(vec![0u8; 8192], 512)).unwrap());
    }
}
