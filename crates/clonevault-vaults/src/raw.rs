//! Raw vault - Direct sector image container
//!
//! This module implements the simplest vault type: a raw sector image with no
//! container metadata. The whole file is the disk, addressed as a run of
//! equally sized pseudo-blocks that are always present.

use clonevault_core::{
    geometry::{ceil_div, natural_block_size, validate_alignment},
    Error, ImageFile, ImageFormat, Result, Vault, MINIMUM_DISK_SIZE, SECTOR_SIZE,
};

/// Raw vault - a simple passthrough to the underlying file
///
/// # Example
///
/// ```rust
/// use clonevault_core::Vault;
/// use clonevault_pipeline::MemoryFile;
/// use clonevault_vaults::RawVault;
///
/// let mut vault = RawVault::attach(MemoryFile::new(4096), 4096).unwrap();
/// vault.construct_header(4 * 1024 * 1024, 0, 512, true).unwrap();
/// assert_eq!(vault.probe_block(0), Some(0));
/// ```
pub struct RawVault<F: ImageFile> {
    file: F,
    require_alignment: u32,
    disk_size: u64,
    block_size: u32,
    table_entries_count: u32,
}

impl<F: ImageFile> RawVault<F> {
    /// Bind a file with the alignment every block must honor
    pub fn attach(file: F, require_alignment: u32) -> Result<Self> {
        validate_alignment(require_alignment)?;
        Ok(Self {
            file,
            require_alignment,
            disk_size: 0,
            block_size: 0,
            table_entries_count: 0,
        })
    }

    /// Weak content check: a nonempty file made of whole sectors
    pub fn detect(file: &F) -> Result<bool> {
        let size = file.size()?;
        Ok(size > 0 && size % SECTOR_SIZE as u64 == 0)
    }

    fn set_geometry(&mut self, disk_size: u64) {
        self.disk_size = disk_size;
        self.block_size = natural_block_size(disk_size, self.require_alignment);
        self.table_entries_count = ceil_div(disk_size, self.block_size as u64);
    }
}

impl<F: ImageFile> Vault for RawVault<F> {
    type File = F;

    fn format(&self) -> ImageFormat {
        ImageFormat::Raw
    }

    fn read_header(&mut self) -> Result<()> {
        let disk_size = self.file.size()?;
        if disk_size < MINIMUM_DISK_SIZE {
            return Err(Error::invalid_vault(format!(
                "RAW image of {} bytes is smaller than 3 MiB",
                disk_size
            )));
        }
        if disk_size % SECTOR_SIZE as u64 != 0 {
            return Err(Error::invalid_vault(
                "RAW image size is not a multiple of the sector size",
            ));
        }

        self.set_geometry(disk_size);
        tracing::debug!(disk_size, block_size = self.block_size, "read RAW image");
        Ok(())
    }

    fn construct_header(
        &mut self,
        disk_size: u64,
        _block_size: u32,
        sector_size: u32,
        _is_fixed: bool,
    ) -> Result<()> {
        if sector_size != SECTOR_SIZE {
            return Err(Error::invalid_parameter(format!(
                "Unsupported RAW sector size {}",
                sector_size
            )));
        }
        if disk_size < MINIMUM_DISK_SIZE {
            return Err(Error::invalid_parameter("RAW disk size is less than 3 MiB"));
        }
        if disk_size % SECTOR_SIZE as u64 != 0 {
            return Err(Error::invalid_parameter(
                "RAW disk size is not a multiple of the sector size",
            ));
        }

        self.set_geometry(disk_size);
        if disk_size / self.block_size as u64 > u32::MAX as u64 {
            return Err(Error::overflow("RAW image has more than 2^32 blocks"));
        }
        self.file.set_size(disk_size)
    }

    fn write_header(&mut self) -> Result<()> {
        // Drop any cluster padding the final clone left past the disk end
        self.file.set_size(self.disk_size)?;
        self.file.flush()
    }

    fn check_convertible(&self) -> Result<()> {
        if self.disk_size / self.block_size as u64 > u32::MAX as u64 {
            return Err(Error::overflow("RAW image has more than 2^32 blocks"));
        }
        if self.disk_size % self.require_alignment as u64 != 0 {
            return Err(Error::misaligned(format!(
                "RAW image size {} is not a multiple of the {} byte cluster size",
                self.disk_size, self.require_alignment
            )));
        }
        Ok(())
    }

    fn is_fixed(&self) -> bool {
        true
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
        (index < self.table_entries_count).then(|| self.block_size as u64 * index as u64)
    }

    fn allocate_block(&mut self, index: u32) -> Result<u64> {
        self.probe_block(index).ok_or_else(|| {
            Error::invalid_parameter(format!(
                "RAW block index {} out of range ({} blocks)",
                index, self.table_entries_count
            ))
        })
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
