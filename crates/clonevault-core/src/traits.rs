//! Core traits for block-cloning conversion

use crate::{
    error::Result,
    types::{ImageFormat, VaultInfo},
};

/// Host file service an image engine is bound to
///
/// Every operation is fully addressed; nothing depends on an implicit file
/// cursor, so calls may be reordered or retried freely.
pub trait ImageFile {
    /// Current length of the file in bytes
    fn size(&self) -> Result<u64>;

    /// Grow or truncate the file to exactly `size` bytes
    fn set_size(&mut self, size: u64) -> Result<()>;

    /// Fill `buf` from `offset`, failing on a short read
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Read up to `buf.len()` bytes from `offset`, returning how many arrived
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write all of `buf` at `offset`
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Share `len` bytes of `source` starting at `src_offset` into this file at `dst_offset`
    ///
    /// All three numbers must be multiples of the volume cluster size.
    fn clone_range_from(
        &mut self,
        source: &Self,
        src_offset: u64,
        dst_offset: u64,
        len: u64,
    ) -> Result<()>;

    /// Share an extent of this file with another location in the same file
    fn clone_range_within(&mut self, src_offset: u64, dst_offset: u64, len: u64) -> Result<()>;

    /// Push written data and metadata to stable storage
    fn flush(&mut self) -> Result<()>;

    /// Minimum extent-clone granularity of the volume holding this file
    fn cluster_size(&self) -> Result<u32>;

    /// Whether the volume holding this file can share extents
    fn supports_block_cloning(&self) -> Result<bool>;

    /// Whether the file currently has unallocated holes
    fn is_sparse(&self) -> Result<bool>;

    /// Make the file sparse, or back every hole with real allocation
    fn set_sparse(&mut self, sparse: bool) -> Result<()>;
}

/// A disk image container (vault) bound to one file
///
/// Lifecycle: attach a file, then call exactly one of [`Vault::read_header`]
/// or [`Vault::construct_header`], then probe or allocate blocks, then call
/// [`Vault::write_header`] once.
pub trait Vault {
    /// File service this vault reads and writes through
    type File: ImageFile;

    /// Container format implemented by this vault
    fn format(&self) -> ImageFormat;

    /// Parse and validate the metadata of an existing image
    fn read_header(&mut self) -> Result<()>;

    /// Build fresh metadata for a new image
    ///
    /// A `block_size` of zero selects the format default.
    fn construct_header(
        &mut self,
        disk_size: u64,
        block_size: u32,
        sector_size: u32,
        is_fixed: bool,
    ) -> Result<()>;

    /// Persist the metadata and flush the file
    fn write_header(&mut self) -> Result<()>;

    /// Fail if the image cannot serve as a block-cloning source
    fn check_convertible(&self) -> Result<()>;

    /// Preallocated (true) or sparse-growable (false)
    fn is_fixed(&self) -> bool;

    /// Virtual disk size in bytes
    fn disk_size(&self) -> u64;

    /// Logical sector size in bytes
    fn sector_size(&self) -> u32;

    /// Data block size in bytes
    fn block_size(&self) -> u32;

    /// Number of logical data blocks
    fn table_entries_count(&self) -> u32;

    /// File offset of block `index`, or `None` when the block is absent
    fn probe_block(&self, index: u32) -> Option<u64>;

    /// File offset of block `index`, allocating it when absent
    fn allocate_block(&mut self, index: u32) -> Result<u64>;

    /// Alignment every data block offset must honor
    fn require_alignment(&self) -> u32;

    /// The underlying file
    fn file(&self) -> &Self::File;

    /// The underlying file, mutably
    fn file_mut(&mut self) -> &mut Self::File;

    /// Release the underlying file
    fn into_file(self: Box<Self>) -> Self::File;

    /// Summary of the opened image
    fn info(&self) -> VaultInfo {
        let allocated_blocks = (0..self.table_entries_count())
            .filter(|&index| self.probe_block(index).is_some())
            .count() as u64;

        VaultInfo {
            format: self.format(),
            is_fixed: self.is_fixed(),
            disk_size: self.disk_size(),
            block_size: self.block_size(),
            sector_size: self.sector_size(),
            block_count: self.table_entries_count(),
            allocated_blocks,
        }
    }
}
