//! In-memory image file
//!
//! Emulates a reflink-capable volume: clones copy bytes but keep the same
//! alignment rules and reference accounting as the host implementation, so
//! vault engines and the conversion driver can run without a btrfs or XFS
//! mount.

use clonevault_core::{geometry::u64_to_usize, Error, ImageFile, Result};
use std::collections::HashMap;

/// An image file held entirely in memory
#[derive(Debug, Clone)]
pub struct MemoryFile {
    data: Vec<u8>,
    cluster_size: u32,
    block_cloning: bool,
    sparse: bool,
    reference_limit: Option<u32>,
    references: HashMap<u64, u32>,
    clone_count: u64,
    cloned_bytes: u64,
}

impl MemoryFile {
    /// Create an empty file on an emulated volume with the given cluster size
    pub fn new(cluster_size: u32) -> Self {
        Self::from_bytes(Vec::new(), cluster_size)
    }

    /// Create a file holding `data`
    pub fn from_bytes(data: Vec<u8>, cluster_size: u32) -> Self {
        Self {
            data,
            cluster_size,
            block_cloning: true,
            sparse: false,
            reference_limit: None,
            references: HashMap::new(),
            clone_count: 0,
            cloned_bytes: 0,
        }
    }

    /// Pretend the volume cannot share extents
    pub fn without_block_cloning(mut self) -> Self {
        self.block_cloning = false;
        self
    }

    /// Limit how often one source extent may be cloned within this file
    pub fn with_reference_limit(mut self, limit: u32) -> Self {
        self.reference_limit = Some(limit);
        self
    }

    /// Mark the file as sparse
    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    /// Contents of the file
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the file and return its contents
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of clone operations performed into this file
    pub fn clone_count(&self) -> u64 {
        self.clone_count
    }

    /// Total bytes shared into this file by clone operations
    pub fn cloned_bytes(&self) -> u64 {
        self.cloned_bytes
    }

    fn check_clone(&self, src_offset: u64, dst_offset: u64, len: u64, source_len: u64) -> Result<()> {
        if !self.block_cloning {
            return Err(Error::CloneUnsupported(
                "Volume does not support block cloning".to_string(),
            ));
        }

        let cluster = self.cluster_size as u64;
        if src_offset % cluster != 0 || dst_offset % cluster != 0 || len % cluster != 0 {
            return Err(Error::misaligned(format!(
                "Clone of {} bytes from {:#x} to {:#x} is not aligned to {} byte clusters",
                len, src_offset, dst_offset, cluster
            )));
        }

        if src_offset + len > source_len {
            return Err(Error::invalid_operation(format!(
                "Clone source range {:#x}+{:#x} extends past end of file ({:#x})",
                src_offset, len, source_len
            )));
        }
        Ok(())
    }

    fn place(&mut self, bytes: &[u8], dst_offset: u64) -> Result<()> {
        let start = u64_to_usize(dst_offset, "Memory file offset")?;
        let end = start + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn range(&self, offset: u64, len: u64) -> Result<std::ops::Range<usize>> {
        let start = u64_to_usize(offset, "Memory file offset")?;
        let len = u64_to_usize(len, "Memory file length")?;
        Ok(start..start + len)
    }
}

impl ImageFile for MemoryFile {
    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_size(&mut self, size: u64) -> Result<()> {
        let size = u64_to_usize(size, "Memory file size")?;
        self.data.resize(size, 0);
        Ok(())
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if self.read_at(buf, offset)? != buf.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            )));
        }
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let start = u64_to_usize(offset, "Memory file offset")?;
        if start >= self.data.len() {
            return Ok(0);
        }
        let available = (self.data.len() - start).min(buf.len());
        buf[..available].copy_from_slice(&self.data[start..start + available]);
        Ok(available)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.place(buf, offset)
    }

    fn clone_range_from(
        &mut self,
        source: &Self,
        src_offset: u64,
        dst_offset: u64,
        len: u64,
    ) -> Result<()> {
        self.check_clone(src_offset, dst_offset, len, source.data.len() as u64)?;
        let range = source.range(src_offset, len)?;
        self.place(&source.data[range], dst_offset)?;
        self.clone_count += 1;
        self.cloned_bytes += len;
        Ok(())
    }

    fn clone_range_within(&mut self, src_offset: u64, dst_offset: u64, len: u64) -> Result<()> {
        self.check_clone(src_offset, dst_offset, len, self.data.len() as u64)?;

        if let Some(limit) = self.reference_limit {
            let refs = self.references.entry(src_offset).or_insert(1);
            if *refs >= limit {
                return Err(Error::CloneContention(format!(
                    "Extent at {:#x} already has {} references",
                    src_offset, refs
                )));
            }
            *refs += 1;
        }

        let range = self.range(src_offset, len)?;
        let bytes = self.data[range].to_vec();
        self.place(&bytes, dst_offset)?;
        self.clone_count += 1;
        self.cloned_bytes += len;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn cluster_size(&self) -> Result<u32> {
        Ok(self.cluster_size)
    }

    fn supports_block_cloning(&self) -> Result<bool> {
        Ok(self.block_cloning)
    }

    fn is_sparse(&self) -> Result<bool> {
        Ok(self.sparse)
    }

    fn set_sparse(&mut self, sparse: bool) -> Result<()> {
        self.sparse = sparse;
        Ok(())
    }
}
