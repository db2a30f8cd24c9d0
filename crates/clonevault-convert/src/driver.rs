//! Block-cloning conversion driver
//!
//! Walks the allocated blocks of a source image and shares each one into
//! the destination image, so no payload bytes pass through this process.

use crate::error::{ConvertError, Result};
use crate::progress::{ConvertProgress, ProgressCallback};
use clonevault_core::{
    geometry::{is_power_of_two, round_up},
    Error, ImageFile, ImageFormat, Vault,
};
use clonevault_vaults::{create_vault, resolve_block_size, DynVault};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Options for conversion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertOptions {
    /// Destination block size in bytes (None = format default)
    pub block_size: Option<u32>,
    /// Preallocate the destination (None = same as the source)
    pub fixed: Option<bool>,
    /// Leave holes in the destination file (None = same as the source file)
    pub sparse: Option<bool>,
}

/// Result of a conversion
#[derive(Debug, Clone, Serialize)]
pub struct ConvertReport {
    pub source_format: ImageFormat,
    pub destination_format: ImageFormat,
    pub disk_size: u64,
    pub source_block_size: u32,
    pub destination_block_size: u32,
    pub is_fixed: bool,
    pub sparse: bool,
    /// Source blocks that were present and shared
    pub blocks_cloned: u32,
    /// Clone calls issued against the destination
    pub clone_operations: u64,
    pub bytes_cloned: u64,
    pub elapsed: Duration,
}

/// Derive a destination path by swapping `.vhd` and `.vhdx`
pub fn default_destination(source: &Path) -> Result<PathBuf> {
    let extension = source
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match extension.as_deref() {
        Some("vhd") => Ok(source.with_extension(ImageFormat::Vhdx.extension())),
        Some("vhdx") => Ok(source.with_extension(ImageFormat::Vhd.extension())),
        _ => Err(ConvertError::NoDefaultDestination(
            source.display().to_string(),
        )),
    }
}

fn check_extent(src_offset: u64, dst_offset: u64, len: u64, alignment: u32) -> Result<()> {
    let cluster = alignment as u64;
    if src_offset % cluster != 0 || dst_offset % cluster != 0 || len % cluster != 0 {
        return Err(ConvertError::UnalignedExtent {
            src_offset,
            dst_offset,
            len,
            alignment,
        });
    }
    Ok(())
}

fn check_block_sizes(src_block_size: u32, dst_block_size: u32) -> Result<()> {
    let smaller = src_block_size.min(dst_block_size);
    let larger = src_block_size.max(dst_block_size);
    if smaller == 0 || larger % smaller != 0 {
        return Err(ConvertError::IncompatibleBlockSizes {
            src_block_size,
            dst_block_size,
        });
    }
    Ok(())
}

/// Image converter
pub struct Converter {
    options: ConvertOptions,
    progress: Option<ProgressCallback>,
}

impl Converter {
    /// Create a new converter with default options
    pub fn new() -> Self {
        Self::with_options(ConvertOptions::default())
    }

    /// Create with custom options
    pub fn with_options(options: ConvertOptions) -> Self {
        Self {
            options,
            progress: None,
        }
    }

    /// Report progress through `callback` once per source block
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }

    /// Convert an opened source image into a new destination image
    ///
    /// The source, the requested block size and the destination block size
    /// are all validated before `create_destination` is called, so a rejected
    /// conversion never leaves a destination file behind. The returned
    /// destination has its header written and flushed.
    pub fn convert<S, C>(
        &self,
        source: &S,
        destination_format: ImageFormat,
        create_destination: C,
    ) -> Result<(DynVault<S::File>, ConvertReport)>
    where
        S: Vault + ?Sized,
        S::File: 'static,
        C: FnOnce() -> Result<S::File>,
    {
        let start_time = Instant::now();

        if !source.file().supports_block_cloning()? {
            return Err(Error::CloneUnsupported(
                "Source volume does not support block cloning".to_string(),
            )
            .into());
        }
        source.check_convertible()?;

        let alignment = source.require_alignment();
        let disk_size = source.disk_size();
        let is_fixed = self.options.fixed.unwrap_or_else(|| source.is_fixed());
        let sparse = match self.options.sparse {
            Some(sparse) => sparse,
            None => source.file().is_sparse()?,
        };

        let requested_block_size = self.options.block_size.unwrap_or(0);
        if let Some(block_size) = self.options.block_size {
            if !is_power_of_two(block_size as u64) {
                return Err(Error::invalid_parameter(format!(
                    "Block size {} is not a power of two",
                    block_size
                ))
                .into());
            }
            if block_size < alignment {
                return Err(Error::misaligned(format!(
                    "Block size {} is smaller than the {} byte cluster size",
                    block_size, alignment
                ))
                .into());
            }
        }
        let src_block_size = source.block_size();
        let dst_block_size = resolve_block_size(
            destination_format,
            disk_size,
            requested_block_size,
            is_fixed,
            alignment,
        )?;
        check_block_sizes(src_block_size, dst_block_size)?;

        tracing::info!(
            source_format = %source.format(),
            destination_format = %destination_format,
            disk_size,
            alignment,
            src_block_size,
            dst_block_size,
            is_fixed,
            sparse,
            "starting conversion"
        );

        let mut destination = create_vault(destination_format, create_destination()?, alignment)?;
        if sparse {
            destination.file_mut().set_sparse(true)?;
        }
        destination.construct_header(disk_size, requested_block_size, source.sector_size(), is_fixed)?;
        debug_assert_eq!(destination.block_size(), dst_block_size);

        let extent = src_block_size.min(dst_block_size) as u64;
        let blocks_total = source.table_entries_count();
        let mut blocks_cloned = 0u32;
        let mut clone_operations = 0u64;
        let mut bytes_cloned = 0u64;

        for index in 0..blocks_total {
            if let Some(callback) = &self.progress {
                callback(&ConvertProgress::calculate(
                    blocks_total,
                    index,
                    bytes_cloned,
                    start_time,
                    "Cloning",
                ));
            }

            let Some(src_block) = source.probe_block(index) else {
                continue;
            };
            let virtual_address = index as u64 * src_block_size as u64;

            let mut offset = 0u64;
            while offset < src_block_size as u64 {
                let address = virtual_address + offset;
                if address >= disk_size {
                    break;
                }

                let dst_index = u32::try_from(address / dst_block_size as u64)
                    .map_err(|_| Error::overflow("Destination block index exceeds 32 bits"))?;
                let dst_offset =
                    destination.allocate_block(dst_index)? + address % dst_block_size as u64;
                let src_offset = src_block + offset;
                let len = extent.min(round_up(disk_size - address, alignment as u64));

                check_extent(src_offset, dst_offset, len, alignment)?;
                destination
                    .file_mut()
                    .clone_range_from(source.file(), src_offset, dst_offset, len)?;
                tracing::trace!(index, dst_index, src_offset, dst_offset, len, "cloned extent");

                clone_operations += 1;
                bytes_cloned += len;
                offset += extent;
            }
            blocks_cloned += 1;
        }

        destination.write_header()?;
        if !sparse {
            destination.file_mut().set_sparse(false)?;
        }

        if let Some(callback) = &self.progress {
            callback(&ConvertProgress::calculate(
                blocks_total,
                blocks_total,
                bytes_cloned,
                start_time,
                "Cloning",
            ));
        }

        let report = ConvertReport {
            source_format: source.format(),
            destination_format,
            disk_size,
            source_block_size: src_block_size,
            destination_block_size: dst_block_size,
            is_fixed,
            sparse,
            blocks_cloned,
            clone_operations,
            bytes_cloned,
            elapsed: start_time.elapsed(),
        };

        tracing::info!(
            blocks_cloned,
            clone_operations,
            bytes_cloned,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "conversion finished"
        );
        Ok((destination, report))
    }

    /// Convert the image at `source` into a new file at `destination`
    ///
    /// The destination format follows the destination extension. The new
    /// image is built in a temporary file next to `destination` and only
    /// moved into place once its header is written, so a failed conversion
    /// leaves nothing behind.
    #[cfg(target_os = "linux")]
    pub fn convert_file(&self, source: &Path, destination: &Path) -> Result<ConvertReport> {
        use clonevault_pipeline::HostFile;
        use clonevault_vaults::{detect_format_by_extension, open_vault};

        let source_file = HostFile::open(source)?;
        if !source_file.supports_block_cloning()? {
            return Err(Error::CloneUnsupported(format!(
                "{} is not on a volume that supports block cloning",
                source.display()
            ))
            .into());
        }
        let alignment = source_file.cluster_size()?;

        if destination.exists() {
            return Err(ConvertError::DestinationExists(
                destination.display().to_string(),
            ));
        }

        let source_vault = open_vault(source_file, alignment)?;
        let destination_format = detect_format_by_extension(destination);
        let directory = destination
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut staged = None;
        let (destination_vault, report) =
            self.convert(&*source_vault, destination_format, || {
                let temp = tempfile::Builder::new()
                    .prefix(".clonevault-")
                    .tempfile_in(directory)?;
                let file = HostFile::from_file(temp.as_file().try_clone()?, temp.path());
                staged = Some(temp);
                Ok(file)
            })?;
        drop(destination_vault);

        let temp = staged.ok_or_else(|| {
            Error::invalid_operation("Destination file was never created")
        })?;
        temp.persist_noclobber(destination).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                ConvertError::DestinationExists(destination.display().to_string())
            } else {
                ConvertError::IoError(e.error)
            }
        })?;

        tracing::info!(destination = %destination.display(), "destination committed");
        Ok(report)
    }
}

impl Default for Converter {
    fn default() -> Self {
        Self::new()
    }
}
