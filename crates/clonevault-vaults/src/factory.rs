//! Vault factory for automatic format detection
//!
//! Sources are classified by content. Destinations do not exist yet, so
//! their format comes from the file extension.

use crate::{vhd, vhdx, RawVault, VhdVault, VhdxVault};
use clonevault_core::{geometry::natural_block_size, Error, ImageFile, ImageFormat, Result, Vault};
use std::path::Path;

/// Boxed vault bound to file service `F`
pub type DynVault<F> = Box<dyn Vault<File = F>>;

/// Detect the container format from file content
///
/// VHDX and VHD are recognized by their signatures; RAW is the weak fallback
/// for anything made of whole sectors.
pub fn detect_format_by_data<F: ImageFile>(file: &F) -> Result<ImageFormat> {
    if VhdxVault::detect(file)? {
        return Ok(ImageFormat::Vhdx);
    }
    if VhdVault::detect(file)? {
        return Ok(ImageFormat::Vhd);
    }
    if RawVault::detect(file)? {
        return Ok(ImageFormat::Raw);
    }
    Err(Error::invalid_vault("Unrecognized disk image format"))
}

/// Pick the format for a path by its extension
///
/// Anything other than `.vhd` or `.vhdx` is treated as RAW.
pub fn detect_format_by_extension(path: &Path) -> ImageFormat {
    let Some(extension) = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
    else {
        return ImageFormat::Raw;
    };

    supported_formats()
        .into_iter()
        .find(|(_, extensions)| extensions.contains(&extension.as_str()))
        .map(|(format, _)| format)
        .unwrap_or(ImageFormat::Raw)
}

/// Block size an engine of `format` will construct with these parameters
///
/// Mirrors the engines' own `construct_header` choice so a destination can be
/// checked before its file exists. `block_size` 0 selects the format default.
pub fn resolve_block_size(
    format: ImageFormat,
    disk_size: u64,
    block_size: u32,
    is_fixed: bool,
    require_alignment: u32,
) -> Result<u32> {
    match format {
        ImageFormat::Raw => Ok(natural_block_size(disk_size, require_alignment)),
        ImageFormat::Vhd => {
            vhd::resolve_block_size(disk_size, block_size, is_fixed, require_alignment)
        }
        ImageFormat::Vhdx => vhdx::resolve_block_size(block_size, require_alignment),
    }
}

/// Bind an engine of the given format without touching the file
pub fn create_vault<F: ImageFile + 'static>(
    format: ImageFormat,
    file: F,
    require_alignment: u32,
) -> Result<DynVault<F>> {
    let vault: DynVault<F> = match format {
        ImageFormat::Raw => Box::new(RawVault::attach(file, require_alignment)?),
        ImageFormat::Vhd => Box::new(VhdVault::attach(file, require_alignment)?),
        ImageFormat::Vhdx => Box::new(VhdxVault::attach(file, require_alignment)?),
    };
    Ok(vault)
}

/// Open an existing image with automatic detection
///
/// Detects the format, binds the engine and reads its header.
///
/// # Example
///
/// ```rust
/// use clonevault_core::Vault;
/// use clonevault_pipeline::MemoryFile;
/// use clonevault_vaults::factory::open_vault;
///
/// let file = MemoryFile::from_bytes(vec![0u8; 4 * 1024 * 1024], 4096);
/// let vault = open_vault(file, 4096).unwrap();
/// println!("{}", vault.info());
/// ```
pub fn open_vault<F: ImageFile + 'static>(file: F, require_alignment: u32) -> Result<DynVault<F>> {
    let format = detect_format_by_data(&file)?;
    tracing::debug!(format = %format, "detected source format");

    let mut vault = create_vault(format, file, require_alignment)?;
    vault.read_header()?;
    Ok(vault)
}

/// Supported formats with the extensions that select them
pub fn supported_formats() -> Vec<(ImageFormat, &'static [&'static str])> {
    vec![
        (ImageFormat::Raw, &["img", "raw", "bin"][..]),
        (ImageFormat::Vhd, &["vhd"][..]),
        (ImageFormat::Vhdx, &["vhdx"][..]),
    ]
}
