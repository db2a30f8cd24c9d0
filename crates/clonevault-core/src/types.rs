//! Core types for block-cloning conversion

use serde::{Deserialize, Serialize};
use std::fmt;

/// Container formats a vault engine exists for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Headerless byte-for-byte disk contents
    Raw,
    /// Classic Microsoft VHD (fixed or dynamic)
    Vhd,
    /// Hyper-V VHDX
    Vhdx,
}

impl ImageFormat {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "RAW",
            ImageFormat::Vhd => "VHD",
            ImageFormat::Vhdx => "VHDX",
        }
    }

    /// Conventional file extension (without the dot)
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "img",
            ImageFormat::Vhd => "vhd",
            ImageFormat::Vhdx => "vhdx",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Summary of an opened vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultInfo {
    /// Container format
    pub format: ImageFormat,

    /// Preallocated (true) or sparse-growable (false)
    pub is_fixed: bool,

    /// Virtual disk size in bytes
    pub disk_size: u64,

    /// Data block size in bytes
    pub block_size: u32,

    /// Logical sector size in bytes
    pub sector_size: u32,

    /// Number of logical data blocks
    pub block_count: u32,

    /// Number of data blocks with backing storage
    pub allocated_blocks: u64,
}

impl fmt::Display for VaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Format:      {} ({})",
            self.format,
            if self.is_fixed { "fixed" } else { "dynamic" }
        )?;
        writeln!(
            f,
            "Disk size:   {} ({} bytes)",
            format_size(self.disk_size),
            self.disk_size
        )?;
        writeln!(f, "Block size:  {}", format_size(self.block_size as u64))?;
        writeln!(f, "Sector size: {} bytes", self.sector_size)?;
        write!(
            f,
            "Blocks:      {} of {} allocated",
            self.allocated_blocks, self.block_count
        )
    }
}

/// Format size in human-readable format
pub fn format_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = size as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1.00 KiB");
        assert_eq!(format_size(2 * 1024 * 1024), "2.00 MiB");
        assert_eq!(format_size(1536 * 1024), "1.50 MiB");
    }

    #[test]
    fn test_image_format_names() {
        assert_eq!(ImageFormat::Vhdx.to_string(), "VHDX");
        assert_eq!(ImageFormat::Vhd.extension(), "vhd");
        assert_eq!(ImageFormat::Raw.extension(), "img");
    }

    #[test]
    fn test_vault_info_display() {
        let info = VaultInfo {
            format: ImageFormat::Vhd,
            is_fixed: false,
            disk_size: 10 * 1024 * 1024,
            block_size: 2 * 1024 * 1024,
            sector_size: 512,
            block_count: 5,
            allocated_blocks: 3,
        };
        let text = info.to_string();
        assert!(text.contains("VHD (dynamic)"));
        assert!(text.contains("10.00 MiB"));
        assert!(text.contains("3 of 5 allocated"));
    }
}
