//! # CloneVault Vaults
//!
//! Container format engines for block-cloning conversion.
//!
//! This crate provides implementations of the supported disk image containers:
//! - **RawVault**: Plain sector images with no metadata
//! - **VhdVault**: Microsoft VHD format (Fixed and Dynamic)
//! - **VhdxVault**: Hyper-V VHDX format (Fixed and Dynamic)
//!
//! ## Example
//!
//! ```rust
//! use clonevault_core::{ImageFormat, Vault};
//! use clonevault_pipeline::MemoryFile;
//! use clonevault_vaults::factory::create_vault;
//!
//! let mut vault = create_vault(ImageFormat::Vhdx, MemoryFile::new(4096), 4096).unwrap();
//! vault.construct_header(64 * 1024 * 1024, 0, 512, false).unwrap();
//! vault.write_header().unwrap();
//!
//! println!("Type: {}", vault.format());
//! println!("Size: {} bytes", vault.disk_size());
//! ```

pub mod checksum;
pub mod factory;
pub mod raw;
pub mod vhd;
pub mod vhdx;

pub use factory::{
    create_vault, detect_format_by_data, detect_format_by_extension, open_vault,
    resolve_block_size, supported_formats, DynVault,
};
pub use raw::RawVault;
pub use vhd::VhdVault;
pub use vhdx::VhdxVault;
