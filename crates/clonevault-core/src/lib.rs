//! # CloneVault Core
//!
//! Core traits, types, and error handling for converting disk images by
//! block cloning instead of copying.
//!
//! This crate provides the foundational abstractions:
//! - **Vaults**: Container formats (RAW, VHD, VHDX) addressed in blocks
//! - **ImageFile**: The host file service a vault reads and clones through
//! - **Geometry**: Alignment arithmetic and CHS calculation
//!
//! ## Terminology
//!
//! - **Vault** = Container format
//! - **Block** = Unit of allocation in a vault's block allocation table
//! - **Alignment** = The volume's cluster size; every cloned extent honors it
//! - **Factory** = Format detection by content or extension
//!
//! ## Example
//!
//! ```rust,no_run
//! use clonevault_core::{Result, Vault};
//!
//! fn allocated<V: Vault>(vault: &V) -> Result<u32> {
//!     Ok((0..vault.table_entries_count())
//!         .filter(|&i| vault.probe_block(i).is_some())
//!         .count() as u32)
//! }
//! ```

pub mod error;
pub mod geometry;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use error::{Error, Result};
pub use geometry::*;
pub use traits::{ImageFile, Vault};
pub use types::{format_size, ImageFormat, VaultInfo};
