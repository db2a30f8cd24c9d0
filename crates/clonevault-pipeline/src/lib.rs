//! # CloneVault Pipeline
//!
//! Host file services the vault engines read, write and clone through.
//!
//! - **HostFile**: A file on a Linux reflink-capable volume
//! - **MemoryFile**: An in-memory file emulating block cloning
//!
//! ## Example
//!
//! ```rust,no_run
//! use clonevault_core::ImageFile;
//! use clonevault_pipeline::HostFile;
//! use std::path::Path;
//!
//! let file = HostFile::open(Path::new("disk.vhd")).unwrap();
//! if file.supports_block_cloning().unwrap() {
//!     println!("cluster size: {}", file.cluster_size().unwrap());
//! }
//! ```

#[cfg(target_os = "linux")]
pub mod host;
pub mod memory;

#[cfg(target_os = "linux")]
pub use host::HostFile;
pub use memory::MemoryFile;
