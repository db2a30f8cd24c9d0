//! Disk image conversion by block cloning
//!
//! Provides functionality for:
//! - Converting between RAW, VHD and VHDX images without copying payload
//! - Mapping blocks across differing source and destination block sizes
//! - Progress tracking during conversion
//!
//! ## Example
//!
//! ```rust,no_run
//! use clonevault_convert::{default_destination, ConvertOptions, Converter};
//! use std::path::Path;
//!
//! let source = Path::new("disk.vhd");
//! let destination = default_destination(source).unwrap();
//! let options = ConvertOptions {
//!     block_size: Some(1024 * 1024),
//!     ..Default::default()
//! };
//! let report = Converter::with_options(options)
//!     .convert_file(source, &destination)
//!     .unwrap();
//! println!("{} bytes cloned", report.bytes_cloned);
//! ```

pub mod driver;
pub mod error;
pub mod progress;

pub use driver::{default_destination, ConvertOptions, ConvertReport, Converter};
pub use error::{ConvertError, Result};
pub use progress::{ConvertProgress, ProgressCallback};
