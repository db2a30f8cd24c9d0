//! CloneVault CLI - block-cloning disk image converter
//!
//! Converts between RAW, VHD and VHDX images on reflink-capable volumes and
//! reports what an image contains.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clonevault")]
#[command(about = "Convert VHD, VHDX and RAW disk images by block cloning")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log debug events to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Convert an image without copying its data
    Convert {
        /// Preallocate every destination block
        #[arg(long, conflicts_with = "dynamic")]
        fixed: bool,

        /// Allocate destination blocks only where the source has data
        #[arg(long)]
        dynamic: bool,

        /// Destination block size in MiB
        #[arg(short = 'b', long = "block-size", value_name = "MIB")]
        block_size: Option<u32>,

        /// Leave holes in the destination file
        #[arg(long, conflicts_with = "nosparse")]
        sparse: bool,

        /// Back every byte of the destination file with storage
        #[arg(long)]
        nosparse: bool,

        /// Source image
        source: PathBuf,

        /// Destination image (default: swap .vhd and .vhdx)
        destination: Option<PathBuf>,
    },

    /// Display image information
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,

        /// Image to inspect
        image: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// Tri-state flag pair: `Some(true)`, `Some(false)` or unset
fn flag_pair(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

#[cfg(target_os = "linux")]
fn run(command: Command) -> Result<()> {
    match command {
        Command::Convert {
            fixed,
            dynamic,
            block_size,
            sparse,
            nosparse,
            source,
            destination,
        } => cmd_convert(
            flag_pair(fixed, dynamic),
            block_size,
            flag_pair(sparse, nosparse),
            source,
            destination,
        ),
        Command::Info { json, image } => cmd_info(&image, json),
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_command: Command) -> Result<()> {
    anyhow::bail!("clonevault needs a Linux volume with reflink support")
}

#[cfg(target_os = "linux")]
fn cmd_convert(
    fixed: Option<bool>,
    block_size_mib: Option<u32>,
    sparse: Option<bool>,
    source: PathBuf,
    destination: Option<PathBuf>,
) -> Result<()> {
    use anyhow::Context;
    use clonevault_convert::{
        default_destination, progress::format_duration, ConvertOptions, ConvertProgress, Converter,
    };
    use clonevault_core::format_size;
    use std::io::Write;
    use std::sync::Arc;

    let block_size = match block_size_mib {
        Some(mib) => Some(
            mib.checked_mul(1024 * 1024)
                .with_context(|| format!("Block size of {} MiB is too large", mib))?,
        ),
        None => None,
    };
    let destination = match destination {
        Some(path) => path,
        None => default_destination(&source)?,
    };

    let options = ConvertOptions {
        block_size,
        fixed,
        sparse,
    };
    let converter = Converter::with_options(options).with_progress(Arc::new(
        |progress: &ConvertProgress| {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "\r{}", progress.format());
            let _ = stderr.flush();
        },
    ));
    tracing::debug!(
        options = ?converter.options(),
        destination = %destination.display(),
        "conversion options"
    );

    let result = converter.convert_file(&source, &destination);
    eprintln!();
    let report = result.with_context(|| {
        format!(
            "Failed to convert {} to {}",
            source.display(),
            destination.display()
        )
    })?;

    println!("=== Conversion Complete ===");
    println!("Source:      {} ({})", source.display(), report.source_format);
    println!("Destination: {} ({})", destination.display(), report.destination_format);
    println!(
        "Disk size:   {} ({} bytes)",
        format_size(report.disk_size),
        report.disk_size
    );
    println!(
        "Block size:  {} -> {}",
        format_size(report.source_block_size as u64),
        format_size(report.destination_block_size as u64)
    );
    println!(
        "Layout:      {}{}",
        if report.is_fixed { "fixed" } else { "dynamic" },
        if report.sparse { ", sparse file" } else { "" }
    );
    println!(
        "Cloned:      {} blocks in {} extents ({})",
        report.blocks_cloned,
        report.clone_operations,
        format_size(report.bytes_cloned)
    );
    println!("Elapsed:     {}", format_duration(report.elapsed));

    Ok(())
}

#[cfg(target_os = "linux")]
fn cmd_info(image: &std::path::Path, json: bool) -> Result<()> {
    use anyhow::Context;
    use clonevault_core::{ImageFile, Vault};
    use clonevault_pipeline::HostFile;
    use clonevault_vaults::open_vault;

    let file = HostFile::open(image).with_context(|| format!("Failed to open {}", image.display()))?;
    let reflink = file.supports_block_cloning()?;
    let alignment = file.cluster_size()?;
    let vault = open_vault(file, alignment)
        .with_context(|| format!("Failed to read {}", image.display()))?;
    let info = vault.info();

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("=== Vault Information ===");
    println!("Path:        {}", image.display());
    println!("{}", info);
    println!();
    println!("=== Block Cloning ===");
    println!("Cluster:     {} bytes", alignment);
    println!("Reflink:     {}", if reflink { "supported" } else { "not supported" });
    match vault.check_convertible() {
        Ok(()) => println!("Convertible: yes"),
        Err(e) => println!("Convertible: no ({})", e),
    }

    Ok(())
}
