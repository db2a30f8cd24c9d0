//! End-to-end conversions through in-memory files

use clonevault_convert::{ConvertError, ConvertOptions, ConvertProgress, Converter};
use clonevault_core::{Error, ImageFile, ImageFormat, Vault};
use clonevault_pipeline::MemoryFile;
use clonevault_vaults::vhd::types::{BlockAllocationTable, VhdDynamicHeader, VhdFooter, VhdType};
use clonevault_vaults::vhd::{VHD_BAT_OFFSET, VHD_DYNAMIC_HEADER_OFFSET};
use clonevault_vaults::{detect_format_by_data, open_vault, DynVault, VhdVault, VhdxVault};
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const CLUSTER: u32 = 4096;
const MIB: u64 = 1024 * 1024;

/// Recognizable contents for block `index`
fn pattern(index: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (index as usize * 31 + i / 4096) as u8)
        .collect()
}

fn dynamic_vhd(disk_size: u64, block_size: u32, blocks: &[u32]) -> Vec<u8> {
    let mut vault = VhdVault::attach(MemoryFile::new(CLUSTER), CLUSTER).unwrap();
    vault.construct_header(disk_size, block_size, 512, false).unwrap();
    for &index in blocks {
        let offset = vault.allocate_block(index).unwrap();
        vault
            .file_mut()
            .write_all_at(&pattern(index, block_size as usize), offset)
            .unwrap();
    }
    vault.write_header().unwrap();
    Box::new(vault).into_file().into_bytes()
}

fn fixed_vhd(disk_size: u64) -> Vec<u8> {
    let mut vault = VhdVault::attach(MemoryFile::new(CLUSTER), CLUSTER).unwrap();
    vault.construct_header(disk_size, 0, 512, true).unwrap();
    vault
        .file_mut()
        .write_all_at(&pattern(9, disk_size as usize), 0)
        .unwrap();
    vault.write_header().unwrap();
    Box::new(vault).into_file().into_bytes()
}

fn dynamic_vhdx(disk_size: u64, block_size: u32, blocks: &[u32]) -> Vec<u8> {
    let mut vault = VhdxVault::attach(MemoryFile::new(CLUSTER), CLUSTER).unwrap();
    vault.construct_header(disk_size, block_size, 512, false).unwrap();
    for &index in blocks {
        let offset = vault.allocate_block(index).unwrap();
        vault
            .file_mut()
            .write_all_at(&pattern(index, block_size as usize), offset)
            .unwrap();
    }
    vault.write_header().unwrap();
    Box::new(vault).into_file().into_bytes()
}

fn open(bytes: Vec<u8>) -> DynVault<MemoryFile> {
    open_vault(MemoryFile::from_bytes(bytes, CLUSTER), CLUSTER).unwrap()
}

/// Flatten an image into the bytes a guest would see
fn virtual_disk(vault: &dyn Vault<File = MemoryFile>) -> Vec<u8> {
    let block_size = vault.block_size() as u64;
    let disk_size = vault.disk_size();
    let mut disk = vec![0u8; disk_size as usize];
    for index in 0..vault.table_entries_count() {
        if let Some(offset) = vault.probe_block(index) {
            let start = index as u64 * block_size;
            let len = block_size.min(disk_size - start) as usize;
            let start = start as usize;
            vault
                .file()
                .read_exact_at(&mut disk[start..start + len], offset)
                .unwrap();
        }
    }
    disk
}

fn convert(
    source: &DynVault<MemoryFile>,
    format: ImageFormat,
    options: ConvertOptions,
) -> clonevault_convert::Result<DynVault<MemoryFile>> {
    let (destination, _) = Converter::with_options(options)
        .convert(&**source, format, || Ok(MemoryFile::new(CLUSTER)))?;
    Ok(open(destination.into_file().into_bytes()))
}

#[test]
fn test_dynamic_vhd_to_vhdx_splits_blocks() {
    let source = open(dynamic_vhd(10 * MIB, 2 * MIB as u32, &[0, 2, 4]));
    assert_eq!(source.info().allocated_blocks, 3);

    let options = ConvertOptions {
        block_size: Some(MIB as u32),
        ..Default::default()
    };
    let destination = convert(&source, ImageFormat::Vhdx, options).unwrap();

    assert_eq!(destination.format(), ImageFormat::Vhdx);
    assert_eq!(destination.disk_size(), 10 * MIB);
    assert!(!destination.is_fixed());
    let present: Vec<u32> = (0..destination.table_entries_count())
        .filter(|&i| destination.probe_block(i).is_some())
        .collect();
    assert_eq!(present, vec![0, 1, 4, 5, 8, 9]);
    assert_eq!(virtual_disk(&*destination), virtual_disk(&*source));
}

#[test]
fn test_fixed_vhd_to_fixed_vhdx() {
    let source = open(fixed_vhd(16 * MIB));
    assert!(source.is_fixed());

    let destination = convert(&source, ImageFormat::Vhdx, ConvertOptions::default()).unwrap();
    assert!(destination.is_fixed());
    assert!((0..destination.table_entries_count()).all(|i| destination.probe_block(i).is_some()));
    assert_eq!(virtual_disk(&*destination), virtual_disk(&*source));

    let options = ConvertOptions {
        block_size: Some(MIB as u32),
        ..Default::default()
    };
    let destination = convert(&source, ImageFormat::Vhdx, options).unwrap();
    assert_eq!(destination.table_entries_count(), 16);
    assert_eq!(destination.info().allocated_blocks, 16);
    assert_eq!(virtual_disk(&*destination), virtual_disk(&*source));
}

#[test]
fn test_misaligned_source_fails_before_destination_exists() {
    // Blocks packed on 512-byte sectors, as older tools write them
    let block_size = MIB as u32;
    let footer = VhdFooter::new(4 * MIB, VhdType::Dynamic, VHD_DYNAMIC_HEADER_OFFSET).to_bytes();
    let header = VhdDynamicHeader::new(VHD_BAT_OFFSET, 4, block_size).to_bytes();
    let mut bat = BlockAllocationTable::unused(4);
    bat.set(1, ((VHD_BAT_OFFSET as usize + bat.to_bytes().len()) / 512) as u32);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&footer);
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&bat.to_bytes());
    bytes.extend_from_slice(&[0xFFu8; 512]);
    bytes.extend_from_slice(&pattern(1, block_size as usize));
    bytes.extend_from_slice(&footer);

    let source = open(bytes);
    let created = Cell::new(false);
    let result = Converter::new().convert(&*source, ImageFormat::Vhdx, || {
        created.set(true);
        Ok(MemoryFile::new(CLUSTER))
    });

    assert!(matches!(result, Err(ConvertError::Image(Error::Misaligned(_)))));
    assert!(!created.get());
}

#[test]
fn test_detect_by_data_without_extension_hints() {
    let vhdx = MemoryFile::from_bytes(dynamic_vhdx(16 * MIB, MIB as u32, &[]), CLUSTER);
    let vhd = MemoryFile::from_bytes(dynamic_vhd(8 * MIB, 2 * MIB as u32, &[1]), CLUSTER);
    let raw = MemoryFile::from_bytes(pattern(3, 4 * MIB as usize), CLUSTER);

    assert_eq!(detect_format_by_data(&vhdx).unwrap(), ImageFormat::Vhdx);
    assert_eq!(detect_format_by_data(&vhd).unwrap(), ImageFormat::Vhd);
    assert_eq!(detect_format_by_data(&raw).unwrap(), ImageFormat::Raw);
}

#[test]
fn test_vhdx_to_vhd_merges_blocks() {
    let source = open(dynamic_vhdx(8 * MIB, MIB as u32, &[1, 6]));
    let options = ConvertOptions {
        block_size: Some(2 * MIB as u32),
        ..Default::default()
    };
    let destination = convert(&source, ImageFormat::Vhd, options).unwrap();

    assert_eq!(destination.block_size(), 2 * MIB as u32);
    let present: Vec<u32> = (0..destination.table_entries_count())
        .filter(|&i| destination.probe_block(i).is_some())
        .collect();
    assert_eq!(present, vec![0, 3]);
    assert_eq!(virtual_disk(&*destination), virtual_disk(&*source));
}

#[test]
fn test_raw_to_dynamic_vhdx_and_back() {
    let source = open(pattern(5, 4 * MIB as usize));
    assert_eq!(source.format(), ImageFormat::Raw);

    let options = ConvertOptions {
        block_size: Some(MIB as u32),
        fixed: Some(false),
        sparse: None,
    };
    let vhdx = convert(&source, ImageFormat::Vhdx, options).unwrap();
    assert!(!vhdx.is_fixed());
    assert_eq!(vhdx.info().allocated_blocks, 4);

    let raw = convert(&vhdx, ImageFormat::Raw, ConvertOptions::default()).unwrap();
    assert_eq!(raw.file().bytes(), source.file().bytes());
}

#[test]
fn test_volume_without_block_cloning_is_rejected() {
    let file = MemoryFile::from_bytes(fixed_vhd(4 * MIB), CLUSTER).without_block_cloning();
    let source = open_vault(file, CLUSTER).unwrap();

    let result = Converter::new().convert(&*source, ImageFormat::Vhdx, || {
        Ok(MemoryFile::new(CLUSTER).without_block_cloning())
    });
    assert!(matches!(result, Err(ConvertError::Image(Error::CloneUnsupported(_)))));
}

#[test]
fn test_block_size_must_be_power_of_two() {
    let source = open(fixed_vhd(4 * MIB));
    let options = ConvertOptions {
        block_size: Some(3 * MIB as u32),
        ..Default::default()
    };
    let created = Cell::new(false);
    let result = Converter::with_options(options).convert(&*source, ImageFormat::Vhdx, || {
        created.set(true);
        Ok(MemoryFile::new(CLUSTER))
    });
    assert!(matches!(result, Err(ConvertError::Image(Error::InvalidParameter(_)))));
    assert!(!created.get());
}

/// Run a conversion, recording whether the destination file was created
fn convert_tracking_creation(
    source: &DynVault<MemoryFile>,
    format: ImageFormat,
    options: ConvertOptions,
) -> (clonevault_convert::Result<()>, bool) {
    let created = Cell::new(false);
    let result = Converter::with_options(options)
        .convert(&**source, format, || {
            created.set(true);
            Ok(MemoryFile::new(CLUSTER))
        })
        .map(|_| ());
    (result, created.get())
}

#[test]
fn test_block_size_below_cluster_fails_before_destination_exists() {
    let source = open(pattern(2, 4 * MIB as usize));
    for block_size in [1024, 2048] {
        let options = ConvertOptions {
            block_size: Some(block_size),
            fixed: Some(false),
            sparse: None,
        };
        let (result, created) = convert_tracking_creation(&source, ImageFormat::Vhd, options);
        assert!(matches!(result, Err(ConvertError::Image(Error::Misaligned(_)))));
        assert!(!created);
    }
}

#[test]
fn test_fixed_vhd_tail_off_cluster_fails_before_destination_exists() {
    let source = open(fixed_vhd(3 * MIB + 512));
    assert!(source.is_fixed());

    let (result, created) =
        convert_tracking_creation(&source, ImageFormat::Vhdx, ConvertOptions::default());
    assert!(matches!(result, Err(ConvertError::Image(Error::Misaligned(_)))));
    assert!(!created);
}

#[test]
fn test_destination_block_size_checked_before_destination_exists() {
    let source = open(dynamic_vhd(8 * MIB, 2 * MIB as u32, &[1]));
    let options = ConvertOptions {
        block_size: Some(512 * 1024),
        ..Default::default()
    };
    let (result, created) = convert_tracking_creation(&source, ImageFormat::Vhdx, options);
    assert!(matches!(result, Err(ConvertError::Image(Error::InvalidParameter(_)))));
    assert!(!created);
}

#[test]
fn test_sparse_setting_follows_source_unless_overridden() {
    let bytes = dynamic_vhd(8 * MIB, 2 * MIB as u32, &[0]);
    let file = MemoryFile::from_bytes(bytes, CLUSTER).with_sparse(true);
    let source = open_vault(file, CLUSTER).unwrap();

    let (destination, report) = Converter::new()
        .convert(&*source, ImageFormat::Vhdx, || Ok(MemoryFile::new(CLUSTER)))
        .unwrap();
    assert!(report.sparse);
    assert!(destination.file().is_sparse().unwrap());

    let options = ConvertOptions {
        sparse: Some(false),
        ..Default::default()
    };
    let (destination, report) = Converter::with_options(options)
        .convert(&*source, ImageFormat::Vhdx, || Ok(MemoryFile::new(CLUSTER)))
        .unwrap();
    assert!(!report.sparse);
    assert!(!destination.file().is_sparse().unwrap());
}

#[test]
fn test_progress_and_report() {
    let source = open(dynamic_vhd(10 * MIB, 2 * MIB as u32, &[1, 3]));
    let calls = Arc::new(AtomicU32::new(0));
    let last_percent = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let percent = last_percent.clone();
    let converter = Converter::new().with_progress(Arc::new(move |progress: &ConvertProgress| {
        counter.fetch_add(1, Ordering::SeqCst);
        percent.store(progress.percent_complete as u32, Ordering::SeqCst);
    }));

    let (destination, report) = converter
        .convert(&*source, ImageFormat::Vhdx, || Ok(MemoryFile::new(CLUSTER)))
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(last_percent.load(Ordering::SeqCst), 100);
    assert_eq!(report.source_format, ImageFormat::Vhd);
    assert_eq!(report.destination_format, ImageFormat::Vhdx);
    assert_eq!(report.blocks_cloned, 2);
    assert_eq!(report.clone_operations, 2);
    assert_eq!(report.bytes_cloned, 4 * MIB);
    assert_eq!(report.destination_block_size, 32 * MIB as u32);
    assert_eq!(destination.file().cloned_bytes(), 4 * MIB);
}
