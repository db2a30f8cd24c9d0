//! Checksum engines for VHD and VHDX metadata records
//!
//! Both checksums are computed over the exact record with the 4-byte checksum
//! field treated as zero.

/// VHD checksum: one's complement of the byte sum, checksum field excluded
pub fn vhd_checksum(record: &[u8], field_offset: usize) -> u32 {
    let sum = record
        .iter()
        .enumerate()
        .filter(|(i, _)| !(field_offset..field_offset + 4).contains(i))
        .fold(0u32, |sum, (_, &byte)| sum.wrapping_add(byte as u32));
    !sum
}

/// Compare the stored big-endian VHD checksum with a fresh calculation
pub fn vhd_checksum_valid(record: &[u8], field_offset: usize) -> bool {
    let stored = u32::from_be_bytes([
        record[field_offset],
        record[field_offset + 1],
        record[field_offset + 2],
        record[field_offset + 3],
    ]);
    stored == vhd_checksum(record, field_offset)
}

/// Recompute and store the VHD checksum in place
pub fn vhd_checksum_update(record: &mut [u8], field_offset: usize) {
    let checksum = vhd_checksum(record, field_offset);
    record[field_offset..field_offset + 4].copy_from_slice(&checksum.to_be_bytes());
}

/// VHDX checksum: CRC-32C (Castagnoli) with the checksum field zeroed
pub fn crc32c_checksum(record: &[u8], field_offset: usize) -> u32 {
    let crc = crc32c::crc32c(&record[..field_offset]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &record[field_offset + 4..])
}

/// Compare the stored little-endian CRC-32C with a fresh calculation
pub fn crc32c_checksum_valid(record: &[u8], field_offset: usize) -> bool {
    let stored = u32::from_le_bytes([
        record[field_offset],
        record[field_offset + 1],
        record[field_offset + 2],
        record[field_offset + 3],
    ]);
    stored == crc32c_checksum(record, field_offset)
}

/// Recompute and store the CRC-32C in place
pub fn crc32c_checksum_update(record: &mut [u8], field_offset: usize) {
    let checksum = crc32c_checksum(record, field_offset);
    record[field_offset..field_offset + 4].copy_from_slice(&checksum.to_le_bytes());
}
