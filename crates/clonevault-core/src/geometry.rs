//! Geometry and alignment helpers
//!
//! Size arithmetic shared by every vault engine, plus the classic
//! cylinder/head/sector calculation stored in VHD footers.

use crate::Error;

/// Bytes per logical sector in VHD and RAW images
pub const SECTOR_SIZE: u32 = 512;

/// One mebibyte
pub const MIB: u64 = 1024 * 1024;

/// Smallest disk any engine will read or construct (3 MiB)
pub const MINIMUM_DISK_SIZE: u64 = 3 * MIB;

/// Round `value` up to the next multiple of `multiple`
pub fn round_up(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}

/// Ceiling division, saturating to `u32::MAX`
///
/// Callers that need an exact count must range-check the result.
pub fn ceil_div(value: u64, divisor: u64) -> u32 {
    u32::try_from(value.div_ceil(divisor)).unwrap_or(u32::MAX)
}

/// True when `value` is a nonzero power of two
pub fn is_power_of_two(value: u64) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

/// Largest power of two dividing `disk_size` (capped at 2^31), floored at `alignment`
///
/// Used as the addressing block size of images without a real block structure.
pub fn natural_block_size(disk_size: u64, alignment: u32) -> u32 {
    let shift = disk_size.trailing_zeros().min(31);
    (1u32 << shift).max(alignment)
}

/// Safely add two u64 values with overflow checking
pub fn checked_add_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_add(b)
        .ok_or_else(|| Error::overflow(format!("{}: addition overflow", context)))
}

/// Safely multiply two u64 values with overflow checking
pub fn checked_multiply_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| Error::overflow(format!("{}: multiplication overflow", context)))
}

/// Safely convert u64 to usize with platform checking
pub fn u64_to_usize(value: u64, context: &str) -> crate::Result<usize> {
    value.try_into().map_err(|_| {
        Error::overflow(format!(
            "{}: value {} exceeds platform usize limit",
            context, value
        ))
    })
}

/// Validate a required alignment (cluster size)
pub fn validate_alignment(alignment: u32) -> crate::Result<()> {
    if !is_power_of_two(alignment as u64) {
        return Err(Error::invalid_parameter(format!(
            "Required alignment {} is not a power of two",
            alignment
        )));
    }
    Ok(())
}

/// Cylinder/head/sector geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chs {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl Chs {
    /// Pack as `cylinders:16 | heads:8 | sectors_per_track:8`
    pub fn pack(&self) -> u32 {
        ((self.cylinders as u32) << 16) | ((self.heads as u32) << 8) | self.sectors_per_track as u32
    }

    /// Inverse of [`Chs::pack`]
    pub fn unpack(value: u32) -> Self {
        Self {
            cylinders: (value >> 16) as u16,
            heads: (value >> 8) as u8,
            sectors_per_track: value as u8,
        }
    }
}

/// Calculate CHS geometry for a disk of `disk_size` bytes
///
/// This is the algorithm from the VHD format documentation; the result has to
/// match other implementations exactly.
pub fn calculate_chs(disk_size: u64) -> Chs {
    let total_sectors = (disk_size / SECTOR_SIZE as u64).min(65535 * 16 * 255);

    let (sectors_per_track, heads, cylinder_times_heads) = if total_sectors >= 65535 * 16 * 63 {
        (255u64, 16u64, total_sectors / 255)
    } else {
        let mut spt = 17u64;
        let mut cth = total_sectors / spt;
        let mut heads = cth.div_ceil(1024).max(4);

        if cth >= heads * 1024 || heads > 16 {
            spt = 31;
            heads = 16;
            cth = total_sectors / spt;
        }

        if cth >= heads * 1024 {
            spt = 63;
            heads = 16;
            cth = total_sectors / spt;
        }

        (spt, heads, cth)
    };

    Chs {
        cylinders: (cylinder_times_heads / heads) as u16,
        heads: heads as u8,
        sectors_per_track: sectors_per_track as u8,
    }
}
