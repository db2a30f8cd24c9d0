//! Host file service backed by a Linux file descriptor
//!
//! Positioned reads and writes go through [`FileExt`]; extent sharing goes
//! through the `FICLONERANGE` ioctl, which btrfs, XFS (reflink=1), OCFS2 and
//! bcachefs implement.

use clonevault_core::{Error, ImageFile, Result};
use std::fs::File;
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// `_IOW(0x94, 13, struct file_clone_range)`
const FICLONERANGE: u64 = 0x4020_940D;

const BTRFS_SUPER_MAGIC: u32 = 0x9123_683E;
const XFS_SUPER_MAGIC: u32 = 0x5846_5342;
const OCFS2_SUPER_MAGIC: u32 = 0x7461_636F;
const BCACHEFS_SUPER_MAGIC: u32 = 0xCA45_1A4E;

/// Argument block of `FICLONERANGE`
#[repr(C)]
struct FileCloneRange {
    src_fd: i64,
    src_offset: u64,
    src_length: u64,
    dest_offset: u64,
}

/// An image file on the host filesystem
#[derive(Debug)]
pub struct HostFile {
    file: File,
    path: PathBuf,
}

impl HostFile {
    /// Open an existing image read-only
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;

        if !metadata.is_file() {
            return Err(Error::invalid_operation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Wrap an already opened file
    pub fn from_file(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
        }
    }

    /// Path the file was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn statfs(&self) -> Result<libc::statfs> {
        let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
        // SAFETY: the descriptor is owned by `self.file` and `stat` is a valid out-pointer
        let rc = unsafe { libc::fstatfs(self.file.as_raw_fd(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(stat)
    }

    fn clone_range_fd(
        &self,
        src_fd: i32,
        src_offset: u64,
        dst_offset: u64,
        len: u64,
    ) -> Result<()> {
        let range = FileCloneRange {
            src_fd: src_fd as i64,
            src_offset,
            src_length: len,
            dest_offset: dst_offset,
        };

        // SAFETY: `range` outlives the call and matches the kernel's struct file_clone_range
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), FICLONERANGE as _, &range as *const FileCloneRange) };
        if rc == 0 {
            tracing::trace!(src_offset, dst_offset, len, "cloned extent");
            return Ok(());
        }

        let err = io::Error::last_os_error();
        let context = format!(
            "{} bytes from offset {:#x} to {:#x} in {}: {}",
            len,
            src_offset,
            dst_offset,
            self.path.display(),
            err
        );
        match err.raw_os_error() {
            Some(libc::EMLINK) | Some(libc::ETXTBSY) => Err(Error::CloneContention(context)),
            Some(libc::EOPNOTSUPP) | Some(libc::EXDEV) | Some(libc::EINVAL)
            | Some(libc::ENOTTY) => Err(Error::CloneUnsupported(context)),
            _ => Err(err.into()),
        }
    }
}

impl ImageFile for HostFile {
    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        FileExt::read_exact_at(&self.file, buf, offset)?;
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match FileExt::read_at(&self.file, &mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        FileExt::write_all_at(&self.file, buf, offset)?;
        Ok(())
    }

    fn clone_range_from(
        &mut self,
        source: &Self,
        src_offset: u64,
        dst_offset: u64,
        len: u64,
    ) -> Result<()> {
        self.clone_range_fd(source.file.as_raw_fd(), src_offset, dst_offset, len)
    }

    fn clone_range_within(&mut self, src_offset: u64, dst_offset: u64, len: u64) -> Result<()> {
        self.clone_range_fd(self.file.as_raw_fd(), src_offset, dst_offset, len)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn cluster_size(&self) -> Result<u32> {
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: the descriptor is owned by `self.file` and `stat` is a valid out-pointer
        let rc = unsafe { libc::fstatvfs(self.file.as_raw_fd(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        u32::try_from(stat.f_bsize)
            .map_err(|_| Error::unsupported(format!("Cluster size {} too large", stat.f_bsize)))
    }

    fn supports_block_cloning(&self) -> Result<bool> {
        let stat = self.statfs()?;
        let magic = stat.f_type as u32;
        Ok(matches!(
            magic,
            BTRFS_SUPER_MAGIC | XFS_SUPER_MAGIC | OCFS2_SUPER_MAGIC | BCACHEFS_SUPER_MAGIC
        ))
    }

    fn is_sparse(&self) -> Result<bool> {
        let metadata = self.file.metadata()?;
        Ok(metadata.blocks() * 512 < metadata.len())
    }

    fn set_sparse(&mut self, sparse: bool) -> Result<()> {
        // Unwritten ranges on Linux are holes already; only the dense direction needs work
        if sparse {
            return Ok(());
        }

        let len = self.size()?;
        if len == 0 {
            return Ok(());
        }
        // SAFETY: plain syscall on an owned descriptor
        let rc = unsafe { libc::fallocate(self.file.as_raw_fd(), 0, 0, len as libc::off_t) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_positioned_io() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[0u8; 4096]).unwrap();
        temp.flush().unwrap();

        let mut file = HostFile::from_file(temp.reopen().unwrap(), temp.path());
        file.write_all_at(b"conectix", 1024).unwrap();

        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, 1024).unwrap();
        assert_eq!(&buf, b"conectix");
        assert_eq!(file.size().unwrap(), 4096);
    }

    #[test]
    fn test_short_read_reports_length() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[7u8; 700]).unwrap();
        temp.flush().unwrap();

        let file = HostFile::open(temp.path()).unwrap();
        let mut buf = [0u8; 512];
        assert_eq!(file.read_at(&mut buf, 512).unwrap(), 188);
        assert!(file.read_exact_at(&mut buf, 512).is_err());
    }

    #[test]
    fn test_set_size() {
        let temp = NamedTempFile::new().unwrap();
        let mut file = HostFile::from_file(temp.reopen().unwrap(), temp.path());
        file.set_size(3 * 1024 * 1024).unwrap();
        assert_eq!(file.size().unwrap(), 3 * 1024 * 1024);
    }

    #[test]
    fn test_cluster_size_is_power_of_two() {
        let temp = NamedTempFile::new().unwrap();
        let file = HostFile::open(temp.path()).unwrap();
        let cluster = file.cluster_size().unwrap();
        assert!(cluster.is_power_of_two());
    }

    #[test]
    fn test_open_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HostFile::open(dir.path()).is_err());
    }
}
