//! Disk-space capability.
//!
//! The file tier's reclaim loop decides when to evict based on the ratio of
//! free to total bytes on the volume holding the cache directory. The probe
//! is a trait so tests can simulate disk pressure without filling a disk.

use std::io;
use std::path::Path;

/// Free/total bytes for a volume and sizes of individual files.
pub trait DiskSpace: Send + Sync {
    /// Free and total bytes of the volume containing `path`.
    fn free_and_total(&self, path: &Path) -> io::Result<(u64, u64)>;

    /// Size in bytes of the file at `path`.
    fn file_size(&self, path: &Path) -> io::Result<u64>;
}

/// Production probe backed by `fs2` and `std::fs`.
#[derive(Debug, Default, Clone)]
pub struct SysDiskSpace;

impl DiskSpace for SysDiskSpace {
    fn free_and_total(&self, path: &Path) -> io::Result<(u64, u64)> {
        let free = fs2::available_space(path)?;
        let total = fs2::total_space(path)?;
        Ok((free, total))
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}
