//! Disk-space admission
//!
//! At header time a transfer is rejected outright when its advertised size
//! would push the movies volume below the configured reserve.

use crate::error::{DownloadError, Result};
use std::path::Path;
use sysinfo::Disks;

/// Free bytes on the volume holding `path`, by longest mount-point match.
pub fn available_bytes(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Pure admission check: `total_size` must fit in `free − reserved`.
pub fn admit(total_size: u64, free: u64, reserved: u64) -> Result<()> {
    let available = free.saturating_sub(reserved);
    if total_size > available {
        Err(DownloadError::NotEnoughDiskSpace {
            needed: total_size,
            available,
        })
    } else {
        Ok(())
    }
}

/// Admission check against the live filesystem. When the volume cannot be
/// identified the transfer is admitted; a full disk still surfaces as a
/// write error later.
pub fn check(path: &Path, total_size: u64, reserved: u64) -> Result<()> {
    match available_bytes(path) {
        Some(free) => admit(total_size, free, reserved),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_boundary() {
        assert!(admit(100, 300, 200).is_ok());
        assert!(admit(101, 300, 200).is_err());
        // Reserve larger than free saturates to zero available
        assert!(admit(1, 100, 200).is_err());
        assert!(admit(0, 100, 200).is_ok());
    }

    #[test]
    fn available_bytes_finds_root_volume() {
        // Every platform has some volume holding the temp dir
        let free = available_bytes(&std::env::temp_dir());
        assert!(free.is_some());
    }
}
