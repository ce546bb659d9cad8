use std::{
    fs::File,
    os::unix::fs::{FileTypeExt, OpenOptionsExt},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use block_devs::BlckExt as _;
use nix::fcntl::{Flock, FlockArg};

use crate::error::InstallError;

/// The whole block device the pipeline owns for its lifetime.
///
/// Claiming takes an exclusive advisory flock on the device node, so two
/// concurrent pipeline instances targeting the same device fail fast instead
/// of interleaving partition writes. The lock is released when the pipeline
/// drops the claim.
#[derive(Debug)]
pub struct TargetDevice {
    path: PathBuf,
    size: u64,
    _lock: Flock<File>,
}

impl TargetDevice {
    pub fn claim(path: &Path) -> Result<Self, InstallError> {
        let meta = std::fs::metadata(path).map_err(|e| {
            InstallError::validation("device", format!("{}: {e}", path.display()))
        })?;
        if !meta.file_type().is_block_device() {
            return Err(InstallError::validation(
                "device",
                format!("{} is not a block device", path.display()),
            ));
        }
        if is_partition(path) {
            return Err(InstallError::validation(
                "device",
                format!(
                    "{} is a partition; the installer needs the whole device",
                    path.display()
                ),
            ));
        }

        let file = File::open(path).map_err(|e| {
            InstallError::validation("device", format!("cannot open {}: {e}", path.display()))
        })?;
        let size = file.get_block_device_size().map_err(|e| {
            InstallError::validation("device", format!("cannot size {}: {e}", path.display()))
        })?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|_| {
            InstallError::validation(
                "device",
                format!("{} is locked by another installer instance", path.display()),
            )
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            size,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the index-th partition (1-based), by kernel naming rules.
    /// Partitions are always addressed by the order they were created in,
    /// never by re-scanning tool output.
    pub fn partition_path(&self, index: u32) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path
            .with_file_name(partition_node(&name, index))
    }

    /// The device must be otherwise idle at pipeline start. An O_EXCL open
    /// fails with EBUSY while the kernel holds the device (mounted, mapped,
    /// or claimed by another opener).
    pub fn is_busy(&self) -> Result<bool> {
        let res = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_EXCL)
            .open(&self.path);
        match res {
            Ok(_) => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(true),
            Err(e) => Err(e).with_context(|| format!("cannot probe {}", self.path.display())),
        }
    }
}

fn is_partition(path: &Path) -> bool {
    match path.file_name() {
        Some(name) => Path::new("/sys/class/block")
            .join(name)
            .join("partition")
            .exists(),
        None => false,
    }
}

/// Kernel partition naming: `sda` -> `sda1`, but devices whose base name ends
/// in a digit get a `p` separator (`nvme0n1` -> `nvme0n1p1`).
pub fn partition_node(base: &str, index: u32) -> String {
    if base.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{base}p{index}")
    } else {
        format!("{base}{index}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("sda", 1, "sda1")]
    #[case("sda", 3, "sda3")]
    #[case("vdb", 2, "vdb2")]
    #[case("nvme0n1", 1, "nvme0n1p1")]
    #[case("nvme0n1", 3, "nvme0n1p3")]
    #[case("mmcblk0", 2, "mmcblk0p2")]
    #[case("loop7", 1, "loop7p1")]
    fn partition_naming(#[case] base: &str, #[case] index: u32, #[case] expect: &str) {
        assert_eq!(partition_node(base, index), expect);
    }

    #[test]
    fn claiming_a_regular_file_is_a_validation_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = TargetDevice::claim(file.path()).unwrap_err();
        assert!(matches!(
            err,
            InstallError::Validation { field: "device", .. }
        ));
    }

    #[test]
    fn claiming_a_missing_path_is_a_validation_error() {
        let err = TargetDevice::claim(Path::new("/dev/archstrap-does-not-exist")).unwrap_err();
        assert!(matches!(
            err,
            InstallError::Validation { field: "device", .. }
        ));
    }
}
