use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::cmd::RunChecked as _;

/// Filesystems the provisioner knows how to make: FAT32 for the ESP, ext4
/// for boot and the mapped root volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Vfat,
    Ext4,
}

impl FsType {
    fn tool(self) -> &'static str {
        match self {
            FsType::Vfat => "mkfs.vfat",
            FsType::Ext4 => "mkfs.ext4",
        }
    }

    fn args(self) -> &'static [&'static str] {
        match self {
            FsType::Vfat => &["-F", "32"],
            // -F: the target is a just-created partition or mapper node,
            // never an interactive confirmation candidate.
            FsType::Ext4 => &["-F", "-q"],
        }
    }
}

/// Formats a device. Always destructive; the pipeline state machine
/// guarantees this runs at most once per pipeline instance.
pub async fn mkfs(dev: &Path, fs: FsType) -> Result<()> {
    tracing::info!(dev = %dev.display(), ?fs, "formatting");
    Command::new(fs.tool())
        .args(fs.args())
        .arg(dev)
        .run_checked()
        .await
        .with_context(|| format!("failed to format {} as {:?}", dev.display(), fs))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esp_gets_fat32() {
        assert_eq!(FsType::Vfat.tool(), "mkfs.vfat");
        assert_eq!(FsType::Vfat.args(), ["-F", "32"]);
    }

    #[test]
    fn ext4_is_forced_non_interactive() {
        assert!(FsType::Ext4.args().contains(&"-F"));
    }
}
