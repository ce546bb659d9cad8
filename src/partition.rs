use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::process::Command;

use crate::{cmd::RunChecked as _, device::TargetDevice, poll};

const MIB: u64 = 1024 * 1024;
const PARTITION_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a partition is created for. Every later stage addresses partitions by
/// role, carried through [`PartitionTable`], never by parsing tool output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    Esp,
    Boot,
    Root,
}

impl PartitionRole {
    /// sgdisk type code: EFI System for the ESP, Linux LUKS for the root
    /// partition that is about to be encrypted.
    fn type_code(self) -> &'static str {
        match self {
            PartitionRole::Esp => "ef00",
            PartitionRole::Boot => "8300",
            PartitionRole::Root => "8309",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    Mib(u64),
    Remainder,
}

#[derive(Debug, Clone, Copy)]
pub struct PartitionSpec {
    pub role: PartitionRole,
    pub size: PartitionSize,
}

/// The fixed three-partition GPT layout: ESP, boot, then root taking the
/// remainder. Constructed from configured sizes; the shape itself is not
/// configurable.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    specs: [PartitionSpec; 3],
}

impl PartitionPlan {
    pub fn new(esp_size_mib: u64, boot_size_mib: u64) -> Self {
        Self {
            specs: [
                PartitionSpec {
                    role: PartitionRole::Esp,
                    size: PartitionSize::Mib(esp_size_mib),
                },
                PartitionSpec {
                    role: PartitionRole::Boot,
                    size: PartitionSize::Mib(boot_size_mib),
                },
                PartitionSpec {
                    role: PartitionRole::Root,
                    size: PartitionSize::Remainder,
                },
            ],
        }
    }

    pub fn specs(&self) -> &[PartitionSpec] {
        &self.specs
    }

    /// Fixed sizes plus headroom for GPT metadata must fit the device.
    pub fn fits(&self, device_size: u64) -> bool {
        let fixed: u64 = self
            .specs
            .iter()
            .filter_map(|s| match s.size {
                PartitionSize::Mib(mib) => Some(mib * MIB),
                PartitionSize::Remainder => None,
            })
            .sum();
        // The remainder partition needs room too; require at least 1 GiB.
        fixed + 1024 * MIB <= device_size
    }

    /// One `-n`/`-t` pair per partition, in creation order.
    fn sgdisk_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (i, spec) in self.specs.iter().enumerate() {
            let index = i as u64 + 1;
            let end = match spec.size {
                PartitionSize::Mib(mib) => format!("+{mib}M"),
                PartitionSize::Remainder => "0".to_string(),
            };
            args.push("-n".to_string());
            args.push(format!("{index}:0:{end}"));
            args.push("-t".to_string());
            args.push(format!("{index}:{}", spec.role.type_code()));
        }
        args
    }
}

/// The realized plan: role -> resolved partition node. Produced once by
/// [`write_layout`] and threaded to every later stage by the controller.
/// Deterministic from the device name, so resume can rebuild it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub esp: PathBuf,
    pub boot: PathBuf,
    pub root: PathBuf,
}

impl PartitionTable {
    pub fn from_device(device: &TargetDevice) -> Self {
        Self {
            esp: device.partition_path(1),
            boot: device.partition_path(2),
            root: device.partition_path(3),
        }
    }

    pub fn all_present(&self) -> bool {
        self.esp.exists() && self.boot.exists() && self.root.exists()
    }
}

#[derive(Deserialize)]
struct LsblkReport {
    blockdevices: Vec<LsblkNode>,
}

#[derive(Deserialize)]
struct LsblkNode {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

/// Number of partitions lsblk reports under the device.
fn partition_count(lsblk_json: &str) -> Result<usize> {
    let report: LsblkReport =
        serde_json::from_str(lsblk_json).context("unparseable lsblk output")?;
    Ok(report
        .blockdevices
        .iter()
        .flat_map(|d| d.children.iter())
        .filter(|c| c.kind == "part")
        .count())
}

pub async fn existing_partitions(device: &TargetDevice) -> Result<usize> {
    let out = Command::new("lsblk")
        .args(["--json", "-o", "NAME,TYPE"])
        .arg(device.path())
        .run_checked()
        .await
        .context("failed to scan existing partitions")?;
    partition_count(&String::from_utf8_lossy(&out))
}

/// Writes a fresh GPT and the three planned partitions, then re-probes and
/// waits for every expected partition node before returning the table.
///
/// Refuses a device that already carries partitions unless `force` is set.
/// A write failure is fatal with no partial recovery; the device is presumed
/// dirty and left for manual intervention.
pub async fn write_layout(
    device: &TargetDevice,
    plan: &PartitionPlan,
    force: bool,
) -> Result<PartitionTable> {
    if !plan.fits(device.size()) {
        bail!(
            "partition plan does not fit device {} ({} bytes)",
            device.path().display(),
            device.size()
        );
    }

    let existing = existing_partitions(device).await?;
    if existing > 0 && !force {
        bail!(
            "{} already has {existing} partition(s); pass --force to overwrite",
            device.path().display()
        );
    }

    if device.is_busy()? {
        bail!(
            "{} is held open by the kernel; unmount/close it first",
            device.path().display()
        );
    }

    tracing::info!(device = %device.path().display(), "writing fresh GPT");
    Command::new("sgdisk")
        .arg("--zap-all")
        .arg(device.path())
        .run_checked()
        .await
        .context("failed to clear the partition table")?;

    Command::new("sgdisk")
        .args(plan.sgdisk_args())
        .arg(device.path())
        .run_checked()
        .await
        .context("failed to write partitions")?;

    // The kernel learns about the new layout asynchronously; re-probe and
    // then poll for each node instead of sleeping a fixed window.
    Command::new("partprobe")
        .arg(device.path())
        .run_checked()
        .await
        .context("failed to re-read the partition table")?;

    let table = PartitionTable::from_device(device);
    for node in [&table.esp, &table.boot, &table.root] {
        poll::wait_for_path(node, PARTITION_SETTLE_TIMEOUT).await?;
    }

    Ok(table)
}
