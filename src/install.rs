use std::{path::Path, time::Duration};

use again::RetryPolicy;
use anyhow::{Context, Result};
use tokio::process::Command;

use crate::cmd::RunChecked as _;

const INSTALL_RETRIES: usize = 2;

/// Microcode package for the CPU vendor, from a /proc/cpuinfo dump.
/// Unrecognized vendors are a skip, never a failure.
pub fn microcode_package(cpuinfo: &str) -> Option<&'static str> {
    let vendor = cpuinfo
        .lines()
        .find(|line| line.starts_with("vendor_id"))
        .and_then(|line| line.split(':').nth(1))
        .map(str::trim)?;
    match vendor {
        "GenuineIntel" => Some("intel-ucode"),
        "AuthenticAMD" => Some("amd-ucode"),
        _ => None,
    }
}

pub async fn cpu_microcode() -> Option<&'static str> {
    let cpuinfo = tokio::fs::read_to_string("/proc/cpuinfo").await.ok()?;
    let package = microcode_package(&cpuinfo);
    if package.is_none() {
        tracing::warn!("unrecognized CPU vendor, skipping microcode package");
    }
    package
}

/// Installs the base package set into the mounted target root.
///
/// Package resolution and download are the one transient-failure-prone part
/// of the pipeline, so this retries with backoff before giving up. There is
/// no partial-install rollback; a final failure is fatal.
pub async fn pacstrap(root: &Path, packages: &[String]) -> Result<()> {
    tracing::info!(count = packages.len(), "installing base system");
    RetryPolicy::exponential(Duration::from_secs(2))
        .with_max_retries(INSTALL_RETRIES)
        .with_max_delay(Duration::from_secs(30))
        .retry(|| async {
            Command::new("pacstrap")
                .arg(root)
                .args(packages)
                .run_checked()
                .await
        })
        .await
        .context("failed to install the base package set")?;
    Ok(())
}

/// Materializes the target's fstab from the live mount layout, by UUID.
pub async fn write_fstab(root: &Path) -> Result<()> {
    let out = Command::new("genfstab")
        .arg("-U")
        .arg(root)
        .run_checked()
        .await
        .context("failed to derive fstab from the mount layout")?;
    let fstab = root.join("etc/fstab");
    tokio::fs::write(&fstab, &out)
        .await
        .with_context(|| format!("failed to write {}", fstab.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const INTEL: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
model name\t: Intel(R) Core(TM) i7
";
    const AMD: &str = "\
processor\t: 0
vendor_id\t: AuthenticAMD
model name\t: AMD Ryzen 7
";
    const OTHER: &str = "\
processor\t: 0
vendor_id\t: SomethingElse
";

    #[rstest]
    #[case(INTEL, Some("intel-ucode"))]
    #[case(AMD, Some("amd-ucode"))]
    #[case(OTHER, None)]
    #[case("", None)]
    fn vendor_selects_microcode(#[case] cpuinfo: &str, #[case] expect: Option<&str>) {
        assert_eq!(microcode_package(cpuinfo), expect);
    }

    #[test]
    fn intel_never_pulls_the_amd_package() {
        let pkg = microcode_package(INTEL).unwrap();
        assert_eq!(pkg, "intel-ucode");
        assert_ne!(pkg, "amd-ucode");
    }
}
