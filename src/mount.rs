use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::{
    cmd::RunChecked as _,
    error::TeardownWarning,
    luks,
    partition::PartitionTable,
};

/// One mount obligation: a source device onto a subpath of the target root.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub source: PathBuf,
    pub subpath: &'static str,
}

/// Ordered mount entries, parent before child by construction. The manager
/// executes the plan verbatim; ordering is encoded here, never inferred at
/// mount time.
#[derive(Debug, Clone)]
pub struct MountPlan {
    entries: Vec<MountEntry>,
}

impl MountPlan {
    /// Root volume first, then boot, then the ESP under boot's sibling `efi`.
    pub fn for_system(table: &PartitionTable, mapper_name: &str) -> Self {
        Self {
            entries: vec![
                MountEntry {
                    source: luks::mapper_path(mapper_name),
                    subpath: "",
                },
                MountEntry {
                    source: table.boot.clone(),
                    subpath: "boot",
                },
                MountEntry {
                    source: table.esp.clone(),
                    subpath: "efi",
                },
            ],
        }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }
}

/// Live mounts under the target root. Every successful mount pushes an
/// unmount obligation; [`MountStack::unmount_all`] drains them in reverse on
/// every exit path, fatal or not.
pub struct MountStack {
    root: PathBuf,
    mounted: Vec<PathBuf>,
}

impl MountStack {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            mounted: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty()
    }

    pub async fn mount_all(&mut self, plan: &MountPlan) -> Result<()> {
        for entry in plan.entries() {
            // join("") would leave a trailing slash that breaks the
            // mountinfo comparison below.
            let target = if entry.subpath.is_empty() {
                self.root.clone()
            } else {
                self.root.join(entry.subpath)
            };
            tokio::fs::create_dir_all(&target)
                .await
                .with_context(|| format!("failed to create mount point {}", target.display()))?;

            // A crashed previous run can leave kernel mounts behind; adopt
            // them instead of failing on a double mount.
            if is_mounted(&target) {
                tracing::info!(target = %target.display(), "already mounted, adopting");
            } else {
                Command::new("mount")
                    .arg(&entry.source)
                    .arg(&target)
                    .run_checked()
                    .await
                    .with_context(|| {
                        format!(
                            "failed to mount {} on {}",
                            entry.source.display(),
                            target.display()
                        )
                    })?;
            }
            self.mounted.push(target);
        }
        Ok(())
    }

    /// Reverse-order teardown. Already-unmounted targets and unmount
    /// failures both degrade to warnings; teardown never aborts part-way.
    pub async fn unmount_all(&mut self) -> Vec<TeardownWarning> {
        let mut warnings = Vec::new();
        while let Some(target) = self.mounted.pop() {
            if !is_mounted(&target) {
                warnings.push(TeardownWarning::new(
                    target.display().to_string(),
                    "already unmounted",
                ));
                continue;
            }
            if let Err(e) = Command::new("umount").arg(&target).run_checked().await {
                warnings.push(TeardownWarning::new(
                    target.display().to_string(),
                    format!("{e:#}"),
                ));
            }
        }
        warnings
    }
}

/// Whether `target` is a current mount point, from /proc/self/mountinfo.
pub fn is_mounted(target: &Path) -> bool {
    match std::fs::read_to_string("/proc/self/mountinfo") {
        Ok(content) => mountinfo_contains(&content, target),
        Err(_) => false,
    }
}

/// mountinfo field 5 (0-based index 4) is the mount point. Octal-escaped
/// characters do not occur in the paths this pipeline creates.
fn mountinfo_contains(mountinfo: &str, target: &Path) -> bool {
    let want = target.to_string_lossy();
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|mp| mp == want)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PartitionTable {
        PartitionTable {
            esp: "/dev/vda1".into(),
            boot: "/dev/vda2".into(),
            root: "/dev/vda3".into(),
        }
    }

    #[test]
    fn plan_mounts_root_before_children() {
        let plan = MountPlan::for_system(&table(), "cryptroot");
        let subpaths: Vec<_> = plan.entries().iter().map(|e| e.subpath).collect();
        assert_eq!(subpaths, ["", "boot", "efi"]);
        assert_eq!(
            plan.entries()[0].source,
            PathBuf::from("/dev/mapper/cryptroot")
        );
    }

    #[test]
    fn plan_sources_come_from_the_partition_table() {
        let plan = MountPlan::for_system(&table(), "cryptroot");
        assert_eq!(plan.entries()[1].source, PathBuf::from("/dev/vda2"));
        assert_eq!(plan.entries()[2].source, PathBuf::from("/dev/vda1"));
    }

    #[tokio::test]
    async fn unmounting_nothing_is_silent() {
        let mut stack = MountStack::new(Path::new("/mnt/test"));
        assert!(stack.unmount_all().await.is_empty());
    }

    #[tokio::test]
    async fn unmounting_a_never_mounted_target_is_a_warning_not_an_error() {
        let mut stack = MountStack::new(Path::new("/mnt/test"));
        stack.mounted.push(PathBuf::from("/mnt/test/boot"));
        let warnings = stack.unmount_all().await;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].to_string().contains("already unmounted"));
        assert!(stack.is_empty());
    }

    #[test]
    fn mountinfo_lookup_matches_exact_mount_points() {
        let mountinfo = "\
22 27 0:20 / /proc rw,nosuid shared:13 - proc proc rw
98 27 253:0 / /mnt/archstrap rw shared:52 - ext4 /dev/mapper/cryptroot rw
99 98 259:2 / /mnt/archstrap/boot rw shared:53 - ext4 /dev/vda2 rw
";
        assert!(mountinfo_contains(mountinfo, Path::new("/mnt/archstrap")));
        assert!(mountinfo_contains(
            mountinfo,
            Path::new("/mnt/archstrap/boot")
        ));
        assert!(!mountinfo_contains(
            mountinfo,
            Path::new("/mnt/archstrap/efi")
        ));
        // A prefix is not a match.
        assert!(!mountinfo_contains(mountinfo, Path::new("/mnt/arch")));
    }

    #[tokio::test]
    async fn teardown_runs_in_reverse_order() {
        let mut stack = MountStack::new(Path::new("/mnt/test"));
        stack.mounted.push(PathBuf::from("/mnt/test"));
        stack.mounted.push(PathBuf::from("/mnt/test/boot"));
        stack.mounted.push(PathBuf::from("/mnt/test/efi"));
        let warnings = stack.unmount_all().await;
        let order: Vec<_> = warnings.iter().map(|w| w.what.clone()).collect();
        assert_eq!(order, ["/mnt/test/efi", "/mnt/test/boot", "/mnt/test"]);
    }
}
