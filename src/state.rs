use std::{
    collections::BTreeSet,
    fmt::Display,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The linear pipeline. Stage order is total; there is no branching except
/// that Teardown is conditional on the operator's on-complete choice.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Partition,
    Encrypt,
    Format,
    Mount,
    Install,
    Configure,
    Teardown,
}

impl Stage {
    pub const ORDER: [Stage; 8] = [
        Stage::Validate,
        Stage::Partition,
        Stage::Encrypt,
        Stage::Format,
        Stage::Mount,
        Stage::Install,
        Stage::Configure,
        Stage::Teardown,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Partition => "partition",
            Stage::Encrypt => "encrypt",
            Stage::Format => "format",
            Stage::Mount => "mount",
            Stage::Install => "install",
            Stage::Configure => "configure",
            Stage::Teardown => "teardown",
        }
    }

    /// Stages whose completion survives a process restart: their effect lives
    /// on disk. Validate is cheap and re-runs scoped to the remaining stages;
    /// Mount acquisitions and Teardown die with the process.
    pub fn is_durable(self) -> bool {
        matches!(
            self,
            Stage::Partition | Stage::Encrypt | Stage::Format | Stage::Install | Stage::Configure
        )
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Persisted progress record, written after each stage commit and read back
/// on re-entry so completed destructive stages are never repeated. Lives
/// outside the target root. Archived on terminal success.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineState {
    pub device: PathBuf,
    pub hostname: String,
    pub username: String,
    pub current: Option<Stage>,
    pub completed: BTreeSet<Stage>,
    /// Learned once Encrypt commits; re-verified against the header on use.
    pub luks_uuid: Option<String>,
}

impl PipelineState {
    pub fn new(device: &Path, hostname: &str, username: &str) -> Self {
        Self {
            device: device.to_path_buf(),
            hostname: hostname.to_string(),
            username: username.to_string(),
            current: None,
            completed: BTreeSet::new(),
            luks_uuid: None,
        }
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }

    pub fn mark_complete(&mut self, stage: Stage) {
        self.completed.insert(stage);
        self.current = None;
    }

    /// Prepares a loaded record for re-entry: completions that do not
    /// survive a process restart are dropped so those stages run again.
    pub fn resumed(mut self) -> Self {
        self.completed.retain(|s| s.is_durable());
        self.current = None;
        self
    }

    /// A resumed record must describe the same installation.
    pub fn matches(&self, device: &Path, hostname: &str, username: &str) -> bool {
        self.device == device && self.hostname == hostname && self.username == username
    }

    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(raw) => {
                let state = serde_json::from_slice(&raw)
                    .with_context(|| format!("corrupt state file {}", path.display()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
        }
    }

    /// Durable commit: write-then-rename so an interrupted write never
    /// leaves a truncated record.
    pub async fn commit(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, raw)
            .await
            .with_context(|| format!("cannot write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("cannot commit {}", path.display()))?;
        Ok(())
    }

    /// On terminal success the record is archived, not destroyed, so a later
    /// run starts fresh while the history stays inspectable.
    pub async fn archive(path: &Path) -> Result<()> {
        let archived = path.with_extension("json.done");
        tokio::fs::rename(path, archived)
            .await
            .with_context(|| format!("cannot archive {}", path.display()))?;
        Ok(())
    }

    pub async fn reset(path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("cannot remove {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PipelineState {
        PipelineState::new(Path::new("/dev/test0"), "my-archbox", "paul")
    }

    #[test]
    fn stage_order_is_total_and_linear() {
        for pair in Stage::ORDER.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(Stage::ORDER[0], Stage::Validate);
        assert_eq!(Stage::ORDER[7], Stage::Teardown);
    }

    #[test]
    fn volatile_stage_completions_are_dropped_on_resume() {
        let mut st = state();
        st.mark_complete(Stage::Validate);
        st.mark_complete(Stage::Partition);
        st.mark_complete(Stage::Encrypt);
        st.mark_complete(Stage::Mount);
        let resumed = st.resumed();
        assert!(resumed.is_complete(Stage::Partition));
        assert!(resumed.is_complete(Stage::Encrypt));
        assert!(!resumed.is_complete(Stage::Validate));
        assert!(!resumed.is_complete(Stage::Mount));
    }

    #[test]
    fn completion_is_recorded_per_stage() {
        let mut st = state();
        assert!(!st.is_complete(Stage::Partition));
        st.mark_complete(Stage::Partition);
        assert!(st.is_complete(Stage::Partition));
        assert!(!st.is_complete(Stage::Encrypt));
    }

    #[test]
    fn mismatched_identity_is_detected() {
        let st = state();
        assert!(st.matches(Path::new("/dev/test0"), "my-archbox", "paul"));
        assert!(!st.matches(Path::new("/dev/test1"), "my-archbox", "paul"));
        assert!(!st.matches(Path::new("/dev/test0"), "other", "paul"));
    }

    #[tokio::test]
    async fn commit_load_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.json");

        let mut st = state();
        st.mark_complete(Stage::Validate);
        st.mark_complete(Stage::Partition);
        st.luks_uuid = Some("2f6c...".into());
        st.commit(&path).await?;

        let loaded = PipelineState::load(&path).await?.expect("state present");
        assert_eq!(loaded, st);
        Ok(())
    }

    #[tokio::test]
    async fn loading_a_missing_file_is_none() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(PipelineState::load(&dir.path().join("nope.json"))
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn archive_renames_instead_of_deleting() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.json");
        state().commit(&path).await?;
        PipelineState::archive(&path).await?;
        assert!(!path.exists());
        assert!(dir.path().join("state.json.done").exists());
        Ok(())
    }

    #[tokio::test]
    async fn reset_reports_whether_anything_was_cleared() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.json");
        assert!(!PipelineState::reset(&path).await?);
        state().commit(&path).await?;
        assert!(PipelineState::reset(&path).await?);
        Ok(())
    }

    #[test]
    fn stage_serializes_as_snake_case() {
        let json = serde_json::to_string(&Stage::Partition).unwrap();
        assert_eq!(json, "\"partition\"");
    }
}
