use std::{path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::{
    cli::{OnComplete, RunOptions},
    config::InstallConfig,
    configure,
    device::TargetDevice,
    error::InstallError,
    fetch, install,
    luks::{self, LuksParams, OpenOutcome, Passphrase},
    mkfs::{self, FsType},
    mount::{self, MountPlan, MountStack},
    partition::{self, PartitionPlan, PartitionTable},
    poll,
    state::{PipelineState, Stage},
    validate,
};

const MOUNT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Every stage the controller executes itself; Teardown is sequenced
/// separately because it is conditional on the on-complete choice.
const WORK_STAGES: [Stage; 7] = [
    Stage::Validate,
    Stage::Partition,
    Stage::Encrypt,
    Stage::Format,
    Stage::Mount,
    Stage::Install,
    Stage::Configure,
];

/// Outcome record for one stage execution; the controller keeps a transcript
/// and is the sole decision point for retry, abort and teardown.
#[derive(Debug)]
pub struct StageResult {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

#[derive(Debug)]
pub enum StageOutcome {
    Completed,
    Skipped,
    Failed(String),
}

/// The single-threaded state machine over
/// Validate → Partition → Encrypt → Format → Mount → Install → Configure →
/// Teardown. Owns the pipeline state exclusively; stages hand their outputs
/// back here and never reach into each other.
pub struct Pipeline {
    config: InstallConfig,
    opts: RunOptions,
    username: String,
    transcript: Vec<StageResult>,
    luks_passphrase: Option<Passphrase>,
}

impl Pipeline {
    pub fn new(config: InstallConfig, opts: RunOptions) -> Self {
        let username = opts
            .username
            .clone()
            .unwrap_or_else(|| config.default_username.clone());
        Self {
            config,
            opts,
            username,
            transcript: Vec::new(),
            luks_passphrase: None,
        }
    }

    pub async fn run(mut self) -> Result<(), InstallError> {
        // Name checks come before the device is even touched, so a bad
        // hostname can never reach a partition write.
        validate::ensure_name("hostname", &self.opts.hostname)?;
        validate::ensure_name("username", &self.username)?;

        let device = TargetDevice::claim(&self.opts.device)?;
        let state_file = self.config.state_file();

        let mut state = match PipelineState::load(&state_file)
            .await
            .map_err(|e| InstallError::StateInconsistency(format!("{e:#}")))?
        {
            Some(loaded) => {
                if !loaded.matches(device.path(), &self.opts.hostname, &self.username) {
                    return Err(InstallError::StateInconsistency(format!(
                        "state file {} records an installation of {:?} on {}, not {:?} on {}; \
                         run `archstrap reset` to start over",
                        state_file.display(),
                        loaded.hostname,
                        loaded.device.display(),
                        self.opts.hostname,
                        device.path().display(),
                    )));
                }
                let resumed = loaded.resumed();
                tracing::info!(
                    completed = ?resumed.completed,
                    "resuming an interrupted installation"
                );
                resumed
            }
            None => PipelineState::new(device.path(), &self.opts.hostname, &self.username),
        };

        let table = PartitionTable::from_device(&device);
        self.verify_resume(&state, &table).await?;

        let cancel = CancellationToken::new();
        let listener = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("abort requested; waiting for the current stage to finish");
                    cancel.cancel();
                }
            }
        });
        scopeguard::defer! {
            listener.abort();
        }

        let mut mounts = MountStack::new(&self.config.target_root);

        for stage in WORK_STAGES {
            if cancel.is_cancelled() {
                self.abort(&mut mounts, &state).await;
                return Err(InstallError::Cancelled);
            }

            if state.is_complete(stage) {
                tracing::info!(%stage, "already committed, skipping");
                self.transcript.push(StageResult {
                    stage,
                    outcome: StageOutcome::Skipped,
                });
                continue;
            }

            tracing::info!(%stage, "starting");
            state.current = Some(stage);
            state
                .commit(&state_file)
                .await
                .map_err(|e| InstallError::StateInconsistency(format!("{e:#}")))?;

            let result = self
                .execute(stage, &device, &table, &mut state, &mut mounts)
                .await;

            match result {
                Ok(()) => {
                    tracing::info!(%stage, "completed");
                    self.transcript.push(StageResult {
                        stage,
                        outcome: StageOutcome::Completed,
                    });
                    state.mark_complete(stage);
                    state
                        .commit(&state_file)
                        .await
                        .map_err(|e| InstallError::StateInconsistency(format!("{e:#}")))?;
                }
                Err(err) => {
                    self.transcript.push(StageResult {
                        stage,
                        outcome: StageOutcome::Failed(format!("{err:#}")),
                    });
                    self.abort(&mut mounts, &state).await;
                    return Err(match err.downcast::<InstallError>() {
                        Ok(install_err) => install_err,
                        Err(source) => InstallError::ToolInvocation { stage, source },
                    });
                }
            }
        }

        // Conditional Teardown: the operator chose explicitly at invocation.
        match self.opts.on_complete {
            OnComplete::Teardown => {
                tracing::info!(stage = %Stage::Teardown, "starting");
                self.release(&mut mounts, true).await;
                self.transcript.push(StageResult {
                    stage: Stage::Teardown,
                    outcome: StageOutcome::Completed,
                });
            }
            OnComplete::KeepOpen => {
                tracing::info!(
                    root = %self.config.target_root.display(),
                    mapper = %luks::mapper_path(&self.config.mapper_name).display(),
                    "leaving the target mounted and the volume open for inspection"
                );
            }
        }

        PipelineState::archive(&state_file)
            .await
            .map_err(|e| InstallError::StateInconsistency(format!("{e:#}")))?;
        tracing::info!("installation finished");
        Ok(())
    }

    async fn execute(
        &mut self,
        stage: Stage,
        device: &TargetDevice,
        table: &PartitionTable,
        state: &mut PipelineState,
        mounts: &mut MountStack,
    ) -> Result<()> {
        match stage {
            Stage::Validate => {
                validate::preflight(&self.config, &self.opts.hostname, &self.username)?;
                Ok(())
            }
            Stage::Partition => {
                let plan = PartitionPlan::new(self.config.esp_size_mib, self.config.boot_size_mib);
                let written = partition::write_layout(device, &plan, self.opts.force).await?;
                // Later stages address partitions through the same
                // role-to-path mapping the plan produced.
                anyhow::ensure!(
                    written == *table,
                    "partition table {written:?} does not match the expected layout"
                );
                Ok(())
            }
            Stage::Encrypt => {
                let passphrase = self.luks_passphrase(true).await?;
                luks::format(&table.root, &passphrase, &LuksParams::default()).await?;
                match luks::open(&table.root, &self.config.mapper_name, &passphrase).await? {
                    OpenOutcome::Opened => {}
                    OpenOutcome::BadPassphrase => {
                        // The volume was formatted with this very passphrase;
                        // a mismatch here means the header is unusable.
                        anyhow::bail!("freshly formatted volume rejected its own passphrase");
                    }
                }
                state.luks_uuid = Some(luks::uuid(&table.root).await?);
                Ok(())
            }
            Stage::Format => {
                self.ensure_open(&table.root).await?;
                mkfs::mkfs(&table.esp, FsType::Vfat).await?;
                mkfs::mkfs(&table.boot, FsType::Ext4).await?;
                mkfs::mkfs(&luks::mapper_path(&self.config.mapper_name), FsType::Ext4).await?;
                Ok(())
            }
            Stage::Mount => {
                self.ensure_open(&table.root).await?;
                let plan = MountPlan::for_system(table, &self.config.mapper_name);
                mounts.mount_all(&plan).await?;
                Ok(())
            }
            Stage::Install => {
                let root = self.config.target_root.clone();
                // Some backends race mount visibility against the installer's
                // filesystem probe; wait for the mount table to show it.
                poll::wait_for("root mount to become visible", MOUNT_VISIBILITY_TIMEOUT, || {
                    mount::is_mounted(&root)
                })
                .await?;

                let packages = self.resolve_packages().await?;
                install::pacstrap(&root, &packages).await?;
                install::write_fstab(&root).await?;

                if let Some(url) = self
                    .opts
                    .post_install_url
                    .clone()
                    .or_else(|| self.config.post_install_url.clone())
                {
                    fetch::place_post_install_script(&url, &root).await?;
                }
                Ok(())
            }
            Stage::Configure => {
                // Query the UUID from the live header, never from an earlier
                // run; a reformat in between would otherwise go unnoticed.
                let live_uuid = luks::uuid(&table.root).await?;
                if let Some(recorded) = &state.luks_uuid {
                    anyhow::ensure!(
                        *recorded == live_uuid,
                        "recorded LUKS UUID {recorded} does not match the live header {live_uuid}"
                    );
                }
                state.luks_uuid = Some(live_uuid.clone());

                let root_password = match &self.opts.root_password_file {
                    Some(path) => Passphrase::from_file(path).await?,
                    None => Passphrase::prompt("root password").await?,
                };
                let user_password = match &self.opts.user_password_file {
                    Some(path) => Passphrase::from_file(path).await?,
                    None => Passphrase::prompt(&format!("password for {}", self.username)).await?,
                };

                let ctx = configure::TargetContext {
                    root: &self.config.target_root,
                    config: &self.config,
                    hostname: &self.opts.hostname,
                    username: &self.username,
                    luks_uuid: &live_uuid,
                    root_password: &root_password,
                    user_password: &user_password,
                };
                configure::run_all(&ctx).await
            }
            Stage::Teardown => unreachable!("teardown is handled by the controller"),
        }
    }

    /// Resumed state must still describe the system in front of us.
    async fn verify_resume(
        &self,
        state: &PipelineState,
        table: &PartitionTable,
    ) -> Result<(), InstallError> {
        if state.is_complete(Stage::Partition) && !table.all_present() {
            return Err(InstallError::StateInconsistency(format!(
                "state records committed partitions but {} is missing them; \
                 run `archstrap reset` and start over",
                state.device.display()
            )));
        }
        if state.is_complete(Stage::Encrypt) {
            let initialized = luks::is_initialized(&table.root).await.map_err(|e| {
                InstallError::StateInconsistency(format!("cannot verify the LUKS header: {e:#}"))
            })?;
            if !initialized {
                return Err(InstallError::StateInconsistency(format!(
                    "state records an encrypted root but {} has no LUKS header; \
                     run `archstrap reset` and start over",
                    table.root.display()
                )));
            }
        }
        Ok(())
    }

    /// The LUKS passphrase for this run: from the configured file, or
    /// prompted (with confirmation when it will format the volume).
    async fn luks_passphrase(&mut self, confirm: bool) -> Result<Passphrase> {
        if let Some(cached) = &self.luks_passphrase {
            return Ok(cached.clone());
        }
        let collected = match &self.opts.passphrase_file {
            Some(path) => Passphrase::from_file(path).await?,
            None if confirm => Passphrase::prompt("LUKS passphrase").await?,
            None => Passphrase::prompt_once("LUKS passphrase").await?,
        };
        self.luks_passphrase = Some(collected.clone());
        Ok(collected)
    }

    /// Re-opens the mapped volume on resume. Wrong passphrases cost one of a
    /// small number of attempts, not a reformat.
    async fn ensure_open(&mut self, root_partition: &Path) -> Result<()> {
        if luks::is_active(&self.config.mapper_name) {
            return Ok(());
        }
        for attempt in 1..=luks::MAX_OPEN_ATTEMPTS {
            let passphrase = self.luks_passphrase(false).await?;
            match luks::open(root_partition, &self.config.mapper_name, &passphrase).await? {
                OpenOutcome::Opened => return Ok(()),
                OpenOutcome::BadPassphrase => {
                    tracing::warn!(attempt, "passphrase rejected");
                    self.luks_passphrase = None;
                    if self.opts.passphrase_file.is_some() {
                        // A file cannot be re-asked.
                        break;
                    }
                }
            }
        }
        Err(anyhow!(
            "could not open {} within {} attempts",
            root_partition.display(),
            luks::MAX_OPEN_ATTEMPTS
        ))
    }

    async fn resolve_packages(&self) -> Result<Vec<String>> {
        let mut packages = match self
            .opts
            .package_list_url
            .clone()
            .or_else(|| self.config.package_list_url.clone())
        {
            Some(url) => fetch::package_list(&url)
                .await
                .context("failed to retrieve the package list")?,
            None => self.config.packages.clone(),
        };
        if let Some(microcode) = install::cpu_microcode().await {
            packages.push(microcode.to_string());
        }
        Ok(packages)
    }

    /// Fatal-failure path: report where the pipeline died and what each
    /// stage did this run, then release whatever was acquired. Destructive
    /// stages are never rolled back.
    async fn abort(&mut self, mounts: &mut MountStack, state: &PipelineState) {
        let last_completed = state.completed.iter().next_back();
        let transcript = transcript_summary(&self.transcript);
        match last_completed {
            Some(stage) => tracing::error!(%stage, %transcript, "aborting; last committed stage"),
            None => tracing::error!(%transcript, "aborting; no stage had committed"),
        }
        let encrypt_started = state.is_complete(Stage::Encrypt) || !mounts.is_empty()
            || luks::is_active(&self.config.mapper_name);
        self.release(mounts, encrypt_started).await;
    }

    /// Best-effort release of acquired resources: unmount in reverse order,
    /// then close the mapped volume. Warnings are logged and swallowed; they
    /// never change the recorded outcome of earlier stages.
    async fn release(&mut self, mounts: &mut MountStack, close_volume: bool) {
        for warning in mounts.unmount_all().await {
            tracing::warn!("{warning}");
        }
        if close_volume {
            if let Some(warning) = luks::close(&self.config.mapper_name).await {
                tracing::warn!("{warning}");
            }
        }
    }

}

/// One entry per executed stage, rendered for the abort report.
fn transcript_summary(transcript: &[StageResult]) -> String {
    if transcript.is_empty() {
        return "nothing ran".to_string();
    }
    transcript
        .iter()
        .map(|r| match &r.outcome {
            StageOutcome::Completed => format!("{}: completed", r.stage),
            StageOutcome::Skipped => format!("{}: skipped", r.stage),
            StageOutcome::Failed(reason) => format!("{}: failed ({reason})", r.stage),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn work_stages_cover_everything_but_teardown_in_order() {
        assert_eq!(WORK_STAGES.len(), Stage::ORDER.len() - 1);
        for (work, full) in WORK_STAGES.iter().zip(Stage::ORDER.iter()) {
            assert_eq!(work, full);
        }
        assert!(!WORK_STAGES.contains(&Stage::Teardown));
    }

    #[test]
    fn resume_does_not_reinvoke_committed_destructive_stages() {
        let mut st = PipelineState::new(Path::new("/dev/test0"), "my-archbox", "paul");
        st.mark_complete(Stage::Validate);
        st.mark_complete(Stage::Partition);
        st.mark_complete(Stage::Encrypt);
        let st = st.resumed();

        let pending: Vec<Stage> = WORK_STAGES
            .iter()
            .copied()
            .filter(|s| !st.is_complete(*s))
            .collect();

        assert!(!pending.contains(&Stage::Partition));
        assert!(!pending.contains(&Stage::Encrypt));
        // Validation is pure and re-runs scoped to the remaining stages; the
        // first mutating stage to execute is Format.
        let first_mutating = pending.iter().find(|s| **s != Stage::Validate);
        assert_eq!(first_mutating, Some(&Stage::Format));
    }

    #[test]
    fn abort_report_renders_every_stage_outcome() {
        assert_eq!(transcript_summary(&[]), "nothing ran");

        let transcript = [
            StageResult {
                stage: Stage::Validate,
                outcome: StageOutcome::Completed,
            },
            StageResult {
                stage: Stage::Partition,
                outcome: StageOutcome::Skipped,
            },
            StageResult {
                stage: Stage::Encrypt,
                outcome: StageOutcome::Failed("cryptsetup exited with code 1".into()),
            },
        ];
        let summary = transcript_summary(&transcript);
        assert_eq!(
            summary,
            "validate: completed, partition: skipped, \
             encrypt: failed (cryptsetup exited with code 1)"
        );
    }

    #[test]
    fn derived_username_comes_from_config() {
        use clap::Parser as _;
        let cli = crate::cli::Cli::try_parse_from([
            "archstrap",
            "run",
            "/dev/test0",
            "my-archbox",
            "--on-complete",
            "teardown",
        ])
        .unwrap();
        let crate::cli::Command::Run(opts) = cli.command else {
            panic!("expected run");
        };
        let pipeline = Pipeline::new(crate::config::InstallConfig::default(), opts);
        assert_eq!(pipeline.username, "admin");
    }
}
