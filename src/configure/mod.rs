mod accounts;
mod boot;
mod edit;
mod system;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::{cmd::RunChecked as _, config::InstallConfig, luks::Passphrase};

pub use edit::{custom_menu_entries, enable_locale, rewrite_hooks, rewrite_kernel_cmdline};

/// Everything the configuration sub-steps need about the target.
pub struct TargetContext<'a> {
    pub root: &'a Path,
    pub config: &'a InstallConfig,
    pub hostname: &'a str,
    pub username: &'a str,
    pub luks_uuid: &'a str,
    pub root_password: &'a Passphrase,
    pub user_password: &'a Passphrase,
}

impl TargetContext<'_> {
    /// Absolute host-side path of a file inside the target root.
    pub fn etc(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// A command executed inside the target's namespace.
    pub fn chroot(&self, program: &str) -> Command {
        let mut cmd = Command::new("arch-chroot");
        cmd.arg(self.root).arg(program);
        cmd
    }
}

/// Named sub-steps in dependency order: locale/hostname/clock first (no
/// dependencies), then initramfs config, then bootloader config (needs the
/// live LUKS UUID), then bootloader install (needs the written config), then
/// daemons and accounts.
pub const SUBSTEPS: &[&str] = &[
    "timezone",
    "hardware-clock",
    "locale",
    "hostname",
    "initramfs",
    "bootloader-config",
    "boot-menu",
    "bootloader-install",
    "daemons",
    "root-password",
    "create-user",
];

async fn run_substep(name: &str, ctx: &TargetContext<'_>) -> Result<()> {
    match name {
        "timezone" => system::timezone(ctx).await,
        "hardware-clock" => system::hardware_clock(ctx).await,
        "locale" => system::locale(ctx).await,
        "hostname" => system::hostname(ctx).await,
        "initramfs" => boot::initramfs(ctx).await,
        "bootloader-config" => boot::bootloader_config(ctx).await,
        "boot-menu" => boot::boot_menu(ctx).await,
        "bootloader-install" => boot::bootloader_install(ctx).await,
        "daemons" => accounts::daemons(ctx).await,
        "root-password" => accounts::root_password(ctx).await,
        "create-user" => accounts::create_user(ctx).await,
        other => unreachable!("unknown sub-step {other}"),
    }
}

/// Runs every sub-step in order. Each operates on a distinct file or
/// namespace, so a failure is reported with its step name and nothing that
/// came earlier is rolled back.
pub async fn run_all(ctx: &TargetContext<'_>) -> Result<()> {
    for &step in SUBSTEPS {
        tracing::info!(step, "configuring target");
        run_substep(step, ctx)
            .await
            .with_context(|| format!("configuration sub-step {step} failed"))?;
        tracing::info!(step, "done");
    }
    Ok(())
}

/// `systemctl enable` inside the target, used by the daemons sub-step.
pub(crate) async fn enable_daemon(ctx: &TargetContext<'_>, daemon: &str) -> Result<()> {
    ctx.chroot("systemctl")
        .args(["enable", daemon])
        .run_checked()
        .await
        .with_context(|| format!("failed to enable {daemon}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substeps_run_in_dependency_order() {
        let pos = |n: &str| SUBSTEPS.iter().position(|x| *x == n).unwrap();
        // Initramfs config precedes bootloader config, which precedes install.
        assert!(pos("initramfs") < pos("bootloader-config"));
        assert!(pos("bootloader-config") < pos("bootloader-install"));
        // Accounts and daemons come last.
        assert!(pos("bootloader-install") < pos("daemons"));
        assert!(pos("daemons") < pos("create-user"));
        // Locale block has no later dependencies and leads.
        assert_eq!(SUBSTEPS[0], "timezone");
    }

    #[test]
    fn substep_names_are_unique() {
        let mut names = SUBSTEPS.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SUBSTEPS.len());
    }
}
