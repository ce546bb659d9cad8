use anyhow::{Context, Result};

use super::{edit, TargetContext};
use crate::cmd::RunChecked as _;

/// /etc/localtime -> zoneinfo symlink, created through the target's own
/// namespace so the link target is correct from the installed system's view.
pub async fn timezone(ctx: &TargetContext<'_>) -> Result<()> {
    let zone = format!("/usr/share/zoneinfo/{}", ctx.config.timezone);
    ctx.chroot("ln")
        .args(["-sf", &zone, "/etc/localtime"])
        .run_checked()
        .await
        .with_context(|| format!("failed to link timezone {zone}"))?;
    Ok(())
}

pub async fn hardware_clock(ctx: &TargetContext<'_>) -> Result<()> {
    ctx.chroot("hwclock")
        .arg("--systohc")
        .run_checked()
        .await
        .context("failed to sync the hardware clock")?;
    Ok(())
}

/// Uncomment the configured locale, generate it, and persist LANG.
pub async fn locale(ctx: &TargetContext<'_>) -> Result<()> {
    let locale_gen = ctx.etc("etc/locale.gen");
    let current = tokio::fs::read_to_string(&locale_gen)
        .await
        .with_context(|| format!("failed to read {}", locale_gen.display()))?;
    let rewritten = edit::enable_locale(&current, &ctx.config.locale);
    edit::backup_then_write(&locale_gen, &rewritten).await?;

    ctx.chroot("locale-gen")
        .run_checked()
        .await
        .context("locale generation failed")?;

    edit::backup_then_write(
        &ctx.etc("etc/locale.conf"),
        &format!("LANG={}\n", ctx.config.locale),
    )
    .await?;
    Ok(())
}

pub async fn hostname(ctx: &TargetContext<'_>) -> Result<()> {
    edit::backup_then_write(&ctx.etc("etc/hostname"), &format!("{}\n", ctx.hostname)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::InstallConfig, luks::Passphrase};
    use std::path::Path;

    #[tokio::test]
    async fn hostname_file_carries_exactly_the_hostname() -> Result<()> {
        let dir = tempfile::tempdir()?;
        tokio::fs::create_dir_all(dir.path().join("etc")).await?;

        let config = InstallConfig::default();
        let pw = Passphrase::from(b"x".to_vec());
        let ctx = TargetContext {
            root: dir.path(),
            config: &config,
            hostname: "my-archbox",
            username: "paul",
            luks_uuid: "ignored",
            root_password: &pw,
            user_password: &pw,
        };
        hostname(&ctx).await?;

        let written = tokio::fs::read_to_string(dir.path().join("etc/hostname")).await?;
        assert_eq!(written, "my-archbox\n");
        Ok(())
    }

    #[test]
    fn etc_joins_into_the_target_root() {
        let config = InstallConfig::default();
        let pw = Passphrase::from(b"x".to_vec());
        let ctx = TargetContext {
            root: Path::new("/mnt/archstrap"),
            config: &config,
            hostname: "h",
            username: "u",
            luks_uuid: "",
            root_password: &pw,
            user_password: &pw,
        };
        assert_eq!(
            ctx.etc("etc/locale.gen"),
            Path::new("/mnt/archstrap/etc/locale.gen")
        );
    }
}
