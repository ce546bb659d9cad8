use anyhow::{Context, Result};

use super::{edit, TargetContext};
use crate::cmd::RunChecked as _;

/// Rewrites the initramfs hook list to decrypt the root volume at boot, then
/// regenerates all presets.
pub async fn initramfs(ctx: &TargetContext<'_>) -> Result<()> {
    let conf = ctx.etc("etc/mkinitcpio.conf");
    let current = tokio::fs::read_to_string(&conf)
        .await
        .with_context(|| format!("failed to read {}", conf.display()))?;
    let rewritten = edit::rewrite_hooks(&current, &ctx.config.initramfs_hooks);
    edit::backup_then_write(&conf, &rewritten).await?;

    ctx.chroot("mkinitcpio")
        .arg("-P")
        .run_checked()
        .await
        .context("initramfs generation failed")?;
    Ok(())
}

/// Writes the kernel command line that unlocks the root volume by its live
/// LUKS UUID. The UUID comes from the header of this run's format, never
/// from an earlier run.
pub async fn bootloader_config(ctx: &TargetContext<'_>) -> Result<()> {
    let grub_default = ctx.etc("etc/default/grub");
    let current = tokio::fs::read_to_string(&grub_default)
        .await
        .with_context(|| format!("failed to read {}", grub_default.display()))?;
    let rewritten =
        edit::rewrite_kernel_cmdline(&current, ctx.luks_uuid, &ctx.config.mapper_name);
    edit::backup_then_write(&grub_default, &rewritten).await?;
    Ok(())
}

/// Appends Shutdown/Restart entries to the custom menu script. A resumed
/// Configure stage re-runs this sub-step, so entries that are already
/// present are left alone instead of being appended again.
pub async fn boot_menu(ctx: &TargetContext<'_>) -> Result<()> {
    let custom = ctx.etc("etc/grub.d/40_custom");
    let current = match tokio::fs::read_to_string(&custom).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", custom.display()));
        }
    };
    if current.contains("menuentry \"Restart\"") {
        return Ok(());
    }
    let extended = format!("{current}{}", edit::custom_menu_entries());
    edit::backup_then_write(&custom, &extended).await
}

/// Installs the bootloader into the ESP and generates its configuration from
/// the files the earlier sub-steps wrote.
pub async fn bootloader_install(ctx: &TargetContext<'_>) -> Result<()> {
    ctx.chroot("grub-install")
        .args([
            "--target=x86_64-efi",
            "--efi-directory=/efi",
            "--bootloader-id=GRUB",
        ])
        .run_checked()
        .await
        .context("bootloader installation failed")?;

    ctx.chroot("grub-mkconfig")
        .args(["-o", "/boot/grub/grub.cfg"])
        .run_checked()
        .await
        .context("bootloader configuration generation failed")?;
    Ok(())
}
