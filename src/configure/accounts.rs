use anyhow::{Context, Result};

use super::{enable_daemon, TargetContext};
use crate::{cmd::RunChecked as _, luks::Passphrase};

pub async fn daemons(ctx: &TargetContext<'_>) -> Result<()> {
    for daemon in &ctx.config.daemons {
        enable_daemon(ctx, daemon).await?;
    }
    Ok(())
}

fn chpasswd_line(user: &str, password: &Passphrase) -> Vec<u8> {
    let mut line = Vec::with_capacity(user.len() + 1 + password.as_bytes().len() + 1);
    line.extend_from_slice(user.as_bytes());
    line.push(b':');
    line.extend_from_slice(password.as_bytes());
    line.push(b'\n');
    line
}

/// Sets a password through chpasswd on stdin; the secret never touches a
/// command line or the target's filesystem.
async fn set_password(ctx: &TargetContext<'_>, user: &str, password: &Passphrase) -> Result<()> {
    ctx.chroot("chpasswd")
        .run_with_stdin(&chpasswd_line(user, password))
        .await
        .with_context(|| format!("failed to set password for {user}"))?;
    Ok(())
}

pub async fn root_password(ctx: &TargetContext<'_>) -> Result<()> {
    set_password(ctx, "root", ctx.root_password).await
}

/// Creates the normal user with a home directory and administrative group
/// membership. Re-runs tolerate an existing user (useradd exit code 9) so a
/// resumed Configure stage does not trip over its own earlier progress.
pub async fn create_user(ctx: &TargetContext<'_>) -> Result<()> {
    ctx.chroot("useradd")
        .args(["-m", "-G", "wheel", ctx.username])
        .run_with_status(None, |code, _, _| match code {
            0 | 9 => Ok(()),
            _ => anyhow::bail!("non-zero exit code"),
        })
        .await
        .with_context(|| format!("failed to create user {}", ctx.username))?;

    set_password(ctx, ctx.username, ctx.user_password).await
}
