use std::{os::unix::fs::PermissionsExt, path::Path, time::Duration};

use again::RetryPolicy;
use anyhow::{bail, Context, Result};

const FETCH_RETRIES: usize = 2;

fn retry_policy() -> RetryPolicy {
    RetryPolicy::exponential(Duration::from_secs(1))
        .with_max_retries(FETCH_RETRIES)
        .with_max_delay(Duration::from_secs(10))
}

async fn get_text(url: &str) -> Result<String> {
    retry_policy()
        .retry(|| async {
            reqwest::get(url)
                .await?
                .error_for_status()?
                .text()
                .await
                .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("failed to fetch {url}"))
}

/// Newline-delimited package identifiers; blank lines and `#` comments are
/// dropped, everything else is consumed verbatim.
pub fn parse_package_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

pub async fn package_list(url: &str) -> Result<Vec<String>> {
    let raw = get_text(url).await?;
    let packages = parse_package_list(&raw);
    if packages.is_empty() {
        bail!("package list at {url} is empty");
    }
    Ok(packages)
}

/// Places the optional second-stage script into the target root and marks it
/// executable. The pipeline never runs it; it is left for the first login.
pub async fn place_post_install_script(url: &str, root: &Path) -> Result<()> {
    let body = get_text(url).await?;
    let dest = root.join("root/post-install.sh");
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&dest, body)
        .await
        .with_context(|| format!("failed to write {}", dest.display()))?;
    tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("failed to mark {} executable", dest.display()))?;
    tracing::info!(script = %dest.display(), "placed second-stage script");
    Ok(())
}
