use std::{path::Path, time::Duration};

use anyhow::{bail, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Waits for a readiness predicate with a bounded timeout.
///
/// Partitioning, device-mapper and mount operations hand work to the kernel
/// and return before the result is visible; rather than sleeping a fixed
/// window we poll an explicit predicate and fail loudly when it never comes
/// true.
pub async fn wait_for(what: &str, timeout: Duration, mut ready: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if ready() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Waits for a path (device node, mapper node) to appear.
pub async fn wait_for_path(path: &Path, timeout: Duration) -> Result<()> {
    wait_for(&format!("{} to appear", path.display()), timeout, || {
        path.exists()
    })
    .await
}
