use std::{
    marker::{Send, Sync},
    process::Stdio,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt as _, process::Command};

/// Runs an external privileged tool and checks its exit status, folding the
/// captured output into the error context on failure. All tool invocations in
/// the pipeline go through this trait; nothing shells out directly.
#[async_trait]
pub trait RunChecked {
    /// Run and require exit code 0, returning captured stdout.
    async fn run_checked(&mut self) -> Result<Vec<u8>>;

    /// Run with bytes fed on stdin (used for secrets, which must never
    /// appear on a command line) and require exit code 0.
    async fn run_with_stdin(&mut self, input: &[u8]) -> Result<Vec<u8>>;

    /// Run and let the caller interpret the exit code. The checker receives
    /// (code, stdout, stderr).
    async fn run_with_status<R>(
        &mut self,
        input: Option<&[u8]>,
        check: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R>;
}

#[async_trait]
impl RunChecked for Command {
    async fn run_checked(&mut self) -> Result<Vec<u8>> {
        self.run_with_status(None, |code, stdout, _| {
            if code != 0 {
                bail!("non-zero exit code")
            }
            Ok(stdout)
        })
        .await
    }

    async fn run_with_stdin(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.run_with_status(Some(input), |code, stdout, _| {
            if code != 0 {
                bail!("non-zero exit code")
            }
            Ok(stdout)
        })
        .await
    }

    async fn run_with_status<R>(
        &mut self,
        input: Option<&[u8]>,
        check: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R> {
        // Tool output is parsed in places; keep it locale-independent.
        self.env("LC_ALL", "C");

        tracing::trace!(cmd = ?self.as_std(), "running external tool");

        let output = async {
            self.stdin(match input {
                Some(_) => Stdio::piped(),
                None => Stdio::null(),
            });
            self.stdout(Stdio::piped());
            self.stderr(Stdio::piped());

            let mut child = self.kill_on_drop(true).spawn()?;

            if let Some(bytes) = input {
                let mut stdin = child.stdin.take().context("child has no stdin")?;
                stdin.write_all(bytes).await?;
                stdin.shutdown().await?;
            }

            child.wait_with_output().await.map_err(anyhow::Error::from)
        }
        .await
        .with_context(|| format!("failed to spawn {:?}", self.as_std()))?;

        let stdout = output.stdout;
        let stderr = output.stderr;
        let code = output.status.code();

        match code {
            Some(code) => check(code, stdout.clone(), stderr.clone()),
            None => Err(anyhow!("killed by signal")),
        }
        .with_context(|| {
            format!(
                "cmd: {:?}\nexit code: {}\nstdout: {}\nstderr: {}",
                self.as_std(),
                code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()),
                String::from_utf8_lossy(&stdout).trim(),
                String::from_utf8_lossy(&stderr).trim(),
            )
        })
    }
}

/// Captured stdout as trimmed UTF-8. Tool output is not guaranteed UTF-8, so
/// this is lossy by choice.
pub fn stdout_str(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_on_success() -> Result<()> {
        let out = Command::new("echo").arg("hello").run_checked().await?;
        assert_eq!(stdout_str(&out), "hello");
        Ok(())
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr_in_context() {
        let err = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run_checked()
            .await
            .unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("exit code: 3"));
        assert!(chain.contains("oops"));
    }

    #[tokio::test]
    async fn status_checker_sees_the_exit_code() -> Result<()> {
        let code = Command::new("sh")
            .args(["-c", "exit 2"])
            .run_with_status(None, |code, _, _| Ok(code))
            .await?;
        assert_eq!(code, 2);
        Ok(())
    }

    #[tokio::test]
    async fn stdin_bytes_reach_the_child() -> Result<()> {
        let out = Command::new("cat").run_with_stdin(b"secret\n").await?;
        assert_eq!(stdout_str(&out), "secret");
        Ok(())
    }
}
