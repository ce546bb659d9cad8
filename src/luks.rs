use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    cmd::{stdout_str, RunChecked as _},
    error::TeardownWarning,
};

/// Wrong-passphrase opens are retryable without reformatting, but only this
/// many times before the pipeline aborts.
pub const MAX_OPEN_ATTEMPTS: u32 = 3;

/// cryptsetup exit code for a passphrase that does not match any keyslot.
const EXIT_BAD_PASSPHRASE: i32 = 2;

/// A secret held only as long as needed and wiped on drop. Fed to cryptsetup
/// and chpasswd on stdin; never placed on a command line or in a temp file.
#[derive(Zeroize, ZeroizeOnDrop, Clone)]
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let mut raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read passphrase file {}", path.display()))?;
        // A trailing newline is almost always editor noise, not intent.
        while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
            raw.pop();
        }
        if raw.is_empty() {
            bail!("passphrase file {} is empty", path.display());
        }
        Ok(Self(raw))
    }

    /// Interactive collection with confirmation. dialoguer blocks, so this
    /// hops onto the blocking pool.
    pub async fn prompt(prompt: &str) -> Result<Self> {
        let prompt = prompt.to_owned();
        let collected = tokio::task::spawn_blocking(move || {
            dialoguer::Password::new()
                .with_prompt(prompt.as_str())
                .with_confirmation(format!("Confirm {prompt}"), "Entries do not match")
                .interact()
        })
        .await
        .context("prompt task failed")?
        .context("failed to read passphrase from terminal")?;
        Ok(Self(collected.into_bytes()))
    }

    /// Single entry without confirmation, for re-tries against an existing
    /// volume where a typo just costs one attempt.
    pub async fn prompt_once(prompt: &str) -> Result<Self> {
        let prompt = prompt.to_owned();
        let collected = tokio::task::spawn_blocking(move || {
            dialoguer::Password::new().with_prompt(prompt).interact()
        })
        .await
        .context("prompt task failed")?
        .context("failed to read passphrase from terminal")?;
        Ok(Self(collected.into_bytes()))
    }
}

impl From<Vec<u8>> for Passphrase {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// LUKS2 formatting parameters: AES-XTS with a 512-bit key, SHA-512 digests
/// and memory-hard Argon2id tuned to roughly four seconds.
#[derive(Debug, Clone)]
pub struct LuksParams {
    pub cipher: &'static str,
    pub key_size: u32,
    pub hash: &'static str,
    pub pbkdf: &'static str,
    pub iter_time_ms: u32,
}

impl Default for LuksParams {
    fn default() -> Self {
        Self {
            cipher: "aes-xts-plain64",
            key_size: 512,
            hash: "sha512",
            pbkdf: "argon2id",
            iter_time_ms: 4000,
        }
    }
}

impl LuksParams {
    fn format_args(&self) -> Vec<String> {
        vec![
            "luksFormat".into(),
            "--type".into(),
            "luks2".into(),
            "--cipher".into(),
            self.cipher.into(),
            "--key-size".into(),
            self.key_size.to_string(),
            "--hash".into(),
            self.hash.into(),
            "--pbkdf".into(),
            self.pbkdf.into(),
            "--iter-time".into(),
            self.iter_time_ms.to_string(),
            "--key-file=-".into(),
            "--batch-mode".into(),
        ]
    }
}

pub fn mapper_path(name: &str) -> PathBuf {
    PathBuf::from("/dev/mapper").join(name)
}

pub fn is_active(name: &str) -> bool {
    mapper_path(name).exists()
}

pub async fn format(dev: &Path, passphrase: &Passphrase, params: &LuksParams) -> Result<()> {
    Command::new("cryptsetup")
        .args(params.format_args())
        .arg(dev)
        .run_with_stdin(passphrase.as_bytes())
        .await
        .with_context(|| format!("failed to format {} as LUKS2", dev.display()))?;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    BadPassphrase,
}

/// One open attempt. A wrong passphrase is reported as an outcome, not an
/// error, so the caller can re-prompt without treating it as a tool failure.
pub async fn open(dev: &Path, name: &str, passphrase: &Passphrase) -> Result<OpenOutcome> {
    Command::new("cryptsetup")
        .args(["open", "--type", "luks2", "--key-file=-"])
        .arg(dev)
        .arg(name)
        .run_with_status(Some(passphrase.as_bytes()), |code, _, _| match code {
            0 => Ok(OpenOutcome::Opened),
            EXIT_BAD_PASSPHRASE => Ok(OpenOutcome::BadPassphrase),
            _ => bail!("non-zero exit code"),
        })
        .await
        .with_context(|| format!("failed to open {} as {name}", dev.display()))
}

/// True when the device already carries a LUKS header, used by resume
/// consistency checks.
pub async fn is_initialized(dev: &Path) -> Result<bool> {
    Command::new("cryptsetup")
        .arg("isLuks")
        .arg(dev)
        .run_with_status(None, |code, _, _| match code {
            0 => Ok(true),
            1 => Ok(false),
            _ => bail!("non-zero exit code"),
        })
        .await
        .with_context(|| format!("failed to probe {} for a LUKS header", dev.display()))
}

/// The volume UUID, queried live from the header. Never cached across runs:
/// a reformat changes it and a stale value would produce an unbootable
/// kernel command line.
pub async fn uuid(dev: &Path) -> Result<String> {
    let out = Command::new("cryptsetup")
        .arg("luksUUID")
        .arg(dev)
        .run_checked()
        .await
        .with_context(|| format!("failed to read LUKS UUID of {}", dev.display()))?;
    let uuid = stdout_str(&out);
    if uuid.is_empty() {
        bail!("cryptsetup reported an empty UUID for {}", dev.display());
    }
    Ok(uuid)
}

/// Best-effort close for teardown. An already-closed mapping is a warning,
/// as is a close failure; neither changes the pipeline outcome.
pub async fn close(name: &str) -> Option<TeardownWarning> {
    if !is_active(name) {
        return Some(TeardownWarning::new(
            format!("volume {name}"),
            "already closed",
        ));
    }
    match Command::new("cryptsetup")
        .args(["close", name])
        .run_checked()
        .await
    {
        Ok(_) => None,
        Err(e) => Some(TeardownWarning::new(format!("volume {name}"), format!("{e:#}"))),
    }
}
