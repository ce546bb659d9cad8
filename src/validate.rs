use crate::{config::InstallConfig, error::InstallError};

/// Tools the pipeline drives; all must resolve on PATH before anything runs.
const REQUIRED_TOOLS: &[&str] = &[
    "sgdisk",
    "partprobe",
    "cryptsetup",
    "mkfs.vfat",
    "mkfs.ext4",
    "mount",
    "umount",
    "blkid",
    "pacstrap",
    "genfstab",
    "arch-chroot",
];

const NAME_MAX_LEN: usize = 20;

/// Pure precondition checks. Nothing here mutates state, and every check is
/// safe to re-run on resume.
pub fn preflight(
    config: &InstallConfig,
    hostname: &str,
    username: &str,
) -> Result<(), InstallError> {
    ensure_root()?;
    ensure_name("hostname", hostname)?;
    ensure_name("username", username)?;
    ensure_not_reserved(config, username)?;
    ensure_tools()?;
    Ok(())
}

fn ensure_root() -> Result<(), InstallError> {
    if !nix::unistd::geteuid().is_root() {
        return Err(InstallError::validation(
            "privilege",
            "must run as root to open block devices and chroot",
        ));
    }
    Ok(())
}

/// Hostnames and usernames share one accepted shape: 1..=20 characters out of
/// `[A-Za-z0-9_-]`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= NAME_MAX_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn ensure_name(field: &'static str, name: &str) -> Result<(), InstallError> {
    if is_valid_name(name) {
        return Ok(());
    }
    let reason = if name.is_empty() {
        "must not be empty".to_string()
    } else if name.len() > NAME_MAX_LEN {
        format!("{name:?} is longer than {NAME_MAX_LEN} characters")
    } else {
        format!("{name:?} contains characters outside [A-Za-z0-9_-]")
    };
    Err(InstallError::Validation { field, reason })
}

fn ensure_not_reserved(config: &InstallConfig, username: &str) -> Result<(), InstallError> {
    if config.reserved_usernames.iter().any(|r| r == username) {
        return Err(InstallError::validation(
            "username",
            format!("{username:?} is a reserved system account"),
        ));
    }
    Ok(())
}

fn ensure_tools() -> Result<(), InstallError> {
    for tool in REQUIRED_TOOLS {
        if which::which(tool).is_err() {
            return Err(InstallError::validation(
                "environment",
                format!("required tool {tool} not found on PATH"),
            ));
        }
    }
    Ok(())
}
