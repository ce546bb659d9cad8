use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Everything about a run that is policy rather than input: the base package
/// set, daemons to enable, locale/timezone, partition sizing and fixed paths.
/// Built-in defaults cover the normal case; a TOML file can override any
/// field. The pipeline receives this at construction and there is no other
/// process-wide configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct InstallConfig {
    /// Username used by the two-argument CLI form.
    pub default_username: String,

    /// Account names the validator refuses for the normal user.
    pub reserved_usernames: Vec<String>,

    /// Base package set handed to the installer (plus conditional microcode).
    pub packages: Vec<String>,

    /// Services enabled inside the target at the end of configuration.
    pub daemons: Vec<String>,

    /// Locale to uncomment in locale.gen and write to locale.conf.
    pub locale: String,

    /// Zoneinfo path suffix for the /etc/localtime symlink.
    pub timezone: String,

    /// EFI system partition size in MiB.
    pub esp_size_mib: u64,

    /// Boot partition size in MiB. The root partition takes the remainder.
    pub boot_size_mib: u64,

    /// Device-mapper name the opened root volume appears under.
    pub mapper_name: String,

    /// Where the target root tree is mounted during installation.
    pub target_root: PathBuf,

    /// Where pipeline state is persisted, outside the target root.
    pub state_dir: PathBuf,

    /// Ordered mkinitcpio hook list written into the target; must contain
    /// `encrypt` ahead of `filesystems`.
    pub initramfs_hooks: Vec<String>,

    /// Optional URL of a newline-delimited package list replacing `packages`.
    pub package_list_url: Option<String>,

    /// Optional URL of a second-stage script placed into the target root.
    pub post_install_url: Option<String>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            default_username: "admin".into(),
            reserved_usernames: [
                "root",
                "bin",
                "daemon",
                "mail",
                "ftp",
                "http",
                "nobody",
                "dbus",
                "systemd-journal",
            ]
            .map(String::from)
            .to_vec(),
            packages: [
                "base",
                "base-devel",
                "linux",
                "linux-firmware",
                "mkinitcpio",
                "grub",
                "efibootmgr",
                "networkmanager",
                "sudo",
                "vim",
            ]
            .map(String::from)
            .to_vec(),
            daemons: vec!["NetworkManager".into()],
            locale: "en_US.UTF-8".into(),
            timezone: "Europe/London".into(),
            esp_size_mib: 500,
            boot_size_mib: 2048,
            mapper_name: "cryptroot".into(),
            target_root: "/mnt/archstrap".into(),
            state_dir: "/var/lib/archstrap".into(),
            initramfs_hooks: [
                "base",
                "udev",
                "autodetect",
                "modconf",
                "kms",
                "keyboard",
                "keymap",
                "consolefont",
                "block",
                "encrypt",
                "filesystems",
                "fsck",
            ]
            .map(String::from)
            .to_vec(),
            package_list_url: None,
            post_install_url: None,
        }
    }
}

impl InstallConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("bad config file {}", path.display()))
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() -> Result<()> {
        let config: InstallConfig = toml::from_str("")?;
        assert_eq!(config, InstallConfig::default());
        Ok(())
    }

    #[test]
    fn partial_override_keeps_other_defaults() -> Result<()> {
        let raw = r#"
            default_username = "paul"
            boot_size_mib = 1024
        "#;
        let config: InstallConfig = toml::from_str(raw)?;
        assert_eq!(config.default_username, "paul");
        assert_eq!(config.boot_size_mib, 1024);
        assert_eq!(config.esp_size_mib, 500);
        assert_eq!(config.mapper_name, "cryptroot");
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<InstallConfig>("not_a_key = 1").is_err());
    }

    #[test]
    fn default_hooks_decrypt_before_filesystems() {
        let config = InstallConfig::default();
        let encrypt = config
            .initramfs_hooks
            .iter()
            .position(|h| h == "encrypt")
            .expect("encrypt hook present");
        let filesystems = config
            .initramfs_hooks
            .iter()
            .position(|h| h == "filesystems")
            .expect("filesystems hook present");
        assert!(encrypt < filesystems);
    }
}
