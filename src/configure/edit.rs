use std::path::Path;

use anyhow::{Context, Result};

/// Copy-then-edit: every configuration file is backed up next to itself
/// before it is rewritten, so a botched sub-step leaves the original
/// recoverable by hand.
pub async fn backup_then_write(path: &Path, content: &str) -> Result<()> {
    let backup = backup_path(path);
    if path.exists() && !backup.exists() {
        tokio::fs::copy(path, &backup)
            .await
            .with_context(|| format!("failed to back up {}", path.display()))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn backup_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

/// Uncomments the requested locale in locale.gen. Lines like
/// `#en_US.UTF-8 UTF-8` become active; everything else is untouched.
pub fn enable_locale(locale_gen: &str, locale: &str) -> String {
    locale_gen
        .lines()
        .map(|line| {
            let uncommented = line.trim_start_matches('#').trim_start();
            if uncommented.starts_with(locale)
                && uncommented[locale.len()..].starts_with(char::is_whitespace)
            {
                uncommented.to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

/// Disables the active `HOOKS=` line and appends an explicit ordered list.
/// The original line is kept, commented, for the operator to compare.
pub fn rewrite_hooks(mkinitcpio_conf: &str, hooks: &[String]) -> String {
    let mut out: Vec<String> = mkinitcpio_conf
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("HOOKS=") {
                format!("#{line}")
            } else {
                line.to_string()
            }
        })
        .collect();
    out.push(format!("HOOKS=({})", hooks.join(" ")));
    out.join("\n") + "\n"
}

/// Disables the active default kernel command line and appends one that
/// unlocks the root volume by stable UUID. The mapped name and the mapper
/// root device ride along; a transient partition path never appears.
pub fn rewrite_kernel_cmdline(grub_default: &str, luks_uuid: &str, mapper_name: &str) -> String {
    let mut out: Vec<String> = grub_default
        .lines()
        .map(|line| {
            let t = line.trim_start();
            if t.starts_with("GRUB_CMDLINE_LINUX_DEFAULT=") || t.starts_with("GRUB_ENABLE_CRYPTODISK=")
            {
                format!("#{line}")
            } else {
                line.to_string()
            }
        })
        .collect();
    out.push(format!(
        "GRUB_CMDLINE_LINUX_DEFAULT=\"loglevel=3 quiet cryptdevice=UUID={luks_uuid}:{mapper_name} root=/dev/mapper/{mapper_name}\""
    ));
    out.push("GRUB_ENABLE_CRYPTODISK=y".to_string());
    out.join("\n") + "\n"
}

/// Shutdown/Restart entries appended to the custom boot menu script.
pub fn custom_menu_entries() -> &'static str {
    r#"
menuentry "Restart" {
    reboot
}

menuentry "Shutdown" {
    halt
}
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_path_appends_bak() {
        assert_eq!(
            backup_path(Path::new("/etc/default/grub")),
            Path::new("/etc/default/grub.bak")
        );
    }

    #[tokio::test]
    async fn first_edit_creates_a_backup_and_later_edits_keep_it() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("grub");
        tokio::fs::write(&file, "original").await?;

        backup_then_write(&file, "edited once").await?;
        backup_then_write(&file, "edited twice").await?;

        let backup = tokio::fs::read_to_string(dir.path().join("grub.bak")).await?;
        assert_eq!(backup, "original");
        let current = tokio::fs::read_to_string(&file).await?;
        assert_eq!(current, "edited twice");
        Ok(())
    }

    #[test]
    fn locale_is_uncommented_exactly() {
        let gen = "#de_DE.UTF-8 UTF-8\n#en_US.UTF-8 UTF-8\n#en_US ISO-8859-1\n";
        let out = enable_locale(gen, "en_US.UTF-8");
        assert!(out.contains("\nen_US.UTF-8 UTF-8"));
        assert!(out.contains("#de_DE.UTF-8 UTF-8"));
        // The ISO variant shares a prefix but is not the requested locale.
        assert!(out.contains("#en_US ISO-8859-1"));
    }

    #[test]
    fn hooks_line_is_disabled_and_replaced() {
        let conf = "MODULES=()\nHOOKS=(base udev autodetect block filesystems)\n";
        let hooks: Vec<String> = ["base", "udev", "block", "encrypt", "filesystems"]
            .map(String::from)
            .to_vec();
        let out = rewrite_hooks(conf, &hooks);
        assert!(out.contains("#HOOKS=(base udev autodetect block filesystems)"));
        assert!(out.ends_with("HOOKS=(base udev block encrypt filesystems)\n"));
        assert!(out.contains("MODULES=()"));
    }

    #[test]
    fn kernel_cmdline_references_the_volume_by_uuid() {
        let grub = "GRUB_TIMEOUT=5\nGRUB_CMDLINE_LINUX_DEFAULT=\"loglevel=3 quiet\"\n";
        let uuid = "0b2f9c3a-8d1e-4e2a-b44e-2f4f2a6a7c1d";
        let out = rewrite_kernel_cmdline(grub, uuid, "cryptroot");
        assert!(out.contains("#GRUB_CMDLINE_LINUX_DEFAULT=\"loglevel=3 quiet\""));
        assert!(out.contains(&format!("cryptdevice=UUID={uuid}:cryptroot")));
        assert!(out.contains("root=/dev/mapper/cryptroot"));
        assert!(out.contains("GRUB_ENABLE_CRYPTODISK=y"));
        // Never by device path.
        assert!(!out.contains("cryptdevice=/dev/"));
    }

    #[test]
    fn menu_entries_cover_restart_and_shutdown() {
        let entries = custom_menu_entries();
        assert!(entries.contains("menuentry \"Restart\""));
        assert!(entries.contains("menuentry \"Shutdown\""));
    }
}
