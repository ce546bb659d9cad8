use std::fmt::Display;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a TOML configuration file overriding the built-in defaults.
    #[clap(long, short = 'c')]
    pub config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub enum Command {
    /// Run the provisioning pipeline against a target device.
    #[command(name = "run")]
    Run(RunOptions),

    /// Clear persisted pipeline state after a manual intervention.
    #[command(name = "reset")]
    Reset(ResetOptions),
}

#[derive(Parser, Debug)]
pub struct RunOptions {
    /// Target block device. The installer assumes it owns the whole device.
    pub device: PathBuf,

    /// Hostname of the installed system ([A-Za-z0-9_-], at most 20 chars).
    pub hostname: String,

    /// Username of the administrative user. Defaults to the configured one.
    pub username: Option<String>,

    /// Overwrite a device that already contains partitions.
    #[clap(long, default_value = "false")]
    pub force: bool,

    /// What to do with the mounted tree and open volume after the last
    /// stage. There is deliberately no default: tearing down finishes the
    /// installation, keeping it open is the diagnostic mode.
    #[clap(long)]
    #[arg(value_enum)]
    pub on_complete: OnComplete,

    /// Read the LUKS passphrase from this file instead of prompting.
    #[clap(long)]
    pub passphrase_file: Option<PathBuf>,

    /// Read the root password from this file instead of prompting.
    #[clap(long)]
    pub root_password_file: Option<PathBuf>,

    /// Read the user password from this file instead of prompting.
    #[clap(long)]
    pub user_password_file: Option<PathBuf>,

    /// Fetch the package list from this URL instead of the built-in set.
    #[clap(long)]
    pub package_list_url: Option<String>,

    /// Fetch a second-stage script into the target root (never executed).
    #[clap(long)]
    pub post_install_url: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ResetOptions {}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnComplete {
    /// Unmount the target tree and close the encrypted volume.
    #[clap(name = "teardown")]
    Teardown,

    /// Leave everything mounted and open for inspection.
    #[clap(name = "keep-open")]
    KeepOpen,
}

impl Display for OnComplete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnComplete::Teardown => write!(f, "teardown"),
            OnComplete::KeepOpen => write!(f, "keep-open"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_requires_an_explicit_on_complete_choice() {
        let err = Cli::try_parse_from(["archstrap", "run", "/dev/test0", "my-archbox"])
            .expect_err("missing --on-complete must not parse");
        assert!(err.to_string().contains("--on-complete"));
    }

    #[test]
    fn two_argument_form_leaves_username_unset() {
        let cli = Cli::try_parse_from([
            "archstrap",
            "run",
            "/dev/test0",
            "my-archbox",
            "--on-complete",
            "teardown",
        ])
        .unwrap();
        let Command::Run(opts) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(opts.device, PathBuf::from("/dev/test0"));
        assert_eq!(opts.hostname, "my-archbox");
        assert_eq!(opts.username, None);
        assert_eq!(opts.on_complete, OnComplete::Teardown);
        assert!(!opts.force);
    }

    #[test]
    fn legacy_three_argument_form_sets_the_username() {
        let cli = Cli::try_parse_from([
            "archstrap",
            "run",
            "/dev/test0",
            "my-archbox",
            "paul",
            "--on-complete",
            "keep-open",
        ])
        .unwrap();
        let Command::Run(opts) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(opts.username.as_deref(), Some("paul"));
        assert_eq!(opts.on_complete, OnComplete::KeepOpen);
    }
}
