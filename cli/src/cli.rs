//! Command line surface (spec.md §6 "CLI surface"), grounded on the
//! teacher's `clap::Parser` derive usage in `lib/src/cli.rs`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// A device-side software update agent.
#[derive(Debug, Parser)]
#[command(name = "supdated", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = supdated_lib::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// One verb per invocation (spec.md §6).
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the current artifact name (or `Unknown`) and exit.
    ShowArtifact,
    /// Print `key=value` for every key in the provides store.
    ShowProvides,
    /// Perform Download through ArtifactInstall.
    Install(InstallOpts),
    /// Advance an uncommitted install to Commit.
    Commit,
    /// Revert an uncommitted install.
    Rollback,
    /// Run the full state machine indefinitely against a remote server.
    Daemon,
}

/// Options for `install`.
#[derive(Debug, Parser)]
pub struct InstallOpts {
    /// A local path or URL to an artifact.
    pub path_or_url: String,

    /// Exit with code 4 instead of blocking when a reboot is required.
    #[arg(long)]
    pub reboot_exit_code: bool,
}
