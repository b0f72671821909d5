//! A thin wrapper around [`std::process::Command`] for the handful of
//! one-shot system commands the engine shells out to directly (the
//! reboot collaborator). Update Modules and state scripts go through
//! `tokio::process` instead since they're awaited from the event loop;
//! this one stays synchronous because [`crate::reboot`] never returns
//! control on success.

use std::ffi::OsStr;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

/// A named, describable command invocation.
pub(crate) struct Task {
    description: String,
    cmd: Command,
}

impl Task {
    /// Build a task that runs `exe` with no arguments yet.
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        let mut cmd = Command::new(exe.as_ref());
        cmd.stdin(Stdio::null());
        Self {
            description: description.as_ref().to_string(),
            cmd,
        }
    }

    /// Append arguments.
    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Run the command, returning an error if it didn't exit successfully.
    pub(crate) fn run(mut self) -> Result<()> {
        tracing::debug!(description = %self.description, cmd = ?self.cmd, "exec");
        let status = self
            .cmd
            .status()
            .with_context(|| format!("spawning {}", self.description))?;
        if !status.success() {
            anyhow::bail!("{} failed: {status:?}", self.description);
        }
        Ok(())
    }
}
