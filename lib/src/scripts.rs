//! State scripts runner (component C8, spec §4.8) and the script-name
//! grammar shared with the artifact parser (spec §3, §6).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::EngineError;
use crate::state_machine::{Action, State};

/// Bit-exact regex from spec §6. Two groups: the state family (Artifact
/// states in the `Install`..`Failure` family, or the bare pre-Artifact
/// names) and the action, plus the mandatory two-digit ordering prefix.
static SCRIPT_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(ArtifactInstall|ArtifactReboot|ArtifactRollback|ArtifactRollbackReboot|ArtifactCommit|ArtifactFailure|Download|Sync|Idle)_(Enter|Leave|Error)_([0-9]{2})(_\S+)?$",
    )
    .expect("static script name regex")
});

/// A parsed, validated script file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptName {
    /// The raw file name, kept for sorting and invocation.
    pub raw: String,
    /// The state family this script runs at.
    pub state: String,
    /// Enter / Leave / Error.
    pub action: String,
    /// Two-digit ordering key.
    pub order: u8,
}

impl ScriptName {
    /// Validate a file name against the spec §6 grammar.
    pub fn parse(name: &str) -> Result<Self, EngineError> {
        let caps = SCRIPT_NAME_RE
            .captures(name)
            .ok_or_else(|| EngineError::ParseError(format!("invalid script name: {name}")))?;
        let order: u8 = caps[3]
            .parse()
            .map_err(|_| EngineError::ParseError(format!("invalid script ordering: {name}")))?;
        Ok(Self {
            raw: name.to_string(),
            state: caps[1].to_string(),
            action: caps[2].to_string(),
            order,
        })
    }
}

/// Outcome of one script invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// Exit code 0.
    Success,
    /// Exit code 21: caller should retry, budget permitting.
    Retry,
    /// Any other non-zero exit, or a timeout.
    Failed,
}

/// Contract for the `version` file guard (spec §4.8).
pub fn check_version_file(scripts_dir: &Path) -> Result<()> {
    let path = scripts_dir.join("version");
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            if content.trim() != "3" {
                anyhow::bail!(EngineError::ParseError(format!(
                    "scripts version file must contain \"3\", found {:?}",
                    content
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("reading scripts version file"),
    }
}

/// Find, sort, and filter scripts applicable to a `(state, action)` pair.
///
/// Sorting is lexicographic by filename, which the fixed two-digit prefix
/// turns into numeric ordering (spec §4.8).
pub fn scripts_for(scripts_dir: &Path, state: State, action: Action) -> Result<Vec<PathBuf>> {
    let prefix = format!("{}_{}_", state.script_name(), action.script_name());
    let mut matches = Vec::new();
    let rd = match std::fs::read_dir(scripts_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context("reading scripts directory"),
    };
    for entry in rd {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == "version" {
            continue;
        }
        if ScriptName::parse(name).is_err() {
            continue;
        }
        if name.starts_with(&prefix) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Execute a single state script with a timeout, interpreting its exit
/// code per spec §4.8.
pub async fn run_script(path: &Path, timeout: Duration) -> Result<ScriptOutcome> {
    let mut cmd = Command::new(path);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning script {}", path.display()))?;

    let wait = async {
        let status = child.wait().await?;
        let mut stderr = String::new();
        if let Some(mut s) = child.stderr.take() {
            let _ = s.read_to_string(&mut stderr).await;
        }
        anyhow::Ok((status, stderr))
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok((status, stderr))) => match status.code() {
            Some(0) => Ok(ScriptOutcome::Success),
            Some(21) => Ok(ScriptOutcome::Retry),
            Some(code) => {
                tracing::warn!(%code, script=%path.display(), %stderr, "state script failed");
                Ok(ScriptOutcome::Failed)
            }
            None => Ok(ScriptOutcome::Failed),
        },
        Ok(Err(e)) => Err(e).context("waiting for script"),
        Err(_) => {
            let _ = child.start_kill();
            Ok(ScriptOutcome::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_artifact_script_names() {
        for name in [
            "ArtifactInstall_Enter_00",
            "ArtifactInstall_Enter_00_mycheck",
            "ArtifactRollbackReboot_Error_99",
            "Download_Enter_01",
            "Sync_Leave_05",
        ] {
            ScriptName::parse(name).unwrap();
        }
    }

    #[test]
    fn invalid_script_names_rejected() {
        for name in [
            "ArtifactInstall_Enter_0",
            "ArtifactInstall_Foo_00",
            "artifactinstall_Enter_00",
            "ArtifactInstall_Enter_00_",
        ] {
            assert!(ScriptName::parse(name).is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn sorting_is_numeric_via_fixed_width_prefix() {
        let names = vec!["ArtifactInstall_Enter_10", "ArtifactInstall_Enter_02", "ArtifactInstall_Enter_01"];
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["ArtifactInstall_Enter_01", "ArtifactInstall_Enter_02", "ArtifactInstall_Enter_10"]);
    }
}
