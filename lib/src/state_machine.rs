//! Update state machine (component C9, spec §4.9): sequences a single
//! update through Download → Install → Reboot → Commit or a rollback
//! path, persisting a checkpoint through [`crate::store`] at every
//! boundary.
//!
//! Grounded on the teacher's `deploy.rs`/`status.rs` split between "what
//! state are we in" and "what do we do about it" — here folded into one
//! module because the alphabet is small and the transition table is the
//! crux of the whole engine.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::artifact::header::Header;
use crate::depends;
use crate::error::{EngineError, FailureAccumulator};
use crate::module::{ModuleReply, PayloadInstaller};
use crate::scripts;
use crate::store::{ProvidesStore, StateData};

/// One state in the update lifecycle (spec §4.9's alphabet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Nothing in progress.
    Idle,
    /// Checking in / resolving an update source.
    Sync,
    /// Streaming the artifact and validating it.
    Download,
    /// Running the installer against the downloaded payload(s).
    ArtifactInstall,
    /// Waiting on (or performing) a reboot the install required.
    ArtifactReboot,
    /// Finalizing a successful install.
    ArtifactCommit,
    /// Undoing a failed install.
    ArtifactRollback,
    /// Waiting on (or performing) a reboot the rollback required.
    ArtifactRollbackReboot,
    /// Terminal failure state; runs failure scripts.
    ArtifactFailure,
    /// Releasing work directories and returning to Idle.
    Cleanup,
}

impl State {
    /// The file-name-prefix spelling used by state scripts and work-tree
    /// paths (spec §6).
    pub fn script_name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Sync => "Sync",
            Self::Download => "Download",
            Self::ArtifactInstall => "ArtifactInstall",
            Self::ArtifactReboot => "ArtifactReboot",
            Self::ArtifactCommit => "ArtifactCommit",
            Self::ArtifactRollback => "ArtifactRollback",
            Self::ArtifactRollbackReboot => "ArtifactRollbackReboot",
            Self::ArtifactFailure => "ArtifactFailure",
            Self::Cleanup => "Cleanup",
        }
    }

    /// True for the `Artifact*` family, which gets Enter/Leave/Error
    /// script action points (spec §4.9).
    pub fn is_artifact_state(self) -> bool {
        !matches!(self, Self::Idle | Self::Sync | Self::Download | Self::Cleanup)
    }
}

/// A script or module invocation point within a state (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Entering the state, before its side effect runs.
    Enter,
    /// Leaving the state, after its side effect succeeded.
    Leave,
    /// Routed here because `Enter` or `Leave` failed.
    Error,
}

impl Action {
    /// The spelling used in script file names (spec §6).
    pub fn script_name(self) -> &'static str {
        match self {
            Self::Enter => "Enter",
            Self::Leave => "Leave",
            Self::Error => "Error",
        }
    }
}

/// What a completed transition reported about the reboot it may need
/// (spec §4.6's `NeedsArtifactReboot` / `SupportsRollback` protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleCapabilities {
    /// Whether the module can roll back a failed install.
    pub supports_rollback: bool,
    /// Whether (and how) a reboot is required to finish the install.
    pub needs_reboot: RebootRequirement,
}

/// The three-way answer to `NeedsArtifactReboot` (spec §4.6, §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebootRequirement {
    /// No reboot needed; `ArtifactReboot` is skipped.
    #[default]
    No,
    /// The engine should reboot itself.
    Automatic,
    /// A reboot is needed but is the caller's responsibility (CLI
    /// `--reboot-exit-code`); the engine stops and reports it.
    Yes,
}

impl ModuleReply {
    /// Parse a `Yes|No|Automatic` single-line stdout reply (spec §4.6).
    pub fn reboot_requirement(&self) -> Result<RebootRequirement, EngineError> {
        match self.0.as_str() {
            "No" => Ok(RebootRequirement::No),
            "Yes" => Ok(RebootRequirement::Yes),
            "Automatic" => Ok(RebootRequirement::Automatic),
            other => Err(EngineError::ProtocolError(format!(
                "expected Yes|No|Automatic, got {other:?}"
            ))),
        }
    }

    /// Parse a `Yes|No` single-line stdout reply (spec §4.6).
    pub fn supports_rollback(&self) -> Result<bool, EngineError> {
        match self.0.as_str() {
            "Yes" => Ok(true),
            "No" => Ok(false),
            other => Err(EngineError::ProtocolError(format!("expected Yes|No, got {other:?}"))),
        }
    }
}

/// Abstracted reboot collaborator (spec §4.9, §9's "abstracted reboot
/// collaborator" open-ended requirement). A real implementation calls
/// `reboot(2)`; tests substitute a recording fake.
pub trait RebootCollaborator {
    /// Request an immediate reboot. Per spec, a well-behaved
    /// implementation does not return on success — the process is torn
    /// down by the kernel. Returning `Ok(())` means the call itself
    /// completed without error but the reboot did not happen within the
    /// allotted wait, which the caller treats as `RebootFailed`.
    fn reboot(&self) -> Result<()>;
}

/// How long the engine waits for an initiated reboot to actually take
/// the process down before giving up (spec §4.9 step 3: "up to 10
/// minutes").
pub const REBOOT_WAIT: Duration = Duration::from_secs(10 * 60);

/// Drives one update through its full lifecycle. Holds no installer or
/// store state itself — both are passed in per call so the same engine
/// instance can service CLI one-shot verbs and the daemon loop.
pub struct Engine<'a> {
    store: &'a ProvidesStore,
    scripts_dir: &'a Path,
    script_timeout: Duration,
    device_type: &'a str,
}

impl<'a> Engine<'a> {
    /// Build an engine bound to a store, a scripts directory, and the
    /// device type `depends.device_type` is checked against (spec §4.5).
    pub fn new(store: &'a ProvidesStore, scripts_dir: &'a Path, script_timeout: Duration, device_type: &'a str) -> Self {
        Self {
            store,
            scripts_dir,
            script_timeout,
            device_type,
        }
    }

    /// Called at process start. Per spec §4.9 "Spontaneous-reboot
    /// detection": if a checkpoint exists in a non-`Idle` state and
    /// wasn't marked reboot-safe, this was an unplanned reboot — route
    /// through the failure path of the in-progress state rather than
    /// resuming it.
    pub async fn resume_or_recover(&self, installer: &mut PayloadInstaller) -> Result<State> {
        let Some(checkpoint) = self.store.read_state_data()? else {
            return Ok(State::Idle);
        };
        if checkpoint.state == State::Idle {
            return Ok(State::Idle);
        }
        if checkpoint.reboot_safe {
            return Ok(checkpoint.state);
        }
        tracing::warn!(state = ?checkpoint.state, "spontaneous reboot detected, routing to failure path");
        let mut failures = FailureAccumulator::default();
        let header_json = checkpoint.header_json.clone();
        self.run_failure_path(installer, checkpoint.payload_index, &mut failures, header_json)
            .await?;
        Ok(State::Idle)
    }

    /// Persist a checkpoint before any side effect of the transition it
    /// marks, per spec §4.9's persistence cadence and §5's ordering
    /// guarantee.
    fn checkpoint(
        &self,
        state: State,
        payload_index: usize,
        update_name: Option<String>,
        reboot_safe: bool,
        header_json: Option<Vec<u8>>,
    ) -> Result<()> {
        self.store
            .write_state_data(&StateData::new(state, payload_index, update_name, reboot_safe, header_json))
    }

    /// Run Enter/Leave scripts around `body`, routing to the Error
    /// action and returning an error if either Enter, `body`, or Leave
    /// fails. Non-artifact states (`Idle`, `Sync`, `Download`,
    /// `Cleanup`) still get script points per spec §4.8's grammar,
    /// which names `Download`/`Sync`/`Idle` prefixes explicitly.
    async fn with_scripts<T>(&self, state: State, body: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        if let Err(e) = self.run_action_scripts(state, Action::Enter).await {
            self.run_action_scripts(state, Action::Error).await.ok();
            return Err(e);
        }
        match body.await {
            Ok(value) => {
                if let Err(e) = self.run_action_scripts(state, Action::Leave).await {
                    self.run_action_scripts(state, Action::Error).await.ok();
                    return Err(e);
                }
                Ok(value)
            }
            Err(e) => {
                self.run_action_scripts(state, Action::Error).await.ok();
                Err(e)
            }
        }
    }

    async fn run_action_scripts(&self, state: State, action: Action) -> Result<()> {
        scripts::check_version_file(self.scripts_dir)?;
        for path in scripts::scripts_for(self.scripts_dir, state, action)? {
            match scripts::run_script(&path, self.script_timeout).await? {
                scripts::ScriptOutcome::Success => {}
                scripts::ScriptOutcome::Retry => {
                    anyhow::bail!(EngineError::ModuleFailed(format!(
                        "script {} requested retry",
                        path.display()
                    )));
                }
                scripts::ScriptOutcome::Failed => {
                    if action == Action::Error {
                        tracing::warn!(script = %path.display(), "error-action script failed, continuing");
                    } else {
                        anyhow::bail!(EngineError::ModuleFailed(format!("script {} failed", path.display())));
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the full happy-path lifecycle for a single artifact, spec
    /// §4.9: `Idle → Sync → Download → ArtifactInstall → ArtifactReboot?
    /// → ArtifactCommit → Cleanup → Idle`. Checks `header`'s depends
    /// against the current provides (spec §4.5 steps 1-4) before
    /// touching the installer, and applies the clears-then-merge commit
    /// rule per sub-header plus the identity overwrite at `ArtifactCommit`
    /// (spec §4.5 commit rules 1-3). On any failure, switches to
    /// [`Self::run_failure_path`] instead.
    pub async fn run_update(&self, installer: &mut PayloadInstaller, header: &Header, update_name: &str) -> Result<()> {
        let current = self.store.load_provides()?;
        depends::check(header, self.device_type, &current)?;
        let header_json = serde_json::to_vec(header).ok();

        self.checkpoint(State::Sync, 0, Some(update_name.to_string()), true, header_json.clone())?;
        self.with_scripts(State::Sync, async { Ok(()) }).await?;

        self.checkpoint(State::Download, 0, Some(update_name.to_string()), true, header_json.clone())?;
        self.with_scripts(State::Download, async { Ok(()) }).await?;

        let payload_count = header.sub_headers.len();
        for index in 0..payload_count {
            if let Err(e) = self.install_one(installer, index, update_name, header_json.clone()).await {
                tracing::error!(error = %e, index, "install failed, entering failure path");
                let mut failures = FailureAccumulator::default();
                failures.record_primary(e);
                self.run_failure_path(installer, index, &mut failures, header_json.clone()).await?;
                anyhow::bail!(EngineError::ModuleFailed(failures.summary()));
            }
        }

        self.checkpoint(
            State::ArtifactCommit,
            payload_count,
            Some(update_name.to_string()),
            true,
            header_json.clone(),
        )?;
        let commit_result = self
            .with_scripts(State::ArtifactCommit, async {
                installer.commit().await?;
                let mut provides = self.store.load_provides()?;
                for sub in &header.sub_headers {
                    depends::apply_commit(&mut provides, &sub.type_info)?;
                }
                depends::apply_identity(&mut provides, header);
                self.store.transaction(|txn| txn.put_provides(&provides))?;
                Ok(())
            })
            .await;
        if let Err(e) = commit_result {
            // Spec §4.11: errors during Commit are non-recoverable.
            tracing::error!(error = %e, "commit failed; device remains on new image");
            return Err(e);
        }

        self.checkpoint(State::Cleanup, 0, None, true, None)?;
        self.with_scripts(State::Cleanup, async { Ok(()) }).await?;
        self.store.clear_state_data()?;
        Ok(())
    }

    async fn install_one(
        &self,
        installer: &mut PayloadInstaller,
        index: usize,
        update_name: &str,
        header_json: Option<Vec<u8>>,
    ) -> Result<()> {
        self.checkpoint(
            State::ArtifactInstall,
            index,
            Some(update_name.to_string()),
            true,
            header_json.clone(),
        )?;
        let caps = self
            .with_scripts(State::ArtifactInstall, async { installer.install(index).await })
            .await?;

        if caps.needs_reboot != RebootRequirement::No {
            self.checkpoint(
                State::ArtifactReboot,
                index,
                Some(update_name.to_string()),
                true,
                header_json,
            )?;
            self.with_scripts(State::ArtifactReboot, self.perform_reboot(installer, caps.needs_reboot))
                .await?;
        }
        Ok(())
    }

    async fn perform_reboot(&self, installer: &mut PayloadInstaller, requirement: RebootRequirement) -> Result<()> {
        match requirement {
            RebootRequirement::No => Ok(()),
            RebootRequirement::Yes => anyhow::bail!(EngineError::RebootRequired),
            RebootRequirement::Automatic => {
                installer.reboot_now().await?;
                anyhow::bail!(EngineError::ModuleFailed("RebootFailed: reboot call returned".into()));
            }
        }
    }

    /// Failure routing (spec §4.9): `ArtifactRollback` (if supported)
    /// then `ArtifactRollbackReboot` (if the rollback needs one) then
    /// `ArtifactFailure` then `Cleanup`. Unsupported rollback skips
    /// straight to `ArtifactFailure` and marks the store inconsistent.
    async fn run_failure_path(
        &self,
        installer: &mut PayloadInstaller,
        index: usize,
        failures: &mut FailureAccumulator,
        header_json: Option<Vec<u8>>,
    ) -> Result<()> {
        let caps = installer.capabilities();
        if caps.supports_rollback {
            self.checkpoint(State::ArtifactRollback, index, None, false, header_json.clone())?;
            let rollback_result = self
                .with_scripts(State::ArtifactRollback, async { installer.rollback(index).await })
                .await;
            match rollback_result {
                Ok(rollback_caps) => {
                    if rollback_caps.needs_reboot != RebootRequirement::No {
                        self.checkpoint(State::ArtifactRollbackReboot, index, None, false, header_json.clone())?;
                        if let Err(e) = self
                            .with_scripts(State::ArtifactRollbackReboot, self.perform_reboot(installer, rollback_caps.needs_reboot))
                            .await
                        {
                            failures.record_rollback(e);
                        }
                    }
                }
                Err(e) => failures.record_rollback(e),
            }
        } else {
            self.mark_inconsistent()?;
        }

        self.checkpoint(State::ArtifactFailure, index, None, false, header_json)?;
        if let Err(e) = self.with_scripts(State::ArtifactFailure, async { Ok(()) }).await {
            failures.record_rollback(e);
        }

        self.checkpoint(State::Cleanup, 0, None, true, None)?;
        self.with_scripts(State::Cleanup, async { Ok(()) }).await.ok();
        self.store.clear_state_data()?;
        Ok(())
    }

    /// Appends the configured broken-artifact suffix to the persisted
    /// artifact name (spec §4.9: "flag the device as inconsistent").
    fn mark_inconsistent(&self) -> Result<()> {
        let mut provides = self.store.load_provides()?;
        if !provides.artifact_name.ends_with("_INCONSISTENT") {
            provides.artifact_name.push_str("_INCONSISTENT");
        }
        self.store.transaction(|txn| txn.put_provides(&provides))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_family_membership() {
        assert!(State::ArtifactInstall.is_artifact_state());
        assert!(State::ArtifactRollbackReboot.is_artifact_state());
        assert!(!State::Idle.is_artifact_state());
        assert!(!State::Sync.is_artifact_state());
        assert!(!State::Download.is_artifact_state());
        assert!(!State::Cleanup.is_artifact_state());
    }

    #[test]
    fn script_names_match_grammar() {
        assert_eq!(State::ArtifactRollbackReboot.script_name(), "ArtifactRollbackReboot");
        assert_eq!(Action::Enter.script_name(), "Enter");
    }

    #[test]
    fn reboot_requirement_parses_stdout_protocol() {
        assert_eq!(ModuleReply("No".into()).reboot_requirement().unwrap(), RebootRequirement::No);
        assert_eq!(ModuleReply("Yes".into()).reboot_requirement().unwrap(), RebootRequirement::Yes);
        assert_eq!(
            ModuleReply("Automatic".into()).reboot_requirement().unwrap(),
            RebootRequirement::Automatic
        );
        assert!(ModuleReply("Maybe".into()).reboot_requirement().is_err());
    }
}
