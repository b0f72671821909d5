//! Update Module invoker (component C6, spec §4.6): spawns the
//! per-payload installer binary against a prepared work directory,
//! enforces a timeout with SIGTERM-then-SIGKILL, and interprets its
//! exit code and stdout per the state-indexed protocol.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::EngineError;
use crate::module::stream_bridge::{PayloadSource, StreamBridge};
use crate::module::workdir::WorkDir;
use crate::module::ModuleReply;
use crate::state_machine::{ModuleCapabilities, RebootCollaborator, RebootRequirement, REBOOT_WAIT};
use crate::store::Provides;

/// Grace period between SIGTERM and SIGKILL on timeout (spec §4.6, §5).
const KILL_GRACE: Duration = Duration::from_secs(5);

/// A retry budget: how many times a state invocation may return exit
/// code 21 before the engine gives up (spec §4.6, §4.8).
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    /// Maximum retry attempts.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: Duration::from_secs(30),
        }
    }
}

/// The external Update Module side of the tagged [`super::PayloadInstaller`].
pub struct ModuleInvoker {
    binary: PathBuf,
    datastore: PathBuf,
    index: usize,
    context: InstallContext,
    timeout: Duration,
    retry: RetryBudget,
    payload_source: Option<PayloadSource>,
    reboot: Box<dyn RebootCollaborator + Send + Sync>,
    last_caps: ModuleCapabilities,
}

impl ModuleInvoker {
    /// Build an invoker for one payload, given its already-resolved
    /// delivery mode (files already hash-verified to a temp location, or
    /// a streaming source still to be drained).
    pub fn new(
        binary: PathBuf,
        datastore: PathBuf,
        index: usize,
        context: InstallContext,
        timeout: Duration,
        payload_source: PayloadSource,
        reboot: Box<dyn RebootCollaborator + Send + Sync>,
    ) -> Self {
        Self {
            binary,
            datastore,
            index,
            context,
            timeout,
            retry: RetryBudget::default(),
            payload_source: Some(payload_source),
            reboot,
            last_caps: ModuleCapabilities::default(),
        }
    }

    fn workdir(&self) -> WorkDir {
        WorkDir::new(&self.datastore, self.index)
    }

    /// Run `ArtifactInstall`, then query `SupportsRollback` and
    /// `NeedsArtifactReboot` (spec §4.6's state-indexed stdout protocol).
    pub async fn install(&mut self, _index: usize) -> Result<ModuleCapabilities> {
        let work = self.workdir();
        let ctx = &self.context;
        work.prepare(
            &ctx.device_type,
            &ctx.current,
            &ctx.header_info_json,
            &ctx.type_info_json,
            ctx.meta_data_json.as_deref(),
            &ctx.payload_type,
            &ctx.incoming_artifact_name,
            ctx.incoming_artifact_group.as_deref(),
        )?;
        match self.payload_source.take() {
            Some(PayloadSource::Streamed(files)) => {
                // Spec §4.7: the bridge runs "in parallel with the
                // module" — the module's ArtifactInstall read of the
                // FIFOs and the engine's write side must be concurrent,
                // or the blocking opens on each side would deadlock.
                let bridge = StreamBridge::new(work.path());
                let (status_stdout, _) = tokio::try_join!(self.run_once("ArtifactInstall"), bridge.serve(files))?;
                self.require_success("ArtifactInstall", status_stdout)?;
            }
            Some(PayloadSource::Files(_)) | None => {
                self.invoke_state("ArtifactInstall").await?;
            }
        }
        let supports_rollback = self.query_reply("SupportsRollback").await?.supports_rollback()?;
        let needs_reboot = self.query_reply("NeedsArtifactReboot").await?.reboot_requirement()?;
        self.last_caps = ModuleCapabilities {
            supports_rollback,
            needs_reboot,
        };
        Ok(self.last_caps)
    }

    /// Run `ArtifactCommit`.
    pub async fn commit(&mut self) -> Result<()> {
        self.invoke_state("ArtifactCommit").await.map(drop)
    }

    /// Run `ArtifactRollback`, then re-query reboot requirement for the
    /// rollback itself.
    pub async fn rollback(&mut self, _index: usize) -> Result<ModuleCapabilities> {
        self.invoke_state("ArtifactRollback").await?;
        let needs_reboot = self.query_reply("NeedsArtifactReboot").await?.reboot_requirement()?;
        self.last_caps.needs_reboot = needs_reboot;
        Ok(self.last_caps)
    }

    /// Invoke the reboot collaborator and wait out the grace window.
    pub async fn reboot_now(&mut self) -> Result<()> {
        self.reboot.reboot()?;
        tokio::time::sleep(REBOOT_WAIT).await;
        Ok(())
    }

    /// Last observed capabilities, for failure-path dispatch without a
    /// fresh install/rollback round trip.
    pub fn capabilities(&self) -> ModuleCapabilities {
        self.last_caps
    }

    /// `Cleanup`; removes the work directory (a no-op if already gone).
    pub async fn cleanup(&mut self) -> Result<()> {
        self.invoke_state("Cleanup").await?;
        self.workdir().remove()
    }

    async fn query_reply(&self, state: &str) -> Result<ModuleReply> {
        let (_, stdout) = self.run_once(state).await?;
        let mut lines = stdout.lines();
        let first = lines
            .next()
            .ok_or_else(|| EngineError::ProtocolError(format!("{state}: no output")))?;
        if lines.next().is_some() {
            anyhow::bail!(EngineError::ProtocolError(format!("{state}: more than one line of output")));
        }
        Ok(ModuleReply(first.to_string()))
    }

    fn require_success(&self, state: &str, (status, stdout): (Option<i32>, String)) -> Result<String> {
        match status {
            Some(0) => Ok(stdout),
            Some(code) => anyhow::bail!(EngineError::ModuleFailed(format!("{state}: exit code {code}"))),
            None => anyhow::bail!(EngineError::ModuleFailed(format!("{state}: killed by signal"))),
        }
    }

    async fn invoke_state(&self, state: &str) -> Result<String> {
        for attempt in 0..=self.retry.max_attempts {
            let (status, stdout) = self.run_once(state).await?;
            match status {
                Some(0) => return Ok(stdout),
                Some(21) if attempt < self.retry.max_attempts => {
                    tracing::info!(state, attempt, "module requested retry");
                    tokio::time::sleep(self.retry.interval).await;
                    continue;
                }
                Some(21) => anyhow::bail!(EngineError::ModuleFailed(format!("{state}: retry budget exhausted"))),
                Some(code) => anyhow::bail!(EngineError::ModuleFailed(format!("{state}: exit code {code}"))),
                None => anyhow::bail!(EngineError::ModuleFailed(format!("{state}: killed by signal"))),
            }
        }
        unreachable!("loop always returns or bails")
    }

    async fn run_once(&self, state: &str) -> Result<(Option<i32>, String)> {
        let work = self.workdir();
        let mut cmd = Command::new(&self.binary);
        cmd.arg(state)
            .arg(work.path())
            .current_dir(work.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning module for state {state}"))?;

        let wait = async {
            let mut stdout = String::new();
            if let Some(mut s) = child.stdout.take() {
                let _ = s.read_to_string(&mut stdout).await;
            }
            let status = child.wait().await?;
            anyhow::Ok((status, stdout))
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(Ok((status, stdout))) => Ok((status.code(), stdout)),
            Ok(Err(e)) => Err(e).context("waiting for module"),
            Err(_) => {
                let _ = child.start_kill();
                tokio::time::sleep(KILL_GRACE).await;
                let _ = child.start_kill();
                anyhow::bail!(EngineError::ModuleTimeout)
            }
        }
    }

    /// Device type this invoker was configured for; exposed for callers
    /// building the next payload's [`InstallContext`] without re-reading
    /// configuration.
    pub fn device_type(&self) -> &str {
        &self.context.device_type
    }
}

/// Pre-resolved header/provides context a work directory is populated
/// from before the module is invoked (spec §6's fixed work-directory
/// file tree).
pub struct InstallContext {
    /// The device type string to write to `current_device_type`.
    pub device_type: String,
    /// Currently-booted provides snapshot (`current_artifact_name`,
    /// `current_artifact_group`).
    pub current: Provides,
    /// Serialized `header-info` JSON for `header/header_info`.
    pub header_info_json: Vec<u8>,
    /// Serialized `type-info` JSON for `header/type_info`.
    pub type_info_json: Vec<u8>,
    /// Serialized `meta-data` JSON for `header/meta-data`, if present.
    pub meta_data_json: Option<Vec<u8>>,
    /// This payload's declared type, for `header/payload_type`.
    pub payload_type: String,
    /// The incoming artifact's name, for `header/artifact_name`.
    pub incoming_artifact_name: String,
    /// The incoming artifact's group, for `header/artifact_group`.
    pub incoming_artifact_group: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;
    use crate::reboot::test_support::RecordingReboot;

    fn fake_module(dir: &Path) -> PathBuf {
        let script = dir.join("module.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncase \"$1\" in\n\
             ArtifactInstall) exit 0 ;;\n\
             ArtifactCommit) exit 0 ;;\n\
             ArtifactRollback) exit 0 ;;\n\
             SupportsRollback) echo Yes ;;\n\
             NeedsArtifactReboot) echo No ;;\n\
             Cleanup) exit 0 ;;\n\
             *) exit 1 ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn context() -> InstallContext {
        InstallContext {
            device_type: "qemux86-64".to_string(),
            current: Provides::default(),
            header_info_json: b"{}".to_vec(),
            type_info_json: b"{}".to_vec(),
            meta_data_json: None,
            payload_type: "rootfs-image".to_string(),
            incoming_artifact_name: "release-42".to_string(),
            incoming_artifact_group: None,
        }
    }

    fn invoker(datastore: &Path) -> ModuleInvoker {
        ModuleInvoker::new(
            fake_module(datastore),
            datastore.to_path_buf(),
            0,
            context(),
            Duration::from_secs(5),
            PayloadSource::Files(vec![]),
            Box::new(RecordingReboot::default()),
        )
    }

    #[tokio::test]
    async fn install_prepares_workdir_and_reads_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invoker(dir.path());

        let caps = inv.install(0).await.unwrap();
        assert!(caps.supports_rollback);
        assert_eq!(caps.needs_reboot, RebootRequirement::No);
        assert_eq!(inv.device_type(), "qemux86-64");

        let workdir = inv.workdir();
        assert!(workdir.path().join("version").exists());
        assert_eq!(std::fs::read(workdir.path().join("header/artifact_name")).unwrap(), b"release-42");
    }

    #[tokio::test]
    async fn cleanup_removes_the_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invoker(dir.path());
        inv.install(0).await.unwrap();
        let workdir = inv.workdir();
        assert!(workdir.path().exists());

        inv.cleanup().await.unwrap();
        assert!(!workdir.path().exists());
    }

    #[tokio::test]
    async fn timeout_kills_the_child_and_reports_module_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context();
        ctx.payload_type = "rootfs-image".to_string();
        let mut inv = ModuleInvoker::new(
            {
                let script = dir.path().join("slow.sh");
                std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
                std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
                script
            },
            dir.path().to_path_buf(),
            0,
            ctx,
            Duration::from_millis(50),
            PayloadSource::Files(vec![]),
            Box::new(RecordingReboot::default()),
        );

        let err = inv.install(0).await.unwrap_err();
        assert!(err.downcast_ref::<EngineError>().is_some());
    }

    #[test]
    fn retry_budget_defaults_match_protocol() {
        let budget = RetryBudget::default();
        assert_eq!(budget.max_attempts, 3);
        assert_eq!(budget.interval, Duration::from_secs(30));
    }
}
