//! Per-payload installer abstraction (components C6/C10, spec §9):
//! "a two-variant sum with a common capability contract... Use a tagged
//! variant rather than subtype polymorphism; dispatch at the
//! state-machine boundary." [`PayloadInstaller`] is that tagged union;
//! [`invoker`] implements the external Update Module side (C6) and
//! [`stream_bridge`] implements its FIFO delivery protocol (C7). The
//! built-in rootfs variant lives in [`crate::rootfs`] (C10).

pub mod invoker;
pub mod stream_bridge;
pub mod workdir;

use anyhow::Result;

use crate::rootfs::RootfsInstaller;
use crate::state_machine::ModuleCapabilities;
use invoker::ModuleInvoker;

/// A single line of stdout from a module's capability query (spec
/// §4.6: "`SupportsRollback` and `NeedsArtifactReboot` consume exactly
/// one line of output").
#[derive(Debug, Clone)]
pub struct ModuleReply(pub String);

/// The per-payload installer: either the built-in dual-rootfs writer or
/// an external Update Module child process, behind one shared contract.
pub enum PayloadInstaller {
    /// C10: in-process dual-rootfs installer.
    Rootfs(RootfsInstaller),
    /// C6: external Update Module child process.
    Module(ModuleInvoker),
}

impl PayloadInstaller {
    /// Run `ArtifactInstall` for the payload at `index`.
    pub async fn install(&mut self, index: usize) -> Result<ModuleCapabilities> {
        match self {
            Self::Rootfs(r) => r.install(index).await,
            Self::Module(m) => m.install(index).await,
        }
    }

    /// Run `ArtifactCommit`.
    pub async fn commit(&mut self) -> Result<()> {
        match self {
            Self::Rootfs(r) => r.commit().await,
            Self::Module(m) => m.commit().await,
        }
    }

    /// Run `ArtifactRollback` for the payload at `index`.
    pub async fn rollback(&mut self, index: usize) -> Result<ModuleCapabilities> {
        match self {
            Self::Rootfs(r) => r.rollback(index).await,
            Self::Module(m) => m.rollback(index).await,
        }
    }

    /// Invoke the reboot collaborator and wait out the grace window
    /// (spec §4.9 step 2+3); returns `Ok(())` only if the process is
    /// still alive after the wait, which the caller treats as failure.
    pub async fn reboot_now(&mut self) -> Result<()> {
        match self {
            Self::Rootfs(r) => r.reboot_now().await,
            Self::Module(m) => m.reboot_now().await,
        }
    }

    /// The capabilities last observed from this installer (used when
    /// routing the failure path without a fresh `install()` result).
    pub fn capabilities(&self) -> ModuleCapabilities {
        match self {
            Self::Rootfs(r) => r.capabilities(),
            Self::Module(m) => m.capabilities(),
        }
    }

    /// Run `Cleanup`; a no-op if the work directory is already gone
    /// (spec §4.6).
    pub async fn cleanup(&mut self) -> Result<()> {
        match self {
            Self::Rootfs(r) => r.cleanup().await,
            Self::Module(m) => m.cleanup().await,
        }
    }
}
