//! Dual-rootfs installer (component C10, spec §4.10): the built-in
//! handler for the `"rootfs-image"` payload type. Contract surface
//! identical to the external Update Module invoker, dispatched through
//! the same [`crate::module::PayloadInstaller`] tagged union.
//!
//! Grounded on the teacher's own dual-partition mental model (bootc's
//! staged-deployment swap) but behind a narrow [`BootEnvironment`] trait
//! so the block-device and bootloader specifics spec §1 puts out of
//! scope stay outside this module.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::hash::HashVerifyingReader;
use crate::state_machine::{ModuleCapabilities, RebootCollaborator, RebootRequirement, REBOOT_WAIT};

/// The two partitions a dual-rootfs device alternates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Partition slot A.
    A,
    /// Partition slot B.
    B,
}

impl Partition {
    /// The other slot.
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Abstracts "select partition / mark bootable / commit" below the
/// level spec §1 puts out of scope.
pub trait BootEnvironment {
    /// The partition currently marked active for boot.
    fn active(&self) -> Result<Partition>;
    /// The block device path backing `partition`.
    fn device_for(&self, partition: Partition) -> Result<String>;
    /// Mark `partition` bootable exactly once (a one-shot try), without
    /// yet making it the permanent default.
    fn set_one_shot(&mut self, partition: Partition) -> Result<()>;
    /// Clear any pending one-shot flag.
    fn clear_one_shot(&mut self) -> Result<()>;
    /// Make `partition` the permanent default on every future boot.
    fn set_permanent(&mut self, partition: Partition) -> Result<()>;
}

/// The built-in rootfs-image installer.
pub struct RootfsInstaller {
    boot_env: Box<dyn BootEnvironment + Send>,
    reboot: Box<dyn RebootCollaborator + Send + Sync>,
    payload: Option<Box<dyn Read + Send>>,
    expected_digest: String,
    target: Option<Partition>,
    previous: Option<Partition>,
}

impl RootfsInstaller {
    /// Build an installer bound to a boot environment and reboot
    /// collaborator, given the already hash-verification-wrapped payload
    /// stream (spec §2 data flow: payload bytes flow through C2 either
    /// way).
    pub fn new(
        boot_env: Box<dyn BootEnvironment + Send>,
        reboot: Box<dyn RebootCollaborator + Send + Sync>,
        payload: Box<dyn Read + Send>,
        expected_digest: String,
    ) -> Self {
        Self {
            boot_env,
            reboot,
            payload: Some(payload),
            expected_digest,
            target: None,
            previous: None,
        }
    }

    /// `ArtifactInstall`: write the payload to the inactive partition,
    /// fsync, and arm its one-shot boot flag.
    pub async fn install(&mut self, _index: usize) -> Result<ModuleCapabilities> {
        let previous = self.boot_env.active()?;
        let target = previous.other();
        self.previous = Some(previous);
        self.target = Some(target);

        let device = self.boot_env.device_for(target)?;
        let payload = self
            .payload
            .take()
            .context("rootfs payload already consumed")?;
        let expected = self.expected_digest.clone();
        tokio::task::spawn_blocking(move || write_payload(&device, payload, &expected))
            .await
            .context("join rootfs writer thread")??;

        self.boot_env.set_one_shot(target)?;
        Ok(ModuleCapabilities {
            supports_rollback: true,
            needs_reboot: RebootRequirement::Automatic,
        })
    }

    /// `ArtifactCommit`: clear the one-shot flag and make the new
    /// partition permanent. If this instance was freshly reconstructed
    /// after a crash or manual reboot rather than carrying `install`'s
    /// in-memory state, the target is re-derived from the boot
    /// environment the same way `install` computed it originally:
    /// `active()` still reports the previous partition until
    /// `set_permanent` runs below.
    pub async fn commit(&mut self) -> Result<()> {
        let target = match self.target {
            Some(t) => t,
            None => self.boot_env.active()?.other(),
        };
        self.boot_env.clear_one_shot()?;
        self.boot_env.set_permanent(target)?;
        self.target = None;
        Ok(())
    }

    /// Rollback: undo the boot-environment change, flipping back to the
    /// previous partition. Re-derives `previous` from the boot
    /// environment when resuming in a fresh process, same rationale as
    /// [`Self::commit`].
    pub async fn rollback(&mut self, _index: usize) -> Result<ModuleCapabilities> {
        let previous = match self.previous {
            Some(p) => p,
            None => self.boot_env.active()?,
        };
        self.boot_env.clear_one_shot()?;
        self.boot_env.set_permanent(previous)?;
        self.previous = None;
        Ok(ModuleCapabilities {
            supports_rollback: true,
            needs_reboot: RebootRequirement::Automatic,
        })
    }

    /// Invoke the reboot collaborator and wait out the grace window.
    pub async fn reboot_now(&mut self) -> Result<()> {
        self.reboot.reboot()?;
        tokio::time::sleep(REBOOT_WAIT).await;
        Ok(())
    }

    /// Rootfs installs always support rollback (spec §4.10: "Rollback
    /// flips back to the previous partition").
    pub fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities {
            supports_rollback: true,
            needs_reboot: RebootRequirement::Automatic,
        }
    }

    /// Nothing to clean up; the block device isn't a work directory.
    pub async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A minimal, file-backed [`BootEnvironment`]: active/one-shot partition
/// state lives in marker files under the datastore directory rather than
/// real bootloader environment variables, since the bootloader
/// integration itself is out of scope (spec §1). Good enough to make the
/// CLI's rootfs-image path actually runnable; a device-specific build
/// would replace this with a `BootEnvironment` that talks to its own
/// bootloader (U-Boot env, GPT attribute bits, grub2-editenv, ...).
pub struct FileBootEnvironment {
    active_file: PathBuf,
    one_shot_file: PathBuf,
    device_a: PathBuf,
    device_b: PathBuf,
}

impl FileBootEnvironment {
    /// Bind to marker files under `datastore_dir` and the two configured
    /// partition block devices.
    pub fn new(datastore_dir: &Path, device_a: PathBuf, device_b: PathBuf) -> Self {
        Self {
            active_file: datastore_dir.join("rootfs-active"),
            one_shot_file: datastore_dir.join("rootfs-one-shot"),
            device_a,
            device_b,
        }
    }

    fn read_partition(path: &Path, default: Partition) -> Partition {
        match std::fs::read_to_string(path) {
            Ok(s) if s.trim() == "B" => Partition::B,
            Ok(s) if s.trim() == "A" => Partition::A,
            _ => default,
        }
    }

    fn label(partition: Partition) -> &'static str {
        match partition {
            Partition::A => "A",
            Partition::B => "B",
        }
    }
}

impl BootEnvironment for FileBootEnvironment {
    fn active(&self) -> Result<Partition> {
        Ok(Self::read_partition(&self.active_file, Partition::A))
    }

    fn device_for(&self, partition: Partition) -> Result<String> {
        Ok(match partition {
            Partition::A => self.device_a.display().to_string(),
            Partition::B => self.device_b.display().to_string(),
        })
    }

    fn set_one_shot(&mut self, partition: Partition) -> Result<()> {
        std::fs::write(&self.one_shot_file, Self::label(partition)).with_context(|| format!("writing {:?}", self.one_shot_file))
    }

    fn clear_one_shot(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.one_shot_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {:?}", self.one_shot_file)),
        }
    }

    fn set_permanent(&mut self, partition: Partition) -> Result<()> {
        std::fs::write(&self.active_file, Self::label(partition)).with_context(|| format!("writing {:?}", self.active_file))
    }
}

fn write_payload(device: &str, mut payload: Box<dyn Read + Send>, expected_digest: &str) -> Result<()> {
    let mut verified = HashVerifyingReader::new(&mut payload, expected_digest.to_string(), device.to_string());
    let mut out = std::fs::OpenOptions::new()
        .write(true)
        .open(device)
        .with_context(|| format!("opening {device}"))?;
    std::io::copy(&mut verified, &mut out).with_context(|| format!("writing rootfs image to {device}"))?;
    out.sync_all().with_context(|| format!("fsync {device}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeBootEnv {
        active: Partition,
        one_shot: Option<Partition>,
    }

    impl BootEnvironment for FakeBootEnv {
        fn active(&self) -> Result<Partition> {
            Ok(self.active)
        }
        fn device_for(&self, partition: Partition) -> Result<String> {
            Ok(format!("/dev/fake-{partition:?}"))
        }
        fn set_one_shot(&mut self, partition: Partition) -> Result<()> {
            self.one_shot = Some(partition);
            Ok(())
        }
        fn clear_one_shot(&mut self) -> Result<()> {
            self.one_shot = None;
            Ok(())
        }
        fn set_permanent(&mut self, partition: Partition) -> Result<()> {
            self.active = partition;
            Ok(())
        }
    }

    struct NoopReboot(Mutex<u32>);
    impl RebootCollaborator for NoopReboot {
        fn reboot(&self) -> Result<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn partition_other_flips() {
        assert_eq!(Partition::A.other(), Partition::B);
        assert_eq!(Partition::B.other(), Partition::A);
    }

    #[tokio::test]
    async fn commit_without_prior_install_derives_target_from_active() {
        // Simulates resuming in a fresh process after a crash: no
        // `install()` ran in this instance, so `target` must come from
        // the boot environment's still-unchanged `active()`.
        let boot = Box::new(FakeBootEnv {
            active: Partition::A,
            one_shot: Some(Partition::B),
        });
        let reboot = Box::new(NoopReboot(Mutex::new(0)));
        let mut installer = RootfsInstaller::new(boot, reboot, Box::new(std::io::empty()), String::new());
        installer.commit().await.unwrap();
        assert_eq!(installer.boot_env.active().unwrap(), Partition::B);
    }

    #[tokio::test]
    async fn rollback_without_prior_install_keeps_active_partition() {
        let boot = Box::new(FakeBootEnv {
            active: Partition::A,
            one_shot: Some(Partition::B),
        });
        let reboot = Box::new(NoopReboot(Mutex::new(0)));
        let mut installer = RootfsInstaller::new(boot, reboot, Box::new(std::io::empty()), String::new());
        installer.rollback(0).await.unwrap();
        assert_eq!(installer.boot_env.active().unwrap(), Partition::A);
    }

}
