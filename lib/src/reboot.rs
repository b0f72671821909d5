//! The reboot collaborator (spec §4.9, §9's "abstracted reboot
//! collaborator"): an implementation of [`crate::state_machine::RebootCollaborator`]
//! that shells out to the system `reboot` binary, adapted from the
//! teacher's trivial synchronous `reboot()` free function but made
//! substitutable so the state machine's reboot-handling branch can be
//! exercised without ever actually rebooting a test host.

use std::io::Write;

use anyhow::Result;
use fn_error_context::context;

use crate::state_machine::RebootCollaborator;
use crate::task::Task;

/// Issues a real reboot via the `reboot(8)` command.
pub struct SystemReboot;

impl RebootCollaborator for SystemReboot {
    #[context("initiating reboot")]
    fn reboot(&self) -> Result<()> {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        Task::new("rebooting system", "reboot").run()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records how many times it was called instead of touching the host.
    #[derive(Default)]
    pub struct RecordingReboot {
        pub calls: AtomicUsize,
    }

    impl RebootCollaborator for RecordingReboot {
        fn reboot(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingReboot;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn recording_reboot_counts_calls() {
        let r = RecordingReboot::default();
        r.reboot().unwrap();
        r.reboot().unwrap();
        assert_eq!(r.calls.load(Ordering::SeqCst), 2);
    }
}
