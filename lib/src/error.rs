//! First-class error kinds for the update engine.
//!
//! Domain errors that invalidate artifact acceptance or that the state
//! machine needs to branch on get their own [`EngineError`] variant, per
//! spec §7. Everything else propagates as a plain `anyhow::Error` with
//! call-site context, matching the rest of the crate.

use thiserror::Error;

/// A first-class, machine-readable engine failure.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed artifact structure; quotes the offending token.
    #[error("parse error: {0}")]
    ParseError(String),
    /// The `version` entry named an unrecognized format or version.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// A payload's streamed bytes did not match its manifest digest.
    #[error("checksum mismatch for {name}: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// The manifest-relative file name.
        name: String,
        /// The digest named in the manifest.
        expected: String,
        /// The digest actually computed while streaming.
        computed: String,
    },
    /// A signature was required but absent.
    #[error("signature missing but required")]
    SignatureMissing,
    /// A signature was present but did not verify.
    #[error("signature invalid")]
    SignatureInvalid,
    /// A meta-data integer exceeded the representable range.
    #[error("meta-data integer out of range: {0}")]
    MetaDataOutOfRange(String),
    /// Meta-data was not a flat object of strings/integers/arrays thereof.
    #[error("meta-data structure invalid: {0}")]
    MetaDataStructure(String),
    /// A `headers/NNNN/...` entry was out of sequence.
    #[error("unexpected header index: observed {observed:04}, expected {expected:04}")]
    UnexpectedIndex {
        /// The index actually seen in the stream.
        observed: u32,
        /// The index the parser required next.
        expected: u32,
    },
    /// The device type did not appear in `depends.device_type`.
    #[error("device type mismatch")]
    DeviceTypeMismatch,
    /// `depends.artifact_name` was present and did not match.
    #[error("artifact name mismatch")]
    ArtifactNameMismatch,
    /// `depends.artifact_group` was present and did not match.
    #[error("artifact group mismatch")]
    ArtifactGroupMismatch,
    /// A sub-header `artifact_depends` key was missing or mismatched.
    #[error("depends unsatisfied: {0}")]
    DependsUnsatisfied(String),
    /// An Update Module exited with a failing, non-retry code.
    #[error("update module failed: {0}")]
    ModuleFailed(String),
    /// An Update Module invocation exceeded its configured timeout.
    #[error("update module timed out")]
    ModuleTimeout,
    /// An Update Module's stdout did not match the expected protocol.
    #[error("module protocol error: {0}")]
    ProtocolError(String),
    /// A `commit`/`rollback` CLI verb was invoked with nothing in progress.
    #[error("no update in progress")]
    NoUpdateInProgress,
    /// A reboot was required to proceed but `--reboot-exit-code` was set.
    #[error("reboot required")]
    RebootRequired,
    /// The persistent store failed in a way that isn't retryable.
    #[error("storage error: {0}")]
    StorageError(String),
    /// A transient IO failure; callers may retry.
    #[error("transient io error: {0}")]
    TransientIOError(String),
}

impl EngineError {
    /// Stable machine-readable code, one per variant, for logs and CLI mapping.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ParseError(_) => "ParseError",
            Self::UnsupportedFormat(_) => "UnsupportedFormat",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::SignatureMissing => "SignatureMissing",
            Self::SignatureInvalid => "SignatureInvalid",
            Self::MetaDataOutOfRange(_) => "MetaDataOutOfRange",
            Self::MetaDataStructure(_) => "MetaDataStructure",
            Self::UnexpectedIndex { .. } => "UnexpectedIndex",
            Self::DeviceTypeMismatch => "DeviceTypeMismatch",
            Self::ArtifactNameMismatch => "ArtifactNameMismatch",
            Self::ArtifactGroupMismatch => "ArtifactGroupMismatch",
            Self::DependsUnsatisfied(_) => "DependsUnsatisfied",
            Self::ModuleFailed(_) => "ModuleFailed",
            Self::ModuleTimeout => "ModuleTimeout",
            Self::ProtocolError(_) => "ProtocolError",
            Self::NoUpdateInProgress => "NoUpdateInProgress",
            Self::RebootRequired => "RebootRequired",
            Self::StorageError(_) => "StorageError",
            Self::TransientIOError(_) => "TransientIOError",
        }
    }
}

/// Accumulates every error encountered while tearing down a failed update,
/// per spec §7 ("a multi-step failure... accumulates both").
#[derive(Debug, Default)]
pub struct FailureAccumulator {
    /// The error that originally routed the state machine to the failure path.
    pub primary: Option<anyhow::Error>,
    /// An error encountered while attempting rollback, if any.
    pub rollback: Option<anyhow::Error>,
}

impl FailureAccumulator {
    /// Record the error that triggered the failure path.
    pub fn record_primary(&mut self, err: anyhow::Error) {
        if self.primary.is_none() {
            self.primary = Some(err);
        }
    }

    /// Record an error encountered while attempting rollback.
    pub fn record_rollback(&mut self, err: anyhow::Error) {
        self.rollback = Some(err);
    }

    /// True if anything was recorded at all.
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.rollback.is_none()
    }

    /// Render a single-line summary plus cause chain, per spec §7.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if let Some(p) = &self.primary {
            out.push_str(&format!("primary: {p:#}"));
        }
        if let Some(r) = &self.rollback {
            if !out.is_empty() {
                out.push_str("; ");
            }
            out.push_str(&format!("rollback: {r:#}"));
        }
        out
    }
}
