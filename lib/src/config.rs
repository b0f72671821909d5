//! Engine configuration (ambient stack, `SPEC_FULL.md` §3).
//!
//! Grounded on the teacher's `ConfigSpec`/keyfile pattern in
//! `lib/src/config.rs`, adapted from keyfiles (which rely on an ostree
//! dependency this crate doesn't carry) to a plain TOML document loaded
//! with `serde` + `toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default path the CLI loads configuration from absent `--config`.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/supdated/supdated.toml";

/// Engine-wide configuration, loaded once and threaded through as a
/// shared reference the way `lib/src/store/mod.rs`'s `Storage` is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for the provides store and module work trees.
    pub datastore_dir: PathBuf,
    /// Directory state scripts are read from.
    pub scripts_dir: PathBuf,
    /// Directory Update Module binaries are discovered in, keyed by
    /// payload type.
    pub modules_dir: PathBuf,
    /// This device's type token, checked against `depends.device_type`.
    pub device_type: String,
    /// Per-state Update Module invocation timeout.
    pub module_timeout: Duration,
    /// Update Module retry attempts on exit code 21.
    pub module_retry_attempts: u32,
    /// Delay between Update Module retry attempts.
    pub module_retry_interval: Duration,
    /// Per-script timeout for the state scripts runner.
    pub script_timeout: Duration,
    /// Appended to the persisted artifact name when rollback is
    /// unsupported and the device is left inconsistent.
    pub broken_artifact_suffix: String,
    /// How long the engine waits for a requested reboot to take the
    /// process down before reporting `RebootFailed`.
    pub reboot_grace: Duration,
    /// PEM-encoded public key used to verify `manifest.sig`, if any.
    pub public_key_path: Option<PathBuf>,
    /// Whether a missing `manifest.sig` is a hard failure.
    pub require_signature: bool,
    /// Block device backing rootfs partition slot A, for the built-in
    /// `"rootfs-image"` installer. `None` means this device has no
    /// configured dual-rootfs layout.
    pub rootfs_device_a: Option<PathBuf>,
    /// Block device backing rootfs partition slot B.
    pub rootfs_device_b: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datastore_dir: PathBuf::from("/var/lib/supdated"),
            scripts_dir: PathBuf::from("/etc/supdated/scripts"),
            modules_dir: PathBuf::from("/usr/share/supdated/modules"),
            device_type: String::new(),
            module_timeout: Duration::from_secs(60),
            module_retry_attempts: 3,
            module_retry_interval: Duration::from_secs(30),
            script_timeout: Duration::from_secs(60),
            broken_artifact_suffix: "_INCONSISTENT".to_string(),
            reboot_grace: Duration::from_secs(10 * 60),
            public_key_path: None,
            require_signature: false,
            rootfs_device_a: None,
            rootfs_device_b: None,
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults for any field the
    /// file doesn't mention (`#[serde(default)]` on the struct).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {path:?}"))?;
        toml::from_str(&text).with_context(|| format!("parsing config {path:?}"))
    }

    /// Load from [`DEFAULT_CONFIG_PATH`], or fall back to built-in
    /// defaults entirely if the file is absent.
    pub fn load_default_or_builtin() -> Result<Self> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        match path.exists() {
            true => Self::load(path),
            false => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: Config = toml::from_str(r#"device_type = "raspberrypi4""#).unwrap();
        assert_eq!(cfg.device_type, "raspberrypi4");
        assert_eq!(cfg.datastore_dir, PathBuf::from("/var/lib/supdated"));
    }

    #[test]
    fn missing_file_falls_back_to_builtin_defaults() {
        let err = Config::load(Path::new("/nonexistent/supdated.toml"));
        assert!(err.is_err());
    }
}
