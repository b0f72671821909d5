//! Update Module work-directory layout (spec §6): builds and tears down
//! the file tree the engine presents to a module child process, rooted
//! at `<datastore>/modules/v3/payloads/<index>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::artifact::header::SubHeader;
use crate::store::Provides;

/// Resolved paths for one payload's work directory.
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// The work directory root for payload `index` under `datastore`.
    pub fn new(datastore: &Path, index: usize) -> Self {
        Self {
            root: datastore.join("modules/v3/payloads").join(format!("{index}")),
        }
    }

    /// The directory itself.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Scratch area the module may write into.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Non-streaming payload file delivery area.
    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    /// The `streams-list` FIFO path.
    pub fn streams_list(&self) -> PathBuf {
        self.root.join("streams-list")
    }

    /// The FIFO path for a named stream.
    pub fn stream_path(&self, name: &str) -> PathBuf {
        self.root.join("streams").join(name)
    }

    /// Build the full tree and populate its fixed files (spec §6); the
    /// caller is responsible for `files/` or `streams*` depending on
    /// delivery mode.
    pub fn prepare(
        &self,
        device_type: &str,
        current: &Provides,
        header_info_json: &[u8],
        type_info_json: &[u8],
        meta_data_json: Option<&[u8]>,
        payload_type: &str,
        incoming_artifact_name: &str,
        incoming_artifact_group: Option<&str>,
    ) -> Result<()> {
        std::fs::create_dir_all(self.root.join("header"))?;
        std::fs::create_dir_all(self.tmp_dir())?;
        write(&self.root.join("version"), b"3\n")?;
        write(&self.root.join("current_artifact_name"), current.artifact_name.as_bytes())?;
        write(
            &self.root.join("current_artifact_group"),
            current.artifact_group.as_deref().unwrap_or("").as_bytes(),
        )?;
        write(&self.root.join("current_device_type"), device_type.as_bytes())?;
        write(&self.root.join("header/artifact_name"), incoming_artifact_name.as_bytes())?;
        write(
            &self.root.join("header/artifact_group"),
            incoming_artifact_group.unwrap_or("").as_bytes(),
        )?;
        write(&self.root.join("header/payload_type"), payload_type.as_bytes())?;
        write(&self.root.join("header/header_info"), header_info_json)?;
        write(&self.root.join("header/type_info"), type_info_json)?;
        if let Some(meta) = meta_data_json {
            write(&self.root.join("header/meta-data"), meta)?;
        }
        Ok(())
    }

    /// `header/type_info` and `header/meta-data` from a parsed sub-header.
    pub fn header_json_for(sub: &SubHeader) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let type_info = serde_json::to_vec(&sub.type_info).context("serializing type-info")?;
        let meta_data = sub
            .meta_data
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .context("serializing meta-data")?;
        Ok((type_info, meta_data))
    }

    /// Recursively remove the work directory. A no-op if it is already
    /// gone (spec §4.6: "`Cleanup` is a no-op and success").
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing work directory {:?}", self.root)),
        }
    }
}

fn write(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("writing {path:?}"))
}
