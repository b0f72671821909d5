//! Streaming tar entry primitives (component C1).
//!
//! The `tar` crate's own `Entries` iterator already gives us exactly the
//! contract spec §4.1 wants: pull-based, no seeking required, advances
//! past padding automatically, and two zero blocks or EOF end the
//! stream. This module just narrows that down to the bits the artifact
//! parser (§4.3) needs and gives the "unknown special entry" case a
//! name, the way `tar/import.rs`'s `Importer::filter_entry` singles out
//! directories.

use anyhow::{anyhow, Result};

/// One tar entry's metadata, detached from its bytes.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    /// The entry's path as recorded in the tar header.
    pub name: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Unix permission bits.
    pub mode: u32,
}

impl EntryInfo {
    /// Read metadata off a live tar entry.
    pub fn from_entry<R: std::io::Read>(entry: &tar::Entry<'_, R>) -> Result<Self> {
        let header = entry.header();
        Ok(Self {
            name: entry
                .path()
                .map_err(|e| anyhow!("invalid entry path: {e}"))?
                .to_string_lossy()
                .into_owned(),
            size: header.size().unwrap_or(0),
            mode: header.mode().unwrap_or(0o644),
        })
    }
}

/// Whether a tar entry is data the parser should hand to the caller, or
/// a structural entry (directory, long-name/long-link GNU extension,
/// hardlink) it should silently step over.
pub fn is_yieldable(entry_type: tar::EntryType) -> bool {
    entry_type == tar::EntryType::Regular
}
