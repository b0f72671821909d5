//! Tar stream plumbing (component C1) shared by the artifact parser.

mod reader;

pub use reader::{is_yieldable, EntryInfo};

use std::io::Read;

use anyhow::{anyhow, Result};

/// Compression applied to an inner `header.tar`/`data/NNNN.tar` member,
/// inferred from its filename suffix per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// No compression; `header.tar`, `data/0000.tar`.
    None,
    /// `header.tar.gz`, `data/0000.tar.gz`.
    Gzip,
    /// `header.tar.xz`, `data/0000.tar.xz`.
    Xz,
    /// `header.tar.zst`, `data/0000.tar.zst`.
    Zstd,
}

impl Compression {
    /// Infer the compression from a manifest filename's suffix, stripping
    /// it and returning the base name alongside.
    pub fn from_filename(name: &str) -> (Self, &str) {
        if let Some(base) = name.strip_suffix(".tar.gz") {
            (Self::Gzip, base)
        } else if let Some(base) = name.strip_suffix(".tar.xz") {
            (Self::Xz, base)
        } else if let Some(base) = name.strip_suffix(".tar.zst") {
            (Self::Zstd, base)
        } else if let Some(base) = name.strip_suffix(".tar") {
            (Self::None, base)
        } else {
            (Self::None, name)
        }
    }

    /// Wrap a reader with the decompressor this variant implies.
    pub fn wrap<'a, R: Read + 'a>(self, inner: R) -> Box<dyn Read + 'a> {
        match self {
            Self::None => Box::new(inner),
            Self::Gzip => Box::new(flate2::read::GzDecoder::new(inner)),
            Self::Xz => Box::new(xz2::read::XzDecoder::new(inner)),
            Self::Zstd => Box::new(
                zstd::stream::read::Decoder::new(inner).expect("zstd decoder frame setup"),
            ),
        }
    }
}

/// Find which of the manifest's declared payload/header names the given
/// base name (without compression suffix) corresponds to, erroring if
/// none match. Used to look up the expected hash for a compressed
/// member whose manifest entry names the compressed name verbatim.
pub fn strip_known_compression(name: &str) -> (Compression, String) {
    let (c, base) = Compression::from_filename(name);
    (c, base.to_string())
}

pub(crate) fn tar_error(context: &str, e: std::io::Error) -> anyhow::Error {
    anyhow!("{context}: {e}")
}
