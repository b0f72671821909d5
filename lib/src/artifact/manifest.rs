//! The `manifest` entry: a newline-delimited digest list (spec §3, §4.3,
//! §6, and the boundary behaviour in §8 about exactly two spaces).

use indexmap::IndexMap;

use crate::error::EngineError;

/// The parsed `manifest` file: filename -> 64-hex-char SHA-256 digest,
/// in the insertion order the lines appeared (spec §3: "insertion order
/// is the canonical order the parser expects those files to appear").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: IndexMap<String, String>,
}

impl Manifest {
    /// Parse the raw bytes of a `manifest` file.
    pub fn parse(raw: &[u8]) -> Result<Self, EngineError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| EngineError::ParseError("manifest is not valid UTF-8".into()))?;
        let mut entries = IndexMap::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let (digest, name) = parse_line(line)?;
            entries.insert(name, digest);
        }
        Ok(Self { entries })
    }

    /// Look up the expected digest for a manifest-relative file name.
    pub fn digest_for(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Iterate filenames in manifest order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the manifest has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse one `HEX64  path` line; exactly two spaces, per spec §6.
fn parse_line(line: &str) -> Result<(String, String), EngineError> {
    // Split on exactly "  " (two spaces); reject one or three+.
    let bad = || EngineError::ParseError(format!("malformed manifest line: {line:?}"));
    let sep = line.find("  ").ok_or_else(bad)?;
    let (digest, rest) = line.split_at(sep);
    let name = &rest[2..];
    if name.starts_with(' ') {
        // Three or more spaces.
        return Err(bad());
    }
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    {
        return Err(bad());
    }
    if name.is_empty() {
        return Err(bad());
    }
    Ok((digest.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_manifest() {
        let digest = "a".repeat(64);
        let raw = format!("{digest}  header.tar\n{digest}  data/0000.tar\n");
        let m = Manifest::parse(raw.as_bytes()).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.digest_for("header.tar"), Some(digest.as_str()));
        assert_eq!(m.names().collect::<Vec<_>>(), vec!["header.tar", "data/0000.tar"]);
    }

    #[test]
    fn rejects_one_space() {
        let digest = "a".repeat(64);
        let raw = format!("{digest} header.tar\n");
        assert!(Manifest::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn rejects_three_spaces() {
        let digest = "a".repeat(64);
        let raw = format!("{digest}   header.tar\n");
        assert!(Manifest::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn rejects_uppercase_hex() {
        let digest = "A".repeat(64);
        let raw = format!("{digest}  header.tar\n");
        assert!(Manifest::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn error_quotes_offending_line() {
        let err = parse_line("garbage").unwrap_err();
        assert!(err.to_string().contains("garbage"));
    }
}
