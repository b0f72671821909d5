//! Hash-verifying reader (component C2).
//!
//! Grounded on `tar/import.rs`'s xattrs checksum pattern (openssl
//! `MessageDigest::sha256` + `hex::encode`), generalized from one-shot
//! buffers to a streaming `Read` wrapper so payload bytes never need to
//! be buffered in full (spec §4.2, §5 "never buffers a whole payload").

use std::io::Read;

use openssl::hash::{Hasher, MessageDigest};

use crate::error::EngineError;

/// Wraps a reader and an expected 64-hex-char SHA-256 digest.
///
/// Forwards every byte read to an internal SHA-256 hasher. The final
/// read that returns 0 (EOF) checks the running digest against the
/// expectation; a mismatch surfaces as an `io::Error` wrapping
/// [`EngineError::ChecksumMismatch`] so it can propagate through
/// ordinary `Read` call sites.
///
/// An empty `expected` digest disables verification, for files whose
/// hash is declared elsewhere (spec §4.2).
pub struct HashVerifyingReader<R: Read> {
    inner: R,
    hasher: Option<Hasher>,
    expected: String,
    name: String,
    finished: bool,
}

impl<R: Read> HashVerifyingReader<R> {
    /// Wrap `inner`, checking its bytes against `expected` (64 lowercase
    /// hex chars) once EOF is reached. `name` is used only in error
    /// messages, to identify which manifest entry failed.
    pub fn new(inner: R, expected: impl Into<String>, name: impl Into<String>) -> Self {
        let expected = expected.into();
        let hasher = if expected.is_empty() {
            None
        } else {
            Some(Hasher::new(MessageDigest::sha256()).expect("openssl sha256 hasher"))
        };
        Self {
            inner,
            hasher,
            expected,
            name: name.into(),
            finished: false,
        }
    }

    /// Digest verification is a no-op for this reader.
    pub fn disabled(inner: R, name: impl Into<String>) -> Self {
        Self::new(inner, "", name)
    }
}

impl<R: Read> Read for HashVerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.finished = true;
            if let Some(hasher) = self.hasher.as_mut() {
                let digest = hasher.finish().expect("finalize sha256");
                let computed = hex::encode(&*digest);
                if computed != self.expected {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        EngineError::ChecksumMismatch {
                            name: self.name.clone(),
                            expected: self.expected.clone(),
                            computed,
                        },
                    ));
                }
            }
            return Ok(0);
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]).expect("sha256 update");
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    fn sha256_hex(data: &[u8]) -> String {
        let digest = openssl::hash::hash(MessageDigest::sha256(), data).unwrap();
        hex::encode(digest)
    }

    #[test]
    fn matching_digest_reads_cleanly() {
        let data = b"hello world";
        let expected = sha256_hex(data);
        let mut r = HashVerifyingReader::new(&data[..], expected, "file");
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn mismatched_digest_fails_at_eof() {
        let data = b"hello world";
        let mut r = HashVerifyingReader::new(&data[..], "0".repeat(64), "file");
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn disabled_verifier_ignores_mismatch() {
        let data = b"hello world";
        let mut r = HashVerifyingReader::disabled(&data[..], "file");
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn last_byte_difference_is_caught() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaab";
        let mut altered = data.to_vec();
        let expected = sha256_hex(data);
        *altered.last_mut().unwrap() ^= 0xff;
        let mut r = HashVerifyingReader::new(&altered[..], expected, "data/0000.tar/file");
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).is_err());
    }
}
