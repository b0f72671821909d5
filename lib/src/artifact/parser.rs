//! Artifact parser (component C3, spec §4.3): a pull-based walk of the
//! outer tar stream that produces the version, manifest, optional
//! signature, header, and drives a caller-supplied callback over each
//! payload file in order.
//!
//! The `tar` crate's `Entries<'a, R>` borrows its `Archive<R>` for its
//! own lifetime, so a long-lived "payload iterator" struct returned from
//! `parse()` would be self-referential. Instead this module follows
//! `other_examples/`'s bundle-walking pattern: the whole outer tar is
//! consumed in one call, and payload bytes are pushed to the caller via
//! `on_payload_file` as soon as they're available rather than pulled
//! back out afterward.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::sign::Verifier;
use tar::Archive;

use crate::artifact::header::{Header, SubHeader, TypeInfo};
use crate::artifact::manifest::Manifest;
use crate::artifact::metadata;
use crate::error::EngineError;
use crate::hash::HashVerifyingReader;
use crate::scripts::ScriptName;
use crate::tar::Compression;

/// Parser-wide configuration (spec §4.3: "`ParsedArtifact parse(Reader,
/// Config)`").
pub struct ParseConfig {
    /// Whether an absent `manifest.sig` is a hard failure.
    pub require_signature: bool,
    /// Public key used to verify `manifest.sig`, if present.
    pub public_key: Option<PKey<Public>>,
    /// Directory state scripts are streamed out to as they're found.
    pub scripts_dir: PathBuf,
}

impl ParseConfig {
    /// Build parser configuration from engine configuration, loading and
    /// parsing the public key PEM if one is configured. Keeps the
    /// `openssl` dependency at the library boundary rather than leaking
    /// it into the CLI crate.
    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        let public_key = match &config.public_key_path {
            Some(path) => {
                let pem = std::fs::read(path).with_context(|| format!("reading public key {path:?}"))?;
                Some(PKey::public_key_from_pem(&pem).context("parsing public key PEM")?)
            }
            None => None,
        };
        Ok(Self {
            require_signature: config.require_signature,
            public_key,
            scripts_dir: config.scripts_dir.clone(),
        })
    }
}

/// Everything the parser produces apart from payload bytes, which are
/// pushed through `on_payload_file` as the outer tar is walked.
#[derive(Debug)]
pub struct ParsedArtifact {
    /// Must equal 3 (spec §3).
    pub format_version: u32,
    /// Filename -> SHA-256 digest, in wire order.
    pub manifest: Manifest,
    /// Whether a `manifest.sig` was present and verified.
    pub signature_present: bool,
    /// The parsed header.
    pub header: Header,
}

/// Parse a single artifact stream, invoking `on_payload_file(index,
/// name, reader)` once per payload file in manifest order. `reader`
/// yields exactly that file's bytes, hash-verified against the
/// manifest, and must be fully drained by the callback before it
/// returns (spec §5: "the parser never buffers a whole payload").
pub fn parse<R: Read>(
    reader: R,
    config: &ParseConfig,
    mut on_payload_file: impl FnMut(usize, &str, &mut dyn Read) -> Result<()>,
) -> Result<ParsedArtifact> {
    let mut outer = Archive::new(reader);
    let mut entries = outer.entries().context("reading outer tar entries")?;

    let version_entry = next_regular(&mut entries)?.context("missing version entry")?;
    let format_version = parse_version(version_entry)?;

    let manifest_entry = next_regular(&mut entries)?.context("missing manifest entry")?;
    let manifest_bytes = read_all(manifest_entry)?;
    let manifest = Manifest::parse(&manifest_bytes)?;

    let mut signature_present = false;
    let mut lookahead = next_regular(&mut entries)?.context("missing header.tar entry")?;
    {
        let name = lookahead.path()?.to_string_lossy().into_owned();
        if name == "manifest.sig" {
            let sig_bytes = read_all(lookahead)?;
            verify_signature(config, &manifest_bytes, &sig_bytes)?;
            signature_present = true;
            lookahead = next_regular(&mut entries)?.context("missing header.tar entry")?;
        } else if config.require_signature {
            anyhow::bail!(EngineError::SignatureMissing);
        }
    }

    let header_name = lookahead.path()?.to_string_lossy().into_owned();
    let (compression, base) = Compression::from_filename(&header_name);
    if base != "header" {
        anyhow::bail!(EngineError::ParseError(format!("expected header.tar*, found {header_name}")));
    }
    let expected_digest = manifest
        .digest_for(&header_name)
        .ok_or_else(|| EngineError::ParseError(format!("{header_name} missing from manifest")))?
        .to_string();
    let header_bytes = read_all(lookahead)?;
    verify_digest(&header_bytes, &expected_digest, &header_name)?;
    let header = parse_header_tar(compression.wrap(&header_bytes[..]), config)?;
    header.validate()?;

    for (index, decl) in header.header_info.payloads.iter().enumerate() {
        let data_entry = next_regular(&mut entries)?
            .with_context(|| format!("missing data/{index:04}.tar entry"))?;
        let data_name = data_entry.path()?.to_string_lossy().into_owned();
        let expected_index_name = format!("data/{index:04}");
        let (compression, base) = Compression::from_filename(&data_name);
        if base != expected_index_name {
            anyhow::bail!(EngineError::UnexpectedIndex {
                observed: parse_index_from_name(&data_name).unwrap_or(u32::MAX),
                expected: index as u32,
            });
        }
        let expected_digest = manifest
            .digest_for(&data_name)
            .ok_or_else(|| EngineError::ParseError(format!("{data_name} missing from manifest")))?
            .to_string();
        let verified = HashVerifyingReader::new(data_entry, expected_digest, data_name.clone());
        drive_payload_files(verified, compression, index, decl, &mut on_payload_file)?;
    }

    Ok(ParsedArtifact {
        format_version,
        manifest,
        signature_present,
        header,
    })
}

fn next_regular<'a, R: Read>(entries: &mut tar::Entries<'a, R>) -> Result<Option<tar::Entry<'a, R>>> {
    for entry in entries.by_ref() {
        let entry = entry.context("reading tar entry")?;
        if crate::tar::is_yieldable(entry.header().entry_type()) {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

fn read_all<R: Read>(mut entry: R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).context("reading tar entry contents")?;
    Ok(buf)
}

fn verify_digest(bytes: &[u8], expected: &str, name: &str) -> Result<()> {
    let mut verifier = HashVerifyingReader::new(bytes, expected.to_string(), name.to_string());
    let mut sink = Vec::new();
    verifier.read_to_end(&mut sink).context("verifying digest")?;
    Ok(())
}

fn parse_version(entry: impl Read) -> Result<u32> {
    let bytes = read_all(entry)?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| EngineError::UnsupportedFormat(format!("version: {e}")))?;
    let format = value.get("format").and_then(|v| v.as_str());
    let version = value.get("version").and_then(|v| v.as_u64());
    match (format, version) {
        (Some("mender"), Some(3)) => Ok(3),
        _ => Err(EngineError::UnsupportedFormat(format!("{value}")).into()),
    }
}

fn verify_signature(config: &ParseConfig, manifest_bytes: &[u8], sig_bytes: &[u8]) -> Result<()> {
    let key = config
        .public_key
        .as_ref()
        .ok_or_else(|| EngineError::SignatureInvalid)?;
    let mut verifier = Verifier::new(MessageDigest::sha256(), key).context("building signature verifier")?;
    verifier.update(manifest_bytes).context("feeding manifest to verifier")?;
    let ok = verifier.verify(sig_bytes).context("running signature verification")?;
    if !ok {
        anyhow::bail!(EngineError::SignatureInvalid);
    }
    Ok(())
}

/// Walk the inner `header.tar`: `header-info`, optional `scripts/...`,
/// then `headers/NNNN/type-info` (+ optional `meta-data`) ascending.
fn parse_header_tar(reader: impl Read, config: &ParseConfig) -> Result<Header> {
    let mut archive = Archive::new(reader);
    let mut entries = archive.entries().context("reading header.tar entries")?;

    let header_info_entry = next_regular(&mut entries)?.context("missing header-info")?;
    let header_info_bytes = read_all(header_info_entry)?;
    let header_info = serde_json::from_slice(&header_info_bytes).context("parsing header-info")?;

    let mut scripts = Vec::new();
    let mut next_index: u32 = 0;
    let mut sub_headers: Vec<SubHeader> = Vec::new();
    let mut pending_type_info: Option<TypeInfo> = None;

    while let Some(entry) = next_regular(&mut entries)? {
        let name = entry.path()?.to_string_lossy().into_owned();
        if let Some(script_name) = name.strip_prefix("scripts/") {
            ScriptName::parse(script_name)?;
            std::fs::create_dir_all(&config.scripts_dir)?;
            let mut out = std::fs::File::create(config.scripts_dir.join(script_name))?;
            let mut entry = entry;
            std::io::copy(&mut entry, &mut out).context("writing state script")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                out.set_permissions(std::fs::Permissions::from_mode(0o755))?;
            }
            scripts.push(script_name.to_string());
        } else if let Some(rest) = name.strip_prefix("headers/") {
            let (idx_str, leaf) = rest.split_once('/').ok_or_else(|| {
                EngineError::ParseError(format!("malformed header entry: {name}"))
            })?;
            let idx: u32 = idx_str
                .parse()
                .map_err(|_| EngineError::ParseError(format!("malformed header index: {name}")))?;
            if leaf == "type-info" {
                if idx != next_index {
                    anyhow::bail!(EngineError::UnexpectedIndex {
                        observed: idx,
                        expected: next_index,
                    });
                }
                if let Some(pending) = pending_type_info.take() {
                    sub_headers.push(SubHeader { type_info: pending, meta_data: None });
                }
                let bytes = read_all(entry)?;
                let type_info: TypeInfo = serde_json::from_slice(&bytes).context("parsing type-info")?;
                pending_type_info = Some(type_info);
                next_index += 1;
            } else if leaf == "meta-data" {
                let bytes = read_all(entry)?;
                let meta = metadata::parse_meta_data(&bytes)?;
                let type_info = pending_type_info
                    .take()
                    .ok_or_else(|| EngineError::ParseError(format!("meta-data without type-info: {name}")))?;
                sub_headers.push(SubHeader {
                    type_info,
                    meta_data: Some(meta),
                });
            } else {
                anyhow::bail!(EngineError::ParseError(format!("unrecognized header entry: {name}")));
            }
        } else {
            anyhow::bail!(EngineError::ParseError(format!("unrecognized header entry: {name}")));
        }
    }
    if let Some(pending) = pending_type_info.take() {
        sub_headers.push(SubHeader { type_info: pending, meta_data: None });
    }

    Ok(Header {
        header_info,
        scripts,
        sub_headers,
    })
}

/// Walk one payload's inner tar, invoking the callback for each file.
fn drive_payload_files(
    reader: impl Read,
    compression: Compression,
    index: usize,
    _decl: &crate::artifact::header::PayloadDecl,
    on_payload_file: &mut impl FnMut(usize, &str, &mut dyn Read) -> Result<()>,
) -> Result<()> {
    let decompressed = compression.wrap(reader);
    let mut archive = Archive::new(decompressed);
    let mut entries = archive.entries().context("reading payload tar entries")?;
    for entry in entries.by_ref() {
        let mut entry = entry.context("reading payload entry")?;
        if !crate::tar::is_yieldable(entry.header().entry_type()) {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        on_payload_file(index, &name, &mut entry)?;
    }
    Ok(())
}

fn parse_index_from_name(name: &str) -> Option<u32> {
    let base = Path::new(name).file_stem()?.to_str()?;
    base.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::pkey::Private;
    use openssl::rsa::Rsa;
    use openssl::sign::Signer;

    fn sha256_hex(data: &[u8]) -> String {
        let digest = openssl::hash::hash(MessageDigest::sha256(), data).unwrap();
        hex::encode(digest)
    }

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// `header.tar` with `payload_types.len()` payload declarations and
    /// matching `headers/NNNN/type-info` entries, written in the order
    /// given by `index_order` (rather than always ascending), so tests
    /// can exercise the out-of-sequence rejection path.
    fn header_tar(payload_types: &[&str], index_order: &[u32]) -> Vec<u8> {
        let header_info = serde_json::json!({
            "payloads": payload_types.iter().enumerate().map(|(i, t)| {
                serde_json::json!({"type": t, "name": format!("payload-{i}")})
            }).collect::<Vec<_>>(),
            "provides": {"artifact_name": "test-artifact"},
            "depends": {"device_type": ["qemux86-64"]},
        });
        let header_info_bytes = serde_json::to_vec(&header_info).unwrap();
        let mut type_infos = Vec::new();
        for (i, t) in payload_types.iter().enumerate() {
            let _ = i;
            type_infos.push(serde_json::to_vec(&serde_json::json!({"type": t})).unwrap());
        }
        let mut entries: Vec<(String, Vec<u8>)> = vec![("header-info".to_string(), header_info_bytes)];
        for idx in index_order {
            entries.push((format!("headers/{idx:04}/type-info"), type_infos[*idx as usize].clone()));
        }
        let refs: Vec<(&str, &[u8])> = entries.iter().map(|(n, b)| (n.as_str(), b.as_slice())).collect();
        build_tar(&refs)
    }

    fn data_tar(file_name: &str, content: &[u8]) -> Vec<u8> {
        build_tar(&[(file_name, content)])
    }

    /// Assemble the outer artifact tar from pre-built inner members, and
    /// return it alongside the raw manifest bytes (needed separately to
    /// produce a signature over it).
    fn build_artifact(
        header_tar_bytes: &[u8],
        data_tars: &[(&str, Vec<u8>)],
        signature: Option<&[u8]>,
    ) -> (Vec<u8>, Vec<u8>) {
        let version = br#"{"format":"mender","version":3}"#.to_vec();
        let mut manifest_text = format!("{}  header.tar\n", sha256_hex(header_tar_bytes));
        for (name, bytes) in data_tars {
            manifest_text.push_str(&format!("{}  {name}\n", sha256_hex(bytes)));
        }
        let manifest_bytes = manifest_text.into_bytes();

        let mut entries: Vec<(&str, &[u8])> = vec![("version", &version), ("manifest", &manifest_bytes)];
        if let Some(sig) = signature {
            entries.push(("manifest.sig", sig));
        }
        entries.push(("header.tar", header_tar_bytes));
        for (name, bytes) in data_tars {
            entries.push((name, bytes));
        }
        (build_tar(&entries), manifest_bytes)
    }

    fn keypair() -> openssl::pkey::PKey<Private> {
        let rsa = Rsa::generate(2048).unwrap();
        openssl::pkey::PKey::from_rsa(rsa).unwrap()
    }

    fn sign(keypair: &openssl::pkey::PKey<Private>, data: &[u8]) -> Vec<u8> {
        let mut signer = Signer::new(MessageDigest::sha256(), keypair).unwrap();
        signer.update(data).unwrap();
        signer.sign_to_vec().unwrap()
    }

    fn config(require_signature: bool, public_key: Option<PKey<Public>>) -> (ParseConfig, tempfile::TempDir) {
        let scripts_dir = tempfile::tempdir().unwrap();
        (
            ParseConfig {
                require_signature,
                public_key,
                scripts_dir: scripts_dir.path().to_path_buf(),
            },
            scripts_dir,
        )
    }

    fn noop_callback() -> impl FnMut(usize, &str, &mut dyn Read) -> Result<()> {
        |_, _, reader: &mut dyn Read| {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(())
        }
    }

    #[test]
    fn well_formed_single_payload_artifact_parses() {
        let header = header_tar(&["module-image"], &[0]);
        let payload = data_tar("file.bin", b"payload bytes");
        let (artifact, _manifest) = build_artifact(&header, &[("data/0000.tar", payload)], None);
        let (config, _dir) = config(false, None);

        let mut seen = Vec::new();
        let parsed = parse(&artifact[..], &config, |index, name, reader| {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            seen.push((index, name.to_string(), buf));
            Ok(())
        })
        .unwrap();

        assert_eq!(parsed.format_version, 3);
        assert!(!parsed.signature_present);
        assert_eq!(parsed.header.header_info.provides.artifact_name, "test-artifact");
        assert_eq!(seen, vec![(0, "file.bin".to_string(), b"payload bytes".to_vec())]);
    }

    #[test]
    fn missing_signature_is_rejected_when_required() {
        let header = header_tar(&["module-image"], &[0]);
        let payload = data_tar("file.bin", b"payload bytes");
        let (artifact, _manifest) = build_artifact(&header, &[("data/0000.tar", payload)], None);
        let (config, _dir) = config(true, None);

        let err = parse(&artifact[..], &config, noop_callback()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::SignatureMissing)
        ));
    }

    #[test]
    fn signature_not_matching_manifest_is_rejected() {
        let header = header_tar(&["module-image"], &[0]);
        let payload = data_tar("file.bin", b"payload bytes");
        let keys = keypair();
        let pub_pem = keys.public_key_to_pem().unwrap();
        let public_key = PKey::public_key_from_pem(&pub_pem).unwrap();
        // Sign something other than the manifest that ends up in the
        // artifact, so the signature is well-formed but verifies false.
        let bad_sig = sign(&keys, b"not the manifest");
        let (artifact, _manifest) = build_artifact(&header, &[("data/0000.tar", payload)], Some(&bad_sig));
        let (config, _dir) = config(true, Some(public_key));

        let err = parse(&artifact[..], &config, noop_callback()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::SignatureInvalid)
        ));
    }

    #[test]
    fn valid_signature_over_manifest_is_accepted() {
        let header = header_tar(&["module-image"], &[0]);
        let payload = data_tar("file.bin", b"payload bytes");
        let keys = keypair();
        let pub_pem = keys.public_key_to_pem().unwrap();
        let public_key = PKey::public_key_from_pem(&pub_pem).unwrap();

        // Build the manifest first so the signature covers the exact
        // bytes that will end up inside the artifact.
        let (_unsigned, manifest_bytes) = build_artifact(&header, &[("data/0000.tar", payload.clone())], None);
        let sig = sign(&keys, &manifest_bytes);
        let (artifact, _manifest) = build_artifact(&header, &[("data/0000.tar", payload)], Some(&sig));
        let (config, _dir) = config(true, Some(public_key));

        let parsed = parse(&artifact[..], &config, noop_callback()).unwrap();
        assert!(parsed.signature_present);
    }

    #[test]
    fn data_payload_index_gap_is_rejected() {
        let header = header_tar(&["module-image", "module-image"], &[0, 1]);
        let first = data_tar("a.bin", b"a");
        let second = data_tar("b.bin", b"b");
        // Second payload is stored as index 2, skipping the required 1.
        let (artifact, _manifest) =
            build_artifact(&header, &[("data/0000.tar", first), ("data/0002.tar", second)], None);
        let (config, _dir) = config(false, None);

        let err = parse(&artifact[..], &config, noop_callback()).unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::UnexpectedIndex { observed, expected }) => {
                assert_eq!(*observed, 2);
                assert_eq!(*expected, 1);
            }
            other => panic!("expected UnexpectedIndex, got {other:?}"),
        }
    }

    #[test]
    fn out_of_order_type_info_entries_are_rejected() {
        // headers/0001/type-info written before headers/0000/type-info.
        let header = header_tar(&["module-image", "module-image"], &[1, 0]);
        let payload = data_tar("file.bin", b"payload bytes");
        let (artifact, _manifest) = build_artifact(&header, &[("data/0000.tar", payload)], None);
        let (config, _dir) = config(false, None);

        let err = parse(&artifact[..], &config, noop_callback()).unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::UnexpectedIndex { observed, expected }) => {
                assert_eq!(*observed, 1);
                assert_eq!(*expected, 0);
            }
            other => panic!("expected UnexpectedIndex, got {other:?}"),
        }
    }
}
