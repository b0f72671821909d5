//! Streaming download bridge (component C7, spec §4.7): for modules
//! that read payload files from FIFOs instead of `files/`, serves the
//! `streams-list` / `streams/<name>` protocol concurrently with the
//! module's `ArtifactInstall` invocation.
//!
//! Blocking FIFO opens are pushed onto `spawn_blocking` workers so the
//! event loop can keep observing the module's exit (spec §5: "Work that
//! unavoidably blocks... is offloaded to dedicated short-lived worker
//! threads").

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::hash::HashVerifyingReader;

/// One payload file still to be read, already wrapped for hash
/// verification against its manifest digest.
pub struct StreamFile {
    /// The name presented to the module (relative payload file name).
    pub name: String,
    /// Declared size, written verbatim into the `streams-list` line.
    pub size: u64,
    /// The hash-verified byte source; consumed exactly once.
    pub reader: Box<dyn Read + Send>,
}

/// How a payload's files are delivered to its Update Module.
pub enum PayloadSource {
    /// Files already materialized under `<work>/files/`.
    Files(Vec<(String, PathBuf)>),
    /// Files delivered over FIFOs as the module reads them.
    Streamed(Vec<StreamFile>),
}

/// Drives the `streams-list` / `streams/<name>` FIFO protocol for one
/// payload's work directory.
pub struct StreamBridge {
    root: PathBuf,
}

impl StreamBridge {
    /// Bind to a payload's work directory.
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf() }
    }

    /// Run the full protocol (spec §4.7 steps 1-4): create FIFOs, open
    /// `streams-list`, announce and stream each file in turn, then close.
    pub async fn serve(&self, files: Vec<StreamFile>) -> Result<()> {
        let streams_dir = self.root.join("streams");
        std::fs::create_dir_all(&streams_dir).context("creating streams/ directory")?;
        let list_path = self.root.join("streams-list");
        make_fifo(&list_path)?;
        for f in &files {
            make_fifo(&streams_dir.join(&f.name))?;
        }

        let list_path_for_open = list_path.clone();
        let mut list = tokio::task::spawn_blocking(move || open_for_write(&list_path_for_open))
            .await
            .context("join opening streams-list")??;

        for f in files {
            let line = format!("{}\t{}\n", f.name, f.size);
            write_line(&mut list, &line)?;

            let stream_path = streams_dir.join(&f.name);
            let mut reader = f.reader;
            let opened = tokio::task::spawn_blocking(move || open_for_write(&stream_path))
                .await
                .context("join opening stream fifo")??;
            copy_blocking(&mut reader, opened)?;
        }

        write_line(&mut list, "\n")?;
        drop(list);
        Ok(())
    }
}

fn make_fifo(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::from_bits_truncate(0o600)) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("mkfifo {path:?}")),
    }
}

fn open_for_write(path: &Path) -> Result<File> {
    File::options()
        .write(true)
        .open(path)
        .with_context(|| format!("opening fifo {path:?} for write (blocks until reader opens)"))
}

fn write_line(f: &mut File, line: &str) -> Result<()> {
    f.write_all(line.as_bytes()).context("writing to streams-list")
}

/// Copy one hash-verified file into its FIFO. Runs on the calling
/// (blocking worker) task; the FIFO's pipe capacity is the only
/// buffering, per spec §9's streaming-backpressure guidance.
fn copy_blocking(reader: &mut dyn Read, mut fifo: File) -> Result<()> {
    std::io::copy(reader, &mut fifo).context("streaming payload bytes into fifo")?;
    Ok(())
}

/// Wrap a payload reader for hash verification before handing it to the
/// bridge, matching C2's contract (spec §2 data-flow: "streams payload
/// bytes through C2").
pub fn verified(reader: impl Read + Send + 'static, expected_digest: &str, name: &str) -> Box<dyn Read + Send> {
    Box::new(HashVerifyingReader::new(reader, expected_digest.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};

    use super::*;

    #[tokio::test]
    async fn serves_announced_files_to_a_concurrent_reader() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = StreamBridge::new(dir.path());

        let files = vec![
            StreamFile {
                name: "rootfs.ext4".to_string(),
                size: 5,
                reader: Box::new(std::io::Cursor::new(b"hello".to_vec())),
            },
            StreamFile {
                name: "delta.bin".to_string(),
                size: 3,
                reader: Box::new(std::io::Cursor::new(b"abc".to_vec())),
            },
        ];

        let root = dir.path().to_path_buf();
        let reader = tokio::task::spawn_blocking(move || -> Vec<(String, u64, Vec<u8>)> {
            // The writer side blocks opening streams-list until this side
            // opens it for reading, same as a real module would.
            let list_path = root.join("streams-list");
            while !list_path.exists() {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            let list = File::open(&list_path).unwrap();
            let mut out = Vec::new();
            for line in BufReader::new(list).lines() {
                let line = line.unwrap();
                if line.is_empty() {
                    break;
                }
                let (name, size) = line.split_once('\t').unwrap();
                let size: u64 = size.parse().unwrap();
                let mut contents = Vec::new();
                let mut f = File::open(root.join("streams").join(name)).unwrap();
                std::io::Read::read_to_end(&mut f, &mut contents).unwrap();
                out.push((name.to_string(), size, contents));
            }
            out
        });

        let (served, read) = tokio::join!(bridge.serve(files), reader);
        served.unwrap();
        let read = read.unwrap();

        assert_eq!(read.len(), 2);
        assert_eq!(read[0], ("rootfs.ext4".to_string(), 5, b"hello".to_vec()));
        assert_eq!(read[1], ("delta.bin".to_string(), 3, b"abc".to_vec()));
    }

    #[test]
    fn make_fifo_tolerates_eexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        make_fifo(&path).unwrap();
        make_fifo(&path).unwrap();
    }
}
