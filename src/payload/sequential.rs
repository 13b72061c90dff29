//! Sequential payload strategy: files written back-to-back in manifest
//! order as runs of fixed-size segments, each segment independently sealed.
//!
//! The manifest records plaintext sizes, so the reader always knows how many
//! segments a run holds and how long each is on the wire, independent of
//! encryption overhead. Extraction streams segment by segment; nothing is
//! ever buffered whole.

use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CuspakError, Result};
use crate::keys::DerivedKey;
use crate::manifest::{FileEntry, Manifest};
use crate::payload::{open_block, read_full, seal_block, sealed_len, SourceFile, SEGMENT_SIZE};
use crate::progress::{CancelToken, Progress};
use crate::verify;

/// Hash every input in parallel and build its manifest entry
pub fn scan_files(files: &[SourceFile]) -> Result<Vec<FileEntry>> {
    files
        .par_iter()
        .map(|file| {
            let content_hash = verify::hash_file(&file.disk_path)?;
            Ok(FileEntry {
                path: file.entry_path.clone(),
                size: file.size,
                content_hash,
                blocks: Vec::new(),
            })
        })
        .collect()
}

/// Write all files as contiguous segment runs in manifest order
pub fn write_payload<W: Write>(
    files: &[SourceFile],
    key: Option<&DerivedKey>,
    out: &mut W,
    progress: &Progress,
    cancel: &CancelToken,
) -> Result<()> {
    let mut buf = vec![0u8; SEGMENT_SIZE];

    for file in files {
        cancel.check()?;
        debug!(path = %file.entry_path, size = file.size, "writing sequential run");

        let mut reader = BufReader::new(File::open(&file.disk_path)?);
        let mut written: u64 = 0;

        loop {
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            cancel.check()?;

            match key {
                Some(key) => out.write_all(&seal_block(key, &buf[..n])?)?,
                None => out.write_all(&buf[..n])?,
            }
            written += n as u64;
            progress.add(n as u64);
        }

        if written != file.size {
            return Err(CuspakError::PayloadCorrupted(format!(
                "source file {} changed during packing",
                file.entry_path
            )));
        }
    }

    Ok(())
}

/// Extract every file in manifest order from a sequential payload.
///
/// Any failure is fatal for the whole container: runs are not independently
/// recoverable once the stream position is in doubt, so everything written
/// so far is rolled back. Cancellation is the one exception — completed
/// files stay.
pub fn read_payload<R: Read>(
    input: &mut R,
    manifest: &Manifest,
    output_dir: &Path,
    key: Option<&DerivedKey>,
    progress: &Progress,
    cancel: &CancelToken,
) -> Result<Vec<PathBuf>> {
    let encrypted = key.is_some();
    let mut wire_buf = vec![0u8; sealed_len(SEGMENT_SIZE as u32, encrypted) as usize];
    let mut extracted = Vec::with_capacity(manifest.entries.len());

    for entry in &manifest.entries {
        cancel.check()?;
        let out_path = output_dir.join(&entry.path);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if let Err(err) = extract_run(input, entry, &out_path, key, &mut wire_buf, progress, cancel)
        {
            let _ = std::fs::remove_file(&out_path);
            // Cancellation keeps completed files (best effort); every other
            // failure rolls the whole extraction back
            if !matches!(err, CuspakError::Cancelled) {
                rollback(&extracted, &out_path, output_dir);
            }
            return Err(err);
        }

        extracted.push(out_path);
    }

    Ok(extracted)
}

/// Remove everything extracted so far plus any now-empty directories we made
fn rollback(extracted: &[PathBuf], partial: &Path, output_dir: &Path) {
    for path in extracted {
        let _ = std::fs::remove_file(path);
    }
    for path in extracted.iter().map(PathBuf::as_path).chain([partial]) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == output_dir || std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

fn extract_run<R: Read>(
    input: &mut R,
    entry: &FileEntry,
    out_path: &Path,
    key: Option<&DerivedKey>,
    wire_buf: &mut [u8],
    progress: &Progress,
    cancel: &CancelToken,
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(out_path)?);
    let mut remaining = entry.size;

    while remaining > 0 {
        cancel.check()?;
        let seg_plain = remaining.min(SEGMENT_SIZE as u64) as usize;
        let wire_len = sealed_len(seg_plain as u32, key.is_some()) as usize;

        if let Err(err) = input.read_exact(&mut wire_buf[..wire_len]) {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(CuspakError::IncompletePayload {
                    path: entry.path.clone(),
                    expected: entry.size,
                    got: entry.size - remaining,
                });
            }
            return Err(err.into());
        }

        match key {
            Some(key) => {
                let plain = open_block(key, &wire_buf[..wire_len])?;
                if plain.len() != seg_plain {
                    return Err(CuspakError::PayloadCorrupted(format!(
                        "segment length mismatch in {}",
                        entry.path
                    )));
                }
                writer.write_all(&plain)?;
            }
            None => writer.write_all(&wire_buf[..seg_plain])?,
        }

        remaining -= seg_plain as u64;
        progress.add(seg_plain as u64);
    }

    writer.flush()?;
    drop(writer);

    // Mandatory gate: decryption succeeding proves nothing about the result
    verify::verify_extracted(out_path, &entry.content_hash)
}
