//! Chunked-shuffled payload strategy.
//!
//! Every file is split into fixed-size plaintext chunks addressed by a
//! truncated BLAKE3 hash. Identical chunks collapse to one stored copy. The
//! distinct chunks are written once, in a freshly shuffled physical order
//! that has nothing to do with any file's logical order, behind an index:
//!
//! ```text
//! [block count: u32][id(16) + wire_len(u32)] per physical block, then the
//! ciphertext block pool in the same physical order
//! ```
//!
//! Packing makes two passes over the sources: pass one streams every file to
//! hash it and collect its chunk refs, pass two re-reads chunks in shuffled
//! order and seals them in bounded parallel batches. Only one batch of
//! chunks is ever in memory.

use rand::seq::SliceRandom;
use rand::thread_rng;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{CuspakError, ErrorKind, Result};
use crate::keys::DerivedKey;
use crate::manifest::{BlockRef, FileEntry, Manifest, BLOCK_ID_SIZE};
use crate::payload::{
    open_block, read_full, seal_block, sealed_len, SourceFile, ENCRYPT_BATCH,
};
use crate::progress::{CancelToken, Progress};
use crate::verify;

/// Size of one block index entry on disk: id + wire length
const INDEX_ENTRY_SIZE: usize = BLOCK_ID_SIZE + 4;

/// Where a distinct chunk can be re-read from during pass two
#[derive(Debug, Clone, Copy)]
pub struct ChunkSource {
    pub file_idx: usize,
    pub chunk_idx: u64,
}

/// Everything pass one learns about the inputs
#[derive(Debug)]
pub struct ScanResult {
    pub entries: Vec<FileEntry>,
    /// Distinct chunks in declaration order (first appearance wins)
    pub distinct: Vec<(BlockRef, ChunkSource)>,
    /// Total plaintext bytes that will actually be stored
    pub distinct_bytes: u64,
}

/// Pass one: stream every file, hashing it whole and per chunk.
/// Files are processed in parallel; the dedup table is built single-threaded
/// afterwards so first-appearance order is deterministic.
pub fn scan_files(files: &[SourceFile], chunk_size: u32) -> Result<ScanResult> {
    let per_file: Vec<FileEntry> = files
        .par_iter()
        .map(|file| scan_one(file, chunk_size))
        .collect::<Result<_>>()?;

    let mut seen: HashMap<BlockRef, ChunkSource> = HashMap::new();
    let mut distinct = Vec::new();
    let mut distinct_bytes = 0u64;

    for (file_idx, entry) in per_file.iter().enumerate() {
        for (chunk_idx, block) in entry.blocks.iter().enumerate() {
            if !seen.contains_key(block) {
                let source = ChunkSource {
                    file_idx,
                    chunk_idx: chunk_idx as u64,
                };
                seen.insert(*block, source);
                distinct.push((*block, source));
                distinct_bytes += block.len as u64;
            }
        }
    }

    debug!(
        files = files.len(),
        chunks = distinct.len(),
        deduped_bytes = distinct_bytes,
        "chunk scan complete"
    );

    Ok(ScanResult {
        entries: per_file,
        distinct,
        distinct_bytes,
    })
}

fn scan_one(file: &SourceFile, chunk_size: u32) -> Result<FileEntry> {
    let mut reader = BufReader::new(File::open(&file.disk_path)?);
    let mut buf = vec![0u8; chunk_size as usize];
    let mut hasher = Sha256::new();
    let mut blocks = Vec::new();
    let mut size = 0u64;

    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        blocks.push(BlockRef::for_chunk(&buf[..n]));
        size += n as u64;
    }

    Ok(FileEntry {
        path: file.entry_path.clone(),
        size,
        content_hash: hasher.finalize().into(),
        blocks,
    })
}

/// Pass two: write the block index, then every distinct chunk in shuffled
/// physical order, sealing batches in parallel. Physical positions are
/// assigned purely by the single writer.
pub fn write_payload<W: Write>(
    files: &[SourceFile],
    scan: &ScanResult,
    chunk_size: u32,
    key: Option<&DerivedKey>,
    out: &mut W,
    progress: &Progress,
    cancel: &CancelToken,
) -> Result<()> {
    let shuffled = shuffle_blocks(&scan.distinct);
    let encrypted = key.is_some();

    out.write_all(&(shuffled.len() as u32).to_be_bytes())?;
    for (block, _) in &shuffled {
        out.write_all(&block.id)?;
        out.write_all(&sealed_len(block.len, encrypted).to_be_bytes())?;
    }

    for batch in shuffled.chunks(ENCRYPT_BATCH) {
        cancel.check()?;

        let sealed: Vec<Vec<u8>> = batch
            .par_iter()
            .map(|(block, source)| {
                let chunk = read_source_chunk(files, *source, chunk_size, block)?;
                match key {
                    Some(key) => seal_block(key, &chunk),
                    None => Ok(chunk),
                }
            })
            .collect::<Result<_>>()?;

        for (wire, (block, _)) in sealed.iter().zip(batch) {
            out.write_all(wire)?;
            progress.add(block.len as u64);
        }
    }

    Ok(())
}

/// Re-read one chunk from its source file, confirming it still matches the
/// ref computed during pass one.
fn read_source_chunk(
    files: &[SourceFile],
    source: ChunkSource,
    chunk_size: u32,
    expected: &BlockRef,
) -> Result<Vec<u8>> {
    let file = &files[source.file_idx];
    let mut reader = File::open(&file.disk_path)?;
    reader.seek(SeekFrom::Start(source.chunk_idx * chunk_size as u64))?;

    let mut chunk = vec![0u8; expected.len as usize];
    reader.read_exact(&mut chunk).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            CuspakError::PayloadCorrupted(format!(
                "source file {} changed during packing",
                file.entry_path
            ))
        } else {
            err.into()
        }
    })?;

    if BlockRef::for_chunk(&chunk) != *expected {
        return Err(CuspakError::PayloadCorrupted(format!(
            "source file {} changed during packing",
            file.entry_path
        )));
    }

    Ok(chunk)
}

/// Random physical order, re-drawn in the (vanishing) case the draw lands
/// on declaration order so the payload never mirrors any logical layout.
fn shuffle_blocks(distinct: &[(BlockRef, ChunkSource)]) -> Vec<(BlockRef, ChunkSource)> {
    let mut shuffled = distinct.to_vec();
    if shuffled.len() > 1 {
        let mut rng = thread_rng();
        loop {
            shuffled.shuffle(&mut rng);
            if shuffled
                .iter()
                .zip(distinct)
                .any(|(a, b)| a.0 != b.0)
            {
                break;
            }
        }
    }
    shuffled
}

/// Reconstruct every file by walking its ordered refs through the block
/// index. Integrity failures are per-file: the damaged file's output is
/// removed and unrelated files still extract; anything else aborts.
pub fn read_payload<R: Read + Seek>(
    input: &mut R,
    index_pos: u64,
    manifest: &Manifest,
    output_dir: &Path,
    key: Option<&DerivedKey>,
    progress: &Progress,
    cancel: &CancelToken,
) -> Result<Vec<PathBuf>> {
    let index = read_index(input, index_pos)?;
    let encrypted = key.is_some();
    let chunk_size = manifest.chunk_size;

    let mut wire_buf = vec![0u8; sealed_len(chunk_size, encrypted) as usize];
    let mut extracted = Vec::new();
    let mut failures: Vec<String> = Vec::new();

    for entry in &manifest.entries {
        cancel.check()?;
        let out_path = output_dir.join(&entry.path);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let result = extract_file(
            input, &index, entry, &out_path, chunk_size, key, &mut wire_buf, progress, cancel,
        );

        match result {
            Ok(()) => extracted.push(out_path),
            Err(err) if err.kind() == ErrorKind::Integrity => {
                warn!(path = %entry.path, %err, "file unrecoverable");
                let _ = std::fs::remove_file(&out_path);
                failures.push(entry.path.clone());
            }
            Err(err) => {
                let _ = std::fs::remove_file(&out_path);
                return Err(err);
            }
        }
    }

    if failures.is_empty() {
        Ok(extracted)
    } else {
        Err(CuspakError::FilesUnrecoverable(failures))
    }
}

struct BlockIndex {
    /// id → (absolute offset of the wire bytes, wire length)
    positions: HashMap<[u8; BLOCK_ID_SIZE], (u64, u32)>,
}

fn read_index<R: Read + Seek>(input: &mut R, index_pos: u64) -> Result<BlockIndex> {
    input.seek(SeekFrom::Start(index_pos))?;

    let mut count_buf = [0u8; 4];
    input
        .read_exact(&mut count_buf)
        .map_err(|_| CuspakError::PayloadCorrupted("block index truncated".into()))?;
    let count = u32::from_be_bytes(count_buf) as usize;

    let mut positions = HashMap::new();
    let mut entry_buf = [0u8; INDEX_ENTRY_SIZE];
    let pool_base = index_pos + 4 + (count * INDEX_ENTRY_SIZE) as u64;
    let mut offset = pool_base;

    for _ in 0..count {
        input
            .read_exact(&mut entry_buf)
            .map_err(|_| CuspakError::PayloadCorrupted("block index truncated".into()))?;
        let mut id = [0u8; BLOCK_ID_SIZE];
        id.copy_from_slice(&entry_buf[..BLOCK_ID_SIZE]);
        let wire_len = u32::from_be_bytes(entry_buf[BLOCK_ID_SIZE..].try_into().unwrap());
        positions.insert(id, (offset, wire_len));
        offset += wire_len as u64;
    }

    Ok(BlockIndex { positions })
}

#[allow(clippy::too_many_arguments)]
fn extract_file<R: Read + Seek>(
    input: &mut R,
    index: &BlockIndex,
    entry: &FileEntry,
    out_path: &Path,
    chunk_size: u32,
    key: Option<&DerivedKey>,
    wire_buf: &mut [u8],
    progress: &Progress,
    cancel: &CancelToken,
) -> Result<()> {
    let declared: u64 = entry.blocks.iter().map(|b| b.len as u64).sum();
    if declared != entry.size {
        return Err(CuspakError::PayloadCorrupted(format!(
            "block lengths disagree with size for {}",
            entry.path
        )));
    }

    let mut writer = BufWriter::new(File::create(out_path)?);

    for (block_idx, block) in entry.blocks.iter().enumerate() {
        cancel.check()?;

        if block.len > chunk_size {
            return Err(CuspakError::PayloadCorrupted(format!(
                "block {} of {} exceeds chunk size",
                block_idx, entry.path
            )));
        }

        let Some(&(offset, wire_len)) = index.positions.get(&block.id) else {
            return Err(CuspakError::MissingBlock {
                path: entry.path.clone(),
                index: block_idx,
            });
        };

        if wire_len != sealed_len(block.len, key.is_some()) {
            return Err(CuspakError::PayloadCorrupted(format!(
                "block {} of {} has inconsistent physical length",
                block_idx, entry.path
            )));
        }

        input.seek(SeekFrom::Start(offset))?;
        let wire = &mut wire_buf[..wire_len as usize];
        input
            .read_exact(wire)
            .map_err(|_| CuspakError::IncompletePayload {
                path: entry.path.clone(),
                expected: entry.size,
                got: (block_idx as u64) * chunk_size as u64,
            })?;

        match key {
            Some(key) => {
                let plain = open_block(key, wire)?;
                if plain.len() != block.len as usize {
                    return Err(CuspakError::PayloadCorrupted(format!(
                        "block {} of {} decrypted to the wrong length",
                        block_idx, entry.path
                    )));
                }
                writer.write_all(&plain)?;
            }
            None => writer.write_all(wire)?,
        }
        progress.add(block.len as u64);
    }

    writer.flush()?;
    drop(writer);

    verify::verify_extracted(out_path, &entry.content_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{derive_key, SALT_SIZE};
    use crate::manifest::Strategy;
    use std::io::Cursor;
    use tempfile::tempdir;

    const CHUNK: u32 = 4096;

    fn make_sources(dir: &Path, specs: &[(&str, Vec<u8>)]) -> Vec<SourceFile> {
        specs
            .iter()
            .map(|(name, data)| {
                let path = dir.join(name);
                std::fs::write(&path, data).unwrap();
                SourceFile {
                    disk_path: path,
                    entry_path: name.to_string(),
                    size: data.len() as u64,
                }
            })
            .collect()
    }

    fn manifest_from_scan(scan: &ScanResult) -> Manifest {
        let mut manifest = Manifest::new(Strategy::Chunked, CHUNK);
        for entry in &scan.entries {
            manifest.add_entry(entry.clone()).unwrap();
        }
        manifest
    }

    fn pack_to_vec(
        sources: &[SourceFile],
        scan: &ScanResult,
        key: Option<&DerivedKey>,
    ) -> Vec<u8> {
        let progress = Progress::new(None, scan.distinct_bytes);
        let mut payload = Vec::new();
        write_payload(
            sources,
            scan,
            CHUNK,
            key,
            &mut payload,
            &progress,
            &CancelToken::new(),
        )
        .unwrap();
        payload
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let data_a: Vec<u8> = (0..20_000).map(|i| (i % 256) as u8).collect();
        let data_b: Vec<u8> = (0..9_999).map(|i| ((i * 7) % 256) as u8).collect();
        let sources = make_sources(
            dir.path(),
            &[("a.bin", data_a.clone()), ("b.bin", data_b.clone())],
        );

        let key = derive_key(b"secret", &[8u8; SALT_SIZE]);
        let scan = scan_files(&sources, CHUNK).unwrap();
        let manifest = manifest_from_scan(&scan);
        let payload = pack_to_vec(&sources, &scan, Some(&key));

        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let progress = Progress::new(None, manifest.total_size());
        let extracted = read_payload(
            &mut Cursor::new(payload),
            0,
            &manifest,
            &out_dir,
            Some(&key),
            &progress,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(extracted.len(), 2);
        assert_eq!(std::fs::read(out_dir.join("a.bin")).unwrap(), data_a);
        assert_eq!(std::fs::read(out_dir.join("b.bin")).unwrap(), data_b);
    }

    #[test]
    fn test_deduplication() {
        let dir = tempdir().unwrap();
        let shared: Vec<u8> = (0..CHUNK as usize * 3).map(|i| (i % 256) as u8).collect();
        let sources = make_sources(
            dir.path(),
            &[("one.bin", shared.clone()), ("two.bin", shared.clone())],
        );

        let scan = scan_files(&sources, CHUNK).unwrap();
        // Identical files: every chunk of the second is already stored
        assert_eq!(scan.entries[0].blocks.len(), 3);
        assert_eq!(scan.entries[1].blocks.len(), 3);
        assert_eq!(scan.distinct.len(), 3);
        assert_eq!(scan.distinct_bytes, shared.len() as u64);
    }

    #[test]
    fn test_shuffle_decorrelates_physical_order() {
        let dir = tempdir().unwrap();
        // Two files, plenty of chunks, all distinct
        let data_a: Vec<u8> = (0..CHUNK as usize * 20).map(|i| (i % 253) as u8).collect();
        let data_b: Vec<u8> = (0..CHUNK as usize * 20)
            .map(|i| ((i * 11 + 3) % 251) as u8)
            .collect();
        let sources = make_sources(dir.path(), &[("a", data_a), ("b", data_b)]);

        let scan = scan_files(&sources, CHUNK).unwrap();
        let payload = pack_to_vec(&sources, &scan, None);

        // Parse physical id order straight out of the written index
        let count = u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize;
        assert_eq!(count, scan.distinct.len());
        let physical: Vec<[u8; BLOCK_ID_SIZE]> = (0..count)
            .map(|i| {
                let start = 4 + i * INDEX_ENTRY_SIZE;
                payload[start..start + BLOCK_ID_SIZE].try_into().unwrap()
            })
            .collect();
        let logical: Vec<[u8; BLOCK_ID_SIZE]> =
            scan.distinct.iter().map(|(b, _)| b.id).collect();

        assert_eq!(physical.len(), logical.len());
        assert_ne!(physical, logical, "physical order must not mirror logical order");
    }

    #[test]
    fn test_missing_block_is_per_file() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..CHUNK as usize + 17).map(|i| (i % 256) as u8).collect();
        let sources = make_sources(dir.path(), &[("good.bin", data.clone())]);

        let key = derive_key(b"secret", &[8u8; SALT_SIZE]);
        let scan = scan_files(&sources, CHUNK).unwrap();
        let mut manifest = manifest_from_scan(&scan);

        // An entry whose only block was never stored
        manifest
            .add_entry(FileEntry {
                path: "ghost.bin".into(),
                size: 5,
                content_hash: [0u8; 32],
                blocks: vec![BlockRef {
                    id: [0xEE; BLOCK_ID_SIZE],
                    len: 5,
                }],
            })
            .unwrap();

        let payload = pack_to_vec(&sources, &scan, Some(&key));
        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let progress = Progress::new(None, manifest.total_size());
        let result = read_payload(
            &mut Cursor::new(payload),
            0,
            &manifest,
            &out_dir,
            Some(&key),
            &progress,
            &CancelToken::new(),
        );

        match result {
            Err(CuspakError::FilesUnrecoverable(failed)) => {
                assert_eq!(failed, vec!["ghost.bin".to_string()]);
            }
            other => panic!("expected FilesUnrecoverable, got {:?}", other),
        }
        // The unrelated file still extracted, the casualty did not
        assert_eq!(std::fs::read(out_dir.join("good.bin")).unwrap(), data);
        assert!(!out_dir.join("ghost.bin").exists());
    }

    #[test]
    fn test_shuffle_never_returns_declaration_order() {
        let blocks: Vec<(BlockRef, ChunkSource)> = (0..4u8)
            .map(|i| {
                (
                    BlockRef::for_chunk(&[i; 32]),
                    ChunkSource {
                        file_idx: 0,
                        chunk_idx: i as u64,
                    },
                )
            })
            .collect();

        for _ in 0..50 {
            let shuffled = shuffle_blocks(&blocks);
            let same = shuffled.iter().zip(&blocks).all(|(a, b)| a.0 == b.0);
            assert!(!same);
        }
    }
}
