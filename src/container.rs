//! Container orchestration: pack, unpack, inspect.
//!
//! On-disk layout (all integers big-endian):
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ MAGIC "CUSPKG" (6)  VERSION (1)  SALT (32)                  │
//! │ IV (16)  TAG (16, all zero when the header is plaintext)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │ HEADER_LEN (4)                                              │
//! │ HEADER: crc32 (4) + manifest record, AEAD-sealed when a     │
//! │         secret was supplied                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │ PAYLOAD: sequential ciphertext runs, or block index +       │
//! │          shuffled block pool                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │ TRAILER: SHA3-256 over every preceding byte (32)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pack writes to a same-directory temporary file and renames it into place
//! only after the trailer is flushed and synced; a drop guard removes the
//! temporary on every other exit path. Unpack trusts nothing it has not
//! verified: magic and version first, then the trailer checksum (fast-path
//! corruption check), then the header tag, then each file's content hash.

use rand::Rng;
use sha3::{Digest, Sha3_256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{CuspakError, ErrorKind, Result};
use crate::header::{open_manifest, seal_manifest, IV_SIZE, MAGIC, TAG_SIZE};
use crate::keys::{derive_key, generate_salt, DerivedKey, SALT_SIZE};
use crate::manifest::{Manifest, Strategy, FORMAT_VERSION};
use crate::payload::{
    chunked, sequential, validate_chunk_size, SourceFile, DEFAULT_CHUNK_SIZE,
};
use crate::progress::{CancelToken, Progress, ProgressSink};

/// Fixed bytes before the header: magic + version + salt + iv + tag
const PRELUDE_SIZE: usize = 6 + 1 + SALT_SIZE + IV_SIZE + TAG_SIZE;

/// Trailing SHA3-256 checksum
const TRAILER_SIZE: usize = 32;

/// Smallest byte count any container can have
const MIN_CONTAINER_SIZE: u64 = (PRELUDE_SIZE + 4 + TRAILER_SIZE) as u64;

/// Options for pack
#[derive(Clone)]
pub struct PackOptions {
    pub strategy: Strategy,
    /// Plaintext chunk size (chunked strategy only)
    pub chunk_size: u32,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub cancel: CancelToken,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress: None,
            cancel: CancelToken::new(),
        }
    }
}

/// Options for unpack
#[derive(Clone, Default)]
pub struct UnpackOptions {
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub cancel: CancelToken,
}

/// Pack `inputs` into a container at `output`.
///
/// With a secret the header and every payload block are AEAD-encrypted;
/// without one the container is a plaintext archive in the same layout.
/// The output appears atomically: either the finished container lands at
/// `output` or nothing does.
pub fn pack(
    inputs: &[PathBuf],
    output: &Path,
    secret: Option<&[u8]>,
    options: &PackOptions,
) -> Result<PathBuf> {
    if options.strategy == Strategy::Chunked {
        validate_chunk_size(options.chunk_size)?;
    }
    let sources = validate_inputs(inputs)?;
    options.cancel.check()?;

    let (salt, key) = match secret {
        Some(secret) => {
            let salt = generate_salt();
            let key = derive_key(secret, &salt);
            (salt, Some(key))
        }
        None => ([0u8; SALT_SIZE], None),
    };

    debug!(files = sources.len(), strategy = %options.strategy, "scanning inputs");
    let (manifest, chunk_scan, total_bytes) = match options.strategy {
        Strategy::Sequential => {
            let entries = sequential::scan_files(&sources)?;
            let mut manifest = Manifest::new(Strategy::Sequential, 0);
            for entry in entries {
                manifest.add_entry(entry)?;
            }
            let total = manifest.total_size();
            (manifest, None, total)
        }
        Strategy::Chunked => {
            let scan = chunked::scan_files(&sources, options.chunk_size)?;
            let mut manifest = Manifest::new(Strategy::Chunked, options.chunk_size);
            for entry in scan.entries.iter().cloned() {
                manifest.add_entry(entry)?;
            }
            let total = scan.distinct_bytes;
            (manifest, Some(scan), total)
        }
    };
    options.cancel.check()?;

    let sealed = seal_manifest(&manifest, key.as_ref())?;
    let progress = Progress::new(options.progress.clone(), total_bytes);

    let tmp_path = temp_path_for(output);
    let mut guard = TempGuard::new(tmp_path.clone());
    let file = File::create(&tmp_path)?;
    let mut writer = HashingWriter::new(BufWriter::new(file));

    writer.write_all(MAGIC)?;
    writer.write_all(&[FORMAT_VERSION])?;
    writer.write_all(&salt)?;
    writer.write_all(&sealed.iv)?;
    writer.write_all(&sealed.tag)?;
    writer.write_all(&(sealed.body.len() as u32).to_be_bytes())?;
    writer.write_all(&sealed.body)?;
    debug!(header_len = sealed.body.len(), "header written");

    match options.strategy {
        Strategy::Sequential => {
            sequential::write_payload(
                &sources,
                key.as_ref(),
                &mut writer,
                &progress,
                &options.cancel,
            )?;
        }
        Strategy::Chunked => {
            let scan = chunk_scan.as_ref().expect("scan exists for chunked packs");
            chunked::write_payload(
                &sources,
                scan,
                options.chunk_size,
                key.as_ref(),
                &mut writer,
                &progress,
                &options.cancel,
            )?;
        }
    }

    let (mut inner, digest) = writer.into_parts();
    inner.write_all(&digest)?;
    inner.flush()?;
    let file = inner
        .into_inner()
        .map_err(|err| CuspakError::Io(err.into_error()))?;
    file.sync_all()?;
    drop(file);

    options.cancel.check()?;
    std::fs::rename(&tmp_path, output)?;
    guard.disarm();

    info!(
        output = %output.display(),
        files = manifest.entries.len(),
        bytes = total_bytes,
        "container packed"
    );
    Ok(output.to_path_buf())
}

/// Unpack a container into `output_dir`, returning the recovered paths.
pub fn unpack(
    container: &Path,
    output_dir: &Path,
    secret: Option<&[u8]>,
    options: &UnpackOptions,
) -> Result<Vec<PathBuf>> {
    let file = File::open(container)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let envelope = read_envelope(&mut reader, file_len)?;

    // Fast-path corruption check before any key work or output is attempted.
    // The AEAD tag remains the authority for tamper detection.
    verify_trailer(container, file_len)?;
    options.cancel.check()?;

    let key = resolve_key(&envelope, secret)?;

    let mut body = vec![0u8; envelope.header_len];
    reader
        .read_exact(&mut body)
        .map_err(|_| CuspakError::HeaderCorrupted("container truncated".into()))?;
    let manifest = open_manifest(&body, &envelope.iv, &envelope.tag, key.as_ref())?;

    if manifest.strategy == Strategy::Chunked {
        validate_chunk_size(manifest.chunk_size)
            .map_err(|_| CuspakError::HeaderCorrupted("invalid chunk size".into()))?;
    }

    let created_root = !output_dir.exists();
    std::fs::create_dir_all(output_dir)?;

    let progress = Progress::new(options.progress.clone(), manifest.total_size());
    debug!(
        files = manifest.entries.len(),
        strategy = %manifest.strategy,
        "header verified, extracting"
    );

    let result = match manifest.strategy {
        Strategy::Sequential => sequential::read_payload(
            &mut reader,
            &manifest,
            output_dir,
            key.as_ref(),
            &progress,
            &options.cancel,
        ),
        Strategy::Chunked => {
            let index_pos = (PRELUDE_SIZE + 4 + envelope.header_len) as u64;
            chunked::read_payload(
                &mut reader,
                index_pos,
                &manifest,
                output_dir,
                key.as_ref(),
                &progress,
                &options.cancel,
            )
        }
    };

    match result {
        Ok(extracted) => {
            info!(
                container = %container.display(),
                files = extracted.len(),
                "container unpacked"
            );
            Ok(extracted)
        }
        Err(err) => {
            if created_root && err.kind() != ErrorKind::Cancelled {
                let _ = std::fs::remove_dir(output_dir);
            }
            Err(err)
        }
    }
}

/// What `inspect` can report about a container
#[derive(Debug, serde::Serialize)]
pub struct ContainerInfo {
    pub version: u8,
    pub encrypted: bool,
    pub container_size: u64,
    /// Manifest-level details; absent when the header is encrypted and no
    /// secret was supplied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntryInfo>>,
}

#[derive(Debug, serde::Serialize)]
pub struct EntryInfo {
    pub path: String,
    pub size: u64,
    pub content_hash: String,
    pub blocks: usize,
}

impl ContainerInfo {
    /// Pretty JSON rendering, used by `info --json`
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Read a container's envelope and, when possible, its manifest.
/// Without the secret an encrypted container still yields the envelope.
pub fn inspect(container: &Path, secret: Option<&[u8]>) -> Result<ContainerInfo> {
    let file = File::open(container)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let envelope = read_envelope(&mut reader, file_len)?;

    let mut info = ContainerInfo {
        version: envelope.version,
        encrypted: envelope.encrypted(),
        container_size: file_len,
        strategy: None,
        chunk_size: None,
        total_size: None,
        entries: None,
    };

    if envelope.encrypted() && secret.is_none() {
        return Ok(info);
    }

    let key = resolve_key(&envelope, secret)?;
    let mut body = vec![0u8; envelope.header_len];
    reader
        .read_exact(&mut body)
        .map_err(|_| CuspakError::HeaderCorrupted("container truncated".into()))?;
    let manifest = open_manifest(&body, &envelope.iv, &envelope.tag, key.as_ref())?;

    info.strategy = Some(manifest.strategy);
    info.chunk_size = (manifest.strategy == Strategy::Chunked).then_some(manifest.chunk_size);
    info.total_size = Some(manifest.total_size());
    info.entries = Some(
        manifest
            .entries
            .iter()
            .map(|e| EntryInfo {
                path: e.path.clone(),
                size: e.size,
                content_hash: hex::encode(e.content_hash),
                blocks: e.blocks.len(),
            })
            .collect(),
    );

    Ok(info)
}

/// The fixed fields preceding the header body
struct Envelope {
    version: u8,
    salt: [u8; SALT_SIZE],
    iv: [u8; IV_SIZE],
    tag: [u8; TAG_SIZE],
    header_len: usize,
}

impl Envelope {
    fn encrypted(&self) -> bool {
        self.tag.iter().any(|&b| b != 0)
    }
}

fn read_envelope<R: Read>(reader: &mut R, file_len: u64) -> Result<Envelope> {
    let mut magic = [0u8; 6];
    reader
        .read_exact(&mut magic)
        .map_err(|_| CuspakError::NotAContainer)?;
    if &magic != MAGIC {
        return Err(CuspakError::NotAContainer);
    }

    let mut version = [0u8; 1];
    reader
        .read_exact(&mut version)
        .map_err(|_| CuspakError::NotAContainer)?;
    let version = version[0];
    if version != FORMAT_VERSION {
        return Err(CuspakError::UnsupportedVersion(version));
    }

    if file_len < MIN_CONTAINER_SIZE {
        return Err(CuspakError::HeaderCorrupted("container truncated".into()));
    }

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    let mut tag = [0u8; TAG_SIZE];
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut salt)?;
    reader.read_exact(&mut iv)?;
    reader.read_exact(&mut tag)?;
    reader.read_exact(&mut len_buf)?;
    let header_len = u32::from_be_bytes(len_buf) as usize;

    if (PRELUDE_SIZE + 4 + header_len) as u64 + TRAILER_SIZE as u64 > file_len {
        return Err(CuspakError::HeaderCorrupted(
            "header length exceeds container".into(),
        ));
    }

    Ok(Envelope {
        version,
        salt,
        iv,
        tag,
        header_len,
    })
}

fn resolve_key(envelope: &Envelope, secret: Option<&[u8]>) -> Result<Option<DerivedKey>> {
    if envelope.encrypted() {
        let secret = secret.ok_or(CuspakError::SecretRequired)?;
        Ok(Some(derive_key(secret, &envelope.salt)))
    } else {
        if secret.is_some() {
            warn!("container is not encrypted; ignoring supplied secret");
        }
        Ok(None)
    }
}

/// Stream the whole container (minus the trailer) through SHA3-256 and
/// compare against the stored trailer.
fn verify_trailer(container: &Path, file_len: u64) -> Result<()> {
    let mut reader = BufReader::new(File::open(container)?);
    let mut hasher = Sha3_256::new();
    let mut remaining = file_len - TRAILER_SIZE as u64;
    let mut buf = vec![0u8; 64 * 1024];

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        reader
            .read_exact(&mut buf[..want])
            .map_err(|_| CuspakError::TrailerMismatch)?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }

    let mut stored = [0u8; TRAILER_SIZE];
    reader
        .read_exact(&mut stored)
        .map_err(|_| CuspakError::TrailerMismatch)?;

    let computed: [u8; TRAILER_SIZE] = hasher.finalize().into();
    if computed != stored {
        return Err(CuspakError::TrailerMismatch);
    }
    Ok(())
}

/// Check inputs exist, map them to unique relative entry paths
fn validate_inputs(inputs: &[PathBuf]) -> Result<Vec<SourceFile>> {
    let mut seen = HashSet::new();
    let mut sources = Vec::with_capacity(inputs.len());

    for input in inputs {
        let metadata =
            std::fs::metadata(input).map_err(|_| CuspakError::MissingInput(input.clone()))?;
        if !metadata.is_file() {
            return Err(CuspakError::MissingInput(input.clone()));
        }

        let entry_path = entry_path_for(input)?;
        if !seen.insert(entry_path.clone()) {
            return Err(CuspakError::DuplicatePath(entry_path));
        }

        sources.push(SourceFile {
            disk_path: input.clone(),
            entry_path,
            size: metadata.len(),
        });
    }

    Ok(sources)
}

/// Relative inputs keep their path inside the container; absolute inputs are
/// stored by file name.
fn entry_path_for(input: &Path) -> Result<String> {
    let invalid = || CuspakError::InvalidEntryPath(input.display().to_string());

    if input.is_absolute() {
        return input
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(invalid);
    }

    let mut parts = Vec::new();
    for component in input.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(invalid)?),
            Component::CurDir => {}
            _ => return Err(invalid()),
        }
    }
    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts.join("/"))
}

fn temp_path_for(output: &Path) -> PathBuf {
    let nonce: u32 = rand::thread_rng().gen();
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "container".into());
    output.with_file_name(format!("{}.tmp-{:08x}", name, nonce))
}

/// Removes the temporary container unless the rename succeeded
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write adapter that folds everything written into a SHA3-256 digest
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha3_256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha3_256::new(),
        }
    }

    fn into_parts(self) -> (W, [u8; TRAILER_SIZE]) {
        (self.inner, self.hasher.finalize().into())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
