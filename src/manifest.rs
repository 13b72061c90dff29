//! Manifest model and its binary codec.
//!
//! The manifest describes every packed file: relative path, plaintext size,
//! whole-file SHA-256, and (chunked mode) the ordered block references that
//! reassemble it. Serialization is fixed and versioned, all integers
//! big-endian, with a CRC32 of the record prepended. The checksum must
//! validate before any field is trusted; it is a corruption fast-path only —
//! tamper detection is the job of the header's AEAD tag.

use crate::error::{CuspakError, Result};
use serde::{Deserialize, Serialize};

/// Container format version understood by this implementation
pub const FORMAT_VERSION: u8 = 1;

/// Length of a whole-file content hash (SHA-256)
pub const CONTENT_HASH_SIZE: usize = 32;

/// Length of a truncated block content hash (BLAKE3, first 16 bytes)
pub const BLOCK_ID_SIZE: usize = 16;

/// Payload layout strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Sequential,
    Chunked,
}

impl Strategy {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Sequential => 0,
            Self::Chunked => 1,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Sequential),
            1 => Ok(Self::Chunked),
            other => Err(CuspakError::UnsupportedAlgorithm(format!(
                "strategy: {}",
                other
            ))),
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = CuspakError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "chunked" => Ok(Self::Chunked),
            _ => Err(CuspakError::UnsupportedAlgorithm(format!(
                "strategy: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Chunked => write!(f, "chunked"),
        }
    }
}

/// Reference to one fixed-size plaintext chunk: truncated content hash plus
/// chunk length. Two chunks with identical bytes produce the same ref, which
/// is what makes deduplication work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub id: [u8; BLOCK_ID_SIZE],
    pub len: u32,
}

impl BlockRef {
    /// Compute the ref for a plaintext chunk
    pub fn for_chunk(chunk: &[u8]) -> Self {
        let hash = blake3::hash(chunk);
        let mut id = [0u8; BLOCK_ID_SIZE];
        id.copy_from_slice(&hash.as_bytes()[..BLOCK_ID_SIZE]);
        Self {
            id,
            len: chunk.len() as u32,
        }
    }
}

/// One input file's manifest record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative path within the container (unique)
    pub path: String,
    /// Plaintext size in bytes
    pub size: u64,
    /// SHA-256 of the whole plaintext file
    pub content_hash: [u8; CONTENT_HASH_SIZE],
    /// Ordered chunk references (chunked strategy only, empty otherwise)
    pub blocks: Vec<BlockRef>,
}

/// Ordered file entries plus the layout parameters needed to read the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: u8,
    pub strategy: Strategy,
    /// Plaintext chunk size in bytes (0 for the sequential strategy)
    pub chunk_size: u32,
    pub entries: Vec<FileEntry>,
}

impl Manifest {
    pub fn new(strategy: Strategy, chunk_size: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            strategy,
            chunk_size,
            entries: Vec::new(),
        }
    }

    /// Add an entry, rejecting duplicate or unsafe paths
    pub fn add_entry(&mut self, entry: FileEntry) -> Result<()> {
        validate_entry_path(&entry.path)?;
        if self.entries.iter().any(|e| e.path == entry.path) {
            return Err(CuspakError::DuplicatePath(entry.path));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Total plaintext bytes across all entries
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Serialize with a prepended CRC32 over the record bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64 * self.entries.len() + 16);
        body.push(self.version);
        body.push(self.strategy.as_byte());
        body.extend_from_slice(&self.chunk_size.to_be_bytes());
        body.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());

        for entry in &self.entries {
            let path = entry.path.as_bytes();
            body.extend_from_slice(&(path.len() as u16).to_be_bytes());
            body.extend_from_slice(path);
            body.extend_from_slice(&entry.size.to_be_bytes());
            body.extend_from_slice(&entry.content_hash);
            if self.strategy == Strategy::Chunked {
                body.extend_from_slice(&(entry.blocks.len() as u32).to_be_bytes());
                for block in &entry.blocks {
                    body.extend_from_slice(&block.id);
                    body.extend_from_slice(&block.len.to_be_bytes());
                }
            }
        }

        let checksum = crc32fast::hash(&body);
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&checksum.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Parse and verify a checksummed manifest record
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(CuspakError::HeaderCorrupted("record too short".into()));
        }
        let stored = u32::from_be_bytes(data[..4].try_into().unwrap());
        let body = &data[4..];
        if crc32fast::hash(body) != stored {
            return Err(CuspakError::HeaderCorrupted("checksum mismatch".into()));
        }

        let mut reader = RecordReader::new(body);
        let version = reader.u8()?;
        if version != FORMAT_VERSION {
            return Err(CuspakError::UnsupportedVersion(version));
        }
        let strategy = Strategy::from_byte(reader.u8()?)?;
        let chunk_size = reader.u32()?;
        let entry_count = reader.u32()?;

        let mut manifest = Manifest {
            version,
            strategy,
            chunk_size,
            entries: Vec::new(),
        };

        for _ in 0..entry_count {
            let path_len = reader.u16()? as usize;
            let path = String::from_utf8(reader.bytes(path_len)?.to_vec())
                .map_err(|_| CuspakError::HeaderCorrupted("path is not UTF-8".into()))?;
            let size = reader.u64()?;
            let mut content_hash = [0u8; CONTENT_HASH_SIZE];
            content_hash.copy_from_slice(reader.bytes(CONTENT_HASH_SIZE)?);

            let mut blocks = Vec::new();
            if strategy == Strategy::Chunked {
                let block_count = reader.u32()?;
                for _ in 0..block_count {
                    let mut id = [0u8; BLOCK_ID_SIZE];
                    id.copy_from_slice(reader.bytes(BLOCK_ID_SIZE)?);
                    let len = reader.u32()?;
                    blocks.push(BlockRef { id, len });
                }
            }

            manifest.add_entry(FileEntry {
                path,
                size,
                content_hash,
                blocks,
            })?;
        }

        if !reader.is_empty() {
            return Err(CuspakError::HeaderCorrupted(
                "trailing bytes after entries".into(),
            ));
        }

        Ok(manifest)
    }
}

/// Reject paths that would escape the extraction directory
pub fn validate_entry_path(path: &str) -> Result<()> {
    if path.is_empty() || path.len() > u16::MAX as usize {
        return Err(CuspakError::InvalidEntryPath(path.to_string()));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(CuspakError::InvalidEntryPath(path.to_string()));
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(CuspakError::InvalidEntryPath(path.to_string()));
        }
    }
    Ok(())
}

/// Bounds-checked cursor over a manifest record
struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(CuspakError::HeaderCorrupted("record truncated".into()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use super::Strategy;

    fn entry(path: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
            content_hash: [0xAB; CONTENT_HASH_SIZE],
            blocks: Vec::new(),
        }
    }

    #[test]
    fn test_sequential_roundtrip() {
        let mut manifest = Manifest::new(Strategy::Sequential, 0);
        manifest.add_entry(entry("a.txt", 5)).unwrap();
        manifest.add_entry(entry("dir/b.bin", 1 << 20)).unwrap();

        let bytes = manifest.to_bytes();
        let restored = Manifest::from_bytes(&bytes).unwrap();
        assert_eq!(manifest, restored);
    }

    #[test]
    fn test_chunked_roundtrip() {
        let mut manifest = Manifest::new(Strategy::Chunked, 64 * 1024);
        let mut e = entry("big.bin", 100_000);
        e.blocks = vec![
            BlockRef::for_chunk(&[1u8; 64 * 1024]),
            BlockRef::for_chunk(&[2u8; 34_464]),
        ];
        manifest.add_entry(e).unwrap();

        let restored = Manifest::from_bytes(&manifest.to_bytes()).unwrap();
        assert_eq!(manifest, restored);
        assert_eq!(restored.entries[0].blocks.len(), 2);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut manifest = Manifest::new(Strategy::Sequential, 0);
        manifest.add_entry(entry("a.txt", 5)).unwrap();

        let mut bytes = manifest.to_bytes();
        // Flip one bit in the body
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        match Manifest::from_bytes(&bytes) {
            Err(CuspakError::HeaderCorrupted(_)) => {}
            other => panic!("expected HeaderCorrupted, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_version_rejected() {
        let manifest = Manifest::new(Strategy::Sequential, 0);
        let mut bytes = manifest.to_bytes();
        bytes[4] = 99; // version byte lives right after the checksum
        let body_checksum = crc32fast::hash(&bytes[4..]);
        bytes[..4].copy_from_slice(&body_checksum.to_be_bytes());

        match Manifest::from_bytes(&bytes) {
            Err(CuspakError::UnsupportedVersion(99)) => {}
            other => panic!("expected UnsupportedVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let mut manifest = Manifest::new(Strategy::Sequential, 0);
        manifest.add_entry(entry("same.txt", 1)).unwrap();
        match manifest.add_entry(entry("same.txt", 2)) {
            Err(CuspakError::DuplicatePath(p)) => assert_eq!(p, "same.txt"),
            other => panic!("expected DuplicatePath, got {:?}", other),
        }
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        for path in ["", "/etc/passwd", "../escape", "a/../b", "a//b", "a\\b", "."] {
            assert!(
                validate_entry_path(path).is_err(),
                "path {:?} should be rejected",
                path
            );
        }
        for path in ["a.txt", "dir/sub/file.bin", "weird name.txt"] {
            assert!(validate_entry_path(path).is_ok());
        }
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("sequential".parse::<Strategy>().unwrap(), Strategy::Sequential);
        assert_eq!("CHUNKED".parse::<Strategy>().unwrap(), Strategy::Chunked);
        assert!("zip".parse::<Strategy>().is_err());
        assert!(Strategy::from_byte(7).is_err());
    }

    #[test]
    fn test_block_ref_content_addressing() {
        let a = BlockRef::for_chunk(b"identical bytes");
        let b = BlockRef::for_chunk(b"identical bytes");
        let c = BlockRef::for_chunk(b"different bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len, 15);
    }

    proptest! {
        #[test]
        fn prop_roundtrip_arbitrary_entries(
            files in proptest::collection::vec(
                ("[a-z]{1,12}(/[a-z0-9]{1,8}){0,2}", 0u64..10_000_000),
                0..20,
            )
        ) {
            let mut manifest = Manifest::new(Strategy::Sequential, 0);
            for (path, size) in files {
                // Duplicate paths from the generator are legitimately rejected
                let _ = manifest.add_entry(entry(&path, size));
            }
            let restored = Manifest::from_bytes(&manifest.to_bytes()).unwrap();
            prop_assert_eq!(manifest, restored);
        }
    }
}
