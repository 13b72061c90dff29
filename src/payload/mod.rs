//! Payload strategies and the pieces they share.
//!
//! Encrypted block/segment wire format:
//!
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! The overhead is fixed, so a block's physical length is always derivable
//! from its plaintext length. Plaintext payloads carry no overhead at all.

pub mod chunked;
pub mod sequential;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::Read;
use std::path::PathBuf;

use crate::error::{CuspakError, Result};
use crate::header::{NONCE_SIZE, TAG_SIZE};
use crate::keys::DerivedKey;

/// Default plaintext chunk size for the chunked strategy
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Chunk size bounds
pub const MIN_CHUNK_SIZE: u32 = 4 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Plaintext segment size for the sequential strategy
pub const SEGMENT_SIZE: usize = 1024 * 1024;

/// Fixed per-block encryption overhead: nonce + tag
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// How many chunks one parallel encryption batch holds. Bounds pack memory
/// at `ENCRYPT_BATCH * chunk_size` while keeping the rayon pool busy.
pub const ENCRYPT_BATCH: usize = 16;

/// A validated input file queued for packing
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Where the file lives on disk
    pub disk_path: PathBuf,
    /// Relative path it will carry inside the container
    pub entry_path: String,
    /// Size in bytes at validation time
    pub size: u64,
}

pub fn validate_chunk_size(chunk_size: u32) -> Result<()> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(CuspakError::InvalidChunkSize(chunk_size));
    }
    Ok(())
}

/// Physical length of a block once sealed (identity when unencrypted)
pub fn sealed_len(plain_len: u32, encrypted: bool) -> u32 {
    if encrypted {
        plain_len + SEAL_OVERHEAD as u32
    } else {
        plain_len
    }
}

/// Encrypt one block with a fresh random nonce
pub fn seal_block(key: &DerivedKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CuspakError::PayloadCorrupted("block encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt one block. The header has already authenticated the key, so a
/// failing tag here means the payload bytes are damaged, not that the key
/// is wrong.
pub fn open_block(key: &DerivedKey, wire: &[u8]) -> Result<Vec<u8>> {
    if wire.len() < SEAL_OVERHEAD {
        return Err(CuspakError::PayloadCorrupted(format!(
            "block too short: {} bytes",
            wire.len()
        )));
    }

    let (nonce_bytes, ciphertext) = wire.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CuspakError::PayloadCorrupted("block authentication failed".into()))
}

/// Read until `buf` is full or EOF; returns how many bytes landed
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
