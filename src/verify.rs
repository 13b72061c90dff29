//! Post-extraction integrity gate.
//!
//! Decryption succeeding is not proof of a correct result, so every
//! extracted file is re-read from disk and its SHA-256 compared against the
//! manifest before unpack may report it as recovered.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{CuspakError, Result};
use crate::manifest::CONTENT_HASH_SIZE;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Streaming SHA-256 of a file on disk
pub fn hash_file(path: &Path) -> Result<[u8; CONTENT_HASH_SIZE]> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().into())
}

/// Recompute an extracted file's content hash and compare to the manifest.
/// The caller is responsible for deleting the file on mismatch.
pub fn verify_extracted(path: &Path, expected: &[u8; CONTENT_HASH_SIZE]) -> Result<()> {
    let actual = hash_file(path)?;
    if &actual != expected {
        return Err(CuspakError::ContentHashMismatch(
            path.display().to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hash_file_matches_oneshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let expected: [u8; 32] = Sha256::digest(&data).into();
        assert_eq!(hash_file(&path).unwrap(), expected);
    }

    #[test]
    fn test_verify_extracted_accepts_match() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ok.txt");
        std::fs::write(&path, b"hello").unwrap();

        let expected: [u8; 32] = Sha256::digest(b"hello").into();
        assert!(verify_extracted(&path, &expected).is_ok());
    }

    #[test]
    fn test_verify_extracted_rejects_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, b"actual contents").unwrap();

        match verify_extracted(&path, &[0u8; 32]) {
            Err(CuspakError::ContentHashMismatch(_)) => {}
            other => panic!("expected ContentHashMismatch, got {:?}", other),
        }
    }
}
