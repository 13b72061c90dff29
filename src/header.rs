//! Sealing and opening the manifest record.
//!
//! The checksummed manifest bytes are encrypted with AES-256-GCM under the
//! derived key. The 96-bit nonce occupies the first 12 bytes of the fixed
//! 16-byte IV field; the 16-byte authentication tag is stored detached in
//! the prelude. An all-zero tag marks a plaintext (unencrypted) header.
//!
//! Tag verification happens before anything is decrypted. A failed tag is
//! reported as `AuthenticationFailed` without distinguishing a wrong key
//! from a tampered header.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{CuspakError, Result};
use crate::keys::DerivedKey;
use crate::manifest::Manifest;

/// Magic bytes identifying a cuspak container
pub const MAGIC: &[u8; 6] = b"CUSPKG";

/// Size of the IV field in the container prelude
pub const IV_SIZE: usize = 16;

/// AES-GCM nonce size (stored in the first bytes of the IV field)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size
pub const TAG_SIZE: usize = 16;

/// A manifest ready to be written: IV + detached tag + (possibly encrypted) body
#[derive(Debug)]
pub struct SealedHeader {
    pub iv: [u8; IV_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub body: Vec<u8>,
}

/// Serialize and (when a key is present) encrypt the manifest.
pub fn seal_manifest(manifest: &Manifest, key: Option<&DerivedKey>) -> Result<SealedHeader> {
    let plaintext = manifest.to_bytes();

    let Some(key) = key else {
        return Ok(SealedHeader {
            iv: [0u8; IV_SIZE],
            tag: [0u8; TAG_SIZE],
            body: plaintext,
        });
    };

    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv[..NONCE_SIZE]);

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv[..NONCE_SIZE]), plaintext.as_slice())
        .map_err(|_| CuspakError::HeaderCorrupted("header encryption failed".into()))?;

    // aes-gcm appends the tag; the container stores it detached in the prelude
    let split = sealed.len() - TAG_SIZE;
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&sealed[split..]);
    sealed.truncate(split);

    Ok(SealedHeader {
        iv,
        tag,
        body: sealed,
    })
}

/// Verify, decrypt, and parse a sealed header read back from a container.
pub fn open_manifest(
    body: &[u8],
    iv: &[u8; IV_SIZE],
    tag: &[u8; TAG_SIZE],
    key: Option<&DerivedKey>,
) -> Result<Manifest> {
    let encrypted = tag.iter().any(|&b| b != 0);

    if !encrypted {
        return Manifest::from_bytes(body);
    }

    let Some(key) = key else {
        return Err(CuspakError::SecretRequired);
    };

    let mut sealed = Vec::with_capacity(body.len() + TAG_SIZE);
    sealed.extend_from_slice(body);
    sealed.extend_from_slice(tag);

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv[..NONCE_SIZE]), sealed.as_slice())
        .map_err(|_| CuspakError::AuthenticationFailed)?;

    Manifest::from_bytes(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{derive_key, SALT_SIZE};
    use crate::manifest::{FileEntry, Strategy, CONTENT_HASH_SIZE};

    fn test_manifest() -> Manifest {
        let mut manifest = Manifest::new(Strategy::Sequential, 0);
        manifest
            .add_entry(FileEntry {
                path: "doc.txt".into(),
                size: 42,
                content_hash: [0x11; CONTENT_HASH_SIZE],
                blocks: Vec::new(),
            })
            .unwrap();
        manifest
    }

    #[test]
    fn test_sealed_roundtrip() {
        let key = derive_key(b"secret", &[3u8; SALT_SIZE]);
        let manifest = test_manifest();

        let sealed = seal_manifest(&manifest, Some(&key)).unwrap();
        assert_ne!(sealed.tag, [0u8; TAG_SIZE]);

        let opened = open_manifest(&sealed.body, &sealed.iv, &sealed.tag, Some(&key)).unwrap();
        assert_eq!(manifest, opened);
    }

    #[test]
    fn test_plaintext_roundtrip() {
        let manifest = test_manifest();
        let sealed = seal_manifest(&manifest, None).unwrap();
        assert_eq!(sealed.tag, [0u8; TAG_SIZE]);

        let opened = open_manifest(&sealed.body, &sealed.iv, &sealed.tag, None).unwrap();
        assert_eq!(manifest, opened);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let key = derive_key(b"correct", &[3u8; SALT_SIZE]);
        let wrong = derive_key(b"wrong", &[3u8; SALT_SIZE]);
        let sealed = seal_manifest(&test_manifest(), Some(&key)).unwrap();

        match open_manifest(&sealed.body, &sealed.iv, &sealed.tag, Some(&wrong)) {
            Err(CuspakError::AuthenticationFailed) => {}
            other => panic!("expected AuthenticationFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_tampered_body_fails_authentication() {
        let key = derive_key(b"secret", &[3u8; SALT_SIZE]);
        let mut sealed = seal_manifest(&test_manifest(), Some(&key)).unwrap();
        sealed.body[0] ^= 0xFF;

        match open_manifest(&sealed.body, &sealed.iv, &sealed.tag, Some(&key)) {
            Err(CuspakError::AuthenticationFailed) => {}
            other => panic!("expected AuthenticationFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_encrypted_header_requires_secret() {
        let key = derive_key(b"secret", &[3u8; SALT_SIZE]);
        let sealed = seal_manifest(&test_manifest(), Some(&key)).unwrap();

        match open_manifest(&sealed.body, &sealed.iv, &sealed.tag, None) {
            Err(CuspakError::SecretRequired) => {}
            other => panic!("expected SecretRequired, got {:?}", other),
        }
    }

    #[test]
    fn test_tampered_plaintext_header_is_corruption() {
        let sealed = seal_manifest(&test_manifest(), None).unwrap();
        let mut body = sealed.body.clone();
        let last = body.len() - 1;
        body[last] ^= 0x01;

        match open_manifest(&body, &sealed.iv, &sealed.tag, None) {
            Err(CuspakError::HeaderCorrupted(_)) => {}
            other => panic!("expected HeaderCorrupted, got {:?}", other),
        }
    }
}
