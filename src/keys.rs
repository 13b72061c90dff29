//! Key derivation: secret + salt → fixed-length symmetric key.
//!
//! PBKDF2-HMAC-SHA256 with a deliberately slow iteration count. The salt is
//! generated fresh per container and stored unencrypted in the header region;
//! only the secret itself must stay unknown to an attacker.

use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

/// Symmetric key length in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Salt length in bytes
pub const SALT_SIZE: usize = 32;

/// PBKDF2 iteration count. Fixed for format v1.
pub const KDF_ITERATIONS: u32 = 100_000;

/// A 256-bit key derived from a secret and salt.
///
/// Lives only for the duration of one pack/unpack call; zeroized on drop so
/// key material does not linger in memory.
#[derive(Clone)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive a key from a secret and salt.
///
/// Deterministic: the same (secret, salt) pair always yields the same key,
/// which is what lets unpack recover the key from the stored salt.
pub fn derive_key(secret: &[u8], salt: &[u8; SALT_SIZE]) -> DerivedKey {
    let mut bytes = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(secret, salt, KDF_ITERATIONS, &mut bytes);
    DerivedKey { bytes }
}

/// Generate a random salt using the system CSPRNG.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}
