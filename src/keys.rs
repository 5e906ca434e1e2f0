//! Key material loading and first-run generation.
//!
//! The vault encrypts every token with one AES-256 key and one 96-bit nonce.
//! Both are generated on first start and stored as raw bytes in two files
//! next to the token log.
//!
//! # Security
//!
//! The key and nonce sit in plaintext beside the data they protect, and the
//! nonce is reused for every record. Both are known weaknesses kept for
//! compatibility with existing `tokens.data` files. See [`crate::crypto`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{KEY_FILE, NONCE_FILE, TOKEN_LOG_FILE};

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Errors raised while loading or creating key material.
///
/// Any of these is fatal at startup.
#[derive(Debug, Error)]
pub enum KeyError {
    /// A key file could not be created, read or written.
    #[error("key material I/O failed for {}: {source}", path.display())]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A key file exists but holds the wrong number of bytes.
    #[error("{} holds {found} bytes, expected {expected}", path.display())]
    InvalidLength {
        /// Offending file.
        path: PathBuf,
        /// Required length.
        expected: usize,
        /// Length on disk.
        found: usize,
    },
}

/// Symmetric key and nonce shared by every encrypt/decrypt call.
///
/// Cloned by value into whoever needs it; wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("nonce", &"<redacted>")
            .finish()
    }
}

impl KeyMaterial {
    /// Build key material from raw bytes.
    pub fn from_bytes(key: [u8; KEY_SIZE], nonce: [u8; NONCE_SIZE]) -> Self {
        Self { key, nonce }
    }

    /// Generate a fresh random key and nonce.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut nonce);
        Self { key, nonce }
    }

    /// The AES-256 key.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// The AES-GCM nonce.
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }
}

/// Paths of the two key material files inside `dir`.
pub fn key_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join(KEY_FILE), dir.join(NONCE_FILE))
}

/// Load the key material from `dir`, generating and persisting it on first run.
///
/// If either file is missing both are regenerated. Existing files are
/// returned unchanged on every later call.
pub fn ensure_key_material(dir: &Path) -> Result<KeyMaterial, KeyError> {
    let (key_path, nonce_path) = key_paths(dir);

    if key_path.exists() && nonce_path.exists() {
        log::info!("[Keys] Key material found, loading from {}", dir.display());
        let key = read_exact_file::<KEY_SIZE>(&key_path)?;
        let nonce = read_exact_file::<NONCE_SIZE>(&nonce_path)?;
        return Ok(KeyMaterial::from_bytes(key, nonce));
    }

    log::info!("[Keys] No key material found, generating key and nonce");
    warn_if_log_orphaned(dir);

    fs::create_dir_all(dir).map_err(|source| KeyError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let material = KeyMaterial::generate();
    write_private_file(&key_path, material.key())?;
    write_private_file(&nonce_path, material.nonce())?;

    log::info!("[Keys] Generated and stored new key material");
    Ok(material)
}

fn read_exact_file<const N: usize>(path: &Path) -> Result<[u8; N], KeyError> {
    let bytes = fs::read(path).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.try_into().map_err(|bytes: Vec<u8>| KeyError::InvalidLength {
        path: path.to_path_buf(),
        expected: N,
        found: bytes.len(),
    })
}

fn write_private_file(path: &Path, bytes: &[u8]) -> Result<(), KeyError> {
    let io_err = |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    };

    fs::write(path, bytes).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms).map_err(io_err)?;
    }

    Ok(())
}

/// Records written under an older key can no longer be decrypted.
fn warn_if_log_orphaned(dir: &Path) {
    let log_path = dir.join(TOKEN_LOG_FILE);
    if fs::metadata(&log_path).is_ok_and(|meta| meta.len() > 0) {
        log::warn!(
            "[Keys] {} has content but key material is missing; existing records will not decrypt",
            log_path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_run_generates_both_files() {
        let dir = TempDir::new().unwrap();
        let material = ensure_key_material(dir.path()).unwrap();

        let (key_path, nonce_path) = key_paths(dir.path());
        assert_eq!(fs::read(&key_path).unwrap(), material.key());
        assert_eq!(fs::read(&nonce_path).unwrap(), material.nonce());
    }

    #[test]
    fn test_second_run_returns_same_material() {
        let dir = TempDir::new().unwrap();
        let first = ensure_key_material(dir.path()).unwrap();
        let second = ensure_key_material(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_nonce_regenerates_both() {
        let dir = TempDir::new().unwrap();
        let first = ensure_key_material(dir.path()).unwrap();

        let (_, nonce_path) = key_paths(dir.path());
        fs::remove_file(&nonce_path).unwrap();

        let second = ensure_key_material(dir.path()).unwrap();
        assert_ne!(first.key(), second.key());
        assert!(nonce_path.exists());
    }

    #[test]
    fn test_truncated_key_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        ensure_key_material(dir.path()).unwrap();

        let (key_path, _) = key_paths(dir.path());
        fs::write(&key_path, [1u8; 7]).unwrap();

        match ensure_key_material(dir.path()) {
            Err(KeyError::InvalidLength {
                expected, found, ..
            }) => {
                assert_eq!(expected, KEY_SIZE);
                assert_eq!(found, 7);
            }
            other => panic!("expected InvalidLength, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        ensure_key_material(dir.path()).unwrap();

        let (key_path, nonce_path) = key_paths(dir.path());
        for path in [key_path, nonce_path] {
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_debug_redacts_bytes() {
        let material = KeyMaterial::from_bytes([0xAB; KEY_SIZE], [0xCD; NONCE_SIZE]);
        let rendered = format!("{material:?}");
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("171"));
    }
}
