//! Encrypted, deduplicated store of registered device tokens.
//!
//! The vault owns the in-memory token set and the append-only log file that
//! backs it. Each line of the log is one [`crate::crypto`] record.
//!
//! # Concurrency
//!
//! A single mutex guards "check membership, append to log, update memory".
//! The append is synced to disk before the lock is released, and
//! [`TokenVault::all`] snapshots under the same lock, so a reader never sees
//! a registration that is half applied.
//!
//! # Storage structure
//!
//! ```text
//! {data_dir}/
//!     tokens.data     # one hex AES-GCM record per line, registration order
//!     key.key         # see crate::keys
//!     nonce.key
//! ```

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::crypto;
use crate::keys::KeyMaterial;

/// Opaque push destination identifier for one registered device.
///
/// Identity is the exact string value; no trimming or case folding.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Token(String);

impl Token {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The full identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Truncate for display, on a char boundary
        match self.0.char_indices().nth(8) {
            Some((end, _)) => write!(f, "{}...", &self.0[..end]),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Token {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors raised by vault file operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The log could not be created, opened or read.
    #[error("token log I/O failed for {}: {source}", path.display())]
    Io {
        /// Log file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Appending a record failed. The token stays registered in memory.
    #[error("failed to persist token to {}: {reason}", path.display())]
    Persistence {
        /// Log file path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },
}

/// Outcome reported to the registering client.
///
/// Re-registering a known token is reported exactly like a first registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The token is registered.
    Created,
}

/// Counts gathered while loading the log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    /// Distinct tokens now in memory.
    pub loaded: usize,
    /// Lines that failed to decode or authenticate.
    pub skipped: usize,
    /// Valid lines whose token was already seen.
    pub duplicates: usize,
}

#[derive(Debug, Default)]
struct VaultState {
    /// Insertion order, no duplicates.
    ordered: Vec<Token>,
    members: HashSet<Token>,
    /// Log ends mid-line (crash during a previous append).
    torn_tail: bool,
}

impl VaultState {
    fn insert(&mut self, token: Token) -> bool {
        if self.members.insert(token.clone()) {
            self.ordered.push(token);
            true
        } else {
            false
        }
    }
}

/// Deduplicated token set backed by an append-only encrypted log.
#[derive(Debug)]
pub struct TokenVault {
    path: PathBuf,
    keys: KeyMaterial,
    state: Mutex<VaultState>,
}

impl TokenVault {
    /// Create an empty vault over `path` without touching the file.
    pub fn new(path: impl Into<PathBuf>, keys: KeyMaterial) -> Self {
        Self {
            path: path.into(),
            keys,
            state: Mutex::new(VaultState::default()),
        }
    }

    /// Create a vault over `path` and load every record from it.
    pub fn open(path: impl Into<PathBuf>, keys: KeyMaterial) -> Result<Self, VaultError> {
        let vault = Self::new(path, keys);
        vault.load()?;
        Ok(vault)
    }

    /// Path of the backing log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, VaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn io_err(&self, source: io::Error) -> VaultError {
        VaultError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Rebuild the in-memory set from the log.
    ///
    /// Creates an empty log if none exists. Lines that fail to decode or
    /// authenticate are logged and skipped; the rest still load.
    pub fn load(&self) -> Result<LoadReport, VaultError> {
        let mut state = self.lock();

        if !self.path.exists() {
            log::info!("[Vault] Token file not found, creating {}", self.path.display());
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
            }
            create_private_file(&self.path).map_err(|e| self.io_err(e))?;
            *state = VaultState::default();
            return Ok(LoadReport::default());
        }

        let file = File::open(&self.path).map_err(|e| self.io_err(e))?;
        let mut fresh = VaultState::default();
        let mut report = LoadReport::default();

        // Split on raw bytes: a garbage line must not abort the whole load
        for (index, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line.map_err(|e| self.io_err(e))?;
            let record = match std::str::from_utf8(&line) {
                Ok(text) => text.trim(),
                Err(e) => {
                    log::warn!("[Vault] Skipping record on line {}: {e}", index + 1);
                    report.skipped += 1;
                    continue;
                }
            };
            if record.is_empty() {
                continue;
            }

            match crypto::decrypt(record, &self.keys) {
                Ok(id) => {
                    if !fresh.insert(Token::new(id)) {
                        report.duplicates += 1;
                    }
                }
                Err(e) => {
                    log::warn!("[Vault] Skipping record on line {}: {e}", index + 1);
                    report.skipped += 1;
                }
            }
        }

        fresh.torn_tail = ends_mid_line(&self.path).map_err(|e| self.io_err(e))?;
        if fresh.torn_tail {
            log::warn!("[Vault] Token file ends mid-record, next append starts a new line");
        }

        report.loaded = fresh.ordered.len();
        *state = fresh;

        log::info!(
            "[Vault] Loaded {} token(s) ({} skipped, {} duplicate)",
            report.loaded,
            report.skipped,
            report.duplicates
        );
        Ok(report)
    }

    /// Register a token.
    ///
    /// New tokens are encrypted and appended to the log, synced before
    /// returning. Known tokens are a no-op. On `Persistence` failure the
    /// token remains registered in memory.
    pub fn register(&self, id: &str) -> Result<RegisterOutcome, VaultError> {
        let token = Token::from(id);
        let mut state = self.lock();

        if !state.insert(token.clone()) {
            log::debug!("[Vault] Token {token} already registered");
            return Ok(RegisterOutcome::Created);
        }

        let record = crypto::encrypt(token.as_str(), &self.keys).map_err(|e| {
            VaultError::Persistence {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut line = String::with_capacity(record.len() + 2);
        if state.torn_tail {
            line.push('\n');
        }
        line.push_str(&record);
        line.push('\n');

        if let Err(e) = append_synced(&self.path, line.as_bytes()) {
            // A short write may have left a partial record behind
            state.torn_tail = true;
            return Err(VaultError::Persistence {
                path: self.path.clone(),
                reason: e.to_string(),
            });
        }
        state.torn_tail = false;

        log::info!("[Vault] Registered token {token} ({} total)", state.ordered.len());
        Ok(RegisterOutcome::Created)
    }

    /// Snapshot of every registered token in first-registration order.
    pub fn all(&self) -> Vec<Token> {
        self.lock().ordered.clone()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().members.contains(&Token::from(id))
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.lock().ordered.len()
    }

    /// Whether no tokens are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().ordered.is_empty()
    }

    /// Rewrite the log with exactly one record per registered token.
    ///
    /// Drops duplicate and undecryptable lines. The new log is written to a
    /// sibling temp file, synced, then renamed over the old one. Returns the
    /// number of records written.
    pub fn compact(&self) -> Result<usize, VaultError> {
        let mut state = self.lock();

        let mut contents = String::new();
        for token in &state.ordered {
            let record = crypto::encrypt(token.as_str(), &self.keys).map_err(|e| {
                VaultError::Persistence {
                    path: self.path.clone(),
                    reason: e.to_string(),
                }
            })?;
            contents.push_str(&record);
            contents.push('\n');
        }

        let tmp_path = self.path.with_extension("data.tmp");
        {
            let mut tmp = create_private_file(&tmp_path).map_err(|e| self.io_err(e))?;
            tmp.write_all(contents.as_bytes())
                .and_then(|()| tmp.sync_all())
                .map_err(|e| self.io_err(e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_err(e))?;
        state.torn_tail = false;

        log::info!("[Vault] Compacted token file to {} record(s)", state.ordered.len());
        Ok(state.ordered.len())
    }
}

fn create_private_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options.open(path)
}

fn append_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_data()
}

/// Non-empty file whose last byte is not a newline.
fn ends_mid_line(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KEY_SIZE, NONCE_SIZE};
    use tempfile::TempDir;

    fn keys() -> KeyMaterial {
        KeyMaterial::from_bytes([3u8; KEY_SIZE], [9u8; NONCE_SIZE])
    }

    fn open(dir: &TempDir) -> TokenVault {
        TokenVault::open(dir.path().join("tokens.data"), keys()).unwrap()
    }

    fn ids(vault: &TokenVault) -> Vec<String> {
        vault.all().iter().map(|t| t.as_str().to_string()).collect()
    }

    fn line_count(vault: &TokenVault) -> usize {
        fs::read_to_string(vault.path()).unwrap().lines().count()
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let vault = open(&dir);
        assert!(vault.path().exists());
        assert!(vault.is_empty());
    }

    #[test]
    fn test_register_dedupes_in_first_seen_order() {
        let dir = TempDir::new().unwrap();
        let vault = open(&dir);

        for id in ["b", "a", "b", "c", "a"] {
            assert_eq!(vault.register(id).unwrap(), RegisterOutcome::Created);
        }

        assert_eq!(ids(&vault), ["b", "a", "c"]);
        assert_eq!(line_count(&vault), 3);
    }

    #[test]
    fn test_no_trimming_or_case_folding() {
        let dir = TempDir::new().unwrap();
        let vault = open(&dir);
        vault.register("abc").unwrap();
        vault.register("ABC").unwrap();
        vault.register(" abc").unwrap();
        assert_eq!(vault.len(), 3);
        assert!(vault.contains(" abc"));
    }

    #[test]
    fn test_reload_restores_tokens() {
        let dir = TempDir::new().unwrap();
        {
            let vault = open(&dir);
            vault.register("tokenA").unwrap();
            vault.register("tokenB").unwrap();
        }
        let vault = open(&dir);
        assert_eq!(ids(&vault), ["tokenA", "tokenB"]);
    }

    #[test]
    fn test_corrupt_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.data");
        let good = crypto::encrypt("tokenA", &keys()).unwrap();
        fs::write(&path, format!("{good}\n{}\nzz-not-hex\n", &good[..7])).unwrap();

        let vault = TokenVault::new(&path, keys());
        let report = vault.load().unwrap();

        assert_eq!(ids(&vault), ["tokenA"]);
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped, 2);
    }

    #[test]
    fn test_duplicate_lines_collapse_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.data");
        let a = crypto::encrypt("tokenA", &keys()).unwrap();
        let b = crypto::encrypt("tokenB", &keys()).unwrap();
        fs::write(&path, format!("{a}\n{b}\n{a}\n\n")).unwrap();

        let vault = TokenVault::new(&path, keys());
        let report = vault.load().unwrap();
        assert_eq!(ids(&vault), ["tokenA", "tokenB"]);
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn test_torn_tail_gets_newline_before_next_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.data");
        let a = crypto::encrypt("tokenA", &keys()).unwrap();
        // Crash mid-append left half a record without a newline
        fs::write(&path, format!("{a}\n{}", &a[..12])).unwrap();

        let vault = TokenVault::open(&path, keys()).unwrap();
        vault.register("tokenB").unwrap();

        let reloaded = TokenVault::open(&path, keys()).unwrap();
        assert_eq!(ids(&reloaded), ["tokenA", "tokenB"]);
    }

    #[test]
    fn test_persistence_failure_keeps_token_in_memory() {
        let dir = TempDir::new().unwrap();
        // Parent is a regular file, so the log can never be opened
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let vault = TokenVault::new(blocker.join("tokens.data"), keys());

        let err = vault.register("tokenA").unwrap_err();
        assert!(matches!(err, VaultError::Persistence { .. }));
        assert!(vault.contains("tokenA"));
    }

    #[test]
    fn test_compact_drops_duplicates_and_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.data");
        let a = crypto::encrypt("tokenA", &keys()).unwrap();
        let b = crypto::encrypt("tokenB", &keys()).unwrap();
        fs::write(&path, format!("{a}\ngarbage\n{b}\n{a}\n")).unwrap();

        let vault = TokenVault::open(&path, keys()).unwrap();
        assert_eq!(vault.compact().unwrap(), 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{a}\n{b}\n"));

        let reloaded = TokenVault::open(&path, keys()).unwrap();
        assert_eq!(ids(&reloaded), ["tokenA", "tokenB"]);
    }

    #[test]
    fn test_non_utf8_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.data");
        let a = crypto::encrypt("tokenA", &keys()).unwrap();
        let b = crypto::encrypt("tokenB", &keys()).unwrap();

        let mut contents = format!("{a}\n").into_bytes();
        contents.extend_from_slice(&[0xFF, 0xFE, 0x00, b'\n']);
        contents.extend_from_slice(format!("{b}\n").as_bytes());
        fs::write(&path, contents).unwrap();

        let vault = TokenVault::new(&path, keys());
        let report = vault.load().unwrap();

        assert_eq!(ids(&vault), ["tokenA", "tokenB"]);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_failed_append_marks_tail_torn() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        fs::write(&data_dir, b"").unwrap();
        let path = data_dir.join("tokens.data");
        let vault = TokenVault::new(&path, keys());

        assert!(vault.register("tokenA").is_err());
        assert!(vault.lock().torn_tail);

        // Storage comes back; the next record starts on its own line
        fs::remove_file(&data_dir).unwrap();
        fs::create_dir(&data_dir).unwrap();
        vault.register("tokenB").unwrap();
        assert!(!vault.lock().torn_tail);
        assert!(fs::read_to_string(&path).unwrap().starts_with('\n'));

        let reloaded = TokenVault::open(&path, keys()).unwrap();
        assert_eq!(ids(&reloaded), ["tokenB"]);
    }

    #[test]
    fn test_token_display_truncates() {
        let token = Token::new("0123456789abcdef");
        assert_eq!(token.to_string(), "01234567...");
        assert_eq!(Token::new("short").to_string(), "short");
    }

    #[test]
    fn test_token_display_truncates_multibyte() {
        let token = Token::new("abcdefgé-secret-device-token");
        assert_eq!(token.to_string(), "abcdefgé...");
        assert_eq!(Token::new("ééééé").to_string(), "ééééé");
    }
}
