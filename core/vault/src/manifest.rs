//! The manifest: persisted record of vault state.
//!
//! The manifest is the single source of truth for which files are
//! ciphertext. It is rewritten as a whole on every mutation through
//! [`write_atomic`], so readers see either the old or the new version.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TEMP_PREFIX;
use casevault_common::{CasePath, Error, Result};
use casevault_crypto::aead::NONCE_SIZE;
use casevault_crypto::{CipherAlgorithm, KdfParams, Salt, VerificationToken};

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Encryption state of the whole case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultState {
    /// Vault parameters exist but no file has been encrypted yet.
    Plaintext,
    /// A migration is in progress or was interrupted.
    Migrating,
    /// Every recorded file is ciphertext.
    Encrypted,
}

/// Encryption metadata of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path; identity within the manifest.
    pub path: CasePath,
    pub algorithm: CipherAlgorithm,
    #[serde(with = "casevault_crypto::encoding::base64_bytes")]
    pub nonce_base: [u8; NONCE_SIZE],
    pub plaintext_size: u64,
    /// SHA-256 of the plaintext, lowercase hex.
    pub plaintext_hash: String,
    pub encrypted_size: u64,
    pub encrypted_at: DateTime<Utc>,
}

/// Persisted vault record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// Generated once at init; never changes.
    pub salt: Salt,
    /// Frozen at init; never changes.
    pub kdf: KdfParams,
    pub verification_token: VerificationToken,
    pub state: VaultState,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    entries: Vec<FileEntry>,
}

impl Manifest {
    /// Create a manifest for a vault that has not encrypted anything yet.
    pub fn new(salt: Salt, kdf: KdfParams, verification_token: VerificationToken) -> Self {
        let now = Utc::now();
        Self {
            version: MANIFEST_VERSION,
            salt,
            kdf,
            verification_token,
            state: VaultState::Plaintext,
            created_at: now,
            modified_at: now,
            entries: Vec::new(),
        }
    }

    /// Load the manifest at `path`, or `None` if there is none.
    ///
    /// # Errors
    /// - I/O errors other than a missing file
    /// - `Error::Serialization` for unreadable content
    /// - `Error::Vault` for an unsupported version
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Serialization(format!("Manifest: {}", e)))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::Vault(format!(
                "Unsupported manifest version {}",
                manifest.version
            )));
        }
        manifest.entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Some(manifest))
    }

    /// Persist atomically, bumping `modified_at`.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.modified_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        write_atomic(path, &bytes)
    }

    /// All entries, sorted by path.
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Look up the entry for `path`.
    pub fn entry(&self, path: &CasePath) -> Option<&FileEntry> {
        self.entries
            .binary_search_by(|e| e.path.cmp(path))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// Whether `path` is recorded as ciphertext.
    pub fn contains(&self, path: &CasePath) -> bool {
        self.entry(path).is_some()
    }

    /// Insert or replace the entry for `entry.path`.
    pub fn upsert(&mut self, entry: FileEntry) {
        match self.entries.binary_search_by(|e| e.path.cmp(&entry.path)) {
            Ok(idx) => self.entries[idx] = entry,
            Err(idx) => self.entries.insert(idx, entry),
        }
    }

    /// Remove and return the entry for `path`.
    pub fn remove(&mut self, path: &CasePath) -> Option<FileEntry> {
        self.entries
            .binary_search_by(|e| e.path.cmp(path))
            .ok()
            .map(|idx| self.entries.remove(idx))
    }
}

/// File identity of a saved manifest, used to notice saves by other owners.
///
/// Every save renames a fresh file over the old one, so on unix the inode
/// alone changes; size and mtime cover other platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestStamp {
    len: u64,
    modified: Option<SystemTime>,
    #[cfg(unix)]
    inode: u64,
}

impl ManifestStamp {
    /// Stamp of the file at `path`, or `None` if there is none.
    pub fn of(path: &Path) -> Result<Option<Self>> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
            #[cfg(unix)]
            inode: std::os::unix::fs::MetadataExt::ino(&meta),
        }))
    }
}

/// Replace `path` with `bytes` via a temporary sibling, fsync, and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidInput(format!("{} has no parent", path.display())))?;

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    sync_dir(dir)
}

/// Flush directory metadata so a rename survives a crash.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
