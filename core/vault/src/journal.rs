//! Write-ahead journal for migrations.
//!
//! One JSON object per line. The first line is the header describing the
//! migration; every following line records one file that was committed
//! forward, or reverted by a rollback. Each append is fsync'd before the
//! caller proceeds, so a record survives a crash. A crash in the middle of
//! an append leaves an unterminated final line, which is discarded on open.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::manifest::{sync_dir, FileEntry};
use casevault_common::{CasePath, Error, Result};
use casevault_crypto::VerificationToken;

/// Which migration the journal belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationKind {
    /// Plaintext files are being encrypted.
    Encrypt,
    /// Files are being re-encrypted under a new password.
    Rotate,
    /// Files are being decrypted in place.
    Decrypt,
}

impl std::fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Encrypt => "encrypt",
            Self::Rotate => "rotate",
            Self::Decrypt => "decrypt",
        };
        f.write_str(name)
    }
}

/// Key material wrapped with one-shot AEAD under the current key.
#[derive(Clone, Serialize, Deserialize)]
pub struct WrappedKey(#[serde(with = "casevault_crypto::encoding::base64_bytes")] pub Vec<u8>);

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrappedKey([REDACTED])")
    }
}

/// First record of a journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalHeader {
    pub operation_id: Uuid,
    pub kind: MigrationKind,
    pub started_at: DateTime<Utc>,
    /// Rotation only: token of the key files are moving to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_token: Option<VerificationToken>,
    /// Rotation only: the new key, sealed under the old one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_key: Option<WrappedKey>,
}

impl JournalHeader {
    pub fn new(kind: MigrationKind) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            kind,
            started_at: Utc::now(),
            pending_token: None,
            pending_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CommitStatus {
    Committed,
    Reverted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitRecord {
    operation_id: Uuid,
    file_path: CasePath,
    status: CommitStatus,
    /// Manifest entry after this record; `None` when the file is plaintext.
    entry: Option<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "lowercase")]
enum JournalRecord {
    Header(JournalHeader),
    Commit(CommitRecord),
}

/// Open journal of the current migration.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    header: JournalHeader,
    committed: BTreeSet<CasePath>,
    latest: BTreeMap<CasePath, Option<FileEntry>>,
    records: u64,
}

impl Journal {
    /// Start a new journal. Fails if one already exists.
    pub fn create(path: &Path, header: JournalHeader) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => Error::MigrationInterrupted(
                    "A migration journal already exists".to_string(),
                ),
                _ => Error::Io(e),
            })?;

        write_record(&mut file, &JournalRecord::Header(header.clone()))?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        debug!(operation = %header.operation_id, kind = %header.kind, "Journal created");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            committed: BTreeSet::new(),
            latest: BTreeMap::new(),
            records: 0,
        })
    }

    /// Open an existing journal, or `None` if there is none.
    ///
    /// An unterminated final line is cut off. A journal without a complete
    /// header never recorded anything and is removed.
    ///
    /// # Errors
    /// - `Error::Integrity` if a complete line is not a valid record
    pub fn open(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let complete_len = bytes
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|idx| idx + 1)
            .unwrap_or(0);

        if complete_len < bytes.len() {
            warn!(path = %path.display(), "Discarding torn journal record");
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(complete_len as u64)?;
            file.sync_all()?;
        }

        let mut header: Option<JournalHeader> = None;
        let mut committed = BTreeSet::new();
        let mut latest = BTreeMap::new();
        let mut records = 0u64;

        for (lineno, line) in bytes[..complete_len].split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            let record: JournalRecord = serde_json::from_slice(line).map_err(|e| {
                Error::Integrity(format!("Journal line {} is malformed: {}", lineno + 1, e))
            })?;

            let out_of_order =
                || Error::Integrity(format!("Journal line {} is out of order", lineno + 1));
            match record {
                JournalRecord::Header(h) if header.is_none() => header = Some(h),
                JournalRecord::Header(_) => return Err(out_of_order()),
                JournalRecord::Commit(c) => {
                    let h = header.as_ref().ok_or_else(out_of_order)?;
                    if c.operation_id != h.operation_id {
                        return Err(Error::Integrity(format!(
                            "Journal line {} belongs to another operation",
                            lineno + 1
                        )));
                    }
                    match c.status {
                        CommitStatus::Committed => committed.insert(c.file_path.clone()),
                        CommitStatus::Reverted => committed.remove(&c.file_path),
                    };
                    latest.insert(c.file_path, c.entry);
                    records += 1;
                }
            }
        }

        let Some(header) = header else {
            fs::remove_file(path)?;
            return Ok(None);
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
            header,
            committed,
            latest,
            records,
        }))
    }

    pub fn header(&self) -> &JournalHeader {
        &self.header
    }

    pub fn kind(&self) -> MigrationKind {
        self.header.kind
    }

    /// Whether `path` is committed forward and not reverted.
    pub fn is_committed(&self, path: &CasePath) -> bool {
        self.committed.contains(path)
    }

    /// Paths committed forward and not reverted.
    pub fn committed(&self) -> &BTreeSet<CasePath> {
        &self.committed
    }

    /// Manifest entry recorded last for every touched path.
    pub fn latest(&self) -> &BTreeMap<CasePath, Option<FileEntry>> {
        &self.latest
    }

    /// Number of file records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Durably record that `path` was committed forward.
    pub fn append_commit(&mut self, path: &CasePath, entry: Option<FileEntry>) -> Result<()> {
        self.append(path, CommitStatus::Committed, entry)?;
        self.committed.insert(path.clone());
        Ok(())
    }

    /// Durably record that a forward commit of `path` was undone.
    pub fn append_revert(&mut self, path: &CasePath, entry: Option<FileEntry>) -> Result<()> {
        self.append(path, CommitStatus::Reverted, entry)?;
        self.committed.remove(path);
        Ok(())
    }

    fn append(
        &mut self,
        path: &CasePath,
        status: CommitStatus,
        entry: Option<FileEntry>,
    ) -> Result<()> {
        let record = JournalRecord::Commit(CommitRecord {
            operation_id: self.header.operation_id,
            file_path: path.clone(),
            status,
            entry: entry.clone(),
        });
        write_record(&mut self.file, &record)?;
        self.latest.insert(path.clone(), entry);
        self.records += 1;
        Ok(())
    }

    /// Delete the journal once the migration is finished.
    pub fn remove(self) -> Result<()> {
        let Self { path, file, .. } = self;
        drop(file);
        fs::remove_file(&path)?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        Ok(())
    }
}

fn write_record(file: &mut File, record: &JournalRecord) -> Result<()> {
    let mut line =
        serde_json::to_vec(record).map_err(|e| Error::Serialization(e.to_string()))?;
    line.push(b'\n');
    file.write_all(&line)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use casevault_crypto::CipherAlgorithm;
    use tempfile::TempDir;

    fn entry(path: &CasePath) -> FileEntry {
        FileEntry {
            path: path.clone(),
            algorithm: CipherAlgorithm::XChaCha20Poly1305Stream,
            nonce_base: [0u8; 24],
            plaintext_size: 1,
            plaintext_hash: "ab".repeat(32),
            encrypted_size: 57,
            encrypted_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_append_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let a = CasePath::parse("a.txt").unwrap();
        let b = CasePath::parse("media/b.mp4").unwrap();

        let mut journal = Journal::create(&path, JournalHeader::new(MigrationKind::Encrypt)).unwrap();
        journal.append_commit(&a, Some(entry(&a))).unwrap();
        journal.append_commit(&b, None).unwrap();
        let id = journal.header().operation_id;
        drop(journal);

        let reopened = Journal::open(&path).unwrap().unwrap();
        assert_eq!(reopened.header().operation_id, id);
        assert_eq!(reopened.kind(), MigrationKind::Encrypt);
        assert!(reopened.is_committed(&a));
        assert!(reopened.is_committed(&b));
        assert_eq!(reopened.records(), 2);
        assert_eq!(reopened.latest()[&a].as_ref().unwrap().path, a);
        assert!(reopened.latest()[&b].is_none());

        reopened.remove().unwrap();
        assert!(!path.exists());
        assert!(Journal::open(&path).unwrap().is_none());
    }

    #[test]
    fn test_revert_removes_from_committed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let a = CasePath::parse("a.txt").unwrap();

        let mut journal = Journal::create(&path, JournalHeader::new(MigrationKind::Encrypt)).unwrap();
        journal.append_commit(&a, Some(entry(&a))).unwrap();
        journal.append_revert(&a, None).unwrap();
        drop(journal);

        let reopened = Journal::open(&path).unwrap().unwrap();
        assert!(!reopened.is_committed(&a));
        assert!(reopened.latest()[&a].is_none());
        assert_eq!(reopened.records(), 2);
    }

    #[test]
    fn test_create_refuses_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let _journal = Journal::create(&path, JournalHeader::new(MigrationKind::Rotate)).unwrap();
        let second = Journal::create(&path, JournalHeader::new(MigrationKind::Rotate));
        assert!(matches!(second, Err(Error::MigrationInterrupted(_))));
    }

    #[test]
    fn test_torn_last_line_ignored_and_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let a = CasePath::parse("a.txt").unwrap();

        let mut journal = Journal::create(&path, JournalHeader::new(MigrationKind::Encrypt)).unwrap();
        journal.append_commit(&a, Some(entry(&a))).unwrap();
        drop(journal);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"record\":\"commit\",\"operation_").unwrap();
        drop(file);

        let mut reopened = Journal::open(&path).unwrap().unwrap();
        assert_eq!(reopened.committed().len(), 1);

        let b = CasePath::parse("b.txt").unwrap();
        reopened.append_commit(&b, Some(entry(&b))).unwrap();
        drop(reopened);

        let again = Journal::open(&path).unwrap().unwrap();
        assert_eq!(again.committed().len(), 2);
    }

    #[test]
    fn test_malformed_complete_line_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = Journal::create(&path, JournalHeader::new(MigrationKind::Encrypt)).unwrap();
        drop(journal);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not json\n").unwrap();
        drop(file);

        assert!(matches!(Journal::open(&path), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_headerless_journal_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(&path, b"{\"record\":\"hea").unwrap();

        assert!(Journal::open(&path).unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_header_json_shape() {
        let header = JournalHeader::new(MigrationKind::Rotate);
        let json = serde_json::to_value(JournalRecord::Header(header)).unwrap();
        assert_eq!(json["record"], "header");
        assert_eq!(json["kind"], "rotate");
        assert!(json.get("pending_key").is_none());
    }
}
