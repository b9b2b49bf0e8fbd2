//! Case vault engine.
//!
//! This module provides:
//! - Vault initialization, unlock, and lock for one case directory
//! - Scoped plaintext access for collaborators and external tools
//! - Crash-safe bulk migrations (encrypt, rotate, decrypt) under a journal
//! - Integrity verification and decrypted export
//!
//! # Architecture
//! [`VaultManager`] owns a [`SessionManager`] holding the key while
//! unlocked. The [`Manifest`] records which files are ciphertext; every
//! migration goes through the journal so an interrupted run can be resumed
//! or rolled back.

pub mod access;
pub mod cipher;
pub mod config;
pub mod journal;
pub mod lockfile;
pub mod manager;
pub mod manifest;
pub mod migration;
pub mod retry;
pub mod session;

pub use access::{MaterializedFile, ScopedDecryptedAccess};
pub use config::{VaultConfig, VaultLayout};
pub use journal::MigrationKind;
pub use manager::{VaultManager, VaultStatus, MIN_PASSWORD_LEN};
pub use manifest::{FileEntry, Manifest, VaultState};
pub use migration::{
    CancelToken, EncryptReport, ExportReport, IntegrityFailure, IntegrityReport,
    MigrationOptions, MigrationReport, Progress, RotateReport,
};
pub use retry::{RetryConfig, RetryExecutor};
pub use session::{KeyLease, SessionInfo, SessionManager, SessionState};
