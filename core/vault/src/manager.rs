//! Vault manager: lifecycle and migrations of one case directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::access::{MaterializedFile, ScopedDecryptedAccess};
use crate::cipher::{decrypt_into, open_file, reseal_file, seal_bytes, seal_file, unseal_file, CipherParams};
use crate::config::{VaultConfig, VaultLayout, TEMP_PREFIX, VAULT_DIRNAME};
use crate::journal::{Journal, JournalHeader, MigrationKind, WrappedKey};
use crate::lockfile::VaultLock;
use crate::manifest::{write_atomic, FileEntry, Manifest, ManifestStamp, VaultState};
use crate::migration::{
    blocking, discard_stale, recover, run_jobs, scan_plaintext, Committer, Direction,
    EncryptReport, ExportReport, IntegrityFailure, IntegrityReport, Job, MigrationOptions,
    MigrationReport, PlaintextScan, Prepared, RotateReport,
};
use crate::retry::RetryExecutor;
use crate::session::{derive_verified, KeyLease, SessionInfo, SessionManager, SessionState};
use casevault_common::{CaseId, CasePath, Error, ErrorKind, Result, SensitiveBytes};
use casevault_crypto::{aead, derive_key, KdfParams, MasterKey, Salt};

/// Minimum password length accepted by `init` and rotation.
pub const MIN_PASSWORD_LEN: usize = 8;

/// What a case directory currently looks like to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VaultStatus {
    /// No vault has been initialized.
    NoVault,
    Locked,
    Unlocked,
    /// An interrupted migration must be resumed or rolled back.
    Migrating,
}

impl std::fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoVault => "no-vault",
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::Migrating => "migrating",
        };
        f.write_str(name)
    }
}

/// Manifest as last seen by this process, with the identity of its file.
struct CachedManifest {
    manifest: Option<Arc<Manifest>>,
    stamp: Option<ManifestStamp>,
}

/// State shared between the manager and the access handles it gives out.
pub(crate) struct VaultInner {
    pub layout: VaultLayout,
    pub config: VaultConfig,
    pub session: SessionManager,
    pub retry: RetryExecutor,
    cache: RwLock<CachedManifest>,
    /// Mutating operations hold it exclusively; reads share it, so they wait
    /// for a write of this process instead of seeing it half done.
    pub gate: RwLock<()>,
}

impl VaultInner {
    /// Absolute location of a case file.
    pub fn resolve(&self, path: &CasePath) -> Result<PathBuf> {
        let first = path.components().first().map(String::as_str);
        if first == Some(VAULT_DIRNAME) || path.name().starts_with(TEMP_PREFIX) {
            return Err(Error::InvalidInput(format!(
                "{} is reserved for the vault",
                path
            )));
        }
        Ok(path.to_fs_path(self.layout.root()))
    }

    /// The manifest on disk, reloaded only when its file changed since this
    /// process last read or wrote it.
    ///
    /// A reload that carries another verification token, or finds the vault
    /// gone, locks the session: its key belongs to a password that no longer
    /// opens the case.
    pub async fn current(&self) -> Result<Option<Arc<Manifest>>> {
        let path = self.layout.manifest();
        let stamp = ManifestStamp::of(&path)?;
        {
            let cache = self.cache.read().await;
            if cache.stamp == stamp {
                return Ok(cache.manifest.clone());
            }
        }

        let manifest = Manifest::load(&path)?.map(Arc::new);
        debug!(path = %path.display(), "Manifest changed on disk, reloaded");
        match &manifest {
            Some(manifest) => {
                self.session
                    .lock_unless_matches(&manifest.verification_token)
                    .await;
            }
            None => self.session.lock().await,
        }
        *self.cache.write().await = CachedManifest {
            manifest: manifest.clone(),
            stamp,
        };
        Ok(manifest)
    }

    /// Replace the cached manifest after this process saved or removed it.
    async fn publish(&self, manifest: Option<Manifest>) {
        // An unreadable stamp only forces the next access to reload.
        let stamp = ManifestStamp::of(&self.layout.manifest()).ok().flatten();
        *self.cache.write().await = CachedManifest {
            manifest: manifest.map(Arc::new),
            stamp,
        };
    }

    /// Manifest entry of `path`, or `None` if the file is plaintext.
    pub async fn entry_for(&self, path: &CasePath) -> Result<Option<FileEntry>> {
        match self.current().await? {
            None => Ok(None),
            Some(manifest) => {
                self.ensure_settled(&manifest)?;
                Ok(manifest.entry(path).cloned())
            }
        }
    }

    /// Fail while the manifest is `migrating`.
    ///
    /// A migration whose lock is held by a live process is still running
    /// and reported as a conflict; otherwise it was interrupted.
    fn ensure_settled(&self, manifest: &Manifest) -> Result<()> {
        if manifest.state != VaultState::Migrating {
            return Ok(());
        }
        if let Some(pid) = VaultLock::holder(&self.layout.lock_file()) {
            return Err(Error::Conflict(format!(
                "A migration is running in process {}; retry when it finishes",
                pid
            )));
        }
        Err(Error::MigrationInterrupted(
            "A migration did not complete; resume or roll it back".to_string(),
        ))
    }

    fn params(&self) -> CipherParams {
        CipherParams {
            streaming_threshold: self.config.streaming_threshold,
            chunk_size: self.config.chunk_size,
        }
    }
}

fn ensure_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::InvalidInput(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn no_vault() -> Error {
    Error::NotFound("No vault in this case directory".to_string())
}

/// Key for migration jobs.
#[derive(Clone)]
enum JobKey {
    /// Derived from a password for this migration.
    Owned(Arc<MasterKey>),
    /// Borrowed from the session; jobs fail once it locks.
    Leased(KeyLease),
}

impl JobKey {
    fn get(&self) -> Result<Arc<MasterKey>> {
        match self {
            Self::Owned(key) => Ok(Arc::clone(key)),
            Self::Leased(lease) => lease.key(),
        }
    }

    fn lease(&self) -> Option<&KeyLease> {
        match self {
            Self::Owned(_) => None,
            Self::Leased(lease) => Some(lease),
        }
    }
}

/// Manager for one case directory.
///
/// Owns the session; clones of the handle returned by [`access`](Self::access)
/// share it. Several managers for different cases can coexist, and managers
/// in other processes may change the same case: the manifest is re-read
/// whenever its file changes.
pub struct VaultManager {
    inner: Arc<VaultInner>,
}

impl VaultManager {
    /// Open the case at `case_dir`. Does not unlock.
    ///
    /// # Errors
    /// - `Error::NotFound` if the directory does not exist
    /// - Invalid configuration
    /// - Unreadable manifest
    pub fn open(case_dir: impl Into<PathBuf>, config: VaultConfig) -> Result<Self> {
        config.validate()?;
        let root = case_dir.into();
        if !root.is_dir() {
            return Err(Error::NotFound(format!(
                "Case directory {} does not exist",
                root.display()
            )));
        }

        let layout = VaultLayout::new(root);
        let case_id = CaseId::from_dir(layout.root())?;
        let stamp = ManifestStamp::of(&layout.manifest())?;
        let manifest = Manifest::load(&layout.manifest())?.map(Arc::new);
        let session = SessionManager::new(case_id, config.session_timeout);
        let retry = RetryExecutor::new(config.retry.clone());

        Ok(Self {
            inner: Arc::new(VaultInner {
                layout,
                config,
                session,
                retry,
                cache: RwLock::new(CachedManifest { manifest, stamp }),
                gate: RwLock::new(()),
            }),
        })
    }

    pub fn case_dir(&self) -> &Path {
        self.inner.layout.root()
    }

    pub fn config(&self) -> &VaultConfig {
        &self.inner.config
    }

    /// Handle for collaborators reading case files.
    pub fn access(&self) -> ScopedDecryptedAccess {
        ScopedDecryptedAccess::new(Arc::clone(&self.inner))
    }

    async fn publish(&self, manifest: Option<Manifest>) {
        self.inner.publish(manifest).await;
    }

    async fn settled_manifest(&self) -> Result<Manifest> {
        let manifest = self.inner.current().await?.ok_or_else(no_vault)?;
        self.inner.ensure_settled(&manifest)?;
        Ok(Manifest::clone(&manifest))
    }

    fn acquire_lock(&self) -> Result<VaultLock> {
        fs::create_dir_all(self.inner.layout.vault_dir())?;
        VaultLock::acquire(&self.inner.layout.lock_file())
    }

    fn exclude(&self) -> &[String] {
        &self.inner.config.exclude
    }

    /// Initialize the vault and encrypt every file in the case.
    ///
    /// Files whose names cannot be recorded stay plaintext and are listed in
    /// the report.
    ///
    /// # Preconditions
    /// - No vault exists, or an earlier `init` stopped before encrypting
    /// - Password has at least [`MIN_PASSWORD_LEN`] characters
    ///
    /// # Postconditions
    /// - Every other non-excluded file is ciphertext with a manifest entry
    /// - The session is unlocked with the new key
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if the case is already encrypted
    /// - `Error::MigrationInterrupted` if cancelled or a migration is pending
    pub async fn init(&self, password: &str, kdf: KdfParams) -> Result<EncryptReport> {
        self.init_with(password, kdf, MigrationOptions::default()).await
    }

    /// [`init`](Self::init) with cancellation and progress reporting.
    pub async fn init_with(
        &self,
        password: &str,
        kdf: KdfParams,
        options: MigrationOptions,
    ) -> Result<EncryptReport> {
        ensure_password(password)?;
        kdf.validate()?;

        let _gate = self.inner.gate.write().await;
        let _lock = self.acquire_lock()?;
        let layout = &self.inner.layout;

        match Manifest::load(&layout.manifest())? {
            Some(existing) if existing.state == VaultState::Migrating => {
                self.publish(Some(existing)).await;
                return Err(Error::MigrationInterrupted(
                    "A migration did not complete; resume or roll it back".to_string(),
                ));
            }
            Some(existing) if existing.state == VaultState::Encrypted => {
                self.publish(Some(existing)).await;
                return Err(Error::AlreadyExists("Vault is already initialized".to_string()));
            }
            _ => discard_stale(layout, self.exclude())?,
        }

        let salt = Salt::generate();
        let key = {
            let password = Zeroizing::new(password.as_bytes().to_vec());
            let salt = salt.clone();
            let kdf = kdf.clone();
            Arc::new(blocking(move || derive_key(&password, &salt, &kdf)).await?)
        };

        let mut manifest = Manifest::new(salt, kdf, key.verification_token());
        manifest.save(&layout.manifest())?;
        self.inner.session.start(Arc::clone(&key)).await;
        info!(case = %layout.root().display(), kdf = manifest.kdf.algorithm_id(), "Vault initialized");

        let scan = scan_plaintext(layout.root(), self.exclude(), &manifest)?;
        self.encrypt_plaintext(manifest, scan, &JobKey::Owned(key), &options)
            .await
    }

    /// Encrypt scanned plaintext under a fresh `encrypt` journal.
    async fn encrypt_plaintext(
        &self,
        manifest: Manifest,
        scan: PlaintextScan,
        key: &JobKey,
        options: &MigrationOptions,
    ) -> Result<EncryptReport> {
        let layout = &self.inner.layout;
        let skipped = scan.skipped(layout.root());
        let journal = Journal::create(&layout.journal(), JournalHeader::new(MigrationKind::Encrypt))?;
        let mut committer = self.begin(manifest, journal).await?;

        let jobs = self.encrypt_jobs(key, scan.paths);
        self.execute(&mut committer, jobs, Direction::Forward, options, key.lease())
            .await?;
        self.finish_encrypted(committer, skipped).await
    }

    /// Mark the manifest as migrating and hand it to a committer.
    async fn begin(&self, mut manifest: Manifest, journal: Journal) -> Result<Committer> {
        manifest.state = VaultState::Migrating;
        manifest.save(&self.inner.layout.manifest())?;
        self.publish(Some(manifest.clone())).await;
        info!(
            kind = %journal.kind(),
            operation = %journal.header().operation_id,
            "Migration started"
        );
        Ok(Committer::new(self.inner.layout.clone(), manifest, journal))
    }

    async fn execute(
        &self,
        committer: &mut Committer,
        jobs: Vec<Job>,
        direction: Direction,
        options: &MigrationOptions,
        lease: Option<&KeyLease>,
    ) -> Result<usize> {
        let result = run_jobs(
            committer,
            jobs,
            direction,
            self.inner.config.workers,
            &self.inner.retry,
            options,
            lease,
        )
        .await;

        if let Err(e) = &result {
            warn!(
                kind = %committer.journal.kind(),
                operation = %committer.journal.header().operation_id,
                "Migration stopped: {}",
                e
            );
            self.publish(Some(committer.manifest.clone())).await;
        }
        result.map_err(|e| match e {
            Error::Cancelled => Error::MigrationInterrupted(format!(
                "{} cancelled after {} files; resume or roll it back",
                committer.journal.kind(),
                committer.journal.committed().len()
            )),
            other => other,
        })
    }

    async fn finish_encrypted(
        &self,
        mut committer: Committer,
        skipped: Vec<String>,
    ) -> Result<EncryptReport> {
        let report = EncryptReport {
            files: committer.journal.committed().len(),
            bytes: committer
                .journal
                .latest()
                .values()
                .flatten()
                .map(|entry| entry.plaintext_size)
                .sum(),
            skipped,
        };
        self.settle(&mut committer).await?;
        committer.journal.remove()?;
        info!(
            files = report.files,
            bytes = report.bytes,
            skipped = report.skipped.len(),
            "Encryption complete"
        );
        Ok(report)
    }

    /// Persist the committer's manifest as encrypted.
    async fn settle(&self, committer: &mut Committer) -> Result<()> {
        committer.manifest.state = VaultState::Encrypted;
        committer.manifest.save(&self.inner.layout.manifest())?;
        self.publish(Some(committer.manifest.clone())).await;
        Ok(())
    }

    /// Remove every trace of the vault; the case is plaintext afterwards.
    async fn delete_vault(&self, journal: Option<Journal>, lock: VaultLock) -> Result<()> {
        let layout = &self.inner.layout;
        fs::remove_file(layout.manifest())?;
        self.publish(None).await;
        if let Some(journal) = journal {
            journal.remove()?;
        }
        if layout.backup_dir().exists() {
            fs::remove_dir_all(layout.backup_dir())?;
        }
        drop(lock);
        fs::remove_dir_all(layout.vault_dir())?;
        self.inner.session.lock().await;
        info!(case = %layout.root().display(), "Vault removed");
        Ok(())
    }

    fn encrypt_jobs(&self, key: &JobKey, paths: Vec<CasePath>) -> Vec<Job> {
        let root = self.inner.layout.root().to_path_buf();
        let params = self.inner.params();
        paths
            .into_iter()
            .map(|path| {
                let key = key.clone();
                let src = path.to_fs_path(&root);
                let job: Job = Arc::new(move || {
                    let (temp, entry) = seal_file(&*key.get()?, &path, &src, params)?;
                    Ok(Prepared {
                        path: path.clone(),
                        temp,
                        entry: Some(entry),
                    })
                });
                job
            })
            .collect()
    }

    fn decrypt_jobs(&self, key: &Arc<MasterKey>, entries: Vec<FileEntry>) -> Vec<Job> {
        let root = self.inner.layout.root().to_path_buf();
        entries
            .into_iter()
            .map(|entry| {
                let key = Arc::clone(key);
                let src = entry.path.to_fs_path(&root);
                let job: Job = Arc::new(move || {
                    let temp = unseal_file(&key, &src, &entry)?;
                    Ok(Prepared {
                        path: entry.path.clone(),
                        temp,
                        entry: None,
                    })
                });
                job
            })
            .collect()
    }

    fn reseal_jobs(
        &self,
        from: &Arc<MasterKey>,
        to: &Arc<MasterKey>,
        entries: Vec<FileEntry>,
    ) -> Vec<Job> {
        let root = self.inner.layout.root().to_path_buf();
        let params = self.inner.params();
        entries
            .into_iter()
            .map(|entry| {
                let from = Arc::clone(from);
                let to = Arc::clone(to);
                let src = entry.path.to_fs_path(&root);
                let job: Job = Arc::new(move || {
                    let (temp, new_entry) = reseal_file(&from, &to, &src, &entry, params)?;
                    Ok(Prepared {
                        path: entry.path.clone(),
                        temp,
                        entry: Some(new_entry),
                    })
                });
                job
            })
            .collect()
    }

    /// Report the vault status, refreshing the manifest from disk.
    pub async fn status(&self) -> Result<VaultStatus> {
        // A running operation of this process owns the cache until it ends.
        let manifest = match self.inner.gate.try_read() {
            Ok(_gate) => self.inner.current().await?,
            Err(_) => Manifest::load(&self.inner.layout.manifest())?.map(Arc::new),
        };
        let status = match manifest.as_ref().map(|m| m.state) {
            None | Some(VaultState::Plaintext) => VaultStatus::NoVault,
            Some(VaultState::Migrating) => VaultStatus::Migrating,
            Some(VaultState::Encrypted) => match self.inner.session.state().await {
                SessionState::Unlocked => VaultStatus::Unlocked,
                SessionState::Locked => VaultStatus::Locked,
            },
        };
        Ok(status)
    }

    /// Unlock the session against the manifest currently on disk.
    ///
    /// During an interrupted rotation only the old password is accepted.
    ///
    /// # Errors
    /// - `Error::Authentication` on a wrong password; the vault stays locked
    /// - `Error::NotFound` without a vault
    pub async fn unlock(&self, password: &str) -> Result<()> {
        let _gate = self.inner.gate.read().await;
        let manifest = self.inner.current().await?.ok_or_else(no_vault)?;
        self.inner
            .session
            .unlock(
                password.as_bytes(),
                &manifest.salt,
                &manifest.kdf,
                &manifest.verification_token,
            )
            .await
    }

    /// Zero and drop the key. Idempotent.
    pub async fn lock(&self) {
        self.inner.session.lock().await;
    }

    pub async fn session_info(&self) -> SessionInfo {
        self.inner.session.info().await
    }

    /// Add `additional` to the idle timeout of the current session.
    ///
    /// # Errors
    /// - `Error::Locked` / `Error::SessionExpired` without a live session
    pub async fn extend_session(&self, additional: Duration) -> Result<()> {
        self.inner.session.extend(additional).await
    }

    /// Change the idle timeout of the current and later sessions.
    pub async fn set_session_timeout(&self, timeout: Option<Duration>) {
        self.inner.session.set_timeout(timeout).await;
    }

    /// Decrypt every entry and check its content hash.
    ///
    /// Failures are collected per file; only a session loss aborts the scan.
    /// During an interrupted migration the journal is taken into account, so
    /// files already migrated are checked against their new state.
    pub async fn verify(&self) -> Result<IntegrityReport> {
        let _gate = self.inner.gate.read().await;
        let lease = self.inner.session.acquire().await?;
        let layout = &self.inner.layout;

        let mut manifest = Manifest::load(&layout.manifest())?.ok_or_else(no_vault)?;
        let mut rotated = Vec::new();
        let mut pending: Option<Arc<MasterKey>> = None;
        if manifest.state == VaultState::Migrating {
            if let Some(journal) = Journal::open(&layout.journal())? {
                for (path, entry) in journal.latest() {
                    match entry {
                        Some(entry) => manifest.upsert(entry.clone()),
                        None => {
                            manifest.remove(path);
                        }
                    }
                }
                if journal.kind() == MigrationKind::Rotate {
                    pending = Some(Arc::new(unwrap_pending(&journal, &*lease.key()?)?));
                    rotated = journal.committed().iter().cloned().collect();
                }
            }
        }

        let root = layout.root().to_path_buf();
        let checks: Vec<BoxFuture<'static, (CasePath, Result<()>)>> = manifest
            .entries()
            .iter()
            .cloned()
            .map(|entry| {
                // Files already rotated open under the pending key.
                let rekeyed = pending
                    .as_ref()
                    .filter(|_| rotated.contains(&entry.path))
                    .cloned();
                let lease = lease.clone();
                let retry = self.inner.retry.clone();
                let src = entry.path.to_fs_path(&root);
                async move {
                    let path = entry.path.clone();
                    let outcome = retry
                        .execute_blocking(move || {
                            let key = match &rekeyed {
                                Some(key) => Arc::clone(key),
                                None => lease.key()?,
                            };
                            open_file(&key, &src, &entry, std::io::sink(), Some(&lease)).map(|_| ())
                        })
                        .await;
                    (path, outcome)
                }
                .boxed()
            })
            .collect();

        let mut results = stream::iter(checks).buffer_unordered(self.inner.config.workers.max(1));
        let mut report = IntegrityReport::default();
        while let Some((path, outcome)) = results.next().await {
            report.checked += 1;
            match outcome {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::SessionExpired => return Err(e),
                Err(e) => {
                    warn!(path = %path, "Integrity check failed: {}", e);
                    report.failures.push(IntegrityFailure {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }
        lease.check()?;
        report.failures.sort_by(|a, b| a.path.cmp(&b.path));
        info!(checked = report.checked, failures = report.failures.len(), "Verification complete");
        Ok(report)
    }

    /// Load a pending migration and bring the files back in line with the
    /// journal. Returns `None` if nothing is pending.
    async fn recover_pending(&self, password: &str) -> Result<Option<(Committer, Arc<MasterKey>)>> {
        let layout = &self.inner.layout;
        let mut manifest = Manifest::load(&layout.manifest())?.ok_or_else(no_vault)?;
        if manifest.state != VaultState::Migrating {
            discard_stale(layout, self.exclude())?;
            self.publish(Some(manifest)).await;
            return Ok(None);
        }

        let key = derive_verified(
            password.as_bytes(),
            &manifest.salt,
            &manifest.kdf,
            &manifest.verification_token,
        )
        .await?;

        let journal = match Journal::open(&layout.journal())? {
            Some(journal) => journal,
            None => {
                warn!("Migrating vault has no journal; treating it as encryption");
                Journal::create(&layout.journal(), JournalHeader::new(MigrationKind::Encrypt))?
            }
        };
        recover(layout, &mut manifest, &journal, self.exclude())?;
        self.publish(Some(manifest.clone())).await;
        info!(
            kind = %journal.kind(),
            operation = %journal.header().operation_id,
            committed = journal.committed().len(),
            "Recovered interrupted migration"
        );
        Ok(Some((
            Committer::new(layout.clone(), manifest, journal),
            Arc::new(key),
        )))
    }

    /// Finish an interrupted migration.
    ///
    /// # Errors
    /// - `Error::Authentication` on a wrong password (the old one for rotation)
    /// - `Error::NotFound` if no migration is pending
    pub async fn resume(&self, password: &str) -> Result<MigrationReport> {
        self.resume_with(password, MigrationOptions::default()).await
    }

    pub async fn resume_with(
        &self,
        password: &str,
        options: MigrationOptions,
    ) -> Result<MigrationReport> {
        let _gate = self.inner.gate.write().await;
        let lock = self.acquire_lock()?;
        let Some((mut committer, key)) = self.recover_pending(password).await? else {
            return Err(Error::NotFound("No interrupted migration to resume".to_string()));
        };
        let kind = committer.journal.kind();

        match kind {
            MigrationKind::Encrypt => {
                self.inner.session.start(Arc::clone(&key)).await;
                let scan = scan_plaintext(
                    self.inner.layout.root(),
                    self.exclude(),
                    &committer.manifest,
                )?;
                let skipped = scan.skipped(self.inner.layout.root());
                let jobs = self.encrypt_jobs(&JobKey::Owned(key), scan.paths);
                self.execute(&mut committer, jobs, Direction::Forward, &options, None)
                    .await?;
                let report = self.finish_encrypted(committer, skipped).await?;
                Ok(MigrationReport {
                    kind,
                    files: report.files,
                })
            }
            MigrationKind::Rotate => {
                let new_key = Arc::new(unwrap_pending(&committer.journal, &key)?);
                let remaining: Vec<FileEntry> = committer
                    .manifest
                    .entries()
                    .iter()
                    .filter(|e| !committer.journal.is_committed(&e.path))
                    .cloned()
                    .collect();
                let jobs = self.reseal_jobs(&key, &new_key, remaining);
                self.execute(&mut committer, jobs, Direction::Forward, &options, None)
                    .await?;
                let files = self.finish_rotation(committer, new_key).await?;
                Ok(MigrationReport { kind, files })
            }
            MigrationKind::Decrypt => {
                let entries = committer.manifest.entries().to_vec();
                let jobs = self.decrypt_jobs(&key, entries);
                self.execute(&mut committer, jobs, Direction::Forward, &options, None)
                    .await?;
                let files = committer.journal.committed().len();
                self.delete_vault(Some(committer.journal), lock).await?;
                Ok(MigrationReport { kind, files })
            }
        }
    }

    /// Undo an interrupted migration.
    ///
    /// Encryption is undone back to plaintext (the vault is removed if
    /// nothing else was encrypted before), rotation back to the old password,
    /// and decryption back to ciphertext.
    pub async fn rollback(&self, password: &str) -> Result<MigrationReport> {
        self.rollback_with(password, MigrationOptions::default()).await
    }

    pub async fn rollback_with(
        &self,
        password: &str,
        options: MigrationOptions,
    ) -> Result<MigrationReport> {
        let _gate = self.inner.gate.write().await;
        let lock = self.acquire_lock()?;
        let Some((mut committer, key)) = self.recover_pending(password).await? else {
            return Err(Error::NotFound("No interrupted migration to roll back".to_string()));
        };
        let kind = committer.journal.kind();
        let committed: Vec<CasePath> = committer.journal.committed().iter().cloned().collect();
        let files = committed.len();
        let entries_of = |manifest: &Manifest| -> Vec<FileEntry> {
            committed
                .iter()
                .filter_map(|p| manifest.entry(p).cloned())
                .collect()
        };

        let jobs = match kind {
            MigrationKind::Encrypt => self.decrypt_jobs(&key, entries_of(&committer.manifest)),
            MigrationKind::Rotate => {
                let new_key = Arc::new(unwrap_pending(&committer.journal, &key)?);
                self.reseal_jobs(&new_key, &key, entries_of(&committer.manifest))
            }
            MigrationKind::Decrypt => {
                self.encrypt_jobs(&JobKey::Owned(Arc::clone(&key)), committed.clone())
            }
        };
        self.execute(&mut committer, jobs, Direction::Revert, &options, None)
            .await?;

        if kind == MigrationKind::Encrypt && committer.manifest.entries().is_empty() {
            self.delete_vault(Some(committer.journal), lock).await?;
        } else {
            self.settle(&mut committer).await?;
            committer.journal.remove()?;
            self.inner.session.start(key).await;
        }
        info!(%kind, files, "Migration rolled back");
        Ok(MigrationReport { kind, files })
    }

    /// Re-encrypt every file under a new password.
    ///
    /// The manifest keeps the old verification token until the last file is
    /// committed, so the vault opens under exactly one password at every
    /// point. An interrupted rotation is resumed or rolled back with the old
    /// password. Other managers of the case lock their sessions once they
    /// see the new token.
    ///
    /// # Errors
    /// - `Error::Authentication` if `old` is wrong
    /// - `Error::InvalidInput` if `new` is too short or equals `old`
    pub async fn rotate_password(&self, old: &str, new: &str) -> Result<RotateReport> {
        self.rotate_password_with(old, new, MigrationOptions::default())
            .await
    }

    pub async fn rotate_password_with(
        &self,
        old: &str,
        new: &str,
        options: MigrationOptions,
    ) -> Result<RotateReport> {
        ensure_password(new)?;
        if old == new {
            return Err(Error::InvalidInput(
                "New password must differ from the current one".to_string(),
            ));
        }

        let _gate = self.inner.gate.write().await;
        let manifest = self.settled_manifest().await?;
        let _lock = self.acquire_lock()?;
        discard_stale(&self.inner.layout, self.exclude())?;

        let old_key = Arc::new(
            derive_verified(
                old.as_bytes(),
                &manifest.salt,
                &manifest.kdf,
                &manifest.verification_token,
            )
            .await?,
        );
        let new_key = {
            let password = Zeroizing::new(new.as_bytes().to_vec());
            let salt = manifest.salt.clone();
            let kdf = manifest.kdf.clone();
            Arc::new(blocking(move || derive_key(&password, &salt, &kdf)).await?)
        };

        let mut header = JournalHeader::new(MigrationKind::Rotate);
        header.pending_token = Some(new_key.verification_token());
        header.pending_key = Some(WrappedKey(aead::encrypt(
            old_key.as_bytes(),
            new_key.as_bytes(),
        )?));
        let journal = Journal::create(&self.inner.layout.journal(), header)?;

        let entries = manifest.entries().to_vec();
        let mut committer = self.begin(manifest, journal).await?;
        let jobs = self.reseal_jobs(&old_key, &new_key, entries);
        self.execute(&mut committer, jobs, Direction::Forward, &options, None)
            .await?;

        let files = self.finish_rotation(committer, new_key).await?;
        Ok(RotateReport { files })
    }

    async fn finish_rotation(
        &self,
        mut committer: Committer,
        new_key: Arc<MasterKey>,
    ) -> Result<usize> {
        let files = committer.journal.committed().len();
        committer.manifest.verification_token = new_key.verification_token();
        self.settle(&mut committer).await?;
        committer.journal.remove()?;
        self.inner.session.start(new_key).await;
        info!(files, "Password rotated");
        Ok(files)
    }

    /// Decrypt the case in place and delete the vault.
    pub async fn remove_encryption(&self, password: &str) -> Result<MigrationReport> {
        self.remove_encryption_with(password, MigrationOptions::default())
            .await
    }

    pub async fn remove_encryption_with(
        &self,
        password: &str,
        options: MigrationOptions,
    ) -> Result<MigrationReport> {
        let _gate = self.inner.gate.write().await;
        let manifest = self.settled_manifest().await?;
        let lock = self.acquire_lock()?;
        discard_stale(&self.inner.layout, self.exclude())?;

        let key = Arc::new(
            derive_verified(
                password.as_bytes(),
                &manifest.salt,
                &manifest.kdf,
                &manifest.verification_token,
            )
            .await?,
        );

        let journal = Journal::create(
            &self.inner.layout.journal(),
            JournalHeader::new(MigrationKind::Decrypt),
        )?;
        let entries = manifest.entries().to_vec();
        let mut committer = self.begin(manifest, journal).await?;
        let jobs = self.decrypt_jobs(&key, entries);
        let files = self
            .execute(&mut committer, jobs, Direction::Forward, &options, None)
            .await?;

        self.delete_vault(Some(committer.journal), lock).await?;
        Ok(MigrationReport {
            kind: MigrationKind::Decrypt,
            files,
        })
    }

    /// Encrypt plaintext files added since the vault was initialized.
    ///
    /// Uses the unlocked session; stops if the session is locked meanwhile.
    pub async fn encrypt_new_files(&self) -> Result<EncryptReport> {
        self.encrypt_new_files_with(MigrationOptions::default()).await
    }

    pub async fn encrypt_new_files_with(&self, options: MigrationOptions) -> Result<EncryptReport> {
        let _gate = self.inner.gate.write().await;
        let manifest = self.settled_manifest().await?;
        let lease = self.inner.session.acquire().await?;
        let _lock = self.acquire_lock()?;
        discard_stale(&self.inner.layout, self.exclude())?;

        let scan = scan_plaintext(self.case_dir(), self.exclude(), &manifest)?;
        if scan.paths.is_empty() {
            return Ok(EncryptReport {
                skipped: scan.skipped(self.case_dir()),
                ..EncryptReport::default()
            });
        }
        self.encrypt_plaintext(manifest, scan, &JobKey::Leased(lease), &options)
            .await
    }

    /// Store `bytes` at `path`, encrypting them if the vault is active.
    ///
    /// Plaintext never reaches the case directory for an encrypted vault.
    /// Reads of this manager wait until the write is committed.
    pub async fn write(&self, path: &CasePath, bytes: &[u8]) -> Result<()> {
        let target = self.inner.resolve(path)?;
        let _gate = self.inner.gate.write().await;
        let current = self.inner.current().await?;
        if let Some(manifest) = &current {
            self.inner.ensure_settled(manifest)?;
        }

        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::InvalidInput(format!("{} has no parent", path)))?;
        tokio::fs::create_dir_all(&dir).await?;

        let manifest = match current {
            Some(manifest) if manifest.state == VaultState::Encrypted => Manifest::clone(&manifest),
            _ => {
                let bytes = bytes.to_vec();
                return blocking(move || write_atomic(&target, &bytes)).await;
            }
        };

        let lease = self.inner.session.acquire().await?;
        let _lock = self.acquire_lock()?;
        discard_stale(&self.inner.layout, self.exclude())?;

        let journal = Journal::create(
            &self.inner.layout.journal(),
            JournalHeader::new(MigrationKind::Encrypt),
        )?;
        let mut committer = self.begin(manifest, journal).await?;

        let bytes = Arc::new(Zeroizing::new(bytes.to_vec()));
        let params = self.inner.params();
        let job_path = path.clone();
        let job_lease = lease.clone();
        let job: Job = Arc::new(move || {
            let (temp, entry) = seal_bytes(&*job_lease.key()?, &job_path, &bytes, &dir, params)?;
            Ok(Prepared {
                path: job_path.clone(),
                temp,
                entry: Some(entry),
            })
        });
        self.execute(
            &mut committer,
            vec![job],
            Direction::Forward,
            &MigrationOptions::default(),
            Some(&lease),
        )
        .await?;
        self.finish_encrypted(committer, Vec::new()).await?;
        Ok(())
    }

    /// Whether `path` is stored as plaintext.
    pub async fn is_plaintext(&self, path: &CasePath) -> Result<bool> {
        self.access().is_plaintext(path).await
    }

    /// Manifest entries, sorted by path.
    pub async fn entries(&self) -> Result<Vec<FileEntry>> {
        let _gate = self.inner.gate.read().await;
        Ok(self
            .inner
            .current()
            .await?
            .map(|m| m.entries().to_vec())
            .unwrap_or_default())
    }

    /// Shorthand for [`ScopedDecryptedAccess::read`].
    pub async fn read(&self, path: &CasePath) -> Result<SensitiveBytes> {
        self.access().read(path).await
    }

    /// Shorthand for [`ScopedDecryptedAccess::materialize`].
    pub async fn materialize(&self, path: &CasePath) -> Result<MaterializedFile> {
        self.access().materialize(path).await
    }

    /// Write a decrypted copy of the case into `output_dir`.
    ///
    /// Read-only with respect to the vault: the manifest, the journal, and
    /// every case file are left untouched. Files the vault could not record
    /// are copied as they are.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if `output_dir` lies inside the case
    /// - `Error::Locked` / `Error::SessionExpired` without a live session
    pub async fn export_decrypted(&self, output_dir: &Path) -> Result<ExportReport> {
        let _gate = self.inner.gate.read().await;
        let manifest = self.settled_manifest().await?;
        let lease = self.inner.session.acquire().await?;

        let root = fs::canonicalize(self.case_dir())?;
        let out = absolute(output_dir)?;
        if out.starts_with(&root) {
            return Err(Error::InvalidInput(
                "Export directory must be outside the case".to_string(),
            ));
        }
        fs::create_dir_all(&out)?;

        let plaintext = scan_plaintext(self.case_dir(), self.exclude(), &manifest)?;
        let case_root = self.case_dir().to_path_buf();
        let mut tasks = Vec::new();
        for entry in manifest.entries().iter().cloned() {
            let src = entry.path.to_fs_path(&case_root);
            let dest = entry.path.to_fs_path(&out);
            let lease = lease.clone();
            tasks.push(ExportTask::Decrypt {
                src,
                dest,
                entry,
                lease,
            });
        }
        for path in plaintext.paths {
            tasks.push(ExportTask::Copy {
                src: path.to_fs_path(&case_root),
                dest: path.to_fs_path(&out),
            });
        }
        for src in plaintext.unsupported {
            let relative = src.strip_prefix(&case_root).map_err(|_| {
                Error::InvalidInput(format!("{} is outside the case", src.display()))
            })?;
            let dest = out.join(relative);
            tasks.push(ExportTask::Copy { src, dest });
        }

        let retry = self.inner.retry.clone();
        let pending: Vec<BoxFuture<'static, (bool, Result<u64>)>> = tasks
            .into_iter()
            .map(|task| {
                let retry = retry.clone();
                let task = Arc::new(task);
                async move {
                    let decrypted = matches!(*task, ExportTask::Decrypt { .. });
                    let bytes = retry.execute_blocking(move || task.run()).await;
                    (decrypted, bytes)
                }
                .boxed()
            })
            .collect();
        let mut results = stream::iter(pending).buffer_unordered(self.inner.config.workers.max(1));

        let mut report = ExportReport::default();
        while let Some((decrypted, bytes)) = results.next().await {
            report.bytes += bytes?;
            if decrypted {
                report.decrypted += 1;
            } else {
                report.copied += 1;
            }
        }
        info!(
            out = %out.display(),
            decrypted = report.decrypted,
            copied = report.copied,
            "Export complete"
        );
        Ok(report)
    }
}

enum ExportTask {
    Decrypt {
        src: PathBuf,
        dest: PathBuf,
        entry: FileEntry,
        lease: KeyLease,
    },
    Copy {
        src: PathBuf,
        dest: PathBuf,
    },
}

impl ExportTask {
    fn run(&self) -> Result<u64> {
        match self {
            Self::Decrypt {
                src,
                dest,
                entry,
                lease,
            } => {
                let dir = ensure_parent(dest)?;
                let temp = tempfile::Builder::new()
                    .prefix(TEMP_PREFIX)
                    .tempfile_in(dir)?;
                let written = decrypt_into(&*lease.key()?, src, entry, &temp, Some(lease))?;
                temp.persist(dest).map_err(|e| Error::Io(e.error))?;
                Ok(written)
            }
            Self::Copy { src, dest } => {
                ensure_parent(dest)?;
                Ok(fs::copy(src, dest)?)
            }
        }
    }
}

fn ensure_parent(path: &Path) -> Result<&Path> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidInput(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir)?;
    Ok(dir)
}

/// Canonical form of `path`, which may not exist yet.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(fs::canonicalize(path)?);
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => absolute(parent)?,
        _ => std::env::current_dir()?,
    };
    let name = path
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("Invalid path {}", path.display())))?;
    Ok(parent.join(name))
}

/// Recover the pending key of a rotation, sealed under `key`.
fn unwrap_pending(journal: &Journal, key: &MasterKey) -> Result<MasterKey> {
    let header = journal.header();
    let (Some(wrapped), Some(token)) = (&header.pending_key, &header.pending_token) else {
        return Err(Error::Integrity(
            "Rotation journal lacks the pending key".to_string(),
        ));
    };
    let bytes = Zeroizing::new(aead::decrypt(key.as_bytes(), &wrapped.0)?);
    let new_key = MasterKey::from_slice(&bytes)?;
    if !new_key.verification_token().matches(token) {
        return Err(Error::Integrity(
            "Pending key does not match the rotation journal".to_string(),
        ));
    }
    Ok(new_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PASSWORD: &str = "correct-horse";

    fn fast_kdf() -> KdfParams {
        KdfParams::argon2id(1024, 1, 1)
    }

    fn case_with(files: &[(&str, &[u8])]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        dir
    }

    fn manager(dir: &TempDir) -> VaultManager {
        VaultManager::open(dir.path(), VaultConfig::default()).unwrap()
    }

    fn p(path: &str) -> CasePath {
        CasePath::parse(path).unwrap()
    }

    #[tokio::test]
    async fn test_init_encrypts_and_unlocks() {
        let dir = case_with(&[("notes.txt", b"hello"), ("media/a.bin", &[7u8; 1000])]);
        let vault = manager(&dir);
        assert_eq!(vault.status().await.unwrap(), VaultStatus::NoVault);

        let report = vault.init(PASSWORD, fast_kdf()).await.unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.bytes, 1005);
        assert_eq!(vault.status().await.unwrap(), VaultStatus::Unlocked);

        assert_ne!(fs::read(dir.path().join("notes.txt")).unwrap(), b"hello");
        assert_eq!(vault.read(&p("notes.txt")).await.unwrap().as_bytes(), b"hello");
        assert!(!dir.path().join(".casevault/journal.jsonl").exists());
        assert!(!dir.path().join(".casevault/lock").exists());
    }

    #[tokio::test]
    async fn test_init_rejects_short_password_and_reinit() {
        let dir = case_with(&[("a.txt", b"a")]);
        let vault = manager(&dir);
        assert!(matches!(
            vault.init("short", fast_kdf()).await,
            Err(Error::InvalidInput(_))
        ));

        vault.init(PASSWORD, fast_kdf()).await.unwrap();
        assert!(matches!(
            vault.init(PASSWORD, fast_kdf()).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_init_skips_excluded_names() {
        let dir = case_with(&[("a.txt", b"a"), (".git/config", b"[core]")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        assert_eq!(fs::read(dir.path().join(".git/config")).unwrap(), b"[core]");
        assert!(vault.is_plaintext(&p(".git/config")).await.unwrap());
        assert!(!vault.is_plaintext(&p("a.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_password_stays_locked() {
        let dir = case_with(&[("a.txt", b"a")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();
        vault.lock().await;

        assert!(matches!(
            vault.unlock("wrong-password").await,
            Err(Error::Authentication)
        ));
        assert_eq!(vault.status().await.unwrap(), VaultStatus::Locked);
        assert!(matches!(vault.read(&p("a.txt")).await, Err(Error::Locked)));
    }

    #[tokio::test]
    async fn test_write_encrypts_new_file() {
        let dir = case_with(&[("a.txt", b"a")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        vault.write(&p("reports/summary.md"), b"# Summary").await.unwrap();
        assert!(!vault.is_plaintext(&p("reports/summary.md")).await.unwrap());
        assert_eq!(
            vault.read(&p("reports/summary.md")).await.unwrap().as_bytes(),
            b"# Summary"
        );
        assert_eq!(vault.entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_write_without_vault_is_plain() {
        let dir = case_with(&[]);
        let vault = manager(&dir);
        vault.write(&p("case.json"), b"{}").await.unwrap();
        assert_eq!(fs::read(dir.path().join("case.json")).unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_reserved_paths_rejected() {
        let dir = case_with(&[]);
        let vault = manager(&dir);
        assert!(matches!(
            vault.write(&p(".casevault/manifest.json"), b"x").await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_encrypt_new_files() {
        let dir = case_with(&[("a.txt", b"a")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        fs::write(dir.path().join("b.txt"), b"added later").unwrap();
        let report = vault.encrypt_new_files().await.unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(vault.read(&p("b.txt")).await.unwrap().as_bytes(), b"added later");

        let report = vault.encrypt_new_files().await.unwrap();
        assert_eq!(report.files, 0);
    }

    #[tokio::test]
    async fn test_rotate_password() {
        let dir = case_with(&[("a.txt", b"alpha"), ("b.txt", b"beta")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        let report = vault.rotate_password(PASSWORD, "battery-staple").await.unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(vault.read(&p("a.txt")).await.unwrap().as_bytes(), b"alpha");

        vault.lock().await;
        assert!(matches!(vault.unlock(PASSWORD).await, Err(Error::Authentication)));
        vault.unlock("battery-staple").await.unwrap();
        assert!(vault.verify().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_rotate_rejects_wrong_old_password() {
        let dir = case_with(&[("a.txt", b"a")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        assert!(matches!(
            vault.rotate_password("not-the-password", "battery-staple").await,
            Err(Error::Authentication)
        ));
        assert_eq!(vault.status().await.unwrap(), VaultStatus::Unlocked);
    }

    #[tokio::test]
    async fn test_remove_encryption() {
        let dir = case_with(&[("a.txt", b"alpha"), ("sub/b.txt", b"beta")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        let report = vault.remove_encryption(PASSWORD).await.unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(dir.path().join("sub/b.txt")).unwrap(), b"beta");
        assert!(!dir.path().join(VAULT_DIRNAME).exists());
        assert_eq!(vault.status().await.unwrap(), VaultStatus::NoVault);
    }

    #[tokio::test]
    async fn test_verify_reports_tampered_file() {
        let dir = case_with(&[("a.txt", b"alpha"), ("b.txt", b"beta")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        let target = dir.path().join("b.txt");
        let mut bytes = fs::read(&target).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        fs::write(&target, bytes).unwrap();

        let report = vault.verify().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, p("b.txt"));
        assert!(matches!(
            vault.read(&p("b.txt")).await,
            Err(Error::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_materialize_cleans_up() {
        let dir = case_with(&[("clip.wav", b"RIFF....WAVE")]);
        let temp_root = TempDir::new().unwrap();
        let config = VaultConfig::default().with_temp_dir(temp_root.path());
        let vault = VaultManager::open(dir.path(), config).unwrap();
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        let seen = vault
            .access()
            .with_materialized(&p("clip.wav"), |path| {
                assert_eq!(path.extension().unwrap(), "wav");
                assert_eq!(fs::read(path)?, b"RIFF....WAVE");
                Ok(path.to_path_buf())
            })
            .await
            .unwrap();
        assert!(!seen.exists());

        let failed: Result<()> = vault
            .access()
            .with_materialized(&p("clip.wav"), |_| {
                Err(Error::Vault("consumer failed".to_string()))
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(fs::read_dir(temp_root.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_materialized_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = case_with(&[("a.txt", b"secret")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        let file = vault.materialize(&p("a.txt")).await.unwrap();
        assert!(file.is_temporary());
        let mode = fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        file.close().unwrap();
    }

    #[tokio::test]
    async fn test_materialize_plaintext_borrows() {
        let dir = case_with(&[("a.txt", b"plain")]);
        let vault = manager(&dir);
        let file = vault.materialize(&p("a.txt")).await.unwrap();
        assert!(!file.is_temporary());
        assert_eq!(file.path(), dir.path().join("a.txt"));
        drop(file);
        assert!(dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_idle_timeout_expires_session() {
        let dir = case_with(&[("a.txt", b"a")]);
        let config = VaultConfig::default().with_session_timeout(Some(Duration::from_millis(100)));
        let vault = VaultManager::open(dir.path(), config).unwrap();
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(matches!(
            vault.read(&p("a.txt")).await,
            Err(Error::SessionExpired)
        ));
        vault.unlock(PASSWORD).await.unwrap();
        assert_eq!(vault.read(&p("a.txt")).await.unwrap().as_bytes(), b"a");
    }

    #[tokio::test]
    async fn test_export_rejects_directory_inside_case() {
        let dir = case_with(&[("a.txt", b"a")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        assert!(matches!(
            vault.export_decrypted(&dir.path().join("out")).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_without_migration() {
        let dir = case_with(&[("a.txt", b"a")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();
        assert!(matches!(
            vault.resume(PASSWORD).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_init_by_another_manager_is_seen() {
        let dir = case_with(&[("case.json", b"{\"id\":1}")]);
        let app = manager(&dir);
        let cli = manager(&dir);
        assert!(app.is_plaintext(&p("case.json")).await.unwrap());

        cli.init(PASSWORD, fast_kdf()).await.unwrap();

        assert!(!app.is_plaintext(&p("case.json")).await.unwrap());
        assert!(matches!(app.read(&p("case.json")).await, Err(Error::Locked)));
        app.unlock(PASSWORD).await.unwrap();
        assert_eq!(
            app.read(&p("case.json")).await.unwrap().as_bytes(),
            b"{\"id\":1}"
        );
    }

    #[tokio::test]
    async fn test_rotation_by_another_manager_locks_session() {
        let dir = case_with(&[("a.txt", b"alpha")]);
        let cli = manager(&dir);
        cli.init(PASSWORD, fast_kdf()).await.unwrap();
        let app = manager(&dir);
        app.unlock(PASSWORD).await.unwrap();
        assert_eq!(app.read(&p("a.txt")).await.unwrap().as_bytes(), b"alpha");

        cli.rotate_password(PASSWORD, "battery-staple").await.unwrap();

        assert!(matches!(app.read(&p("a.txt")).await, Err(Error::Locked)));
        assert!(matches!(app.unlock(PASSWORD).await, Err(Error::Authentication)));
        app.unlock("battery-staple").await.unwrap();
        assert_eq!(app.read(&p("a.txt")).await.unwrap().as_bytes(), b"alpha");
    }

    #[tokio::test]
    async fn test_removal_by_another_manager_is_seen() {
        let dir = case_with(&[("a.txt", b"alpha")]);
        let app = manager(&dir);
        app.init(PASSWORD, fast_kdf()).await.unwrap();
        let cli = manager(&dir);

        cli.remove_encryption(PASSWORD).await.unwrap();

        assert!(app.is_plaintext(&p("a.txt")).await.unwrap());
        assert_eq!(app.read(&p("a.txt")).await.unwrap().as_bytes(), b"alpha");
        assert_eq!(app.status().await.unwrap(), VaultStatus::NoVault);
        assert_eq!(app.session_info().await.state, SessionState::Locked);
    }

    #[tokio::test]
    async fn test_reads_wait_for_write_in_progress() {
        let dir = case_with(&[("case.json", b"{}")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();
        let big = vec![0x5au8; 8 * 1024 * 1024];

        let reads = async {
            let mut failures = Vec::new();
            for _ in 0..50 {
                match vault.read(&p("case.json")).await {
                    Ok(bytes) => assert_eq!(bytes.as_bytes(), b"{}"),
                    Err(e) => failures.push(e.to_string()),
                }
                assert!(vault.is_plaintext(&p("case.json")).await.is_ok());
                tokio::task::yield_now().await;
            }
            failures
        };
        let big_path = p("media/big.bin");
        let (written, failures) = tokio::join!(vault.write(&big_path, &big), reads);

        written.unwrap();
        assert!(failures.is_empty(), "{:?}", failures);
        let stored = vault.read(&p("media/big.bin")).await.unwrap();
        assert_eq!(stored.as_bytes().len(), big.len());
    }

    #[tokio::test]
    async fn test_running_migration_elsewhere_is_conflict() {
        let dir = case_with(&[("a.txt", b"a")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        let path = dir.path().join(".casevault/manifest.json");
        let mut manifest = Manifest::load(&path).unwrap().unwrap();
        manifest.state = VaultState::Migrating;
        manifest.save(&path).unwrap();

        let held = VaultLock::acquire(&dir.path().join(".casevault/lock")).unwrap();
        assert!(matches!(vault.read(&p("a.txt")).await, Err(Error::Conflict(_))));

        drop(held);
        assert!(matches!(
            vault.read(&p("a.txt")).await,
            Err(Error::MigrationInterrupted(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_run_in_spawned_tasks() {
        let dir = case_with(&[("a.txt", b"alpha")]);
        let out = TempDir::new().unwrap();
        let vault = Arc::new(manager(&dir));

        let task = Arc::clone(&vault);
        let report = tokio::spawn(async move { task.init(PASSWORD, fast_kdf()).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.files, 1);

        let task = Arc::clone(&vault);
        tokio::spawn(async move { task.write(&p("b.txt"), b"beta").await })
            .await
            .unwrap()
            .unwrap();

        let task = Arc::clone(&vault);
        let report = tokio::spawn(async move { task.verify().await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.checked, 2);

        let task = Arc::clone(&vault);
        tokio::spawn(async move { task.rotate_password(PASSWORD, "battery-staple").await })
            .await
            .unwrap()
            .unwrap();

        let task = Arc::clone(&vault);
        let target = out.path().join("export");
        let report = tokio::spawn(async move { task.export_decrypted(&target).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.decrypted, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unrecordable_names_stay_plaintext() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = case_with(&[("a.txt", b"alpha")]);
        let odd = OsStr::from_bytes(b"scan\xff.pdf");
        fs::write(dir.path().join(odd), b"%PDF").unwrap();
        let vault = manager(&dir);

        let report = vault.init(PASSWORD, fast_kdf()).await.unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.skipped, vec!["scan\u{fffd}.pdf"]);
        assert_eq!(fs::read(dir.path().join(odd)).unwrap(), b"%PDF");
        assert!(!vault.is_plaintext(&p("a.txt")).await.unwrap());

        let report = vault.encrypt_new_files().await.unwrap();
        assert_eq!(report.files, 0);
        assert_eq!(report.skipped.len(), 1);

        let out = TempDir::new().unwrap();
        let export = vault.export_decrypted(out.path()).await.unwrap();
        assert_eq!((export.decrypted, export.copied), (1, 1));
        assert_eq!(fs::read(out.path().join(odd)).unwrap(), b"%PDF");
    }

    #[tokio::test]
    async fn test_extend_session_outlasts_timeout() {
        let dir = case_with(&[("a.txt", b"a")]);
        let config = VaultConfig::default().with_session_timeout(Some(Duration::from_millis(150)));
        let vault = VaultManager::open(dir.path(), config).unwrap();
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        vault.extend_session(Duration::from_millis(600)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(vault.read(&p("a.txt")).await.unwrap().as_bytes(), b"a");

        vault.lock().await;
        assert!(matches!(
            vault.extend_session(Duration::from_secs(60)).await,
            Err(Error::Locked)
        ));
    }

    #[tokio::test]
    async fn test_set_session_timeout_applies_to_live_session() {
        let dir = case_with(&[("a.txt", b"a")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        vault.set_session_timeout(Some(Duration::from_millis(50))).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            vault.read(&p("a.txt")).await,
            Err(Error::SessionExpired)
        ));
        assert_eq!(vault.session_info().await.idle_timeout_secs, Some(0));
    }

    #[tokio::test]
    async fn test_init_keeps_temporaries_of_excluded_trees() {
        let dir = case_with(&[("a.txt", b"a"), (".git/objects/.cvtmp-pack", b"foreign")]);
        let vault = manager(&dir);
        vault.init(PASSWORD, fast_kdf()).await.unwrap();

        assert_eq!(
            fs::read(dir.path().join(".git/objects/.cvtmp-pack")).unwrap(),
            b"foreign"
        );
    }
}
