//! Crash-safe bulk migrations.
//!
//! Workers prepare verified temporary files in parallel; one committer
//! applies them in completion order:
//!
//! 1. back up the current file under `.casevault/backup/<seq>/`
//! 2. rename the temporary over the target
//! 3. append a journal record (fsync)
//! 4. save the manifest
//! 5. drop the backup
//!
//! `<seq>` is the number of journal records before the commit. On recovery,
//! a backup whose sequence number is below the journal's record count was
//! committed and is discarded; any other backup is restored, undoing a
//! rename that never reached the journal.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::config::{VaultLayout, TEMP_PREFIX, VAULT_DIRNAME};
use crate::journal::{Journal, MigrationKind};
use crate::manifest::{sync_dir, FileEntry, Manifest};
use crate::retry::RetryExecutor;
use crate::session::KeyLease;
use casevault_common::{CasePath, Error, Result};

/// Cooperative cancellation flag shared with a running migration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the migration stop before its next commit.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress of a migration, reported after every commit.
#[derive(Debug, Clone)]
pub struct Progress {
    pub kind: MigrationKind,
    pub path: CasePath,
    pub completed: usize,
    pub total: usize,
}

/// Callback receiving [`Progress`].
pub type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Caller controls for a migration.
#[derive(Clone, Default)]
pub struct MigrationOptions {
    pub cancel: CancelToken,
    pub progress: Option<ProgressFn>,
}

impl MigrationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }
}

impl std::fmt::Debug for MigrationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationOptions")
            .field("cancel", &self.cancel)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Result of encrypting plaintext files.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EncryptReport {
    pub files: usize,
    pub bytes: u64,
    /// Files left as plaintext because their names cannot be recorded,
    /// relative to the case directory and lossily decoded.
    pub skipped: Vec<String>,
}

/// Result of a password rotation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RotateReport {
    pub files: usize,
}

/// Result of a decrypted export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportReport {
    /// Entries decrypted into the output.
    pub decrypted: usize,
    /// Plaintext files copied as-is.
    pub copied: usize,
    pub bytes: u64,
}

/// One file that failed verification.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityFailure {
    pub path: CasePath,
    pub reason: String,
}

/// Result of an integrity scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub failures: Vec<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of finishing or undoing an interrupted migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub kind: MigrationKind,
    pub files: usize,
}

/// A verified temporary ready to replace `path`.
pub(crate) struct Prepared {
    pub path: CasePath,
    pub temp: TempPath,
    /// Manifest entry once committed; `None` for plaintext.
    pub entry: Option<FileEntry>,
}

/// Blocking work producing one [`Prepared`]. Must be idempotent.
pub(crate) type Job = Arc<dyn Fn() -> Result<Prepared> + Send + Sync>;

/// Whether records move a migration forward or undo it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Forward,
    Revert,
}

/// Single writer for the case files, journal, and manifest.
pub(crate) struct Committer {
    layout: VaultLayout,
    pub manifest: Manifest,
    pub journal: Journal,
}

impl Committer {
    pub fn new(layout: VaultLayout, manifest: Manifest, journal: Journal) -> Self {
        Self {
            layout,
            manifest,
            journal,
        }
    }

    /// Apply one prepared file.
    pub fn commit(&mut self, prepared: Prepared, direction: Direction) -> Result<()> {
        let Prepared { path, temp, entry } = prepared;
        let seq_dir = self
            .layout
            .backup_dir()
            .join(self.journal.records().to_string());
        let target = path.to_fs_path(self.layout.root());

        let existed = fs::symlink_metadata(&target).is_ok();
        let backup = path.to_fs_path(&seq_dir.join(if existed { "orig" } else { "absent" }));
        if let Some(parent) = backup.parent() {
            fs::create_dir_all(parent)?;
        }
        if existed {
            if fs::hard_link(&target, &backup).is_err() {
                fs::copy(&target, &backup)?;
                File::open(&backup)?.sync_all()?;
            }
        } else {
            File::create(&backup)?;
        }
        if let Some(parent) = backup.parent() {
            sync_dir(parent)?;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        temp.persist(&target).map_err(|e| Error::Io(e.error))?;
        if let Some(parent) = target.parent() {
            sync_dir(parent)?;
        }

        match direction {
            Direction::Forward => self.journal.append_commit(&path, entry.clone())?,
            Direction::Revert => self.journal.append_revert(&path, entry.clone())?,
        }
        apply_entry(&mut self.manifest, &path, entry);
        self.manifest.save(&self.layout.manifest())?;

        fs::remove_dir_all(&seq_dir)?;
        debug!(path = %path, operation = %self.journal.header().operation_id, "Committed");
        Ok(())
    }
}

/// Run blocking filesystem or cipher work off the async threads.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Vault(format!("Blocking task failed: {}", e)))?
}

/// Drop leftovers of a migration that already finished.
///
/// Only valid while the manifest is not `migrating`: every commit removed
/// its own backup, so nothing left behind needs restoring.
pub(crate) fn discard_stale(layout: &VaultLayout, exclude: &[String]) -> Result<()> {
    let journal = layout.journal();
    if journal.exists() {
        warn!(path = %journal.display(), "Removing journal of a finished migration");
        fs::remove_file(&journal)?;
    }
    let backups = layout.backup_dir();
    if backups.exists() {
        fs::remove_dir_all(&backups)?;
    }
    sweep_temporaries(layout.root(), exclude)?;
    Ok(())
}

fn apply_entry(manifest: &mut Manifest, path: &CasePath, entry: Option<FileEntry>) {
    match entry {
        Some(entry) => manifest.upsert(entry),
        None => {
            manifest.remove(path);
        }
    }
}

/// Run `jobs` on a bounded pool and commit each result.
///
/// Stops before the next commit when cancelled, when `lease` is no longer
/// valid, or on the first failed job; every commit already made stays valid.
pub(crate) async fn run_jobs(
    committer: &mut Committer,
    jobs: Vec<Job>,
    direction: Direction,
    workers: usize,
    retry: &RetryExecutor,
    options: &MigrationOptions,
    lease: Option<&KeyLease>,
) -> Result<usize> {
    let kind = committer.journal.kind();
    let total = jobs.len();
    // Boxed so the returned future stays `Send` for spawned callers.
    let pending: Vec<BoxFuture<'static, Result<Prepared>>> = jobs
        .into_iter()
        .map(|job| {
            let retry = retry.clone();
            async move { retry.execute_blocking(move || job()).await }.boxed()
        })
        .collect();
    let mut results = stream::iter(pending).buffer_unordered(workers.max(1));

    let mut completed = 0;
    while let Some(result) = results.next().await {
        if options.cancel.is_cancelled() {
            info!(%kind, completed, total, "Migration cancelled");
            return Err(Error::Cancelled);
        }
        if let Some(lease) = lease {
            lease.check()?;
        }
        let prepared = result?;
        let path = prepared.path.clone();
        committer.commit(prepared, direction)?;
        completed += 1;

        if let Some(progress) = &options.progress {
            progress(&Progress {
                kind,
                path,
                completed,
                total,
            });
        }
    }
    Ok(completed)
}

/// Bring the case back to a state consistent with the journal.
///
/// Replays records into the manifest, restores or drops backups, and sweeps
/// temporaries. The manifest is saved.
pub(crate) fn recover(
    layout: &VaultLayout,
    manifest: &mut Manifest,
    journal: &Journal,
    exclude: &[String],
) -> Result<()> {
    for (path, entry) in journal.latest() {
        apply_entry(manifest, path, entry.clone());
    }

    let backup_root = layout.backup_dir();
    if backup_root.exists() {
        for seq_dir in fs::read_dir(&backup_root)? {
            let seq_dir = seq_dir?.path();
            let seq = seq_dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u64>().ok());
            let Some(seq) = seq else {
                warn!(path = %seq_dir.display(), "Ignoring unknown backup entry");
                continue;
            };
            if seq < journal.records() {
                debug!(seq, "Dropping backup of committed file");
                continue;
            }
            restore_backups(layout.root(), &seq_dir.join("orig"), true)?;
            restore_backups(layout.root(), &seq_dir.join("absent"), false)?;
        }
        fs::remove_dir_all(&backup_root)?;
    }

    sweep_temporaries(layout.root(), exclude)?;
    manifest.save(&layout.manifest())
}

fn restore_backups(root: &Path, base: &Path, existed: bool) -> Result<()> {
    if !base.exists() {
        return Ok(());
    }
    for file in walk_files(base)? {
        let path = CasePath::from_fs_path(base, &file)?;
        let target = path.to_fs_path(root);
        if existed {
            warn!(path = %path, "Restoring uncommitted file from backup");
            fs::rename(&file, &target)?;
        } else {
            warn!(path = %path, "Removing uncommitted new file");
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(parent) = target.parent() {
            sync_dir(parent)?;
        }
    }
    Ok(())
}

/// Remove vault temporaries from the case and the vault directory.
///
/// Excluded top-level names are not entered; they may hold files that only
/// look like ours.
pub(crate) fn sweep_temporaries(root: &Path, exclude: &[String]) -> Result<usize> {
    let mut removed = 0;
    for file in case_files(root, exclude, true)? {
        if is_temporary(&file) {
            fs::remove_file(&file)?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(removed, "Swept stray temporaries");
    }
    Ok(removed)
}

fn is_temporary(file: &Path) -> bool {
    file.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(TEMP_PREFIX))
}

/// Regular files under `root`, skipping excluded top-level names and, unless
/// `vault` is set, the vault directory.
fn case_files(root: &Path, exclude: &[String], vault: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for top in fs::read_dir(root)? {
        let top = top?;
        let name = top.file_name();
        let name = name.to_string_lossy();
        if exclude.iter().any(|e| *e == name) || (!vault && name == VAULT_DIRNAME) {
            continue;
        }
        let file_type = top.file_type()?;
        if file_type.is_dir() {
            files.extend(walk_files(&top.path())?);
        } else if file_type.is_file() {
            files.push(top.path());
        }
    }
    Ok(files)
}

/// Regular files under `dir`, recursively, without following symlinks.
fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

/// Plaintext found in a case directory.
#[derive(Debug, Default)]
pub(crate) struct PlaintextScan {
    /// Files to encrypt, sorted.
    pub paths: Vec<CasePath>,
    /// Files whose names cannot be recorded as case paths. They stay
    /// plaintext and are reported.
    pub unsupported: Vec<PathBuf>,
}

impl PlaintextScan {
    /// Unsupported files relative to `root`, for reports.
    pub fn skipped(&self, root: &Path) -> Vec<String> {
        self.unsupported
            .iter()
            .map(|file| {
                file.strip_prefix(root)
                    .unwrap_or(file)
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }
}

/// Plaintext case files eligible for encryption.
///
/// Skips the vault directory, excluded top-level names, temporaries, and
/// paths the manifest already records. A file with a name that is not a
/// valid case path is skipped with a warning instead of failing the scan.
pub(crate) fn scan_plaintext(
    root: &Path,
    exclude: &[String],
    manifest: &Manifest,
) -> Result<PlaintextScan> {
    let mut scan = PlaintextScan::default();
    for file in case_files(root, exclude, false)? {
        if is_temporary(&file) {
            continue;
        }
        match CasePath::from_fs_path(root, &file) {
            Ok(path) => {
                if !manifest.contains(&path) {
                    scan.paths.push(path);
                }
            }
            Err(Error::InvalidInput(reason)) => {
                warn!(file = %file.display(), "Leaving file unencrypted: {}", reason);
                scan.unsupported.push(file);
            }
            Err(e) => return Err(e),
        }
    }
    scan.paths.sort();
    scan.unsupported.sort();
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalHeader;
    use casevault_crypto::{KdfParams, MasterKey, Salt};
    use std::io::Write;
    use tempfile::TempDir;

    fn setup() -> (TempDir, VaultLayout, Manifest) {
        let dir = TempDir::new().unwrap();
        let layout = VaultLayout::new(dir.path());
        fs::create_dir_all(layout.vault_dir()).unwrap();
        let manifest = Manifest::new(
            Salt::generate(),
            KdfParams::default(),
            MasterKey::generate().verification_token(),
        );
        (dir, layout, manifest)
    }

    fn prepared(layout: &VaultLayout, path: &str, content: &[u8]) -> Prepared {
        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(layout.root())
            .unwrap();
        temp.write_all(content).unwrap();
        Prepared {
            path: CasePath::parse(path).unwrap(),
            temp: temp.into_temp_path(),
            entry: None,
        }
    }

    #[test]
    fn test_scan_skips_vault_excluded_and_temporaries() {
        let (dir, _, manifest) = setup();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), b"ref").unwrap();
        fs::create_dir_all(dir.path().join("extracted")).unwrap();
        fs::write(dir.path().join("extracted/a.txt"), b"a").unwrap();
        fs::write(dir.path().join("case.json"), b"{}").unwrap();
        fs::write(dir.path().join(".cvtmp-stray"), b"x").unwrap();

        let found = scan_plaintext(dir.path(), &[".git".to_string()], &manifest).unwrap();
        let names: Vec<String> = found.paths.iter().map(|p| p.as_string()).collect();
        assert_eq!(names, vec!["case.json", "extracted/a.txt"]);
        assert!(found.unsupported.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_reports_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (dir, _, manifest) = setup();
        fs::create_dir_all(dir.path().join("mail")).unwrap();
        let odd = dir.path().join("mail").join(OsStr::from_bytes(b"r\xe9sum\xe9.eml"));
        fs::write(&odd, b"latin-1 name").unwrap();
        fs::write(dir.path().join("case.json"), b"{}").unwrap();

        let found = scan_plaintext(dir.path(), &[], &manifest).unwrap();
        let names: Vec<String> = found.paths.iter().map(|p| p.as_string()).collect();
        assert_eq!(names, vec!["case.json"]);
        assert_eq!(found.unsupported, vec![odd]);
        assert_eq!(found.skipped(dir.path()), vec!["mail/r\u{fffd}sum\u{fffd}.eml"]);
    }

    #[test]
    fn test_sweep_leaves_excluded_trees_alone() {
        let (dir, layout, _) = setup();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join(".git/objects/.cvtmp-pack"), b"foreign").unwrap();
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/.cvtmp-ours"), b"stray").unwrap();
        fs::write(layout.vault_dir().join(".cvtmp-manifest"), b"stray").unwrap();

        let removed = sweep_temporaries(dir.path(), &[".git".to_string()]).unwrap();

        assert_eq!(removed, 2);
        assert!(dir.path().join(".git/objects/.cvtmp-pack").exists());
        assert!(!dir.path().join("docs/.cvtmp-ours").exists());
        assert!(!layout.vault_dir().join(".cvtmp-manifest").exists());
    }

    #[test]
    fn test_commit_leaves_no_backup() {
        let (dir, layout, manifest) = setup();
        fs::write(dir.path().join("a.txt"), b"old").unwrap();
        let journal = Journal::create(&layout.journal(), JournalHeader::new(MigrationKind::Encrypt)).unwrap();
        let mut committer = Committer::new(layout.clone(), manifest, journal);

        committer
            .commit(prepared(&layout, "a.txt", b"new"), Direction::Forward)
            .unwrap();

        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"new");
        assert!(committer.journal.is_committed(&CasePath::parse("a.txt").unwrap()));
        assert!(fs::read_dir(layout.backup_dir()).unwrap().next().is_none());
    }

    #[test]
    fn test_recover_restores_unjournaled_rename() {
        let (dir, layout, mut manifest) = setup();
        let journal = Journal::create(&layout.journal(), JournalHeader::new(MigrationKind::Encrypt)).unwrap();

        // Crash after rename, before journal append: backup seq 0, 0 records.
        let backup = layout.backup_dir().join("0/orig/a.txt");
        fs::create_dir_all(backup.parent().unwrap()).unwrap();
        fs::write(&backup, b"original").unwrap();
        fs::write(dir.path().join("a.txt"), b"ciphertext").unwrap();

        let absent = layout.backup_dir().join("0/absent/new.txt");
        fs::create_dir_all(absent.parent().unwrap()).unwrap();
        fs::write(&absent, b"").unwrap();
        fs::write(dir.path().join("new.txt"), b"ciphertext").unwrap();

        fs::write(dir.path().join(".cvtmp-partial"), b"junk").unwrap();

        recover(&layout, &mut manifest, &journal, &[]).unwrap();

        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"original");
        assert!(!dir.path().join("new.txt").exists());
        assert!(!dir.path().join(".cvtmp-partial").exists());
        assert!(!layout.backup_dir().exists());
    }

    #[test]
    fn test_recover_drops_backup_of_committed_file() {
        let (dir, layout, mut manifest) = setup();
        let mut journal = Journal::create(&layout.journal(), JournalHeader::new(MigrationKind::Decrypt)).unwrap();
        let path = CasePath::parse("a.txt").unwrap();
        journal.append_commit(&path, None).unwrap();

        // Crash after journal append, before backup removal.
        let backup = layout.backup_dir().join("0/orig/a.txt");
        fs::create_dir_all(backup.parent().unwrap()).unwrap();
        fs::write(&backup, b"before").unwrap();
        fs::write(dir.path().join("a.txt"), b"after").unwrap();

        recover(&layout, &mut manifest, &journal, &[]).unwrap();
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"after");
        assert!(!layout.backup_dir().exists());
    }

    #[tokio::test]
    async fn test_run_jobs_cancel_stops_before_next_commit() {
        let (dir, layout, manifest) = setup();
        let journal = Journal::create(&layout.journal(), JournalHeader::new(MigrationKind::Encrypt)).unwrap();
        let mut committer = Committer::new(layout.clone(), manifest, journal);

        let jobs: Vec<Job> = (0..5)
            .map(|i| {
                let layout = layout.clone();
                let job: Job = Arc::new(move || {
                    Ok(prepared(&layout, &format!("f{}.txt", i), b"data"))
                });
                job
            })
            .collect();

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let options = MigrationOptions::new()
            .with_cancel(cancel)
            .with_progress(move |p| {
                if p.completed == 2 {
                    trigger.cancel();
                }
            });

        let result = run_jobs(
            &mut committer,
            jobs,
            Direction::Forward,
            1,
            &RetryExecutor::default(),
            &options,
            None,
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(committer.journal.records(), 2);
        drop(committer);
        let written = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".txt")
            })
            .count();
        assert_eq!(written, 2);
    }
}
